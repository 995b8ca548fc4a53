//! MMD 材质与纹理定义

use bitflags::bitflags;
use glam::{Vec3, Vec4};

use crate::collection::{Indexed, Named};

bitflags! {
    /// 材质绘制标志
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DrawFlags: u8 {
        /// 双面绘制
        const DOUBLE_SIDED = 0x01;
        /// 地面阴影
        const GROUND_SHADOW = 0x02;
        /// 投射到自阴影贴图
        const DRAWING_ON_SELF_SHADOW_MAPS = 0x04;
        /// 接收自阴影
        const DRAWING_SELF_SHADOWS = 0x08;
        /// 描边
        const DRAWING_EDGE = 0x10;
    }
}

/// 球面贴图模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SphereMode {
    #[default]
    None,
    Multiply,
    Add,
    SubTexture,
}

impl SphereMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SphereMode::None),
            1 => Some(SphereMode::Multiply),
            2 => Some(SphereMode::Add),
            3 => Some(SphereMode::SubTexture),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SphereMode::None => 0,
            SphereMode::Multiply => 1,
            SphereMode::Add => 2,
            SphereMode::SubTexture => 3,
        }
    }
}

/// Toon 贴图引用：单独纹理或共享槽 0..9
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToonSharing {
    Individual(i32),
    Shared(u8),
}

impl Default for ToonSharing {
    fn default() -> Self {
        ToonSharing::Individual(-1)
    }
}

/// MMD 材质
#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_power: f32,
    pub ambient: Vec3,
    pub draw_flags: DrawFlags,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_index: i32,
    pub sphere_texture_index: i32,
    pub sphere_mode: SphereMode,
    pub toon: ToonSharing,
    pub memo: String,
    /// 面顶点引用数，恒为 3 的倍数
    pub vertices_count: i32,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn triangle_count(&self) -> usize {
        (self.vertices_count.max(0) / 3) as usize
    }

    /// 是否双面渲染
    pub fn is_double_sided(&self) -> bool {
        self.draw_flags.contains(DrawFlags::DOUBLE_SIDED)
    }

    /// 是否绘制边缘
    pub fn has_edge(&self) -> bool {
        self.draw_flags.contains(DrawFlags::DRAWING_EDGE)
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            index: -1,
            name: String::new(),
            english_name: String::new(),
            diffuse: Vec4::new(1.0, 1.0, 1.0, 1.0),
            specular: Vec3::ZERO,
            specular_power: 0.0,
            ambient: Vec3::new(0.5, 0.5, 0.5),
            draw_flags: DrawFlags::empty(),
            edge_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            edge_size: 1.0,
            texture_index: -1,
            sphere_texture_index: -1,
            sphere_mode: SphereMode::None,
            toon: ToonSharing::default(),
            memo: String::new(),
            vertices_count: 0,
        }
    }
}

impl Indexed for Material {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for Material {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

/// 纹理路径
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Texture {
    pub index: i32,
    pub name: String,
}

impl Texture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            index: -1,
            name: name.into(),
        }
    }
}

impl Indexed for Texture {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for Texture {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

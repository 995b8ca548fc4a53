//! Morph 定义

use glam::{Quat, Vec3, Vec4};

use crate::collection::{Indexed, Named};

/// 操作面板
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MorphPanel {
    System,
    Eyebrow,
    Eye,
    Lip,
    #[default]
    Other,
}

impl MorphPanel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MorphPanel::System),
            1 => Some(MorphPanel::Eyebrow),
            2 => Some(MorphPanel::Eye),
            3 => Some(MorphPanel::Lip),
            4 => Some(MorphPanel::Other),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MorphPanel::System => 0,
            MorphPanel::Eyebrow => 1,
            MorphPanel::Eye => 2,
            MorphPanel::Lip => 3,
            MorphPanel::Other => 4,
        }
    }
}

/// Morph 类型；`AfterVertex` 为骨骼变形后应用的顶点 Morph（运行时扩展，类型值 9）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MorphType {
    Group,
    #[default]
    Vertex,
    Bone,
    Uv,
    ExtendedUv1,
    ExtendedUv2,
    ExtendedUv3,
    ExtendedUv4,
    Material,
    AfterVertex,
}

impl MorphType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MorphType::Group),
            1 => Some(MorphType::Vertex),
            2 => Some(MorphType::Bone),
            3 => Some(MorphType::Uv),
            4 => Some(MorphType::ExtendedUv1),
            5 => Some(MorphType::ExtendedUv2),
            6 => Some(MorphType::ExtendedUv3),
            7 => Some(MorphType::ExtendedUv4),
            8 => Some(MorphType::Material),
            9 => Some(MorphType::AfterVertex),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MorphType::Group => 0,
            MorphType::Vertex => 1,
            MorphType::Bone => 2,
            MorphType::Uv => 3,
            MorphType::ExtendedUv1 => 4,
            MorphType::ExtendedUv2 => 5,
            MorphType::ExtendedUv3 => 6,
            MorphType::ExtendedUv4 => 7,
            MorphType::Material => 8,
            MorphType::AfterVertex => 9,
        }
    }

    /// UV 类 Morph 对应的 UV 通道（0 = 主 UV，1..=4 = 扩展 UV）
    pub fn uv_channel(self) -> Option<usize> {
        match self {
            MorphType::Uv => Some(0),
            MorphType::ExtendedUv1 => Some(1),
            MorphType::ExtendedUv2 => Some(2),
            MorphType::ExtendedUv3 => Some(3),
            MorphType::ExtendedUv4 => Some(4),
            _ => None,
        }
    }
}

/// 材质 Morph 计算方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaterialMorphMode {
    #[default]
    Multiply,
    Add,
}

/// 材质 Morph 偏移
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialMorphOffset {
    /// -1 表示所有材质
    pub material_index: i32,
    pub mode: MaterialMorphMode,
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_power: f32,
    pub ambient: Vec3,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_factor: Vec4,
    pub sphere_texture_factor: Vec4,
    pub toon_texture_factor: Vec4,
}

/// Morph 偏移，按 Morph 类型区分
#[derive(Clone, Debug, PartialEq)]
pub enum MorphOffset {
    Group { morph_index: i32, factor: f32 },
    Vertex { vertex_index: u32, position: Vec3 },
    Bone { bone_index: i32, translation: Vec3, rotation: Quat },
    Uv { vertex_index: u32, uv: Vec4 },
    Material(MaterialMorphOffset),
}

/// Morph
#[derive(Clone, Debug, PartialEq)]
pub struct Morph {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    pub panel: MorphPanel,
    pub morph_type: MorphType,
    pub offsets: Vec<MorphOffset>,
}

impl Morph {
    pub fn new(name: impl Into<String>, morph_type: MorphType) -> Self {
        Self {
            index: -1,
            name: name.into(),
            english_name: String::new(),
            panel: MorphPanel::default(),
            morph_type,
            offsets: Vec::new(),
        }
    }
}

impl Indexed for Morph {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for Morph {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

//! 顶点与面

use glam::{Vec2, Vec3, Vec4};

use crate::collection::Indexed;

/// 顶点骨骼绑定
#[derive(Clone, Debug, PartialEq)]
pub enum Deform {
    Bdef1 { bone: i32 },
    Bdef2 { bones: [i32; 2], weight: f32 },
    Bdef4 { bones: [i32; 4], weights: [f32; 4] },
    Sdef { bones: [i32; 2], weight: f32, c: Vec3, r0: Vec3, r1: Vec3 },
    /// PMX 2.1 的双四元数蒙皮，按 BDEF4 线性混合处理
    Qdef { bones: [i32; 4], weights: [f32; 4] },
}

impl Default for Deform {
    fn default() -> Self {
        Deform::Bdef1 { bone: 0 }
    }
}

impl Deform {
    /// PMX 中的变形类型字节
    pub fn type_byte(&self) -> u8 {
        match self {
            Deform::Bdef1 { .. } => 0,
            Deform::Bdef2 { .. } => 1,
            Deform::Bdef4 { .. } => 2,
            Deform::Sdef { .. } => 3,
            Deform::Qdef { .. } => 4,
        }
    }

    pub fn bone_indices(&self) -> Vec<i32> {
        match self {
            Deform::Bdef1 { bone } => vec![*bone],
            Deform::Bdef2 { bones, .. } | Deform::Sdef { bones, .. } => bones.to_vec(),
            Deform::Bdef4 { bones, .. } | Deform::Qdef { bones, .. } => bones.to_vec(),
        }
    }

    /// 归一化后的 (骨骼, 权重) 列表；权重和为 0 时退化为第一根骨骼
    pub fn normalized_weights(&self) -> Vec<(i32, f32)> {
        let raw: Vec<(i32, f32)> = match self {
            Deform::Bdef1 { bone } => vec![(*bone, 1.0)],
            Deform::Bdef2 { bones, weight } | Deform::Sdef { bones, weight, .. } => {
                vec![(bones[0], *weight), (bones[1], 1.0 - *weight)]
            }
            Deform::Bdef4 { bones, weights } | Deform::Qdef { bones, weights } => {
                bones.iter().copied().zip(weights.iter().copied()).collect()
            }
        };

        let sum: f32 = raw.iter().map(|(_, w)| w.max(0.0)).sum();
        if sum <= f32::EPSILON {
            return vec![(raw[0].0, 1.0)];
        }
        raw.into_iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(b, w)| (b, w / sum))
            .collect()
    }
}

/// 顶点
#[derive(Clone, Debug, PartialEq)]
pub struct Vertex {
    pub index: i32,
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub extended_uvs: [Vec4; 4],
    pub deform: Deform,
    pub edge_factor: f32,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            index: -1,
            position: Vec3::ZERO,
            normal: Vec3::Y,
            uv: Vec2::ZERO,
            extended_uvs: [Vec4::ZERO; 4],
            deform: Deform::default(),
            edge_factor: 1.0,
        }
    }
}

impl Indexed for Vertex {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

/// 三角面
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Face {
    pub index: i32,
    pub vertices: [u32; 3],
}

impl Face {
    pub fn new(a: u32, b: u32, c: u32) -> Self {
        Self {
            index: -1,
            vertices: [a, b, c],
        }
    }
}

impl Indexed for Face {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

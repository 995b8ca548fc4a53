//! 顶点蒙皮计算

mod skinning;

pub use skinning::Skinner;

use glam::{Vec2, Vec3, Vec4};

/// 单个顶点的每帧偏移（顶点 / UV Morph 的结果）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VertexDelta {
    pub position: Vec3,
    pub uv: Vec4,
}

/// 蒙皮输出
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VertexBuffer {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
}

impl VertexBuffer {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 按 xyz 平铺的位置，供渲染端直接上传
    pub fn positions_raw(&self) -> Vec<f32> {
        self.positions.iter().flat_map(|p| p.to_array()).collect()
    }

    pub fn normals_raw(&self) -> Vec<f32> {
        self.normals.iter().flat_map(|n| n.to_array()).collect()
    }

    pub fn uvs_raw(&self) -> Vec<f32> {
        self.uvs.iter().flat_map(|uv| uv.to_array()).collect()
    }
}

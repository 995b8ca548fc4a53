//! MMD Runtime - MMD 兼容角色动画的运行时核心
//!
//! 提供：
//! - PMX 2.0/2.1 读写，DirectX `.x`（文本 / 二进制 / MSZIP）导入
//! - 骨骼分层排序、FK / 付与 / 固定轴 / CCD IK 变形
//! - BDEF1/2/4、SDEF 顶点蒙皮
//! - Rapier3D 刚体物理与骨骼耦合（含风场）

pub mod collection;
pub mod loader;
pub mod math;
pub mod model;
pub mod morph;
pub mod physics;
pub mod pmx;
pub mod skeleton;
pub mod skinning;
pub mod xfile;

pub use collection::{Indexed, IndexedCollection, Named, NamedCollection};
pub use loader::load_model;
pub use morph::{apply_morphs, MorphDeltas, MorphWeights};
pub use model::{Bone, BoneFlags, Deform, Material, PmxModel, RigidBody, Vertex};
pub use physics::{PhysicsCoupler, PhysicsEngine, WindField};
pub use skeleton::{BoneGraph, BoneMatrices, BoneMotion, Deformer};
pub use skinning::{Skinner, VertexBuffer, VertexDelta};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("bad extension for {}: expected {expected}", path.display())]
    BadExtension { path: PathBuf, expected: String },

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: i32, len: usize },

    #[error("name not found: {0}")]
    NameNotFound(String),

    #[error("name already exists: {0}")]
    NameConflict(String),

    #[error("name mismatch: expected {expected}, got {actual}")]
    NameMismatch { expected: String, actual: String },

    #[error("model inconsistent: {0}")]
    ModelInconsistent(String),

    #[error("parent of {bone} not found (tried {tried:?})")]
    ParentNotFound { bone: String, tried: Vec<String> },

    #[error("bone graph has a cycle through {0:?}")]
    CycleDetected(Vec<i32>),
}

pub type Result<T> = std::result::Result<T, MmdError>;

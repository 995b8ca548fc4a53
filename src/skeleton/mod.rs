//! 骨骼求值：依赖图、变形器和 IK 求解器

mod deformer;
mod graph;
mod ik_solver;
pub mod motion;

pub use deformer::Deformer;
pub use graph::{BoneGraph, BoneNode, IkChain};
pub use ik_solver::{IkSolver, IK_TOLERANCE};
pub use motion::{BezierCurve, BoneKeyframe, BoneMatrices, BoneMotion, BonePose};

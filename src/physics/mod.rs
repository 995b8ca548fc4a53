//! 刚体物理
//!
//! 使用 Rapier3D 模拟 PMX 的刚体与 Joint，并与骨骼双向耦合。
//!
//! ## 对应关系
//! | PMX | Rapier |
//! |-----|--------|
//! | 刚体 | RigidBody + Collider |
//! | Joint（6DOF 弹簧） | GenericJoint with limits/motors |
//! | 球 / 盒 / 胶囊 | ball / cuboid / capsule_y |

pub mod bone_less;
pub mod config;
mod coupler;
pub mod diagnostics;
mod engine;
mod joint;
mod rigid_body;
mod wind;

pub use config::{
    get_config, reset_config, set_config, JointConstraintConfig, PhysicsConfig, WindConfig,
};
pub use coupler::PhysicsCoupler;
pub use diagnostics::{BodyPair, BodySnapshot, StepDiagnostics, TrackReason, TrackedBody};
pub use engine::{PhysicsEngine, RayHit};
pub use joint::{joint_world_transform, PhysicsJoint};
pub use rigid_body::{BodyKey, CcdParams, PhysicsBody};
pub use wind::{cross_section_area, WindField};

//! 刚体与 Joint 定义

use glam::{Mat4, Vec3};

use crate::collection::{Indexed, Named};
use crate::math::rigid_body_rotation;

/// 刚体形状
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shape {
    #[default]
    Sphere,
    Box,
    Capsule,
}

impl Shape {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Shape::Sphere),
            1 => Some(Shape::Box),
            2 => Some(Shape::Capsule),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Shape::Sphere => 0,
            Shape::Box => 1,
            Shape::Capsule => 2,
        }
    }
}

/// 物理类型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PhysicsType {
    /// 跟随骨骼的运动学刚体
    #[default]
    Static,
    /// 纯物理
    Dynamic,
    /// 物理 + 骨骼位置对齐
    DynamicBone,
}

impl PhysicsType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PhysicsType::Static),
            1 => Some(PhysicsType::Dynamic),
            2 => Some(PhysicsType::DynamicBone),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PhysicsType::Static => 0,
            PhysicsType::Dynamic => 1,
            PhysicsType::DynamicBone => 2,
        }
    }
}

/// 刚体物理参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidBodyParam {
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
}

impl Default for RigidBodyParam {
    fn default() -> Self {
        Self {
            mass: 1.0,
            linear_damping: 0.5,
            angular_damping: 0.5,
            restitution: 0.0,
            friction: 0.5,
        }
    }
}

/// 刚体
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RigidBody {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    pub bone_index: i32,
    /// 碰撞组 0..15
    pub collision_group: u8,
    /// 第 i 位为 1 表示与组 i 碰撞
    pub collision_group_mask: u16,
    pub shape: Shape,
    /// 球：x = 半径；盒：半尺寸；胶囊：x = 半径，y = 高度
    pub size: Vec3,
    pub position: Vec3,
    /// 欧拉角（弧度）
    pub rotation: Vec3,
    pub param: RigidBodyParam,
    pub physics_type: PhysicsType,
}

impl RigidBody {
    /// MMD 坐标系中的静止姿态
    pub fn rest_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(rigid_body_rotation(self.rotation), self.position)
    }

    pub fn is_dynamic(&self) -> bool {
        self.physics_type != PhysicsType::Static
    }
}

impl Indexed for RigidBody {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for RigidBody {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

/// Joint 限制与弹簧参数
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JointParam {
    pub translation_limit_min: Vec3,
    pub translation_limit_max: Vec3,
    pub rotation_limit_min: Vec3,
    pub rotation_limit_max: Vec3,
    pub spring_constant_translation: Vec3,
    pub spring_constant_rotation: Vec3,
}

/// Joint（6 自由度弹簧）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Joint {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    /// PMX 中只定义了 0（6DOF 弹簧）
    pub joint_type: u8,
    pub rigid_body_index_a: i32,
    pub rigid_body_index_b: i32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub param: JointParam,
}

impl Joint {
    /// Joint 欧拉角顺序为 Z·Y·X（Bullet 6DOF 约定）
    pub fn rest_matrix(&self) -> Mat4 {
        let rotation = glam::Quat::from_rotation_z(self.rotation.z)
            * glam::Quat::from_rotation_y(self.rotation.y)
            * glam::Quat::from_rotation_x(self.rotation.x);
        Mat4::from_rotation_translation(rotation, self.position)
    }
}

impl Indexed for Joint {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for Joint {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

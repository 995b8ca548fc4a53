//! 物理世界中的刚体
//!
//! 每个 PMX 刚体对应一个 Rapier 的 RigidBody + Collider。刚体相对骨骼的偏移在
//! 物理坐标系（Z 轴翻转后）中计算，读写骨骼时再翻转回 MMD 坐标系。

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use super::config::PhysicsConfig;
use crate::math::{inv_z, isometry_to_mat4, mat4_to_isometry};
use crate::model::{PhysicsType, PmxModel, RigidBody as PmxRigidBody, Shape};

/// 形状尺寸下限，避免零尺寸碰撞体
pub const MIN_SHAPE_SIZE: f32 = 1e-4;

/// 地面使用的碰撞组位
pub const GROUND_GROUP: u32 = 1 << 15;
/// 地面的 user data 索引
pub const GROUND_INDEX: i32 = -2;

/// 刚体在引擎里的键：(模型索引, 刚体索引)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyKey {
    pub model_index: i32,
    pub rigid_body_index: i32,
}

impl BodyKey {
    pub const GROUND: BodyKey = BodyKey {
        model_index: GROUND_INDEX,
        rigid_body_index: GROUND_INDEX,
    };

    pub fn new(model_index: i32, rigid_body_index: i32) -> Self {
        Self {
            model_index,
            rigid_body_index,
        }
    }

    /// 打包进 Rapier 的 `user_data`
    pub fn to_user_data(self) -> u128 {
        ((self.model_index as u32 as u128) << 32) | self.rigid_body_index as u32 as u128
    }

    pub fn from_user_data(data: u128) -> Self {
        Self {
            model_index: (data >> 32) as u32 as i32,
            rigid_body_index: data as u32 as i32,
        }
    }
}

/// CCD 参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcdParams {
    pub motion_threshold: f32,
    pub swept_sphere_radius: f32,
}

/// 每个分量钳制到 [MIN_SHAPE_SIZE, f32::MAX]，NaN 视为下限
pub fn normalize_size(size: Vec3) -> Vec3 {
    let fix = |v: f32| {
        if v.is_nan() {
            MIN_SHAPE_SIZE
        } else {
            v.clamp(MIN_SHAPE_SIZE, f32::MAX)
        }
    };
    Vec3::new(fix(size.x), fix(size.y), fix(size.z))
}

/// 静态刚体质量为 0，其余钳制到非负
pub fn applied_mass(rb: &PmxRigidBody) -> f32 {
    if rb.physics_type == PhysicsType::Static {
        return 0.0;
    }
    let mass = rb.param.mass;
    if mass.is_nan() {
        0.0
    } else {
        mass.max(0.0)
    }
}

/// CCD 判定用的代表长度：球 / 胶囊取半径，盒取最小正分量
pub fn ccd_characteristic_length(shape: Shape, size: Vec3) -> f32 {
    match shape {
        Shape::Sphere | Shape::Capsule => size.x.max(0.0),
        Shape::Box => [size.x, size.y, size.z]
            .into_iter()
            .filter(|v| *v > 0.0)
            .fold(None, |min: Option<f32>, v| Some(min.map_or(v, |m| m.min(v))))
            .unwrap_or(0.0),
    }
}

/// 有质量的动态刚体才开启 CCD
pub fn resolve_ccd(shape: Shape, size: Vec3, mass: f32, config: &PhysicsConfig) -> Option<CcdParams> {
    if mass <= 0.0 {
        return None;
    }
    let length = ccd_characteristic_length(shape, size);
    if length <= 0.0 || !length.is_finite() {
        return None;
    }
    Some(CcdParams {
        motion_threshold: (length * config.ccd_threshold_scale).max(config.ccd_min_threshold),
        swept_sphere_radius: (length * config.ccd_radius_scale).max(config.ccd_min_radius),
    })
}

/// 碰撞组：成员 = 1 << group，过滤 = 非碰撞掩码
pub fn collision_groups(rb: &PmxRigidBody) -> InteractionGroups {
    InteractionGroups::new(
        Group::from_bits_truncate(1u32 << (rb.collision_group & 0x0f)),
        Group::from_bits_truncate(rb.collision_group_mask as u32),
    )
}

pub fn build_shape(shape: Shape, size: Vec3) -> SharedShape {
    match shape {
        Shape::Sphere => SharedShape::ball(size.x),
        Shape::Box => SharedShape::cuboid(size.x, size.y, size.z),
        // Rapier 的胶囊沿 Y 轴，参数为半高和半径
        Shape::Capsule => SharedShape::capsule_y(size.y * 0.5, size.x),
    }
}

/// 物理世界中的一个刚体
#[derive(Debug, Clone)]
pub struct PhysicsBody {
    pub key: BodyKey,
    pub name: String,
    pub bone_index: Option<usize>,
    pub physics_type: PhysicsType,
    pub shape: Shape,
    pub applied_size: Vec3,
    pub applied_mass: f32,
    pub base_mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub groups: InteractionGroups,
    pub ccd: Option<CcdParams>,
    /// 骨骼空间 → 刚体空间的偏移（物理坐标系）
    pub(crate) offset: Mat4,
    pub(crate) inv_offset: Mat4,
    /// 缓存的世界变换，步进后由动态刚体同步
    pub(crate) motion_state: Isometry<Real>,
    /// 上一次跟随使用的骨骼矩阵（物理坐标系）
    pub(crate) prev_bone: Option<Mat4>,
    pub(crate) handle: Option<RigidBodyHandle>,
    pub(crate) collider: Option<ColliderHandle>,
}

impl PhysicsBody {
    /// `world` 为 MMD 坐标系中的初始世界变换
    pub fn from_model(
        model_index: usize,
        model: &PmxModel,
        rb: &PmxRigidBody,
        world: Mat4,
        config: &PhysicsConfig,
    ) -> Self {
        let bone_index = usize::try_from(rb.bone_index)
            .ok()
            .filter(|&b| b < model.bones.len());
        let bone_rest = bone_index
            .and_then(|b| model.bones.get(b as i32).ok())
            .map(|b| Mat4::from_translation(b.position))
            .unwrap_or(Mat4::IDENTITY);

        let offset = inv_z(bone_rest).inverse() * inv_z(rb.rest_matrix());
        let applied_size = normalize_size(rb.size);
        let mass = applied_mass(rb);

        Self {
            key: BodyKey::new(model_index as i32, rb.index),
            name: rb.name.clone(),
            bone_index,
            physics_type: rb.physics_type,
            shape: rb.shape,
            applied_size,
            applied_mass: mass,
            base_mass: rb.param.mass,
            linear_damping: rb.param.linear_damping,
            angular_damping: rb.param.angular_damping,
            restitution: rb.param.restitution,
            friction: rb.param.friction,
            groups: collision_groups(rb),
            ccd: resolve_ccd(rb.shape, applied_size, mass, config),
            offset,
            inv_offset: offset.inverse(),
            motion_state: mat4_to_isometry(&inv_z(world)),
            prev_bone: None,
            handle: None,
            collider: None,
        }
    }

    /// 跟随骨骼（或无质量）的刚体使用运动学类型
    pub fn is_kinematic(&self) -> bool {
        self.physics_type == PhysicsType::Static || self.applied_mass <= 0.0
    }

    pub fn build_rigid_body(&self) -> RigidBody {
        let body_type = if self.is_kinematic() {
            RigidBodyType::KinematicPositionBased
        } else {
            RigidBodyType::Dynamic
        };
        RigidBodyBuilder::new(body_type)
            .position(self.motion_state)
            .linear_damping(self.linear_damping)
            .angular_damping(self.angular_damping)
            .ccd_enabled(self.ccd.is_some())
            // MMD 物理不使用休眠
            .can_sleep(false)
            .user_data(self.key.to_user_data())
            .build()
    }

    pub fn build_collider(&self) -> Collider {
        let builder = ColliderBuilder::new(build_shape(self.shape, self.applied_size))
            .restitution(self.restitution)
            .friction(self.friction)
            .collision_groups(self.groups)
            .solver_groups(self.groups)
            .user_data(self.key.to_user_data());
        let builder = if self.is_kinematic() {
            builder.density(0.0)
        } else {
            builder.mass(self.applied_mass)
        };
        builder.build()
    }

    /// 骨骼全局矩阵（物理坐标系）→ 刚体世界变换
    pub fn compute_world_transform(&self, bone_global: &Mat4) -> Isometry<Real> {
        mat4_to_isometry(&(*bone_global * self.offset))
    }

    /// 刚体世界变换 → 骨骼全局矩阵（物理坐标系）
    pub fn compute_bone_transform(&self, world: &Isometry<Real>) -> Mat4 {
        isometry_to_mat4(world) * self.inv_offset
    }

    /// 缓存的世界变换（MMD 坐标系）
    pub fn world_matrix(&self) -> Mat4 {
        inv_z(isometry_to_mat4(&self.motion_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::mat4_near;
    use crate::model::{Bone, RigidBodyParam};

    #[test]
    fn test_user_data_round_trip() {
        for key in [BodyKey::new(3, 17), BodyKey::GROUND, BodyKey::new(0, -1)] {
            assert_eq!(BodyKey::from_user_data(key.to_user_data()), key);
        }
    }

    #[test]
    fn test_normalize_size() {
        let size = normalize_size(Vec3::new(-1.0, 2.0, f32::NAN));
        assert_eq!(size, Vec3::new(MIN_SHAPE_SIZE, 2.0, MIN_SHAPE_SIZE));
        assert_eq!(normalize_size(Vec3::new(0.0, f32::INFINITY, 1.0)).y, f32::MAX);
    }

    #[test]
    fn test_ccd_parameters() {
        let config = PhysicsConfig::default();
        let sphere = resolve_ccd(Shape::Sphere, Vec3::new(0.4, 0.0, 0.0), 1.0, &config).unwrap();
        assert!((sphere.swept_sphere_radius - 0.08).abs() < 1e-6);
        assert!((sphere.motion_threshold - 0.2).abs() < 1e-6);

        let boxed = resolve_ccd(Shape::Box, Vec3::new(0.25, 1.6, 0.0), 0.5, &config).unwrap();
        assert!((boxed.swept_sphere_radius - 0.05).abs() < 1e-6);
        assert!((boxed.motion_threshold - 0.125).abs() < 1e-6);

        assert!(resolve_ccd(Shape::Box, Vec3::ONE, 0.0, &config).is_none());
        let tiny = resolve_ccd(Shape::Sphere, Vec3::new(0.001, 0.0, 0.0), 1.0, &config).unwrap();
        assert_eq!(tiny.motion_threshold, config.ccd_min_threshold);
        assert_eq!(tiny.swept_sphere_radius, config.ccd_min_radius);
    }

    #[test]
    fn test_static_body_has_no_mass() {
        let mut rb = PmxRigidBody {
            param: RigidBodyParam {
                mass: 3.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(applied_mass(&rb), 0.0);
        rb.physics_type = PhysicsType::Dynamic;
        assert_eq!(applied_mass(&rb), 3.0);
        rb.param.mass = -2.0;
        assert_eq!(applied_mass(&rb), 0.0);
    }

    #[test]
    fn test_collision_groups() {
        let rb = PmxRigidBody {
            collision_group: 3,
            collision_group_mask: 0x00f7,
            ..Default::default()
        };
        let groups = collision_groups(&rb);
        assert_eq!(groups.memberships.bits(), 1 << 3);
        assert_eq!(groups.filter.bits(), 0x00f7);
    }

    #[test]
    fn test_offset_maps_bone_rest_to_body_rest() {
        let mut model = PmxModel::new();
        let mut bone = Bone::new("arm");
        bone.position = Vec3::new(1.0, 2.0, 3.0);
        model.bones.append(bone);
        let rb = PmxRigidBody {
            bone_index: 0,
            position: Vec3::new(1.5, 2.5, 3.5),
            rotation: Vec3::new(0.3, 0.2, 0.1),
            ..Default::default()
        };
        let body = PhysicsBody::from_model(0, &model, &rb, rb.rest_matrix(), &PhysicsConfig::default());
        let bone_rest = inv_z(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let world = body.compute_world_transform(&bone_rest);
        assert!(mat4_near(&inv_z(isometry_to_mat4(&world)), &rb.rest_matrix(), 1e-5));
        assert!(mat4_near(&body.compute_bone_transform(&world), &bone_rest, 1e-5));
    }
}

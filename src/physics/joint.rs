//! 6 自由度弹簧 Joint
//!
//! Rapier 没有 Bullet 的 btGeneric6DofSpringConstraint，用 GenericJoint 的 limits
//! 加位置电机模拟弹簧。

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use super::config::JointConstraintConfig;
use crate::math::{inv_z, isometry_to_mat4, mat4_to_isometry};
use crate::model::{Joint as PmxJoint, PmxModel};
use crate::skeleton::BoneMatrices;

const AXIS_EPSILON: f32 = 1e-4;
/// 角度上下限相同时给出的最小活动范围
const MIN_ANGULAR_RANGE: f32 = 0.1;

const LINEAR_AXES: [(JointAxis, JointAxesMask); 3] = [
    (JointAxis::LinX, JointAxesMask::LIN_X),
    (JointAxis::LinY, JointAxesMask::LIN_Y),
    (JointAxis::LinZ, JointAxesMask::LIN_Z),
];
const ANGULAR_AXES: [JointAxis; 3] = [JointAxis::AngX, JointAxis::AngY, JointAxis::AngZ];

/// Joint 在 MMD 坐标系中的世界变换。
///
/// 无姿势时就是静止姿势；有姿势时取 A（否则 B）刚体绑定的骨骼，
/// 把 Joint 相对骨骼静止位置的变换挂到骨骼当前矩阵上。找不到参考骨骼返回 `None`。
pub fn joint_world_transform(
    model: &PmxModel,
    joint: &PmxJoint,
    bones: Option<&BoneMatrices>,
) -> Option<Mat4> {
    let Some(bones) = bones else {
        return Some(joint.rest_matrix());
    };
    let reference = [joint.rigid_body_index_a, joint.rigid_body_index_b]
        .into_iter()
        .filter_map(|i| model.rigid_bodies.get(i).ok())
        .filter_map(|rb| model.bones.get(rb.bone_index).ok())
        .find(|bone| (bone.index as usize) < bones.len())?;
    let local = Mat4::from_translation(-reference.position) * joint.rest_matrix();
    Some(bones.global(reference.index) * local)
}

/// 物理世界中的一个 Joint
#[derive(Debug, Clone)]
pub struct PhysicsJoint {
    pub joint_index: usize,
    pub name: String,
    pub rigid_body_a: usize,
    pub rigid_body_b: usize,
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    pub linear_spring: Vec3,
    pub angular_spring: Vec3,
    /// B 为动态刚体时才开启弹簧
    pub springs_enabled: bool,
    pub constraint: JointConstraintConfig,
    pub local_frame_a: Isometry<Real>,
    pub local_frame_b: Isometry<Real>,
    pub(crate) handle: Option<ImpulseJointHandle>,
}

impl PhysicsJoint {
    /// `world` 为 Joint 的 MMD 世界变换；`body_a` / `body_b` 为两个刚体当前的物理世界变换
    pub fn from_model(
        joint: &PmxJoint,
        world: Mat4,
        body_a: &Isometry<Real>,
        body_b: &Isometry<Real>,
        b_is_dynamic: bool,
        constraint: JointConstraintConfig,
    ) -> Self {
        let joint_world = inv_z(world);
        let local_frame_a = mat4_to_isometry(&(isometry_to_mat4(body_a).inverse() * joint_world));
        let local_frame_b = mat4_to_isometry(&(isometry_to_mat4(body_b).inverse() * joint_world));
        let p = &joint.param;

        Self {
            joint_index: joint.index as usize,
            name: joint.name.clone(),
            rigid_body_a: joint.rigid_body_index_a as usize,
            rigid_body_b: joint.rigid_body_index_b as usize,
            linear_lower: p.translation_limit_min,
            linear_upper: p.translation_limit_max,
            angular_lower: p.rotation_limit_min,
            angular_upper: p.rotation_limit_max,
            linear_spring: p.spring_constant_translation,
            angular_spring: p.spring_constant_rotation,
            springs_enabled: b_is_dynamic,
            constraint,
            local_frame_a,
            local_frame_b,
            handle: None,
        }
    }

    /// 线性上下限相同的轴锁定；角度轴不锁定，由限制和弹簧控制。
    /// 下限大于上限的轴完全自由。
    pub fn locked_axes(&self) -> JointAxesMask {
        let mut locked = JointAxesMask::empty();
        for (i, (_, mask)) in LINEAR_AXES.iter().enumerate() {
            if (self.linear_upper[i] - self.linear_lower[i]).abs() < AXIS_EPSILON {
                locked |= *mask;
            }
        }
        locked
    }

    /// 电机阻尼：CFM 越大越软
    fn spring_damping(&self, stiffness: f32) -> f32 {
        stiffness * self.constraint.cfm
    }

    pub fn build_joint(&self) -> GenericJoint {
        let locked = self.locked_axes();
        let mut joint = GenericJointBuilder::new(locked)
            .local_frame1(self.local_frame_a)
            .local_frame2(self.local_frame_b)
            .contacts_enabled(!self.constraint.disable_collisions)
            .build();

        for (i, (axis, mask)) in LINEAR_AXES.iter().enumerate() {
            if locked.contains(*mask) || self.linear_lower[i] > self.linear_upper[i] {
                continue;
            }
            joint.set_limits(*axis, [self.linear_lower[i], self.linear_upper[i]]);
        }
        for (i, axis) in ANGULAR_AXES.iter().enumerate() {
            let (lower, upper) = (self.angular_lower[i], self.angular_upper[i]);
            if lower > upper {
                continue;
            }
            if upper - lower < AXIS_EPSILON {
                joint.set_limits(*axis, [lower - MIN_ANGULAR_RANGE, lower + MIN_ANGULAR_RANGE]);
            } else {
                joint.set_limits(*axis, [lower, upper]);
            }
        }

        if self.springs_enabled {
            for (i, (axis, mask)) in LINEAR_AXES.iter().enumerate() {
                let stiffness = self.linear_spring[i];
                if stiffness != 0.0 && !locked.contains(*mask) {
                    joint.set_motor(*axis, 0.0, 0.0, stiffness, self.spring_damping(stiffness));
                }
            }
            for (i, axis) in ANGULAR_AXES.iter().enumerate() {
                let stiffness = self.angular_spring[i];
                if stiffness != 0.0 {
                    joint.set_motor(*axis, 0.0, 0.0, stiffness, self.spring_damping(stiffness));
                }
            }
        }

        joint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::mat4_near;
    use crate::model::{Bone, JointParam, RigidBody};
    use glam::Quat;

    fn joint_with_limits(min: Vec3, max: Vec3) -> PmxJoint {
        PmxJoint {
            param: JointParam {
                translation_limit_min: min,
                translation_limit_max: max,
                rotation_limit_min: Vec3::new(-0.5, 0.0, 1.0),
                rotation_limit_max: Vec3::new(0.5, 0.0, -1.0),
                spring_constant_rotation: Vec3::new(10.0, 0.0, 0.0),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_axes_lock_on_equal_limits() {
        let joint = joint_with_limits(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0));
        let identity = Isometry::identity();
        let pj = PhysicsJoint::from_model(
            &joint,
            Mat4::IDENTITY,
            &identity,
            &identity,
            true,
            JointConstraintConfig::default(),
        );
        let locked = pj.locked_axes();
        assert!(locked.contains(JointAxesMask::LIN_X));
        assert!(!locked.contains(JointAxesMask::LIN_Y));
        assert!(locked.contains(JointAxesMask::LIN_Z));
        assert!(!locked.intersects(JointAxesMask::ANG_X | JointAxesMask::ANG_Y | JointAxesMask::ANG_Z));
        let built = pj.build_joint();
        assert!(built.contacts_enabled);
    }

    #[test]
    fn test_local_frames_meet_at_joint() {
        let joint = PmxJoint {
            position: Vec3::new(0.0, 9.0, 1.0),
            rotation: Vec3::new(0.0, 0.4, 0.0),
            ..Default::default()
        };
        let a = mat4_to_isometry(&Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0)));
        let b = mat4_to_isometry(&Mat4::from_rotation_translation(
            Quat::from_rotation_x(0.3),
            Vec3::new(0.0, 8.0, -1.0),
        ));
        let pj = PhysicsJoint::from_model(
            &joint,
            joint.rest_matrix(),
            &a,
            &b,
            false,
            JointConstraintConfig::default(),
        );
        let via_a = isometry_to_mat4(&a) * isometry_to_mat4(&pj.local_frame_a);
        let via_b = isometry_to_mat4(&b) * isometry_to_mat4(&pj.local_frame_b);
        assert!(mat4_near(&via_a, &via_b, 1e-5));
        assert!(mat4_near(&via_a, &inv_z(joint.rest_matrix()), 1e-5));
        assert!(!pj.springs_enabled);
    }

    #[test]
    fn test_posed_joint_follows_reference_bone() {
        let mut model = PmxModel::new();
        let mut bone = Bone::new("hair");
        bone.position = Vec3::new(0.0, 10.0, 0.0);
        model.bones.append(bone);
        model.rigid_bodies.append(RigidBody {
            name: "a".into(),
            bone_index: 0,
            ..Default::default()
        });
        model.rigid_bodies.append(RigidBody {
            name: "b".into(),
            bone_index: -1,
            ..Default::default()
        });
        let joint = PmxJoint {
            rigid_body_index_a: 0,
            rigid_body_index_b: 1,
            position: Vec3::new(0.0, 9.0, 0.0),
            ..Default::default()
        };
        assert_eq!(joint_world_transform(&model, &joint, None), Some(joint.rest_matrix()));

        let bones = BoneMatrices {
            globals: vec![Mat4::from_translation(Vec3::new(2.0, 10.0, 0.0))],
            rest_positions: vec![Vec3::new(0.0, 10.0, 0.0)],
        };
        let posed = joint_world_transform(&model, &joint, Some(&bones)).unwrap();
        assert!(mat4_near(&posed, &Mat4::from_translation(Vec3::new(2.0, 9.0, 0.0)), 1e-6));

        let orphan = PmxJoint {
            rigid_body_index_a: 1,
            rigid_body_index_b: 1,
            ..Default::default()
        };
        assert!(joint_world_transform(&model, &orphan, Some(&bones)).is_none());
    }
}

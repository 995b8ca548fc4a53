//! 骨骼与刚体的耦合
//!
//! 步进前把骨骼写进刚体（跟随骨骼的刚体直接同步，DynamicBone 做差分跟随），
//! 步进后把动态刚体的结果写回骨骼。

use glam::Mat4;
use rapier3d::prelude::*;

use super::engine::PhysicsEngine;
use super::rigid_body::PhysicsBody;
use crate::math::{
    from_na_vector, inv_z, isometry_to_mat4, mat4_near, mat4_to_isometry, rotation_angle,
    rotation_of, to_na_vector, translation_of, ROTATION_EPSILON,
};
use crate::model::PhysicsType;
use crate::skeleton::{BoneMatrices, Deformer};

/// 骨骼矩阵未变化的判定误差
const UNCHANGED_EPSILON: f32 = 1e-7;
/// 骨骼已经与刚体一致的判定误差
const IN_SYNC_EPSILON: f32 = 1e-6;

/// 一个模型与物理世界之间的耦合视图
pub struct PhysicsCoupler<'a> {
    engine: &'a mut PhysicsEngine,
    model_index: usize,
}

impl<'a> PhysicsCoupler<'a> {
    pub fn new(engine: &'a mut PhysicsEngine, model_index: usize) -> Self {
        Self {
            engine,
            model_index,
        }
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    /// 直接把刚体放到骨骼驱动的位置。`bone_global` 为 MMD 坐标系
    pub fn update_transform(&mut self, rigid_body_index: usize, bone_global: Mat4) {
        let Some((body, set)) = self.engine.body_and_set(self.model_index, rigid_body_index) else {
            return;
        };
        let bone = inv_z(bone_global);
        let world = body.compute_world_transform(&bone);
        body.motion_state = world;
        body.prev_bone = Some(bone);

        let kinematic = body.is_kinematic();
        let Some(rb) = body.handle.and_then(|h| set.get_mut(h)) else {
            return;
        };
        if kinematic {
            rb.set_next_kinematic_position(world);
        } else {
            rb.set_position(world, true);
            rb.set_linvel(Vector::zeros(), true);
            rb.set_angvel(Vector::zeros(), true);
        }
    }

    /// 差分跟随：把骨骼这一帧的运动叠加到刚体上，保留刚体自身的摆动。
    ///
    /// 第一次调用退化为直接同步。骨骼旋转量超过上限时，速度不随之旋转。
    pub fn follow_delta_transform(&mut self, rigid_body_index: usize, bone_global: Mat4) {
        let limit = self.engine.config.follow_delta_limit();
        let Some((body, set)) = self.engine.body_and_set(self.model_index, rigid_body_index) else {
            return;
        };
        let current = inv_z(bone_global);
        let Some(prev) = body.prev_bone else {
            self.update_transform(rigid_body_index, bone_global);
            return;
        };
        if mat4_near(&current, &prev, UNCHANGED_EPSILON) {
            return;
        }
        let implied = body.compute_bone_transform(&body.motion_state);
        if mat4_near(&current, &implied, IN_SYNC_EPSILON) {
            body.prev_bone = Some(current);
            return;
        }

        let delta = current * prev.inverse();
        let target = mat4_to_isometry(&(delta * isometry_to_mat4(&body.motion_state)));
        body.motion_state = target;
        body.prev_bone = Some(current);

        let Some(rb) = body.handle.and_then(|h| set.get_mut(h)) else {
            return;
        };
        rb.set_position(target, false);

        let delta_rotation = rotation_of(&delta);
        if rotation_angle(delta_rotation) <= limit + ROTATION_EPSILON {
            let linvel = delta_rotation * from_na_vector(rb.linvel());
            let angvel = delta_rotation * from_na_vector(rb.angvel());
            rb.set_linvel(to_na_vector(linvel), false);
            rb.set_angvel(to_na_vector(angvel), false);
        }
        rb.wake_up(true);
    }

    /// 刚体当前推出的骨骼全局矩阵（MMD 坐标系）
    pub fn rigid_body_bone_matrix(&self, rigid_body_index: usize) -> Option<Mat4> {
        self.engine
            .rigid_body_bone_matrix(self.model_index, rigid_body_index)
    }

    fn bodies(&self) -> &[PhysicsBody] {
        self.engine
            .models
            .get(&self.model_index)
            .map_or(&[], |m| m.bodies.as_slice())
    }

    /// 步进前把骨骼写入刚体。
    ///
    /// `force` 为 true 时所有刚体直接同步（用于重置或跳帧）。
    pub fn sync_bones(&mut self, bones: &BoneMatrices, force: bool) {
        let targets: Vec<(usize, usize, PhysicsType, bool)> = self
            .bodies()
            .iter()
            .enumerate()
            .filter_map(|(i, b)| Some((i, b.bone_index?, b.physics_type, b.is_kinematic())))
            .collect();
        for (index, bone, physics_type, kinematic) in targets {
            if bone >= bones.len() {
                continue;
            }
            let global = bones.global(bone as i32);
            match physics_type {
                _ if force => self.update_transform(index, global),
                PhysicsType::Static => self.update_transform(index, global),
                PhysicsType::Dynamic if kinematic => self.update_transform(index, global),
                PhysicsType::Dynamic => {}
                PhysicsType::DynamicBone => self.follow_delta_transform(index, global),
            }
        }
    }

    /// 步进后把刚体结果写回 `bones`，返回写入的骨骼数。
    ///
    /// Dynamic 写入完整矩阵；DynamicBone 只取刚体的旋转，位置保持骨骼当前值。
    pub fn read_bones(&self, bones: &mut BoneMatrices) -> usize {
        let mut written = 0;
        for body in self.bodies() {
            let Some(bone) = body.bone_index.filter(|&b| b < bones.len()) else {
                continue;
            };
            if let Some(global) = self.posed_bone(body, bones.globals[bone]) {
                bones.globals[bone] = global;
                written += 1;
            }
        }
        written
    }

    /// 与 `read_bones` 相同，但写进 `Deformer`，子骨骼随之刷新。
    /// 按骨骼索引顺序写入，保证父骨骼先于子骨骼。
    pub fn apply_to_deformer(&self, deformer: &mut Deformer) -> usize {
        let mut order: Vec<&PhysicsBody> = self
            .bodies()
            .iter()
            .filter(|b| b.bone_index.is_some())
            .collect();
        order.sort_by_key(|b| b.bone_index);

        let mut written = 0;
        for body in order {
            let Some(bone) = body.bone_index else {
                continue;
            };
            if let Some(global) = self.posed_bone(body, deformer.global(bone)) {
                deformer.set_global(bone, global);
                written += 1;
            }
        }
        written
    }

    fn posed_bone(&self, body: &PhysicsBody, current: Mat4) -> Option<Mat4> {
        match body.physics_type {
            PhysicsType::Static => None,
            _ if body.is_kinematic() => None,
            PhysicsType::Dynamic => Some(inv_z(body.compute_bone_transform(&body.motion_state))),
            PhysicsType::DynamicBone => {
                let simulated = inv_z(body.compute_bone_transform(&body.motion_state));
                Some(Mat4::from_rotation_translation(
                    rotation_of(&simulated),
                    translation_of(&current),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bone, PmxModel, RigidBody as PmxRigidBody, Shape};
    use crate::physics::config::PhysicsConfig;
    use crate::skeleton::BonePose;
    use glam::{Quat, Vec3};

    fn one_bone_model(physics_type: PhysicsType) -> PmxModel {
        let mut model = PmxModel::new();
        let mut bone = Bone::new("hair");
        bone.position = Vec3::new(0.0, 10.0, 0.0);
        model.bones.append(bone);
        model.rigid_bodies.append(PmxRigidBody {
            name: "hair_rb".into(),
            bone_index: 0,
            shape: Shape::Sphere,
            size: Vec3::new(0.5, 0.0, 0.0),
            position: Vec3::new(0.0, 11.0, 0.0),
            physics_type,
            ..Default::default()
        });
        model
    }

    fn engine_with(physics_type: PhysicsType, gravity: Vec3) -> PhysicsEngine {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut engine = PhysicsEngine::with_config(gravity, PhysicsConfig::default());
        engine.add_model(0, &one_bone_model(physics_type));
        engine
    }

    #[test]
    fn test_static_round_trip() {
        let mut engine = engine_with(PhysicsType::Static, Vec3::ZERO);
        let bone = Mat4::from_rotation_translation(
            Quat::from_rotation_y(0.7) * Quat::from_rotation_x(0.2),
            Vec3::new(1.0, 12.0, -3.0),
        );
        let mut coupler = PhysicsCoupler::new(&mut engine, 0);
        coupler.update_transform(0, bone);
        let back = coupler.rigid_body_bone_matrix(0).unwrap();
        assert!(mat4_near(&back, &bone, 1e-5));

        let mut bones = BoneMatrices {
            globals: vec![bone],
            rest_positions: vec![Vec3::new(0.0, 10.0, 0.0)],
        };
        // 跟随骨骼的刚体不回写
        assert_eq!(coupler.read_bones(&mut bones), 0);
    }

    #[test]
    fn test_follow_delta_moves_with_bone() {
        let mut engine = engine_with(PhysicsType::DynamicBone, Vec3::ZERO);
        let start = Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0));
        let mut coupler = PhysicsCoupler::new(&mut engine, 0);

        coupler.follow_delta_transform(0, start);
        let first = coupler.rigid_body_bone_matrix(0).unwrap();
        assert!(mat4_near(&first, &start, 1e-5));

        coupler.follow_delta_transform(0, start);
        assert!(mat4_near(&coupler.rigid_body_bone_matrix(0).unwrap(), &first, 1e-7));

        let moved = Mat4::from_translation(Vec3::new(0.5, 11.0, 0.0));
        coupler.follow_delta_transform(0, moved);
        let body = engine.body(0, 0).unwrap();
        let position = body.world_matrix().w_axis.truncate();
        assert!((position - Vec3::new(0.5, 12.0, 0.0)).length() < 1e-5);
        assert!(body.prev_bone.is_some());
    }

    fn linvel_after_turn(angle: f32) -> Vec3 {
        let mut engine = engine_with(PhysicsType::DynamicBone, Vec3::ZERO);
        let start = Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0));
        {
            let mut coupler = PhysicsCoupler::new(&mut engine, 0);
            coupler.follow_delta_transform(0, start);
        }
        let handle = engine.body(0, 0).unwrap().handle.unwrap();
        engine
            .rigid_body_set
            .get_mut(handle)
            .unwrap()
            .set_linvel(to_na_vector(Vec3::X), true);

        let turned = start * Mat4::from_rotation_y(angle);
        PhysicsCoupler::new(&mut engine, 0).follow_delta_transform(0, turned);
        from_na_vector(engine.rigid_body_set.get(handle).unwrap().linvel())
    }

    #[test]
    fn test_follow_delta_rotates_velocity_within_limit() {
        let small = linvel_after_turn(0.3);
        assert!((small.length() - 1.0).abs() < 1e-4);
        assert!(small.z.abs() > 0.2);

        // 超过默认 π/6 的旋转不带动速度
        let large = linvel_after_turn(1.2);
        assert!((large - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn test_dynamic_body_drives_bone() {
        let model = one_bone_model(PhysicsType::Dynamic);
        let mut engine = PhysicsEngine::with_config(Vec3::new(0.0, -9.8, 0.0), PhysicsConfig::default());
        engine.add_model(0, &model);
        let mut deformer = Deformer::new(&model).unwrap();
        let mut bones = deformer.evaluate_before_physics(&BonePose::rest(1));

        PhysicsCoupler::new(&mut engine, 0).sync_bones(&bones, true);
        for _ in 0..10 {
            engine.step(1.0 / 60.0, 1, 1.0 / 60.0);
        }

        let coupler = PhysicsCoupler::new(&mut engine, 0);
        assert_eq!(coupler.read_bones(&mut bones), 1);
        assert!(bones.globals[0].w_axis.y < 10.0);

        assert_eq!(coupler.apply_to_deformer(&mut deformer), 1);
        assert!((deformer.global(0).w_axis.y - bones.globals[0].w_axis.y).abs() < 1e-5);
    }

    #[test]
    fn test_dynamic_bone_keeps_bone_translation() {
        let model = one_bone_model(PhysicsType::DynamicBone);
        let mut engine = PhysicsEngine::with_config(Vec3::new(0.0, -9.8, 0.0), PhysicsConfig::default());
        engine.add_model(0, &model);
        for _ in 0..10 {
            engine.step(1.0 / 60.0, 1, 1.0 / 60.0);
        }
        let mut bones = BoneMatrices {
            globals: vec![Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0))],
            rest_positions: vec![Vec3::new(0.0, 10.0, 0.0)],
        };
        assert_eq!(PhysicsCoupler::new(&mut engine, 0).read_bones(&mut bones), 1);
        assert_eq!(bones.globals[0].w_axis.truncate(), Vec3::new(0.0, 10.0, 0.0));
    }
}

//! 物理世界
//!
//! ## Bullet → Rapier 对应
//! | Bullet | Rapier |
//! |--------|--------|
//! | btDiscreteDynamicsWorld | PhysicsPipeline + RigidBodySet + ColliderSet + ImpulseJointSet |
//! | btDbvtBroadphase | DefaultBroadPhase |
//! | btCollisionDispatcher | NarrowPhase |
//! | btDefaultMotionState | `PhysicsBody::motion_state` |
//! | btGeneric6DofSpringConstraint | GenericJoint（limits + motors） |
//!
//! 一个引擎可以容纳多个模型，刚体和 Joint 以 (模型索引, 刚体索引) 对外暴露。
//! 引擎内部使用 Z 轴翻转后的坐标系，所有公开接口都使用 MMD 坐标系。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use super::bone_less::{rest_transform, resolve_bone_less_transform};
use super::config::{clamp_follow_delta_max_radians, get_config, JointConstraintConfig, PhysicsConfig, WindConfig};
use super::diagnostics::{BodySnapshot, StepDiagnostics, TrackedBody};
use super::joint::{joint_world_transform, PhysicsJoint};
use super::rigid_body::{BodyKey, PhysicsBody, GROUND_GROUP};
use super::wind::WindField;
use crate::math::{flip_z, to_na_vector};
use crate::model::{Joint as PmxJoint, PhysicsType, PmxModel, RigidBody as PmxRigidBody};
use crate::skeleton::BoneMatrices;

/// MMD 的重力单位比物理引擎大 10 倍
const GRAVITY_SCALE: f32 = 10.0;
/// 计算子步数时的容差
const SUBSTEP_EPSILON: f32 = 1e-4;

/// 射线检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub model_index: i32,
    pub rigid_body_index: i32,
    /// 命中点在 from → to 上的比例
    pub hit_fraction: f32,
}

/// 一个模型在物理世界中的全部对象。`bodies[i]` 对应刚体索引 i
#[derive(Debug, Default)]
pub(crate) struct ModelPhysics {
    pub(crate) bodies: Vec<PhysicsBody>,
    pub(crate) joints: Vec<PhysicsJoint>,
}

pub struct PhysicsEngine {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    pub(crate) rigid_body_set: RigidBodySet,
    pub(crate) collider_set: ColliderSet,
    pub(crate) impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    ground_handle: RigidBodyHandle,
    /// 物理坐标系的重力（已放大）
    gravity: Vector<Real>,
    pub(crate) config: PhysicsConfig,
    joint_overrides: HashMap<usize, JointConstraintConfig>,
    pub(crate) models: BTreeMap<usize, ModelPhysics>,
    wind: WindField,
    /// 固定步长的剩余时间
    time_accumulator: f32,
}

impl PhysicsEngine {
    /// 使用全局配置创建物理世界。`gravity` 为 MMD 坐标系的重力
    pub fn new(gravity: Vec3) -> Self {
        Self::with_config(gravity, get_config())
    }

    pub fn with_config(gravity: Vec3, config: PhysicsConfig) -> Self {
        let mut rigid_body_set = RigidBodySet::new();
        let mut collider_set = ColliderSet::new();
        let ground_handle = insert_ground(&mut rigid_body_set, &mut collider_set);

        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.fixed_timestep;
        integration_parameters.num_solver_iterations =
            NonZeroUsize::new(config.solver_iterations).unwrap_or(NonZeroUsize::MIN);

        log::debug!(
            "physics world: gravity={:?}, solver_iterations={}, fixed_timestep={}",
            gravity,
            config.solver_iterations,
            config.fixed_timestep
        );

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set,
            collider_set,
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            ground_handle,
            gravity: engine_gravity(gravity),
            wind: WindField::from_config(config.wind),
            config,
            joint_overrides: HashMap::new(),
            models: BTreeMap::new(),
            time_accumulator: 0.0,
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = engine_gravity(gravity);
    }

    /// MMD 坐标系的重力
    pub fn gravity(&self) -> Vec3 {
        let g = self.gravity;
        flip_z(Vec3::new(g.x, g.y / GRAVITY_SCALE, g.z))
    }

    /// 删除所有模型并重建世界
    pub fn reset_world(&mut self, gravity: Vec3) {
        let indices: Vec<usize> = self.models.keys().copied().collect();
        for index in indices {
            self.remove_model_objects(index);
        }
        self.pipeline = PhysicsPipeline::new();
        self.island_manager = IslandManager::new();
        self.broad_phase = DefaultBroadPhase::new();
        self.narrow_phase = NarrowPhase::new();
        self.rigid_body_set = RigidBodySet::new();
        self.collider_set = ColliderSet::new();
        self.impulse_joint_set = ImpulseJointSet::new();
        self.multibody_joint_set = MultibodyJointSet::new();
        self.ccd_solver = CCDSolver::new();
        self.query_pipeline = QueryPipeline::new();
        self.ground_handle = insert_ground(&mut self.rigid_body_set, &mut self.collider_set);
        self.gravity = engine_gravity(gravity);
        self.wind = WindField::from_config(*self.wind.config());
        self.time_accumulator = 0.0;
    }

    // ========== 模型 ==========

    /// 以静止姿势加入模型
    pub fn add_model(&mut self, model_index: usize, model: &PmxModel) {
        self.build_model(model_index, model, None);
    }

    /// 以当前姿势加入模型：刚体放到骨骼驱动的位置上
    pub fn add_model_posed(&mut self, model_index: usize, model: &PmxModel, bones: &BoneMatrices) {
        self.build_model(model_index, model, Some(bones));
    }

    pub fn has_model(&self, model_index: usize) -> bool {
        self.models.contains_key(&model_index)
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn body_count(&self, model_index: usize) -> usize {
        self.models.get(&model_index).map_or(0, |m| m.bodies.len())
    }

    pub fn joint_count(&self, model_index: usize) -> usize {
        self.models.get(&model_index).map_or(0, |m| m.joints.len())
    }

    /// 删除模型，释放其全部 Joint、刚体和碰撞体
    pub fn delete_model(&mut self, model_index: usize) {
        self.remove_model_objects(model_index);
        self.joint_overrides.remove(&model_index);
    }

    /// 把模型的刚体重建回静止姿势，保留该模型的 Joint 配置
    pub fn reset_model(&mut self, model_index: usize, model: &PmxModel) {
        self.build_model(model_index, model, None);
    }

    fn build_model(&mut self, model_index: usize, model: &PmxModel, bones: Option<&BoneMatrices>) {
        if self.models.contains_key(&model_index) {
            self.remove_model_objects(model_index);
        }

        let mut entry = ModelPhysics {
            bodies: Vec::with_capacity(model.rigid_bodies.len()),
            joints: Vec::with_capacity(model.joints.len()),
        };
        for rb in model.rigid_bodies.iter_by_index() {
            let body = self.insert_body(model_index, model, rb, bones);
            entry.bodies.push(body);
        }

        let constraint = self.joint_config_for(model_index);
        for joint in model.joints.iter_by_index() {
            if let Some(pj) = self.insert_joint(model, joint, &entry.bodies, bones, constraint) {
                entry.joints.push(pj);
            }
        }

        log::info!(
            "physics model {}: {} rigid bodies, {} joints",
            model_index,
            entry.bodies.len(),
            entry.joints.len()
        );
        self.models.insert(model_index, entry);
    }

    fn insert_body(
        &mut self,
        model_index: usize,
        model: &PmxModel,
        rb: &PmxRigidBody,
        bones: Option<&BoneMatrices>,
    ) -> PhysicsBody {
        let world = initial_world_transform(model, rb, bones);
        let mut body = PhysicsBody::from_model(model_index, model, rb, world, &self.config);
        let handle = self.rigid_body_set.insert(body.build_rigid_body());
        let collider = self.collider_set.insert_with_parent(
            body.build_collider(),
            handle,
            &mut self.rigid_body_set,
        );
        body.handle = Some(handle);
        body.collider = Some(collider);
        body
    }

    fn insert_joint(
        &mut self,
        model: &PmxModel,
        joint: &PmxJoint,
        bodies: &[PhysicsBody],
        bones: Option<&BoneMatrices>,
        constraint: JointConstraintConfig,
    ) -> Option<PhysicsJoint> {
        let body_at = |i: i32| usize::try_from(i).ok().and_then(|i| bodies.get(i));
        let (Some(a), Some(b)) = (
            body_at(joint.rigid_body_index_a),
            body_at(joint.rigid_body_index_b),
        ) else {
            log::warn!(
                "joint {} ({}) references missing rigid bodies {} / {}, skipped",
                joint.index,
                joint.name,
                joint.rigid_body_index_a,
                joint.rigid_body_index_b
            );
            return None;
        };
        let (Some(handle_a), Some(handle_b)) = (a.handle, b.handle) else {
            return None;
        };
        if joint.joint_type != 0 {
            log::debug!(
                "joint {} ({}) type {} simulated as a 6-DOF spring",
                joint.index,
                joint.name,
                joint.joint_type
            );
        }

        let world = joint_world_transform(model, joint, bones).unwrap_or_else(|| {
            // 两端都没有骨骼：保持 Joint 相对 A 刚体静止时的位置
            let rest_a = model
                .rigid_bodies
                .get(joint.rigid_body_index_a)
                .map(|rb| rest_transform(model, rb))
                .unwrap_or(Mat4::IDENTITY);
            a.world_matrix() * rest_a.inverse() * joint.rest_matrix()
        });

        let mut pj = PhysicsJoint::from_model(
            joint,
            world,
            &a.motion_state,
            &b.motion_state,
            b.physics_type != PhysicsType::Static,
            constraint,
        );
        pj.handle = Some(
            self.impulse_joint_set
                .insert(handle_a, handle_b, pj.build_joint(), true),
        );
        Some(pj)
    }

    fn remove_joint(&mut self, joint: &PhysicsJoint) {
        if let Some(handle) = joint.handle {
            self.impulse_joint_set.remove(handle, true);
        }
    }

    fn remove_body(&mut self, body: &PhysicsBody) {
        if let Some(handle) = body.handle {
            self.rigid_body_set.remove(
                handle,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            );
        }
    }

    fn remove_model_objects(&mut self, model_index: usize) {
        let Some(entry) = self.models.remove(&model_index) else {
            return;
        };
        for joint in &entry.joints {
            self.remove_joint(joint);
        }
        for body in &entry.bodies {
            self.remove_body(body);
        }
        log::debug!("physics model {} removed", model_index);
    }

    /// 只重建 `changed[i]` 为 true 的刚体（以及与之相连的 Joint），放到骨骼驱动的位置上
    pub fn update_physics_selectively(
        &mut self,
        model_index: usize,
        model: &PmxModel,
        bones: &BoneMatrices,
        changed: &[bool],
    ) {
        let Some(mut entry) = self.models.remove(&model_index) else {
            return;
        };
        let targets: HashSet<i32> = changed
            .iter()
            .enumerate()
            .filter(|(i, c)| **c && *i < entry.bodies.len())
            .map(|(i, _)| i as i32)
            .collect();
        if targets.is_empty() {
            self.models.insert(model_index, entry);
            return;
        }
        let touches = |a: i32, b: i32| targets.contains(&a) || targets.contains(&b);

        let (stale, kept): (Vec<_>, Vec<_>) = entry.joints.drain(..).partition(|j| {
            touches(j.rigid_body_a as i32, j.rigid_body_b as i32)
        });
        entry.joints = kept;
        for joint in &stale {
            self.remove_joint(joint);
        }

        for &index in &targets {
            let Ok(rb) = model.rigid_bodies.get(index) else {
                continue;
            };
            self.remove_body(&entry.bodies[index as usize]);
            entry.bodies[index as usize] = self.insert_body(model_index, model, rb, Some(bones));
        }

        let constraint = self.joint_config_for(model_index);
        let mut rebuilt = 0;
        for joint in model.joints.iter_by_index() {
            if !touches(joint.rigid_body_index_a, joint.rigid_body_index_b) {
                continue;
            }
            if let Some(pj) = self.insert_joint(model, joint, &entry.bodies, Some(bones), constraint) {
                entry.joints.push(pj);
                rebuilt += 1;
            }
        }
        entry.joints.sort_by_key(|j| j.joint_index);

        log::debug!(
            "physics model {}: rebuilt {} rigid bodies, {} joints",
            model_index,
            targets.len(),
            rebuilt
        );
        self.models.insert(model_index, entry);
    }

    // ========== Joint 配置 ==========

    fn joint_config_for(&self, model_index: usize) -> JointConstraintConfig {
        self.joint_overrides
            .get(&model_index)
            .copied()
            .unwrap_or(self.config.joint)
    }

    /// 全局 Joint 配置，影响之后创建的 Joint
    pub fn set_joint_config(&mut self, config: JointConstraintConfig) {
        self.config.joint = config;
    }

    /// 模型专用的 Joint 配置；`None` 恢复使用全局配置
    pub fn set_model_joint_config(&mut self, model_index: usize, config: Option<JointConstraintConfig>) {
        match config {
            Some(config) => {
                self.joint_overrides.insert(model_index, config);
            }
            None => {
                self.joint_overrides.remove(&model_index);
            }
        }
    }

    /// 切换 Joint 两端刚体间的碰撞，已有的 Joint 立即重建
    pub fn set_model_disable_collisions(&mut self, model_index: usize, disable: bool) {
        let mut config = self.joint_config_for(model_index);
        config.disable_collisions = disable;
        self.joint_overrides.insert(model_index, config);

        let Some(mut entry) = self.models.remove(&model_index) else {
            return;
        };
        for joint in &mut entry.joints {
            self.remove_joint(joint);
            joint.constraint.disable_collisions = disable;
            let (Some(a), Some(b)) = (
                entry.bodies.get(joint.rigid_body_a).and_then(|b| b.handle),
                entry.bodies.get(joint.rigid_body_b).and_then(|b| b.handle),
            ) else {
                joint.handle = None;
                continue;
            };
            joint.handle = Some(self.impulse_joint_set.insert(a, b, joint.build_joint(), true));
        }
        self.models.insert(model_index, entry);
    }

    pub fn set_follow_delta_max_radians(&mut self, radians: f32) {
        self.config.follow_delta_max_radians = clamp_follow_delta_max_radians(radians);
    }

    // ========== 风 ==========

    pub fn wind(&self) -> &WindField {
        &self.wind
    }

    pub fn wind_mut(&mut self) -> &mut WindField {
        &mut self.wind
    }

    /// 替换风参数，阵风时间从 0 重新开始
    pub fn set_wind(&mut self, config: WindConfig) {
        log::debug!("wind: enabled={}, speed={}", config.enabled, config.speed);
        self.wind = WindField::from_config(config);
    }

    // ========== 步进 ==========

    /// 推进模拟。
    ///
    /// 与 Bullet 的 stepSimulation 一致：`max_substeps > 0` 时按 `fixed_timestep`
    /// 累积时间，最多执行 `max_substeps` 步；为 0 时直接以 `dt` 走一步。
    /// 风力在每次调用时施加一次。
    pub fn step(&mut self, dt: f32, max_substeps: u32, fixed_timestep: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }

        for body in self.models.values().flat_map(|m| &m.bodies) {
            if body.is_kinematic() {
                continue;
            }
            if let Some(rb) = body.handle.and_then(|h| self.rigid_body_set.get_mut(h)) {
                rb.reset_forces(false);
            }
        }
        self.wind.apply(
            dt,
            &mut self.rigid_body_set,
            self.models.values().flat_map(|m| &m.bodies),
        );

        if max_substeps == 0 {
            self.step_once(dt);
        } else {
            let fixed = if fixed_timestep > 0.0 {
                fixed_timestep
            } else {
                self.config.fixed_timestep
            };
            self.time_accumulator += dt;
            let steps = (self.time_accumulator / fixed + SUBSTEP_EPSILON).floor().max(0.0) as u32;
            self.time_accumulator -= steps as f32 * fixed;
            for _ in 0..steps.min(max_substeps) {
                self.step_once(fixed);
            }
        }

        self.sync_motion_states();
    }

    /// 使用配置中的子步数和步长推进
    pub fn step_default(&mut self, dt: f32) {
        self.step(dt, self.config.max_substeps, self.config.fixed_timestep);
    }

    fn step_once(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
    }

    /// 动态刚体的缓存变换取自模拟结果
    fn sync_motion_states(&mut self) {
        for body in self.models.values_mut().flat_map(|m| &mut m.bodies) {
            if body.is_kinematic() {
                continue;
            }
            if let Some(rb) = body.handle.and_then(|h| self.rigid_body_set.get(h)) {
                body.motion_state = *rb.position();
            }
        }
    }

    // ========== 查询 ==========

    pub fn body(&self, model_index: usize, rigid_body_index: usize) -> Option<&PhysicsBody> {
        self.models.get(&model_index)?.bodies.get(rigid_body_index)
    }

    pub fn joints(&self, model_index: usize) -> &[PhysicsJoint] {
        self.models
            .get(&model_index)
            .map_or(&[], |m| m.joints.as_slice())
    }

    /// 刚体当前位置推出的骨骼全局矩阵（MMD 坐标系）
    pub fn rigid_body_bone_matrix(&self, model_index: usize, rigid_body_index: usize) -> Option<Mat4> {
        let body = self.body(model_index, rigid_body_index)?;
        Some(crate::math::inv_z(body.compute_bone_transform(&body.motion_state)))
    }

    /// 射线检测，忽略地面。`mask` 为要检测的碰撞组位，`None` 检测全部
    pub fn ray_test(&mut self, from: Vec3, to: Vec3, mask: Option<u32>) -> Option<RayHit> {
        let origin = flip_z(from);
        let dir = flip_z(to) - origin;
        if dir.length_squared() <= f32::EPSILON {
            return None;
        }
        self.query_pipeline.update(&self.collider_set);

        let ray = Ray::new(Point::from(to_na_vector(origin)), to_na_vector(dir));
        let mut filter = QueryFilter::default().exclude_rigid_body(self.ground_handle);
        if let Some(mask) = mask {
            filter = filter.groups(InteractionGroups::new(
                Group::ALL,
                Group::from_bits_truncate(mask),
            ));
        }
        let (collider, toi) = self.query_pipeline.cast_ray(
            &self.rigid_body_set,
            &self.collider_set,
            &ray,
            1.0,
            true,
            filter,
        )?;
        let key = BodyKey::from_user_data(self.collider_set.get(collider)?.user_data);
        Some(RayHit {
            model_index: key.model_index,
            rigid_body_index: key.rigid_body_index,
            hit_fraction: toi,
        })
    }

    // ========== 诊断 ==========

    pub fn step_diagnostics(&self) -> StepDiagnostics {
        StepDiagnostics::collect(
            &self.narrow_phase,
            &self.collider_set,
            &self.rigid_body_set,
            self.models.values().flat_map(|m| &m.bodies),
        )
    }

    pub fn body_snapshot(&self, key: BodyKey) -> BodySnapshot {
        let body = usize::try_from(key.model_index)
            .ok()
            .zip(usize::try_from(key.rigid_body_index).ok())
            .and_then(|(m, r)| self.body(m, r));
        match body {
            Some(body) => BodySnapshot::capture(body, &self.rigid_body_set),
            None => BodySnapshot::unresolved(key),
        }
    }

    /// 诊断中值得关注的刚体及其快照
    pub fn tracked_bodies(&self, diagnostics: &StepDiagnostics) -> Vec<(TrackedBody, BodySnapshot)> {
        diagnostics
            .tracked_bodies()
            .into_iter()
            .map(|t| (t, self.body_snapshot(t.key)))
            .collect()
    }

    /// 耦合器需要同时修改缓存和 Rapier 刚体
    pub(crate) fn body_and_set(
        &mut self,
        model_index: usize,
        rigid_body_index: usize,
    ) -> Option<(&mut PhysicsBody, &mut RigidBodySet)> {
        let body = self
            .models
            .get_mut(&model_index)?
            .bodies
            .get_mut(rigid_body_index)?;
        Some((body, &mut self.rigid_body_set))
    }
}

impl Default for PhysicsEngine {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, -9.8, 0.0))
    }
}

fn engine_gravity(gravity: Vec3) -> Vector<Real> {
    to_na_vector(flip_z(Vec3::new(gravity.x, gravity.y * GRAVITY_SCALE, gravity.z)))
}

/// 地面：y = 0 的无限平面，属于第 16 组，与所有组碰撞
fn insert_ground(bodies: &mut RigidBodySet, colliders: &mut ColliderSet) -> RigidBodyHandle {
    let handle = bodies.insert(
        RigidBodyBuilder::fixed()
            .user_data(BodyKey::GROUND.to_user_data())
            .build(),
    );
    let groups = InteractionGroups::new(
        Group::from_bits_truncate(GROUND_GROUP),
        Group::from_bits_truncate(0xFFFF),
    );
    let collider = ColliderBuilder::halfspace(Vector::y_axis())
        .collision_groups(groups)
        .solver_groups(groups)
        .user_data(BodyKey::GROUND.to_user_data())
        .build();
    colliders.insert_with_parent(collider, handle, bodies);
    handle
}

/// 刚体的初始世界变换（MMD 坐标系）。
///
/// 有姿势时为 骨骼全局矩阵 · 骨骼空间中的静止变换；未绑定骨骼的刚体另行推定。
fn initial_world_transform(model: &PmxModel, rb: &PmxRigidBody, bones: Option<&BoneMatrices>) -> Mat4 {
    if rb.bone_index < 0 {
        let resolved = resolve_bone_less_transform(model, rb, bones);
        log::debug!("rigid body {} ({}) anchored by {:?}", rb.index, rb.name, resolved.anchor);
        return resolved.world;
    }
    match (bones, model.bones.get(rb.bone_index)) {
        (Some(bones), Ok(bone)) if (bone.index as usize) < bones.len() => {
            bones.global(bone.index) * Mat4::from_translation(-bone.position) * rb.rest_matrix()
        }
        _ => rb.rest_matrix(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bone, JointParam, RigidBodyParam, Shape};

    fn test_engine(gravity: Vec3) -> PhysicsEngine {
        let _ = env_logger::builder().is_test(true).try_init();
        PhysicsEngine::with_config(gravity, PhysicsConfig::default())
    }

    fn sphere(name: &str, position: Vec3, physics_type: PhysicsType) -> PmxRigidBody {
        PmxRigidBody {
            name: name.into(),
            bone_index: -1,
            shape: Shape::Sphere,
            size: Vec3::new(1.0, 0.0, 0.0),
            position,
            physics_type,
            collision_group_mask: 0xFFFF,
            param: RigidBodyParam {
                restitution: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn single_body_model(rb: PmxRigidBody) -> PmxModel {
        let mut model = PmxModel::new();
        model.rigid_bodies.append(rb);
        model
    }

    #[test]
    fn test_drop_rests_on_ground() {
        let mut engine = test_engine(Vec3::new(0.0, -9.81, 0.0));
        let model = single_body_model(sphere("ball", Vec3::new(0.0, 10.0, 0.0), PhysicsType::Dynamic));
        engine.add_model(0, &model);

        for _ in 0..60 {
            engine.step(1.0 / 60.0, 1, 1.0 / 60.0);
        }
        let snapshot = engine.body_snapshot(BodyKey::new(0, 0));
        assert!(snapshot.resolved);
        assert!(
            (snapshot.position.y - 1.0).abs() < 0.1,
            "ball at {:?}",
            snapshot.position
        );
        let diagnostics = engine.step_diagnostics();
        assert_eq!(diagnostics.dynamic_body_count, 1);
        assert!(diagnostics.contact_point_count > 0);
    }

    #[test]
    fn test_substeps_follow_accumulator() {
        let mut engine = test_engine(Vec3::new(0.0, -9.81, 0.0));
        let model = single_body_model(sphere("ball", Vec3::new(0.0, 50.0, 0.0), PhysicsType::Dynamic));
        engine.add_model(0, &model);

        // 半个固定步长不足一步，刚体不动
        engine.step(1.0 / 120.0, 2, 1.0 / 60.0);
        let y0 = engine.body_snapshot(BodyKey::new(0, 0)).position.y;
        assert!((y0 - 50.0).abs() < 1e-5);
        engine.step(1.0 / 120.0, 2, 1.0 / 60.0);
        assert!(engine.body_snapshot(BodyKey::new(0, 0)).position.y < 50.0);
    }

    #[test]
    fn test_wind_pushes_body_downwind() {
        let mut engine = test_engine(Vec3::ZERO);
        let model = single_body_model(sphere("leaf", Vec3::new(0.0, 5.0, 0.0), PhysicsType::Dynamic));
        engine.add_model(0, &model);
        engine.set_wind(WindConfig {
            enabled: true,
            speed: 10.0,
            ..Default::default()
        });

        for _ in 0..30 {
            engine.step(1.0 / 60.0, 1, 1.0 / 60.0);
        }
        let snapshot = engine.body_snapshot(BodyKey::new(0, 0));
        assert!(snapshot.position.x > 0.01, "leaf at {:?}", snapshot.position);
        assert!(engine.wind().time() > 0.0);
    }

    fn hanging_model(joint_b: i32) -> PmxModel {
        let mut model = PmxModel::new();
        let mut anchor = sphere("anchor", Vec3::new(0.0, 10.0, 0.0), PhysicsType::Static);
        anchor.collision_group_mask = 0;
        model.rigid_bodies.append(anchor);
        let mut weight = sphere("weight", Vec3::new(0.0, 8.0, 0.0), PhysicsType::Dynamic);
        weight.collision_group = 1;
        weight.collision_group_mask = 0;
        weight.size = Vec3::new(0.5, 0.0, 0.0);
        model.rigid_bodies.append(weight);
        model.joints.append(PmxJoint {
            name: "hang".into(),
            rigid_body_index_a: 0,
            rigid_body_index_b: joint_b,
            position: Vec3::new(0.0, 9.0, 0.0),
            param: JointParam::default(),
            ..Default::default()
        });
        model
    }

    #[test]
    fn test_joint_holds_body() {
        let mut engine = test_engine(Vec3::new(0.0, -9.81, 0.0));
        let model = hanging_model(1);
        engine.add_model(0, &model);
        assert_eq!(engine.joint_count(0), 1);

        for _ in 0..60 {
            engine.step(1.0 / 60.0, 1, 1.0 / 60.0);
        }
        let y = engine.body_snapshot(BodyKey::new(0, 1)).position.y;
        assert!((y - 8.0).abs() < 0.3, "weight fell to {}", y);
    }

    #[test]
    fn test_joint_with_missing_body_is_skipped() {
        let mut engine = test_engine(Vec3::ZERO);
        engine.add_model(0, &hanging_model(5));
        assert_eq!(engine.body_count(0), 2);
        assert_eq!(engine.joint_count(0), 0);
    }

    #[test]
    fn test_delete_model_releases_everything() {
        let mut engine = test_engine(Vec3::new(0.0, -9.81, 0.0));
        engine.add_model(0, &hanging_model(1));
        engine.add_model(1, &hanging_model(1));
        assert_eq!(engine.rigid_body_set.len(), 5);
        assert_eq!(engine.impulse_joint_set.len(), 2);

        engine.delete_model(0);
        assert!(!engine.has_model(0));
        assert_eq!(engine.rigid_body_set.len(), 3);
        assert_eq!(engine.collider_set.len(), 3);
        assert_eq!(engine.impulse_joint_set.len(), 1);

        engine.reset_world(Vec3::new(0.0, -9.81, 0.0));
        assert_eq!(engine.model_count(), 0);
        assert_eq!(engine.rigid_body_set.len(), 1);
        assert_eq!(engine.collider_set.len(), 1);
    }

    #[test]
    fn test_ray_test_hits_body_not_ground() {
        let mut engine = test_engine(Vec3::ZERO);
        let mut target = sphere("target", Vec3::new(0.0, 5.0, 0.0), PhysicsType::Static);
        target.shape = Shape::Box;
        target.size = Vec3::ONE;
        engine.add_model(3, &single_body_model(target));

        let hit = engine
            .ray_test(Vec3::new(0.0, 10.0, 0.0), Vec3::new(0.0, 0.0, 0.0), None)
            .unwrap();
        assert_eq!(hit.model_index, 3);
        assert_eq!(hit.rigid_body_index, 0);
        assert!((hit.hit_fraction - 0.4).abs() < 1e-4);

        assert!(engine
            .ray_test(Vec3::new(5.0, 10.0, 0.0), Vec3::new(5.0, -1.0, 0.0), None)
            .is_none());
        assert!(engine
            .ray_test(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Some(1 << 4))
            .is_none());
    }

    #[test]
    fn test_posed_model_places_bodies_on_bones() {
        let mut engine = test_engine(Vec3::ZERO);
        let mut model = PmxModel::new();
        let mut bone = Bone::new("arm");
        bone.position = Vec3::new(1.0, 10.0, 0.0);
        model.bones.append(bone);
        let mut rb = sphere("arm_rb", Vec3::new(2.0, 10.0, 0.0), PhysicsType::Static);
        rb.bone_index = 0;
        model.rigid_bodies.append(rb);

        let bones = BoneMatrices {
            globals: vec![Mat4::from_translation(Vec3::new(1.0, 12.0, 0.0))],
            rest_positions: vec![Vec3::new(1.0, 10.0, 0.0)],
        };
        engine.add_model_posed(0, &model, &bones);
        let snapshot = engine.body_snapshot(BodyKey::new(0, 0));
        assert!((snapshot.position - Vec3::new(2.0, 12.0, 0.0)).length() < 1e-5);
        assert!(snapshot.kinematic);

        let moved = BoneMatrices {
            globals: vec![Mat4::from_translation(Vec3::new(1.0, 15.0, 0.0))],
            ..bones
        };
        engine.update_physics_selectively(0, &model, &moved, &[true]);
        let snapshot = engine.body_snapshot(BodyKey::new(0, 0));
        assert!((snapshot.position - Vec3::new(2.0, 15.0, 0.0)).length() < 1e-5);
        assert_eq!(engine.rigid_body_set.len(), 2);

        engine.reset_model(0, &model);
        let snapshot = engine.body_snapshot(BodyKey::new(0, 0));
        assert!((snapshot.position - Vec3::new(2.0, 10.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_disable_collisions_rebuilds_joints() {
        let mut engine = test_engine(Vec3::ZERO);
        engine.add_model(0, &hanging_model(1));
        engine.set_model_disable_collisions(0, true);
        let joints = engine.joints(0);
        assert_eq!(joints.len(), 1);
        assert!(joints[0].constraint.disable_collisions);
        assert_eq!(engine.impulse_joint_set.len(), 1);
        assert!(engine.joint_config_for(0).disable_collisions);

        engine.set_model_joint_config(0, None);
        assert!(!engine.joint_config_for(0).disable_collisions);
    }

    #[test]
    fn test_gravity_round_trip() {
        let mut engine = test_engine(Vec3::new(0.0, -9.8, 0.0));
        assert!((engine.gravity.y + 98.0).abs() < 1e-4);
        engine.set_gravity(Vec3::new(1.0, -2.0, 3.0));
        assert!((engine.gravity() - Vec3::new(1.0, -2.0, 3.0)).length() < 1e-5);
        assert!((engine.gravity.z + 3.0).abs() < 1e-6);
    }
}

//! 步进诊断
//!
//! 只用于观察：穿透、冲量和速度异常以汇总的形式返回，不会让步进失败。

use glam::Vec3;
use rapier3d::prelude::*;

use super::rigid_body::{BodyKey, CcdParams, PhysicsBody};
use crate::math::from_na_vector;
use crate::model::{PhysicsType, Shape};

/// 一次接触涉及的两个刚体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyPair {
    pub a: BodyKey,
    pub b: BodyKey,
}

/// 一次步进后的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDiagnostics {
    pub manifold_count: usize,
    pub active_manifold_count: usize,
    pub contact_point_count: usize,
    pub penetration_point_count: usize,
    pub max_penetration_depth: f32,
    pub max_penetration_pair: Option<BodyPair>,
    pub max_applied_impulse: f32,
    pub max_impulse_pair: Option<BodyPair>,
    pub dynamic_body_count: usize,
    pub max_linear_speed: f32,
    pub max_linear_speed_body: Option<BodyKey>,
    pub max_angular_speed: f32,
    pub max_angular_speed_body: Option<BodyKey>,
}

fn collider_key(colliders: &ColliderSet, handle: ColliderHandle) -> BodyKey {
    colliders
        .get(handle)
        .map(|c| BodyKey::from_user_data(c.user_data))
        .unwrap_or(BodyKey::new(-1, -1))
}

impl StepDiagnostics {
    pub fn collect<'a>(
        narrow_phase: &NarrowPhase,
        colliders: &ColliderSet,
        set: &RigidBodySet,
        bodies: impl IntoIterator<Item = &'a PhysicsBody>,
    ) -> Self {
        let mut diagnostics = Self::default();
        diagnostics.collect_contacts(narrow_phase, colliders);
        diagnostics.collect_speeds(set, bodies);
        diagnostics
    }

    fn collect_contacts(&mut self, narrow_phase: &NarrowPhase, colliders: &ColliderSet) {
        for pair in narrow_phase.contact_pairs() {
            let bodies = BodyPair {
                a: collider_key(colliders, pair.collider1),
                b: collider_key(colliders, pair.collider2),
            };
            for manifold in &pair.manifolds {
                self.manifold_count += 1;
                if manifold.points.is_empty() {
                    continue;
                }
                self.active_manifold_count += 1;
                for point in &manifold.points {
                    self.contact_point_count += 1;
                    if point.dist < 0.0 {
                        self.penetration_point_count += 1;
                        let depth = -point.dist;
                        if depth > self.max_penetration_depth {
                            self.max_penetration_depth = depth;
                            self.max_penetration_pair = Some(bodies);
                        }
                    }
                    if point.data.impulse > self.max_applied_impulse {
                        self.max_applied_impulse = point.data.impulse;
                        self.max_impulse_pair = Some(bodies);
                    }
                }
            }
        }
    }

    fn collect_speeds<'a>(
        &mut self,
        set: &RigidBodySet,
        bodies: impl IntoIterator<Item = &'a PhysicsBody>,
    ) {
        for body in bodies {
            if body.physics_type == PhysicsType::Static {
                continue;
            }
            let Some(rb) = body.handle.and_then(|h| set.get(h)) else {
                continue;
            };
            self.dynamic_body_count += 1;
            let linear = rb.linvel().norm();
            if linear > self.max_linear_speed {
                self.max_linear_speed = linear;
                self.max_linear_speed_body = Some(body.key);
            }
            let angular = rb.angvel().norm();
            if angular > self.max_angular_speed {
                self.max_angular_speed = angular;
                self.max_angular_speed_body = Some(body.key);
            }
        }
    }

    /// 值得关注的刚体：最大穿透、最大冲量两端，以及最快的刚体
    pub fn tracked_bodies(&self) -> Vec<TrackedBody> {
        let mut tracked = Vec::with_capacity(6);
        let mut push = |reason, key: Option<BodyKey>| {
            if let Some(key) = key {
                tracked.push(TrackedBody { reason, key });
            }
        };
        push(TrackReason::MaxPenetrationA, self.max_penetration_pair.map(|p| p.a));
        push(TrackReason::MaxPenetrationB, self.max_penetration_pair.map(|p| p.b));
        push(TrackReason::MaxImpulseA, self.max_impulse_pair.map(|p| p.a));
        push(TrackReason::MaxImpulseB, self.max_impulse_pair.map(|p| p.b));
        push(TrackReason::MaxLinearSpeed, self.max_linear_speed_body);
        push(TrackReason::MaxAngularSpeed, self.max_angular_speed_body);
        tracked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReason {
    MaxPenetrationA,
    MaxPenetrationB,
    MaxImpulseA,
    MaxImpulseB,
    MaxLinearSpeed,
    MaxAngularSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedBody {
    pub reason: TrackReason,
    pub key: BodyKey,
}

/// 单个刚体的属性与状态。找不到刚体时 `resolved` 为 false，其余为默认值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodySnapshot {
    pub key: Option<BodyKey>,
    pub resolved: bool,
    pub physics_type: Option<PhysicsType>,
    pub shape: Option<Shape>,
    pub group: u32,
    pub mask: u32,
    pub base_mass: f32,
    pub applied_mass: f32,
    pub applied_size: Vec3,
    /// MMD 坐标系
    pub position: Vec3,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub kinematic: bool,
    pub sleeping: bool,
    pub ccd: Option<CcdParams>,
    pub linear_speed: f32,
    pub angular_speed: f32,
    pub linear_velocity: Vec3,
}

impl BodySnapshot {
    pub fn unresolved(key: BodyKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    pub fn capture(body: &PhysicsBody, set: &RigidBodySet) -> Self {
        let mut snapshot = Self {
            key: Some(body.key),
            resolved: true,
            physics_type: Some(body.physics_type),
            shape: Some(body.shape),
            group: body.groups.memberships.bits(),
            mask: body.groups.filter.bits(),
            base_mass: body.base_mass,
            applied_mass: body.applied_mass,
            applied_size: body.applied_size,
            position: body.world_matrix().w_axis.truncate(),
            linear_damping: body.linear_damping,
            angular_damping: body.angular_damping,
            restitution: body.restitution,
            friction: body.friction,
            kinematic: body.is_kinematic(),
            ccd: body.ccd,
            ..Default::default()
        };
        if let Some(rb) = body.handle.and_then(|h| set.get(h)) {
            snapshot.sleeping = rb.is_sleeping();
            snapshot.linear_velocity = from_na_vector(rb.linvel());
            snapshot.linear_speed = rb.linvel().norm();
            snapshot.angular_speed = rb.angvel().norm();
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_bodies_skip_missing_keys() {
        let diagnostics = StepDiagnostics {
            max_impulse_pair: Some(BodyPair {
                a: BodyKey::new(0, 1),
                b: BodyKey::GROUND,
            }),
            max_linear_speed_body: Some(BodyKey::new(0, 4)),
            ..Default::default()
        };
        let tracked = diagnostics.tracked_bodies();
        assert_eq!(tracked.len(), 3);
        assert_eq!(tracked[0].reason, TrackReason::MaxImpulseA);
        assert_eq!(tracked[1].key, BodyKey::GROUND);
        assert_eq!(tracked[2].key, BodyKey::new(0, 4));
        assert!(StepDiagnostics::default().tracked_bodies().is_empty());
    }

    #[test]
    fn test_unresolved_snapshot() {
        let snapshot = BodySnapshot::unresolved(BodyKey::new(2, 9));
        assert!(!snapshot.resolved);
        assert_eq!(snapshot.key, Some(BodyKey::new(2, 9)));
        assert!(snapshot.physics_type.is_none());
    }
}

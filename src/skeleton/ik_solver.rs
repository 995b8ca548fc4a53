//! CCD IK 求解器

use glam::{EulerRot, Quat, Vec3};

use super::deformer::{motion_rotation, update_global_recursive, update_local, BoneState};
use super::graph::IkChain;
use super::BoneGraph;
use crate::math::{signed_angle_about, to_fixed_axis_rotation, translation_of};
use crate::model::IkLink;

/// 目标与效果器距离小于该值时提前结束
pub const IK_TOLERANCE: f32 = 1e-4;
/// 小于该角度的修正视为已对齐
const MIN_STEP_ANGLE: f32 = 1e-6;

/// 单个 IK 骨骼的求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    pub bone: usize,
    pub enabled: bool,
}

impl IkSolver {
    pub fn new(bone: usize) -> Self {
        Self {
            bone,
            enabled: true,
        }
    }

    /// 求解并返回最终的效果器距离；不收敛时保留迭代中最好的姿势
    pub(crate) fn solve(&self, graph: &BoneGraph, states: &mut [BoneState]) -> f32 {
        let Some(chain) = graph.node(self.bone).and_then(|n| n.ik.as_ref()) else {
            return 0.0;
        };
        if !self.enabled {
            return f32::MAX;
        }

        for link in &chain.links {
            let l = link.bone_index as usize;
            states[l].ik_rotate = Quat::IDENTITY;
            states[l].ik_enabled = true;
            update_local(&graph.nodes()[l], &mut states[l]);
        }
        for link in chain.links.iter().rev() {
            update_global_recursive(graph, states, link.bone_index as usize);
        }

        let goal = translation_of(&states[self.bone].global);
        let mut best = f32::MAX;
        let mut saved: Vec<Quat> = vec![Quat::IDENTITY; chain.links.len()];

        for iteration in 0..chain.loop_count {
            self.solve_core(graph, chain, states, goal, iteration);

            let dist = (translation_of(&states[chain.target].global) - goal).length();
            if dist < best {
                best = dist;
                for (slot, link) in saved.iter_mut().zip(&chain.links) {
                    *slot = states[link.bone_index as usize].ik_rotate;
                }
            } else {
                for (rotate, link) in saved.iter().zip(&chain.links) {
                    let l = link.bone_index as usize;
                    states[l].ik_rotate = *rotate;
                    update_local(&graph.nodes()[l], &mut states[l]);
                }
                for link in chain.links.iter().rev() {
                    update_global_recursive(graph, states, link.bone_index as usize);
                }
                break;
            }
            if dist < IK_TOLERANCE {
                break;
            }
        }

        update_global_recursive(graph, states, self.bone);
        if best > IK_TOLERANCE {
            log::trace!("IK {} stopped at distance {}", self.bone, best);
        }
        best
    }

    fn solve_core(
        &self,
        graph: &BoneGraph,
        chain: &IkChain,
        states: &mut [BoneState],
        goal: Vec3,
        iteration: u32,
    ) {
        let first_half = (iteration as f32) < chain.loop_count as f32 / 2.0;

        for link in &chain.links {
            let l = link.bone_index as usize;
            if l == chain.target {
                continue;
            }
            let effector = translation_of(&states[chain.target].global);
            let inv = states[l].global.inverse();
            let local_effector = inv.transform_point3(effector).normalize_or_zero();
            let local_goal = inv.transform_point3(goal).normalize_or_zero();
            if local_effector == Vec3::ZERO || local_goal == Vec3::ZERO {
                continue;
            }

            let cross = local_effector.cross(local_goal);
            let angle = cross.length().atan2(local_effector.dot(local_goal));
            if angle < MIN_STEP_ANGLE {
                continue;
            }
            let angle = if chain.unit_rotation > 0.0 {
                angle.min(chain.unit_rotation)
            } else {
                angle
            };
            let axis = cross.normalize_or_zero();
            if axis == Vec3::ZERO {
                continue;
            }

            let node = &graph.nodes()[l];
            let motion = motion_rotation(node, &states[l]);
            let base = states[l].ik_rotate * motion;

            let limited = if link.angle_limit {
                match single_axis(link) {
                    Some(unit) => {
                        let sign = if axis.dot(unit) < 0.0 { -1.0 } else { 1.0 };
                        let chain_rot = base * Quat::from_axis_angle(unit, sign * angle);
                        let i = axis_slot(unit);
                        let a = limit_angle(
                            signed_angle_about(chain_rot, unit),
                            link.min_angle[i],
                            link.max_angle[i],
                            first_half,
                        );
                        Quat::from_axis_angle(unit, a)
                    }
                    None => clamp_euler(
                        base * Quat::from_axis_angle(axis, angle),
                        link.min_angle,
                        link.max_angle,
                        first_half,
                    ),
                }
            } else if let (true, Some(frame)) = (link.local_angle_limit, node.local_frame) {
                let f = Quat::from_mat3(&frame);
                let in_frame = f.inverse() * base * Quat::from_axis_angle(axis, angle) * f;
                let clamped =
                    clamp_euler(in_frame, link.local_min_angle, link.local_max_angle, first_half);
                f * clamped * f.inverse()
            } else if let Some(fixed) = node.fixed_axis {
                to_fixed_axis_rotation(base * Quat::from_axis_angle(axis, angle), fixed)
            } else {
                base * Quat::from_axis_angle(axis, angle)
            };

            states[l].ik_rotate = (limited * motion.inverse()).normalize();
            update_local(node, &mut states[l]);
            update_global_recursive(graph, states, l);
        }
    }
}

/// 只有一个轴有角度范围时返回该轴（膝盖一类）
fn single_axis(link: &IkLink) -> Option<Vec3> {
    let used = |i: usize| link.min_angle[i] != 0.0 || link.max_angle[i] != 0.0;
    match (used(0), used(1), used(2)) {
        (true, false, false) => Some(Vec3::X),
        (false, true, false) => Some(Vec3::Y),
        (false, false, true) => Some(Vec3::Z),
        _ => None,
    }
}

fn axis_slot(unit: Vec3) -> usize {
    if unit.x != 0.0 {
        0
    } else if unit.y != 0.0 {
        1
    } else {
        2
    }
}

/// 迭代前半程越界时先按边界反射，仍越界或已在后半程则钳制
fn limit_angle(value: f32, min: f32, max: f32, first_half: bool) -> f32 {
    let mut v = value;
    if v < min {
        let reflected = 2.0 * min - v;
        v = if reflected <= max && first_half { reflected } else { min };
    }
    if v > max {
        let reflected = 2.0 * max - v;
        v = if reflected >= min && first_half { reflected } else { max };
    }
    v
}

fn clamp_euler(q: Quat, min: Vec3, max: Vec3, first_half: bool) -> Quat {
    let (x, y, z) = q.to_euler(EulerRot::XYZ);
    Quat::from_euler(
        EulerRot::XYZ,
        limit_angle(x, min.x, max.x, first_half),
        limit_angle(y, min.y, max.y, first_half),
        limit_angle(z, min.z, max.z, first_half),
    )
}

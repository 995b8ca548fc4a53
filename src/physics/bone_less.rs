//! 未绑定骨骼的刚体的初始位置推定
//!
//! 动作已经让模型离开静止姿势时，`bone_index == -1` 的刚体若仍放在静止位置，
//! 会和已经移动的邻居刚体被 Joint 强行拉扯。这里沿 Joint 找一个绑定了骨骼的
//! 参考刚体，让目标刚体随参考骨骼一起移动。

use std::collections::{BTreeMap, HashSet, VecDeque};

use glam::{Mat4, Vec3};

use crate::math::mat4_near;
use crate::model::{PmxModel, RigidBody, CENTER_BONE_NAME};
use crate::skeleton::BoneMatrices;

/// 优先使用的最大搜索深度
const PREFERRED_DEPTH: u32 = 2;
/// Joint 图的最大搜索深度
const MAX_SEARCH_DEPTH: u32 = 3;
/// |x| 超过该值才区分左右
const SIDE_THRESHOLD: f32 = 0.2;
const SCORE_EPSILON: f32 = 1e-6;
/// 判断姿势是否离开静止状态的容差
const POSE_MOVED_EPSILON: f32 = 1e-5;

/// 参考刚体候选
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceCandidate {
    pub depth: u32,
    pub joint_index: i32,
    pub rigid_body_index: i32,
    pub side_penalty: u8,
    pub joint_score: f32,
    pub distance: f32,
}

/// 推定结果使用的锚点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoneLessAnchor {
    /// 参考刚体索引
    Reference(i32),
    CenterBone,
    FirstBone,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneLessResolution {
    /// MMD 坐标系中的世界变换
    pub world: Mat4,
    pub anchor: BoneLessAnchor,
}

/// `left` 是否比 `right` 优先
pub fn is_higher_priority(left: &ReferenceCandidate, right: &ReferenceCandidate) -> bool {
    if left.side_penalty != right.side_penalty {
        return left.side_penalty < right.side_penalty;
    }
    let left_preferred = left.depth <= PREFERRED_DEPTH;
    let right_preferred = right.depth <= PREFERRED_DEPTH;
    if left_preferred != right_preferred {
        return left_preferred;
    }
    if left.joint_score < right.joint_score - SCORE_EPSILON {
        return true;
    }
    if right.joint_score < left.joint_score - SCORE_EPSILON {
        return false;
    }
    if left.distance < right.distance - SCORE_EPSILON {
        return true;
    }
    if right.distance < left.distance - SCORE_EPSILON {
        return false;
    }
    if left.depth != right.depth {
        return left.depth < right.depth;
    }
    if left.joint_index != right.joint_index {
        return left.joint_index < right.joint_index;
    }
    left.rigid_body_index < right.rigid_body_index
}

/// 每个刚体只保留优先度最高的候选，按优先度排序。无效索引被丢弃
pub fn normalize_candidates(candidates: &[ReferenceCandidate]) -> Vec<ReferenceCandidate> {
    let mut deduped: BTreeMap<i32, ReferenceCandidate> = BTreeMap::new();
    for candidate in candidates.iter().filter(|c| c.rigid_body_index >= 0) {
        match deduped.get(&candidate.rigid_body_index) {
            Some(current) if !is_higher_priority(candidate, current) => {}
            _ => {
                deduped.insert(candidate.rigid_body_index, *candidate);
            }
        }
    }

    // 比较带容差，不构成全序，用插入排序保证结果确定
    let mut ordered: Vec<ReferenceCandidate> = Vec::with_capacity(deduped.len());
    for candidate in deduped.into_values() {
        let pos = ordered
            .iter()
            .position(|c| is_higher_priority(&candidate, c))
            .unwrap_or(ordered.len());
        ordered.insert(pos, candidate);
    }
    ordered
}

/// 返回选中的候选和排序后的全部候选
pub fn select_reference_candidate(
    candidates: &[ReferenceCandidate],
) -> Option<(ReferenceCandidate, Vec<ReferenceCandidate>)> {
    let normalized = normalize_candidates(candidates);
    normalized.first().copied().map(|c| (c, normalized))
}

/// 左 +1 / 中央 0 / 右 -1
pub fn side_of(x: f32) -> i8 {
    if x > SIDE_THRESHOLD {
        1
    } else if x < -SIDE_THRESHOLD {
        -1
    } else {
        0
    }
}

/// 目标和参考分处左右两侧时为 1
pub fn side_penalty(target_x: f32, reference_x: f32) -> u8 {
    let (target, reference) = (side_of(target_x), side_of(reference_x));
    if target == 0 || reference == 0 || target == reference {
        0
    } else {
        1
    }
}

/// 候选位置到目标各 Joint 位置的平均距离
pub fn joint_score(joint_positions: &[Vec3], candidate: Vec3) -> f32 {
    if joint_positions.is_empty() {
        return 0.0;
    }
    let total: f32 = joint_positions.iter().map(|p| p.distance(candidate)).sum();
    total / joint_positions.len() as f32
}

/// 是否有骨骼离开了静止位置
pub fn pose_moved(bones: &BoneMatrices) -> bool {
    bones
        .globals
        .iter()
        .zip(&bones.rest_positions)
        .any(|(global, rest)| !mat4_near(global, &Mat4::from_translation(*rest), POSE_MOVED_EPSILON))
}

fn connected_joint_positions(model: &PmxModel, rigid_body_index: i32) -> Vec<Vec3> {
    model
        .joints
        .iter_by_index()
        .filter(|j| {
            j.rigid_body_index_a == rigid_body_index || j.rigid_body_index_b == rigid_body_index
        })
        .map(|j| j.position)
        .collect()
}

/// 目标刚体的静止变换。
///
/// 部分模型把无骨骼刚体的位置写成相对センター或第一个骨骼的坐标，
/// 三种解释中取离相连 Joint 平均距离最近的一个。
pub fn rest_transform(model: &PmxModel, rb: &RigidBody) -> Mat4 {
    let raw = rb.rest_matrix();
    let joints = connected_joint_positions(model, rb.index);
    if joints.is_empty() {
        return raw;
    }

    let center = model
        .bones
        .index_of(CENTER_BONE_NAME)
        .and_then(|i| model.bones.get(i).ok())
        .map(|b| b.position);
    let first = model.bones.get(0).ok().map(|b| b.position);

    let mut best = (joint_score(&joints, rb.position), Vec3::ZERO);
    for base in [center, first].into_iter().flatten() {
        let score = joint_score(&joints, rb.position + base);
        if score < best.0 - SCORE_EPSILON {
            best = (score, base);
        }
    }
    Mat4::from_translation(best.1) * raw
}

fn anchored_bone(model: &PmxModel, rb: &RigidBody, bones: &BoneMatrices) -> Option<i32> {
    let bone = model.bones.get(rb.bone_index).ok()?;
    ((bone.index as usize) < bones.len()).then_some(bone.index)
}

/// 沿 Joint 广度优先搜索，收集绑定了骨骼的刚体
pub fn find_reference_candidates(
    model: &PmxModel,
    rigid_body_index: i32,
    target_position: Vec3,
    bones: &BoneMatrices,
) -> Vec<ReferenceCandidate> {
    let joints = connected_joint_positions(model, rigid_body_index);
    let mut candidates = Vec::new();
    let mut visited = HashSet::from([rigid_body_index]);
    let mut queue = VecDeque::from([(rigid_body_index, 0u32)]);

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= MAX_SEARCH_DEPTH {
            continue;
        }
        for joint in model.joints.iter_by_index() {
            let other = if joint.rigid_body_index_a == current {
                joint.rigid_body_index_b
            } else if joint.rigid_body_index_b == current {
                joint.rigid_body_index_a
            } else {
                continue;
            };
            if !visited.insert(other) {
                continue;
            }
            let Ok(rb) = model.rigid_bodies.get(other) else {
                continue;
            };
            queue.push_back((other, depth + 1));
            if anchored_bone(model, rb, bones).is_none() {
                continue;
            }
            candidates.push(ReferenceCandidate {
                depth: depth + 1,
                joint_index: joint.index,
                rigid_body_index: other,
                side_penalty: side_penalty(target_position.x, rb.position.x),
                joint_score: joint_score(&joints, rb.position),
                distance: rb.position.distance(target_position),
            });
        }
    }
    candidates
}

/// 推定未绑定骨骼刚体的世界变换（MMD 坐标系）。
///
/// 没有姿势或姿势仍在静止状态时直接使用静止变换；否则依次尝试参考刚体、
/// センター、第一个骨骼。
pub fn resolve_bone_less_transform(
    model: &PmxModel,
    rb: &RigidBody,
    bones: Option<&BoneMatrices>,
) -> BoneLessResolution {
    let target_rest = rest_transform(model, rb);
    let rest = BoneLessResolution {
        world: target_rest,
        anchor: BoneLessAnchor::Rest,
    };
    let Some(bones) = bones.filter(|b| pose_moved(b)) else {
        return rest;
    };

    // 参考骨骼的蒙皮矩阵作用到目标的静止变换上
    let follow = |bone_index: i32| -> Option<Mat4> {
        let bone = model.bones.get(bone_index).ok()?;
        ((bone.index as usize) < bones.len()).then(|| {
            bones.global(bone.index) * Mat4::from_translation(-bone.position) * target_rest
        })
    };

    let target_position = target_rest.w_axis.truncate();
    let candidates = find_reference_candidates(model, rb.index, target_position, bones);
    if let Some((selected, ordered)) = select_reference_candidate(&candidates) {
        if ordered.len() > 1 {
            log::debug!(
                "bone-less rigid body {} ({}): {} reference candidates, using {}",
                rb.index,
                rb.name,
                ordered.len(),
                selected.rigid_body_index
            );
        }
        let world = model
            .rigid_bodies
            .get(selected.rigid_body_index)
            .ok()
            .and_then(|r| follow(r.bone_index));
        if let Some(world) = world {
            return BoneLessResolution {
                world,
                anchor: BoneLessAnchor::Reference(selected.rigid_body_index),
            };
        }
    }

    if let Some(world) = model.bones.index_of(CENTER_BONE_NAME).and_then(follow) {
        return BoneLessResolution {
            world,
            anchor: BoneLessAnchor::CenterBone,
        };
    }
    if let Some(world) = follow(0) {
        return BoneLessResolution {
            world,
            anchor: BoneLessAnchor::FirstBone,
        };
    }
    log::warn!("bone-less rigid body {} ({}) has no anchor, using rest", rb.index, rb.name);
    rest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bone, Joint};

    fn candidate(
        depth: u32,
        joint_index: i32,
        rigid_body_index: i32,
        side_penalty: u8,
        joint_score: f32,
        distance: f32,
    ) -> ReferenceCandidate {
        ReferenceCandidate {
            depth,
            joint_index,
            rigid_body_index,
            side_penalty,
            joint_score,
            distance,
        }
    }

    #[test]
    fn test_select_reference_candidate() {
        let candidates = [
            candidate(1, 5, 3, 0, 2.0, 4.0),
            candidate(1, 2, 7, 0, 1.0, 3.0),
            candidate(1, 1, 4, 0, 1.0, 2.0),
            candidate(1, 9, 7, 0, 9.0, 9.0),
        ];
        let (selected, ordered) = select_reference_candidate(&candidates).unwrap();
        assert_eq!(selected.rigid_body_index, 4);
        assert_eq!(selected.joint_index, 1);
        let order: Vec<i32> = ordered.iter().map(|c| c.rigid_body_index).collect();
        assert_eq!(order, vec![4, 7, 3]);
        assert_eq!(ordered[1].joint_index, 2);
    }

    #[test]
    fn test_invalid_candidates_only() {
        assert!(select_reference_candidate(&[candidate(1, 1, -1, 0, 0.0, 0.0)]).is_none());
        assert!(normalize_candidates(&[]).is_empty());
    }

    #[test]
    fn test_depth_priority() {
        let candidates = [
            candidate(3, 0, 1, 0, 0.0, 0.0),
            candidate(1, 9, 2, 0, 10.0, 10.0),
            candidate(1, 3, 3, 0, 9.0, 9.0),
        ];
        let (selected, ordered) = select_reference_candidate(&candidates).unwrap();
        assert_eq!(selected.rigid_body_index, 3);
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn test_side_priority() {
        let candidates = [
            candidate(1, 1, 1, 1, 0.1, 0.1),
            candidate(1, 2, 2, 0, 9.0, 9.0),
        ];
        let (selected, _) = select_reference_candidate(&candidates).unwrap();
        assert_eq!(selected.rigid_body_index, 2);
    }

    #[test]
    fn test_side_penalty_and_joint_score() {
        assert_eq!(side_penalty(1.0, -1.0), 1);
        assert_eq!(side_penalty(1.0, 0.0), 0);
        assert_eq!(side_penalty(-0.5, -3.0), 0);
        let joints = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0)];
        assert!((joint_score(&joints, Vec3::new(2.0, 0.0, 0.0)) - 1.0).abs() < 1e-6);
        assert_eq!(joint_score(&[], Vec3::ONE), 0.0);
    }

    /// センター(0) と hair(1)，刚体 0 绑定 hair，刚体 1 无骨骼
    fn hair_model(with_joint: bool) -> PmxModel {
        let mut model = PmxModel::new();
        model.bones.append(Bone::new(CENTER_BONE_NAME));
        let mut hair = Bone::new("hair");
        hair.parent_index = 0;
        hair.position = Vec3::new(0.0, 10.0, 0.0);
        model.bones.append(hair);
        model.rigid_bodies.append(RigidBody {
            name: "hair_rb".into(),
            bone_index: 1,
            position: Vec3::new(0.0, 9.0, 0.0),
            ..Default::default()
        });
        model.rigid_bodies.append(RigidBody {
            name: "tip".into(),
            bone_index: -1,
            position: Vec3::new(0.0, 8.0, 0.0),
            ..Default::default()
        });
        if with_joint {
            model.joints.append(Joint {
                name: "hair_tip".into(),
                rigid_body_index_a: 0,
                rigid_body_index_b: 1,
                position: Vec3::new(0.0, 8.5, 0.0),
                ..Default::default()
            });
        }
        model
    }

    fn posed(center: Vec3, hair: Vec3) -> BoneMatrices {
        BoneMatrices {
            globals: vec![Mat4::from_translation(center), Mat4::from_translation(hair)],
            rest_positions: vec![Vec3::ZERO, Vec3::new(0.0, 10.0, 0.0)],
        }
    }

    #[test]
    fn test_follows_reference_body() {
        let model = hair_model(true);
        let rb = model.rigid_bodies.get(1).unwrap();
        let bones = posed(Vec3::ZERO, Vec3::new(3.0, 10.0, 0.0));
        let resolved = resolve_bone_less_transform(&model, rb, Some(&bones));
        assert_eq!(resolved.anchor, BoneLessAnchor::Reference(0));
        assert!(mat4_near(
            &resolved.world,
            &Mat4::from_translation(Vec3::new(3.0, 8.0, 0.0)),
            1e-5
        ));
    }

    #[test]
    fn test_falls_back_to_center_then_rest() {
        let model = hair_model(false);
        let rb = model.rigid_bodies.get(1).unwrap();

        let bones = posed(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 12.0, 0.0));
        let resolved = resolve_bone_less_transform(&model, rb, Some(&bones));
        assert_eq!(resolved.anchor, BoneLessAnchor::CenterBone);
        assert!(mat4_near(
            &resolved.world,
            &Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0)),
            1e-5
        ));

        let at_rest = posed(Vec3::ZERO, Vec3::new(0.0, 10.0, 0.0));
        assert!(!pose_moved(&at_rest));
        let resolved = resolve_bone_less_transform(&model, rb, Some(&at_rest));
        assert_eq!(resolved.anchor, BoneLessAnchor::Rest);
        assert_eq!(resolved.world, rb.rest_matrix());
        assert_eq!(resolve_bone_less_transform(&model, rb, None).anchor, BoneLessAnchor::Rest);
    }

    #[test]
    fn test_rest_interpretation_prefers_joint_match() {
        let mut model = hair_model(true);
        // 刚体坐标写成了相对 hair 骨骼的形式
        model.bones.get_mut(0).unwrap().position = Vec3::new(0.0, 10.0, 0.0);
        model.rigid_bodies.get_mut(1).unwrap().position = Vec3::new(0.0, -1.5, 0.0);
        let rb = model.rigid_bodies.get(1).unwrap();
        let rest = rest_transform(&model, rb);
        assert!((rest.w_axis.truncate() - Vec3::new(0.0, 8.5, 0.0)).length() < 1e-5);
    }
}

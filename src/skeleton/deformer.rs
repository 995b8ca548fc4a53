//! 每帧骨骼矩阵求解
//!
//! 按 [`BoneGraph`] 的顺序逐骨骼计算：本地变换（动作、固定轴、付与）、全局合成，
//! 遇到 IK 骨骼时立即解算，使 IK 结果对其后的骨骼可见。

use glam::{Mat4, Quat, Vec3};

use super::motion::{BoneMatrices, BoneMotion, BonePose};
use super::{BoneGraph, BoneNode, IkSolver};
use crate::math::{scale_rotation, to_fixed_axis_rotation};
use crate::model::PmxModel;
use crate::Result;

/// 骨骼运行时状态
#[derive(Clone, Debug)]
pub(crate) struct BoneState {
    pub anim_translate: Vec3,
    pub anim_rotate: Quat,
    pub ik_rotate: Quat,
    pub ik_enabled: bool,
    pub append_translate: Vec3,
    pub append_rotate: Quat,
    pub local: Mat4,
    pub global: Mat4,
}

impl BoneState {
    fn rest(node: &BoneNode) -> Self {
        Self {
            anim_translate: Vec3::ZERO,
            anim_rotate: Quat::IDENTITY,
            ik_rotate: Quat::IDENTITY,
            ik_enabled: false,
            append_translate: Vec3::ZERO,
            append_rotate: Quat::IDENTITY,
            local: Mat4::from_translation(node.offset),
            global: Mat4::from_translation(node.rest_position),
        }
    }
}

/// 动作旋转在禁止旋转和固定轴约束下的实际值
pub(crate) fn motion_rotation(node: &BoneNode, state: &BoneState) -> Quat {
    if !node.can_rotate {
        return Quat::IDENTITY;
    }
    match node.fixed_axis {
        Some(axis) => to_fixed_axis_rotation(state.anim_rotate, axis),
        None => state.anim_rotate,
    }
}

/// 平移 = 静止偏移 + 动作 + 付与；旋转 = IK · 动作 · 付与
pub(crate) fn update_local(node: &BoneNode, state: &mut BoneState) {
    let mut translate = node.offset;
    if node.can_translate {
        translate += state.anim_translate;
    }
    if node.effect_translation {
        translate += state.append_translate;
    }

    let mut rotate = motion_rotation(node, state);
    if state.ik_enabled {
        rotate = state.ik_rotate * rotate;
    }
    if node.effect_rotation {
        rotate *= state.append_rotate;
    }
    state.local = Mat4::from_rotation_translation(rotate.normalize(), translate);
}

pub(crate) fn update_global(graph: &BoneGraph, states: &mut [BoneState], bone: usize) {
    let parent = graph.nodes()[bone].parent.map(|p| states[p].global);
    states[bone].global = match parent {
        Some(parent_global) => parent_global * states[bone].local,
        None => states[bone].local,
    };
}

/// 更新 `bone` 及其子孙的全局变换（本地变换不变）
pub(crate) fn update_global_recursive(graph: &BoneGraph, states: &mut [BoneState], bone: usize) {
    for i in graph.descendants(bone) {
        update_global(graph, states, i);
    }
}

/// 骨骼变形器
#[derive(Clone, Debug)]
pub struct Deformer {
    graph: BoneGraph,
    states: Vec<BoneState>,
    solvers: Vec<IkSolver>,
    pose: BonePose,
}

impl Deformer {
    pub fn new(model: &PmxModel) -> Result<Self> {
        Ok(Self::from_graph(BoneGraph::build(model)?))
    }

    pub fn from_graph(graph: BoneGraph) -> Self {
        let states = graph.nodes().iter().map(BoneState::rest).collect();
        let solvers = graph
            .nodes()
            .iter()
            .filter(|n| n.ik.is_some())
            .map(|n| IkSolver::new(n.index))
            .collect();
        let pose = BonePose::rest(graph.len());
        Self {
            graph,
            states,
            solvers,
            pose,
        }
    }

    pub fn graph(&self) -> &BoneGraph {
        &self.graph
    }

    /// 开关某个 IK（动作中的 IK 开关帧）
    pub fn set_ik_enabled(&mut self, bone: usize, enabled: bool) {
        if let Some(solver) = self.solvers.iter_mut().find(|s| s.bone == bone) {
            solver.enabled = enabled;
        }
    }

    /// 采样动作并求解全部骨骼（中间不经过物理）
    pub fn evaluate(&mut self, motion: &BoneMotion, frame: f32) -> BoneMatrices {
        let pose = motion.pose(&self.graph, frame);
        self.evaluate_pose(&pose)
    }

    pub fn evaluate_pose(&mut self, pose: &BonePose) -> BoneMatrices {
        self.reset(pose);
        self.run_pass(false, None);
        self.run_pass(true, None);
        self.matrices()
    }

    /// 物理前的骨骼（未设置物理后变形标志）
    pub fn evaluate_before_physics(&mut self, pose: &BonePose) -> BoneMatrices {
        self.reset(pose);
        self.run_pass(false, None);
        self.matrices()
    }

    /// 物理后的骨骼，沿用上次 [`Self::evaluate_before_physics`] 的姿势
    pub fn evaluate_after_physics(&mut self) -> BoneMatrices {
        self.run_pass(true, None);
        self.matrices()
    }

    /// 只求解影响 `targets` 的骨骼，其余保持静止姿势
    pub fn evaluate_subset(&mut self, pose: &BonePose, targets: &[usize]) -> BoneMatrices {
        let mut mask = vec![false; self.graph.len()];
        for &t in targets {
            for i in self.graph.relative_bones(t) {
                mask[i] = true;
            }
        }
        self.reset(pose);
        self.run_pass(false, Some(&mask));
        self.run_pass(true, Some(&mask));
        self.matrices()
    }

    /// 写回物理结果：设置全局矩阵，反推本地变换并刷新子孙
    pub fn set_global(&mut self, bone: usize, global: Mat4) {
        if bone >= self.states.len() {
            return;
        }
        let node = &self.graph.nodes()[bone];
        let local = match node.parent {
            Some(p) => self.states[p].global.inverse() * global,
            None => global,
        };
        let (_, rotation, translation) = local.to_scale_rotation_translation();
        let offset = node.offset;
        let state = &mut self.states[bone];
        state.global = global;
        state.local = local;
        state.anim_rotate = rotation;
        state.anim_translate = translation - offset;
        state.ik_rotate = Quat::IDENTITY;
        state.ik_enabled = false;

        let children = node.children.clone();
        for child in children {
            update_global_recursive(&self.graph, &mut self.states, child);
        }
    }

    pub fn global(&self, bone: usize) -> Mat4 {
        self.states.get(bone).map(|s| s.global).unwrap_or(Mat4::IDENTITY)
    }

    pub fn matrices(&self) -> BoneMatrices {
        BoneMatrices {
            globals: self.states.iter().map(|s| s.global).collect(),
            rest_positions: self.graph.nodes().iter().map(|n| n.rest_position).collect(),
        }
    }

    fn reset(&mut self, pose: &BonePose) {
        self.pose.clone_from(pose);
        for (state, node) in self.states.iter_mut().zip(self.graph.nodes()) {
            *state = BoneState::rest(node);
            state.anim_translate = pose.translation(node.index);
            state.anim_rotate = pose.rotation(node.index);
        }
    }

    fn run_pass(&mut self, after_physics: bool, mask: Option<&[bool]>) {
        for k in 0..self.graph.order().len() {
            let i = self.graph.order()[k];
            let node = &self.graph.nodes()[i];
            if node.after_physics != after_physics || mask.is_some_and(|m| !m[i]) {
                continue;
            }
            self.apply_append(i);
            update_local(&self.graph.nodes()[i], &mut self.states[i]);
            update_global(&self.graph, &mut self.states, i);

            if let Some(solver) = self.solvers.iter().find(|s| s.bone == i) {
                solver.solve(&self.graph, &mut self.states);
            }
        }
    }

    /// 付与：付与亲自身也有付与时取其付与值，否则取其动作值；付与亲启用 IK 时叠加 IK 旋转
    fn apply_append(&mut self, bone: usize) {
        let node = &self.graph.nodes()[bone];
        let Some(effect) = node.effect_parent else {
            return;
        };
        let effect_node = &self.graph.nodes()[effect];
        let source = &self.states[effect];
        let chained = effect_node.effect_parent.is_some() && !node.effect_local;

        let rotate = if node.effect_rotation {
            let mut r = if chained {
                source.append_rotate
            } else {
                motion_rotation(effect_node, source)
            };
            if source.ik_enabled {
                r = source.ik_rotate * r;
            }
            Some(scale_rotation(r, node.effect_factor))
        } else {
            None
        };
        let translate = if node.effect_translation {
            let t = if chained {
                source.append_translate
            } else {
                source.anim_translate
            };
            Some(t * node.effect_factor)
        } else {
            None
        };

        let state = &mut self.states[bone];
        if let Some(r) = rotate {
            state.append_rotate = r;
        }
        if let Some(t) = translate {
            state.append_translate = t;
        }
    }
}

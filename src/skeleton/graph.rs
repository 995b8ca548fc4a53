//! 骨骼依赖图
//!
//! 由模型骨骼推导求值顺序，并缓存变形器每帧需要的静态数据。

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use glam::{Mat3, Vec3};

use crate::math::local_axis_frame;
use crate::model::{Bone, IkLink, PmxModel};
use crate::{MmdError, Result};

/// IK 链（静态部分）
#[derive(Clone, Debug)]
pub struct IkChain {
    pub target: usize,
    pub loop_count: u32,
    pub unit_rotation: f32,
    pub links: Vec<IkLink>,
}

/// 单根骨骼的静态缓存
#[derive(Clone, Debug)]
pub struct BoneNode {
    pub index: usize,
    pub name: String,
    pub parent: Option<usize>,
    pub effect_parent: Option<usize>,
    pub effect_factor: f32,
    pub effect_rotation: bool,
    pub effect_translation: bool,
    pub effect_local: bool,
    pub can_rotate: bool,
    pub can_translate: bool,
    pub after_physics: bool,
    pub rest_position: Vec3,
    /// 相对父骨骼的静止偏移
    pub offset: Vec3,
    pub fixed_axis: Option<Vec3>,
    pub local_frame: Option<Mat3>,
    pub children: Vec<usize>,
    pub ik: Option<IkChain>,
    /// 以本骨骼为链接的 IK 骨骼
    pub ik_owners: Vec<usize>,
    /// 求值后的有效层级（不小于父骨骼和付与亲）
    pub layer: i32,
}

/// 骨骼依赖图
#[derive(Clone, Debug)]
pub struct BoneGraph {
    nodes: Vec<BoneNode>,
    order: Vec<usize>,
}

fn node_from_bone(bone: &Bone, index: usize) -> BoneNode {
    let to_index = |i: i32| if i >= 0 { Some(i as usize) } else { None };
    let fixed_axis = if bone.has_fixed_axis() {
        let axis = bone.fixed_axis.normalize_or_zero();
        (axis != Vec3::ZERO).then_some(axis)
    } else {
        None
    };
    let local_frame = bone
        .has_local_axis()
        .then(|| local_axis_frame(bone.local_axis_x, bone.local_axis_z));
    let effect_rotation = bone.is_external_rotation();
    let effect_translation = bone.is_external_translation();

    BoneNode {
        index,
        name: bone.name.clone(),
        parent: to_index(bone.parent_index),
        effect_parent: if effect_rotation || effect_translation {
            to_index(bone.effect_index)
        } else {
            None
        },
        effect_factor: bone.effect_factor,
        effect_rotation,
        effect_translation,
        effect_local: bone.is_external_local(),
        can_rotate: bone.can_rotate(),
        can_translate: bone.can_translate(),
        after_physics: bone.is_after_physics_deform(),
        rest_position: bone.position,
        offset: bone.position,
        fixed_axis,
        local_frame,
        children: Vec::new(),
        ik: bone.ik.as_ref().filter(|_| bone.is_ik()).map(|ik| IkChain {
            target: ik.target_index.max(0) as usize,
            loop_count: ik.loop_count.clamp(0, 255) as u32,
            unit_rotation: ik.unit_rotation,
            links: ik.links.clone(),
        }),
        ik_owners: Vec::new(),
        layer: bone.layer,
    }
}

impl BoneGraph {
    /// 构建求值顺序
    ///
    /// 主键为作者指定的层级，其次保证父骨骼、付与亲、IK 链接先于自身，最后按物理顺序。
    pub fn build(model: &PmxModel) -> Result<Self> {
        let n = model.bones.len();
        for bone in model.bones.iter() {
            check_bone_refs(model, bone)?;
        }

        let mut nodes: Vec<BoneNode> = Vec::with_capacity(n);
        let mut positions = Vec::with_capacity(n);
        for (i, bone) in model.bones.iter_by_index().enumerate() {
            nodes.push(node_from_bone(bone, i));
            positions.push(model.bones.position_of(i as i32).unwrap_or(i));
        }

        for i in 0..n {
            if let Some(p) = nodes[i].parent {
                nodes[i].offset = nodes[i].rest_position - nodes[p].rest_position;
                nodes[p].children.push(i);
            }
            let links: Vec<usize> = nodes[i]
                .ik
                .as_ref()
                .map(|ik| ik.links.iter().map(|l| l.bone_index as usize).collect())
                .unwrap_or_default();
            for link in links {
                if !nodes[link].ik_owners.contains(&i) {
                    nodes[link].ik_owners.push(i);
                }
            }
        }

        let deps: Vec<Vec<usize>> = (0..n).map(|i| dependencies(&nodes, i)).collect();
        let mut dependents = vec![Vec::new(); n];
        let mut pending = vec![0usize; n];
        for (i, ds) in deps.iter().enumerate() {
            pending[i] = ds.len();
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut heap: BinaryHeap<Reverse<(i32, usize, usize)>> = BinaryHeap::new();
        for i in 0..n {
            if pending[i] == 0 {
                heap.push(Reverse((nodes[i].layer, positions[i], i)));
            }
        }
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((layer, _, i))) = heap.pop() {
            nodes[i].layer = layer;
            order.push(i);
            for &dep in &dependents[i] {
                pending[dep] -= 1;
                if pending[dep] == 0 {
                    // 依赖均已出队，其层级已确定
                    let key = deps[dep]
                        .iter()
                        .map(|&d| nodes[d].layer)
                        .fold(nodes[dep].layer, i32::max);
                    heap.push(Reverse((key, positions[dep], dep)));
                }
            }
        }

        if order.len() != n {
            let cycle: Vec<i32> = (0..n).filter(|&i| pending[i] > 0).map(|i| i as i32).collect();
            return Err(MmdError::CycleDetected(cycle));
        }

        log::debug!("bone graph built: {} bones", n);
        Ok(Self { nodes, order })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&BoneNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[BoneNode] {
        &self.nodes
    }

    /// 求值顺序（骨骼索引）
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// 可能影响 `bone` 变换的所有骨骼（含自身），按求值顺序返回
    pub fn relative_bones(&self, bone: usize) -> Vec<usize> {
        if bone >= self.nodes.len() {
            return Vec::new();
        }
        let mut found = BTreeSet::new();
        let mut stack = vec![bone];
        while let Some(i) = stack.pop() {
            if !found.insert(i) {
                continue;
            }
            let node = &self.nodes[i];
            stack.extend(node.parent);
            stack.extend(node.effect_parent);
            for &owner in &node.ik_owners {
                stack.push(owner);
                if let Some(ik) = &self.nodes[owner].ik {
                    stack.push(ik.target);
                    stack.extend(ik.links.iter().map(|l| l.bone_index as usize));
                }
            }
        }
        self.order.iter().copied().filter(|i| found.contains(i)).collect()
    }

    /// `bone` 及其全部子孙
    pub fn descendants(&self, bone: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![bone];
        while let Some(i) = stack.pop() {
            out.push(i);
            if let Some(node) = self.nodes.get(i) {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }
}

/// 先于 `i` 求值的骨骼
fn dependencies(nodes: &[BoneNode], i: usize) -> Vec<usize> {
    let node = &nodes[i];
    let mut deps = Vec::new();
    deps.extend(node.parent);
    if let Some(effect) = node.effect_parent {
        deps.push(effect);
        // 付与亲是 IK 链接时，需要等 IK 解算完成
        deps.extend(nodes[effect].ik_owners.iter().copied().filter(|&o| o != i));
    }
    if let Some(ik) = &node.ik {
        deps.extend(ik.links.iter().map(|l| l.bone_index as usize).filter(|&l| l != i));
    }
    deps.sort_unstable();
    deps.dedup();
    deps
}

fn check_bone_refs(model: &PmxModel, bone: &Bone) -> Result<()> {
    let ok = |i: i32| i == -1 || model.bones.contains(i);
    let fail = |what: &str, i: i32| {
        Err(MmdError::ModelInconsistent(format!(
            "bone {} has invalid {} {}",
            bone.name, what, i
        )))
    };
    if !ok(bone.parent_index) || bone.parent_index == bone.index {
        return fail("parent", bone.parent_index);
    }
    if (bone.is_external_rotation() || bone.is_external_translation())
        && (!ok(bone.effect_index) || bone.effect_index == bone.index)
    {
        return fail("effect parent", bone.effect_index);
    }
    if let Some(ik) = bone.ik.as_ref().filter(|_| bone.is_ik()) {
        if !model.bones.contains(ik.target_index) {
            return fail("ik target", ik.target_index);
        }
        for link in &ik.links {
            if !model.bones.contains(link.bone_index) || link.bone_index == bone.index {
                return fail("ik link", link.bone_index);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoneFlags, Ik};

    fn bone(name: &str, parent: i32, layer: i32) -> Bone {
        Bone {
            parent_index: parent,
            layer,
            ..Bone::new(name)
        }
    }

    #[test]
    fn test_layers_respect_parent_and_effect() {
        let mut model = PmxModel::new();
        model.bones.append(bone("root", -1, 0));
        // 子骨骼层级低于父骨骼
        model.bones.append(bone("child", 2, 0));
        model.bones.append(bone("spine", 0, 2));
        let mut give = bone("give", 0, 0);
        give.flags |= BoneFlags::IS_EXTERNAL_ROTATION;
        give.effect_index = 1;
        give.effect_factor = 0.5;
        model.bones.append(give);

        let graph = BoneGraph::build(&model).unwrap();
        let pos = |i: usize| graph.order().iter().position(|&x| x == i).unwrap();
        assert!(pos(2) < pos(1));
        assert!(pos(1) < pos(3));
        for node in graph.nodes() {
            if let Some(p) = node.parent {
                assert!(node.layer >= graph.node(p).unwrap().layer);
            }
            if let Some(e) = node.effect_parent {
                assert!(node.layer >= graph.node(e).unwrap().layer);
            }
        }
        assert_eq!(graph.node(1).unwrap().offset, Vec3::ZERO);
    }

    #[test]
    fn test_cycle_detected() {
        let mut model = PmxModel::new();
        model.bones.append(bone("a", 1, 0));
        model.bones.append(bone("b", 0, 0));
        match BoneGraph::build(&model) {
            Err(MmdError::CycleDetected(bones)) => assert_eq!(bones, vec![0, 1]),
            other => panic!("unexpected {:?}", other.map(|g| g.order().to_vec())),
        }
    }

    #[test]
    fn test_invalid_ik_link_rejected() {
        let mut model = PmxModel::new();
        model.bones.append(bone("a", -1, 0));
        let mut ik = bone("ik", -1, 0);
        ik.flags |= BoneFlags::IS_IK;
        ik.ik = Some(Ik {
            target_index: 0,
            loop_count: 10,
            unit_rotation: 1.0,
            links: vec![IkLink::new(9)],
        });
        model.bones.append(ik);
        assert!(matches!(
            BoneGraph::build(&model),
            Err(MmdError::ModelInconsistent(_))
        ));
    }

    #[test]
    fn test_ik_after_links_and_relative_bones() {
        let mut model = PmxModel::new();
        model.bones.append(bone("root", -1, 0));
        let mut ik = bone("ik", 0, 0);
        ik.flags |= BoneFlags::IS_IK;
        ik.ik = Some(Ik {
            target_index: 4,
            loop_count: 10,
            unit_rotation: 1.0,
            links: vec![IkLink::new(3), IkLink::new(2)],
        });
        model.bones.append(ik);
        model.bones.append(bone("thigh", 0, 0));
        model.bones.append(bone("knee", 2, 0));
        model.bones.append(bone("ankle", 3, 0));
        model.bones.append(bone("other", 0, 0));

        let graph = BoneGraph::build(&model).unwrap();
        assert_eq!(graph.order(), &[0, 2, 3, 1, 4, 5]);
        assert_eq!(graph.relative_bones(4), vec![0, 2, 3, 1, 4]);
        assert_eq!(graph.relative_bones(5), vec![0, 5]);
        assert_eq!(graph.descendants(2), vec![2, 3, 4]);
    }

    #[test]
    fn test_insertion_order_kept_for_same_layer() {
        let mut model = PmxModel::new();
        model.bones.append(bone("root", -1, 0));
        model.bones.append(bone("spine", 0, 0));
        model.bones.append(bone("head", 1, 1));
        let mut neck = bone("neck", 1, 0);
        neck.position = Vec3::new(0.0, 1.0, 0.0);
        let neck = model.bones.insert_after(1, neck).unwrap();
        model.bones.get_mut(2).unwrap().parent_index = neck;
        model.bones.normalize_layers();

        let graph = BoneGraph::build(&model).unwrap();
        assert_eq!(graph.order(), &[0, 1, 3, 2]);
        let neck_layer = graph.node(3).unwrap().layer;
        assert!(neck_layer == 0 || neck_layer == 1);
        assert!(graph.node(2).unwrap().layer >= neck_layer);
    }
}

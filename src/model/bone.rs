//! 骨骼定义与骨骼集合

use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use glam::Vec3;

use crate::collection::{Indexed, Named, NamedCollection};
use crate::{MmdError, Result};

bitflags! {
    /// 骨骼标志位（与 PMX 位定义一致）
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u16 {
        /// 尾端指定为骨骼
        const TAIL_IS_BONE = 0x0001;
        /// 可旋转
        const CAN_ROTATE = 0x0002;
        /// 可移动
        const CAN_TRANSLATE = 0x0004;
        /// 可见
        const IS_VISIBLE = 0x0008;
        /// 可操作
        const CAN_MANIPULATE = 0x0010;
        /// IK
        const IS_IK = 0x0020;
        /// 付与使用本地值
        const IS_EXTERNAL_LOCAL = 0x0080;
        /// 付与旋转
        const IS_EXTERNAL_ROTATION = 0x0100;
        /// 付与移动
        const IS_EXTERNAL_TRANSLATION = 0x0200;
        /// 固定轴
        const HAS_FIXED_AXIS = 0x0400;
        /// 本地轴
        const HAS_LOCAL_AXIS = 0x0800;
        /// 物理后变形
        const IS_AFTER_PHYSICS_DEFORM = 0x1000;
        /// 外部父变形
        const IS_EXTERNAL_PARENT_DEFORM = 0x2000;
    }
}

/// 尾端：骨骼索引或偏移向量
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoneTail {
    Bone(i32),
    Offset(Vec3),
}

impl Default for BoneTail {
    fn default() -> Self {
        BoneTail::Bone(-1)
    }
}

/// IK 链接
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IkLink {
    pub bone_index: i32,
    pub angle_limit: bool,
    pub min_angle: Vec3,
    pub max_angle: Vec3,
    /// 在骨骼本地轴坐标系中的角度限制（运行时设置，不写入 PMX）
    pub local_angle_limit: bool,
    pub local_min_angle: Vec3,
    pub local_max_angle: Vec3,
}

impl IkLink {
    pub fn new(bone_index: i32) -> Self {
        Self {
            bone_index,
            ..Default::default()
        }
    }

    pub fn with_limits(bone_index: i32, min_angle: Vec3, max_angle: Vec3) -> Self {
        Self {
            bone_index,
            angle_limit: true,
            min_angle,
            max_angle,
            ..Default::default()
        }
    }
}

/// IK 描述
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ik {
    /// 效应器（被拉向 IK 骨骼的骨骼）
    pub target_index: i32,
    pub loop_count: i32,
    /// 单次迭代的旋转上限（弧度）
    pub unit_rotation: f32,
    /// 从末端到根部排列
    pub links: Vec<IkLink>,
}

/// 骨骼
#[derive(Clone, Debug, PartialEq)]
pub struct Bone {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    pub position: Vec3,
    pub parent_index: i32,
    pub layer: i32,
    pub flags: BoneFlags,
    pub tail: BoneTail,
    pub effect_index: i32,
    pub effect_factor: f32,
    pub fixed_axis: Vec3,
    pub local_axis_x: Vec3,
    pub local_axis_z: Vec3,
    pub external_key: i32,
    pub ik: Option<Ik>,
}

impl Default for Bone {
    fn default() -> Self {
        Self {
            index: -1,
            name: String::new(),
            english_name: String::new(),
            position: Vec3::ZERO,
            parent_index: -1,
            layer: 0,
            flags: BoneFlags::CAN_ROTATE | BoneFlags::IS_VISIBLE | BoneFlags::CAN_MANIPULATE,
            tail: BoneTail::default(),
            effect_index: -1,
            effect_factor: 0.0,
            fixed_axis: Vec3::ZERO,
            local_axis_x: Vec3::X,
            local_axis_z: Vec3::Z,
            external_key: -1,
            ik: None,
        }
    }
}

impl Bone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn can_rotate(&self) -> bool {
        self.flags.contains(BoneFlags::CAN_ROTATE)
    }

    pub fn can_translate(&self) -> bool {
        self.flags.contains(BoneFlags::CAN_TRANSLATE)
    }

    pub fn is_ik(&self) -> bool {
        self.flags.contains(BoneFlags::IS_IK) && self.ik.is_some()
    }

    pub fn is_external_rotation(&self) -> bool {
        self.flags.contains(BoneFlags::IS_EXTERNAL_ROTATION)
    }

    pub fn is_external_translation(&self) -> bool {
        self.flags.contains(BoneFlags::IS_EXTERNAL_TRANSLATION)
    }

    pub fn is_external_local(&self) -> bool {
        self.flags.contains(BoneFlags::IS_EXTERNAL_LOCAL)
    }

    pub fn has_effect(&self) -> bool {
        (self.is_external_rotation() || self.is_external_translation()) && self.effect_index >= 0
    }

    pub fn has_fixed_axis(&self) -> bool {
        self.flags.contains(BoneFlags::HAS_FIXED_AXIS)
    }

    pub fn has_local_axis(&self) -> bool {
        self.flags.contains(BoneFlags::HAS_LOCAL_AXIS)
    }

    pub fn is_after_physics_deform(&self) -> bool {
        self.flags.contains(BoneFlags::IS_AFTER_PHYSICS_DEFORM)
    }
}

impl Indexed for Bone {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for Bone {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

/// 骨骼集合：在 [`NamedCollection`] 之上维护层级（变形顺序）
#[derive(Clone, Debug, Default)]
pub struct BoneCollection {
    inner: NamedCollection<Bone>,
}

impl Deref for BoneCollection {
    type Target = NamedCollection<Bone>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BoneCollection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl BoneCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `after_index` 之后插入新骨骼，返回新索引。
    ///
    /// - `after_index < 0`：所有已有骨骼层级 +1，新骨骼位于层级 0 的最前面
    /// - 其后骨骼层级与前者相差不超过 1 时沿用前者层级，否则取前者 +1
    /// - `after_index` 不存在时追加到末尾并沿用末尾骨骼的层级
    pub fn insert_after(&mut self, after_index: i32, mut bone: Bone) -> Result<i32> {
        if self.inner.contains_name(&bone.name) {
            return Err(MmdError::NameConflict(bone.name));
        }
        let index = if after_index < 0 {
            for b in self.inner.iter_mut() {
                b.layer += 1;
            }
            bone.layer = 0;
            self.inner.insert_at(0, bone)?
        } else if let Some(pos) = self.inner.position_of(after_index) {
            let physical: Vec<i32> = self.inner.iter().map(|b| b.layer).collect();
            let prev_layer = physical[pos];
            bone.layer = match physical.get(pos + 1) {
                None => prev_layer,
                Some(&next_layer) if next_layer <= prev_layer + 1 => prev_layer,
                Some(_) => prev_layer + 1,
            };
            self.inner.insert_at(pos + 1, bone)?
        } else {
            bone.layer = self.inner.last().map(|b| b.layer).unwrap_or(0);
            let end = self.inner.len();
            self.inner.insert_at(end, bone)?
        };

        self.normalize_layers();
        Ok(index)
    }

    /// 抬高层级直到 `layer >= parent.layer` 且 `layer >= effect_parent.layer`
    pub fn normalize_layers(&mut self) {
        let len = self.inner.len();
        for _ in 0..len.max(1) {
            let layers: Vec<i32> = self.inner.iter_by_index().map(|b| b.layer).collect();
            let mut changed = false;
            for bone in self.inner.iter_mut() {
                let mut required = bone.layer;
                for dep in [bone.parent_index, bone.effect_index_if_used()] {
                    if dep >= 0 && (dep as usize) < layers.len() && dep != bone.index {
                        required = required.max(layers[dep as usize]);
                    }
                }
                if required != bone.layer {
                    bone.layer = required;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// 父骨骼为 -1 的骨骼
    pub fn roots(&self) -> Vec<i32> {
        self.inner
            .iter_by_index()
            .filter(|b| b.parent_index < 0)
            .map(|b| b.index)
            .collect()
    }
}

impl Bone {
    fn effect_index_if_used(&self) -> i32 {
        if self.has_effect() {
            self.effect_index
        } else {
            -1
        }
    }
}

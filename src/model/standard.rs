//! 准标准骨骼生成
//!
//! 根据已有的锚点骨骼计算位置、按候选列表选择父骨骼，再插入到骨骼集合中。

use glam::Vec3;

use super::{Bone, BoneFlags, BoneTail, PmxModel, CENTER_BONE_NAME};
use crate::{MmdError, Result};

pub const ROOT: &str = "全ての親";
pub const GROOVE: &str = "グルーブ";
pub const WAIST: &str = "腰";
pub const UPPER: &str = "上半身";
pub const UPPER2: &str = "上半身2";
pub const LOWER: &str = "下半身";
pub const LEG_CENTER: &str = "足中心";
pub const NECK: &str = "首";
pub const HEAD: &str = "頭";
pub const LEFT_LEG: &str = "左足";
pub const RIGHT_LEG: &str = "右足";
pub const LEFT_ARM: &str = "左腕";
pub const RIGHT_ARM: &str = "右腕";

/// 可生成的准标准骨骼
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardBone {
    Groove,
    Waist,
    LegCenter,
    Neck,
}

impl StandardBone {
    pub fn name(self) -> &'static str {
        match self {
            StandardBone::Groove => GROOVE,
            StandardBone::Waist => WAIST,
            StandardBone::LegCenter => LEG_CENTER,
            StandardBone::Neck => NECK,
        }
    }

    /// 父骨骼候选（按优先级）
    fn parent_candidates(self) -> &'static [&'static str] {
        match self {
            StandardBone::Groove => &[CENTER_BONE_NAME, ROOT],
            StandardBone::Waist => &[GROOVE, CENTER_BONE_NAME, ROOT],
            StandardBone::LegCenter => &[WAIST, GROOVE, CENTER_BONE_NAME, ROOT],
            StandardBone::Neck => &[UPPER2, UPPER],
        }
    }

    /// 插入后接管为子骨骼的骨骼（仅当其原父骨骼与新骨骼的父骨骼相同）
    fn adopted_children(self) -> &'static [&'static str] {
        match self {
            StandardBone::Groove => &[WAIST, UPPER, LOWER],
            StandardBone::Waist => &[UPPER, LOWER],
            StandardBone::LegCenter => &[],
            StandardBone::Neck => &[HEAD],
        }
    }

    fn flags(self) -> BoneFlags {
        let base = BoneFlags::IS_VISIBLE | BoneFlags::CAN_MANIPULATE | BoneFlags::CAN_ROTATE;
        match self {
            StandardBone::Neck => base,
            _ => base | BoneFlags::CAN_TRANSLATE,
        }
    }
}

fn position_of(model: &PmxModel, name: &str) -> Option<Vec3> {
    model.bones.get_by_name(name).ok().map(|b| b.position)
}

fn midpoint(model: &PmxModel, bone: &str, a: &str, b: &str) -> Result<Vec3> {
    match (position_of(model, a), position_of(model, b)) {
        (Some(pa), Some(pb)) => Ok((pa + pb) * 0.5),
        _ => Err(MmdError::ParentNotFound {
            bone: bone.to_string(),
            tried: vec![a.to_string(), b.to_string()],
        }),
    }
}

/// 生成骨骼（不插入），计算位置与父骨骼
pub fn create(model: &PmxModel, kind: StandardBone) -> Result<Bone> {
    let name = kind.name();
    let position = match kind {
        StandardBone::Groove => {
            let upper = position_of(model, UPPER).ok_or_else(|| MmdError::ParentNotFound {
                bone: name.to_string(),
                tried: vec![UPPER.to_string()],
            })?;
            Vec3::new(0.0, upper.y * 0.7, 0.0)
        }
        StandardBone::Waist => midpoint(model, name, UPPER, LOWER)?,
        StandardBone::LegCenter => midpoint(model, name, LEFT_LEG, RIGHT_LEG)?,
        StandardBone::Neck => midpoint(model, name, LEFT_ARM, RIGHT_ARM)?,
    };

    let candidates = kind.parent_candidates();
    let parent_index = candidates
        .iter()
        .find_map(|c| model.bones.index_of(c))
        .ok_or_else(|| MmdError::ParentNotFound {
            bone: name.to_string(),
            tried: candidates.iter().map(|c| c.to_string()).collect(),
        })?;

    let mut bone = Bone::new(name);
    bone.flags = kind.flags();
    bone.position = position;
    bone.parent_index = parent_index;
    if kind == StandardBone::Neck {
        if let Some(head) = model.bones.index_of(HEAD) {
            bone.tail = BoneTail::Bone(head);
            bone.flags |= BoneFlags::TAIL_IS_BONE;
        }
    }
    Ok(bone)
}

/// 生成并插入到父骨骼之后，接管对应子骨骼，返回新索引
pub fn insert_standard_bone(model: &mut PmxModel, kind: StandardBone) -> Result<i32> {
    if let Some(existing) = model.bones.index_of(kind.name()) {
        return Ok(existing);
    }
    let bone = create(model, kind)?;
    let parent_index = bone.parent_index;
    let index = model.bones.insert_after(parent_index, bone)?;

    for child in kind.adopted_children() {
        if let Some(child_index) = model.bones.index_of(child) {
            let child_bone = model.bones.get_mut(child_index)?;
            if child_bone.parent_index == parent_index {
                child_bone.parent_index = index;
            }
        }
    }
    model.bones.normalize_layers();

    log::debug!("inserted standard bone {} at index {}", kind.name(), index);
    Ok(index)
}

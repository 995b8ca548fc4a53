//! PMX 模型及其实体
//!
//! 模型拥有所有集合，实体之间只通过索引互相引用。

mod bone;
mod display_slot;
mod material;
mod morph;
mod rigid_body;
pub mod standard;
mod vertex;

pub use bone::{Bone, BoneCollection, BoneFlags, BoneTail, Ik, IkLink};
pub use display_slot::{DisplayReference, DisplaySlot};
pub use material::{DrawFlags, Material, SphereMode, Texture, ToonSharing};
pub use morph::{MaterialMorphMode, MaterialMorphOffset, Morph, MorphOffset, MorphPanel, MorphType};
pub use rigid_body::{Joint, JointParam, PhysicsType, RigidBody, RigidBodyParam, Shape};
pub use vertex::{Deform, Face, Vertex};

use std::path::PathBuf;

use crate::collection::{IndexedCollection, NamedCollection};
use crate::{MmdError, Result};

/// 文本编码
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf16Le,
    Utf8,
}

/// センター
pub const CENTER_BONE_NAME: &str = "センター";
/// Root 表示枠
pub const ROOT_SLOT_NAME: &str = "Root";
/// 表情表示枠
pub const MORPH_SLOT_NAME: &str = "表情";

/// PMX 模型
#[derive(Clone, Debug)]
pub struct PmxModel {
    pub path: Option<PathBuf>,
    pub version: f32,
    pub encoding: TextEncoding,
    pub extended_uv_count: u8,
    pub name: String,
    pub english_name: String,
    pub comment: String,
    pub english_comment: String,
    pub vertices: IndexedCollection<Vertex>,
    pub faces: IndexedCollection<Face>,
    pub textures: NamedCollection<Texture>,
    pub materials: NamedCollection<Material>,
    pub bones: BoneCollection,
    pub morphs: NamedCollection<Morph>,
    pub display_slots: NamedCollection<DisplaySlot>,
    pub rigid_bodies: NamedCollection<RigidBody>,
    pub joints: NamedCollection<Joint>,
    /// 2.1 文件末尾是否带 SoftBody 段；新建模型写出时带上
    pub soft_body_section: bool,
}

impl Default for PmxModel {
    fn default() -> Self {
        Self {
            path: None,
            version: 2.0,
            encoding: TextEncoding::Utf16Le,
            extended_uv_count: 0,
            name: String::new(),
            english_name: String::new(),
            comment: String::new(),
            english_comment: String::new(),
            vertices: IndexedCollection::new(),
            faces: IndexedCollection::new(),
            textures: NamedCollection::new(),
            materials: NamedCollection::new(),
            bones: BoneCollection::new(),
            morphs: NamedCollection::new(),
            display_slots: NamedCollection::new(),
            rigid_bodies: NamedCollection::new(),
            joints: NamedCollection::new(),
            soft_body_section: true,
        }
    }
}

impl PmxModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按名称查找纹理，不存在则追加
    pub fn ensure_texture(&mut self, name: &str) -> i32 {
        match self.textures.index_of(name) {
            Some(index) => index,
            None => self.textures.append(Texture::new(name)),
        }
    }

    /// 添加 Root / 表情 两个特殊表示枠（已存在则跳过）
    pub fn ensure_default_display_slots(&mut self) {
        if !self.display_slots.contains_name(ROOT_SLOT_NAME) {
            self.display_slots
                .append(DisplaySlot::new(ROOT_SLOT_NAME, ROOT_SLOT_NAME, true));
        }
        if !self.display_slots.contains_name(MORPH_SLOT_NAME) {
            self.display_slots
                .append(DisplaySlot::new(MORPH_SLOT_NAME, "Exp", true));
        }
    }

    /// 若没有センター骨骼则在最前面插入一根，并登记到 Root 表示枠
    pub fn ensure_center_bone(&mut self) -> Result<i32> {
        if let Some(index) = self.bones.index_of(CENTER_BONE_NAME) {
            return Ok(index);
        }
        let mut center = Bone::new(CENTER_BONE_NAME);
        center.english_name = "center".to_string();
        center.flags = BoneFlags::CAN_MANIPULATE
            | BoneFlags::CAN_ROTATE
            | BoneFlags::CAN_TRANSLATE
            | BoneFlags::IS_VISIBLE;
        let index = self.bones.insert_after(-1, center)?;

        self.ensure_default_display_slots();
        let slot = self.display_slots.get_mut_by_name(ROOT_SLOT_NAME)?;
        slot.references.push(DisplayReference::Bone(index));
        Ok(index)
    }

    /// 材质覆盖的面顶点总数
    pub fn material_vertices_total(&self) -> i64 {
        self.materials
            .iter()
            .map(|m| m.vertices_count as i64)
            .sum()
    }

    /// 载入后的引用完整性检查
    pub fn validate(&self) -> Result<()> {
        let bone_ok = |i: i32| i == -1 || self.bones.contains(i);
        let inconsistent = |msg: String| Err(MmdError::ModelInconsistent(msg));

        for v in self.vertices.iter() {
            for b in v.deform.bone_indices() {
                if !bone_ok(b) {
                    return inconsistent(format!("vertex {} references bone {}", v.index, b));
                }
            }
        }

        let vertex_count = self.vertices.len() as u32;
        for f in self.faces.iter() {
            if f.vertices.iter().any(|&v| v >= vertex_count) {
                return inconsistent(format!("face {} references a missing vertex", f.index));
            }
        }

        for m in self.materials.iter() {
            if m.vertices_count < 0 || m.vertices_count % 3 != 0 {
                return inconsistent(format!(
                    "material {} has vertices_count {}",
                    m.name, m.vertices_count
                ));
            }
            let tex_ok = |i: i32| i == -1 || self.textures.contains(i);
            if !tex_ok(m.texture_index) || !tex_ok(m.sphere_texture_index) {
                return inconsistent(format!("material {} references a missing texture", m.name));
            }
            if let ToonSharing::Individual(t) = m.toon {
                if !tex_ok(t) {
                    return inconsistent(format!("material {} references a missing toon", m.name));
                }
            }
        }
        if self.material_vertices_total() != 3 * self.faces.len() as i64 {
            return inconsistent(format!(
                "materials cover {} face vertices but model has {}",
                self.material_vertices_total(),
                3 * self.faces.len()
            ));
        }

        for b in self.bones.iter() {
            if !bone_ok(b.parent_index) || b.parent_index == b.index {
                return inconsistent(format!("bone {} has invalid parent {}", b.name, b.parent_index));
            }
            if let BoneTail::Bone(t) = b.tail {
                if !bone_ok(t) {
                    return inconsistent(format!("bone {} has invalid tail {}", b.name, t));
                }
            }
            if b.has_effect() && (!self.bones.contains(b.effect_index) || b.effect_index == b.index) {
                return inconsistent(format!(
                    "bone {} has invalid effect parent {}",
                    b.name, b.effect_index
                ));
            }
            if let Some(ik) = &b.ik {
                if !self.bones.contains(ik.target_index) {
                    return inconsistent(format!(
                        "ik bone {} has invalid target {}",
                        b.name, ik.target_index
                    ));
                }
                if let Some(link) = ik.links.iter().find(|l| !self.bones.contains(l.bone_index)) {
                    return inconsistent(format!(
                        "ik bone {} has invalid link {}",
                        b.name, link.bone_index
                    ));
                }
            }
        }

        for rb in self.rigid_bodies.iter() {
            if !bone_ok(rb.bone_index) {
                return inconsistent(format!(
                    "rigid body {} references bone {}",
                    rb.name, rb.bone_index
                ));
            }
        }

        Ok(())
    }
}

//! PMX 写出
//!
//! 索引宽度按各段实体数自动选择最小值。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use glam::{Vec2, Vec3, Vec4};

use super::{text, IndexSizes, SIGNATURE};
use crate::model::{
    BoneFlags, BoneTail, Deform, DisplayReference, MaterialMorphMode, MorphOffset, PmxModel,
    TextEncoding, ToonSharing,
};
use crate::Result;

pub fn write_pmx_file<P: AsRef<Path>>(model: &PmxModel, path: P) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_pmx(model, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn write_pmx<W: Write>(model: &PmxModel, writer: W) -> Result<()> {
    let sizes = IndexSizes {
        vertex: IndexSizes::for_vertex_count(model.vertices.len()),
        texture: IndexSizes::for_signed_count(model.textures.len()),
        material: IndexSizes::for_signed_count(model.materials.len()),
        bone: IndexSizes::for_signed_count(model.bones.len()),
        morph: IndexSizes::for_signed_count(model.morphs.len()),
        rigid_body: IndexSizes::for_signed_count(model.rigid_bodies.len()),
    };
    let mut w = PmxWriter {
        writer,
        encoding: model.encoding,
        sizes,
    };
    w.write_header(model)?;
    w.write_vertices(model)?;
    w.write_faces(model)?;
    w.write_textures(model)?;
    w.write_materials(model)?;
    w.write_bones(model)?;
    w.write_morphs(model)?;
    w.write_display_slots(model)?;
    w.write_rigid_bodies(model)?;
    w.write_joints(model)?;
    if model.version > 2.05 && model.soft_body_section {
        w.i32(0)?;
    }
    log::debug!("PMX written: {} with index sizes {:?}", model.name, sizes);
    Ok(())
}

struct PmxWriter<W: Write> {
    writer: W,
    encoding: TextEncoding,
    sizes: IndexSizes,
}

impl<W: Write> PmxWriter<W> {
    fn u8(&mut self, v: u8) -> Result<()> {
        Ok(self.writer.write_u8(v)?)
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        Ok(self.writer.write_u16::<LittleEndian>(v)?)
    }

    fn i32(&mut self, v: i32) -> Result<()> {
        Ok(self.writer.write_i32::<LittleEndian>(v)?)
    }

    fn f32(&mut self, v: f32) -> Result<()> {
        Ok(self.writer.write_f32::<LittleEndian>(v)?)
    }

    fn vec2(&mut self, v: Vec2) -> Result<()> {
        self.f32(v.x)?;
        self.f32(v.y)
    }

    fn vec3(&mut self, v: Vec3) -> Result<()> {
        self.f32(v.x)?;
        self.f32(v.y)?;
        self.f32(v.z)
    }

    fn vec4(&mut self, v: Vec4) -> Result<()> {
        self.f32(v.x)?;
        self.f32(v.y)?;
        self.f32(v.z)?;
        self.f32(v.w)
    }

    fn count(&mut self, n: usize) -> Result<()> {
        self.i32(n as i32)
    }

    fn text(&mut self, s: &str) -> Result<()> {
        let bytes = text::encode(s, self.encoding);
        self.count(bytes.len())?;
        Ok(self.writer.write_all(&bytes)?)
    }

    fn vertex_index(&mut self, v: u32) -> Result<()> {
        match self.sizes.vertex {
            1 => self.u8(v as u8),
            2 => self.u16(v as u16),
            _ => self.i32(v as i32),
        }
    }

    fn signed_index(&mut self, size: u8, v: i32) -> Result<()> {
        match size {
            1 => Ok(self.writer.write_i8(v as i8)?),
            2 => Ok(self.writer.write_i16::<LittleEndian>(v as i16)?),
            _ => self.i32(v),
        }
    }

    fn bone_index(&mut self, v: i32) -> Result<()> {
        self.signed_index(self.sizes.bone, v)
    }

    fn write_header(&mut self, model: &PmxModel) -> Result<()> {
        self.writer.write_all(SIGNATURE)?;
        self.f32(model.version)?;
        self.u8(8)?;
        self.u8(match self.encoding {
            TextEncoding::Utf16Le => 0,
            TextEncoding::Utf8 => 1,
        })?;
        self.u8(model.extended_uv_count.min(4))?;
        let s = self.sizes;
        for size in [s.vertex, s.texture, s.material, s.bone, s.morph, s.rigid_body] {
            self.u8(size)?;
        }
        self.text(&model.name)?;
        self.text(&model.english_name)?;
        self.text(&model.comment)?;
        self.text(&model.english_comment)
    }

    fn write_vertices(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.vertices.len())?;
        let ext = model.extended_uv_count.min(4) as usize;
        for v in model.vertices.iter_by_index() {
            self.vec3(v.position)?;
            self.vec3(v.normal)?;
            self.vec2(v.uv)?;
            for uv in &v.extended_uvs[..ext] {
                self.vec4(*uv)?;
            }
            self.u8(v.deform.type_byte())?;
            match &v.deform {
                Deform::Bdef1 { bone } => self.bone_index(*bone)?,
                Deform::Bdef2 { bones, weight } => {
                    self.bone_index(bones[0])?;
                    self.bone_index(bones[1])?;
                    self.f32(*weight)?;
                }
                Deform::Bdef4 { bones, weights } | Deform::Qdef { bones, weights } => {
                    for b in bones {
                        self.bone_index(*b)?;
                    }
                    for w in weights {
                        self.f32(*w)?;
                    }
                }
                Deform::Sdef { bones, weight, c, r0, r1 } => {
                    self.bone_index(bones[0])?;
                    self.bone_index(bones[1])?;
                    self.f32(*weight)?;
                    self.vec3(*c)?;
                    self.vec3(*r0)?;
                    self.vec3(*r1)?;
                }
            }
            self.f32(v.edge_factor)?;
        }
        Ok(())
    }

    fn write_faces(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.faces.len() * 3)?;
        for f in model.faces.iter_by_index() {
            for v in f.vertices {
                self.vertex_index(v)?;
            }
        }
        Ok(())
    }

    fn write_textures(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.textures.len())?;
        for t in model.textures.iter_by_index() {
            self.text(&t.name)?;
        }
        Ok(())
    }

    fn write_materials(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.materials.len())?;
        let tex = self.sizes.texture;
        for m in model.materials.iter_by_index() {
            self.text(&m.name)?;
            self.text(&m.english_name)?;
            self.vec4(m.diffuse)?;
            self.vec3(m.specular)?;
            self.f32(m.specular_power)?;
            self.vec3(m.ambient)?;
            self.u8(m.draw_flags.bits())?;
            self.vec4(m.edge_color)?;
            self.f32(m.edge_size)?;
            self.signed_index(tex, m.texture_index)?;
            self.signed_index(tex, m.sphere_texture_index)?;
            self.u8(m.sphere_mode.to_u8())?;
            match m.toon {
                ToonSharing::Individual(t) => {
                    self.u8(0)?;
                    self.signed_index(tex, t)?;
                }
                ToonSharing::Shared(slot) => {
                    self.u8(1)?;
                    self.u8(slot)?;
                }
            }
            self.text(&m.memo)?;
            self.i32(m.vertices_count)?;
        }
        Ok(())
    }

    fn write_bones(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.bones.len())?;
        for b in model.bones.iter_by_index() {
            let mut flags = b.flags;
            flags.set(BoneFlags::TAIL_IS_BONE, matches!(b.tail, BoneTail::Bone(_)));

            self.text(&b.name)?;
            self.text(&b.english_name)?;
            self.vec3(b.position)?;
            self.bone_index(b.parent_index)?;
            self.i32(b.layer)?;
            self.u16(flags.bits())?;
            match b.tail {
                BoneTail::Bone(t) => self.bone_index(t)?,
                BoneTail::Offset(offset) => self.vec3(offset)?,
            }
            if flags.intersects(BoneFlags::IS_EXTERNAL_ROTATION | BoneFlags::IS_EXTERNAL_TRANSLATION) {
                self.bone_index(b.effect_index)?;
                self.f32(b.effect_factor)?;
            }
            if flags.contains(BoneFlags::HAS_FIXED_AXIS) {
                self.vec3(b.fixed_axis)?;
            }
            if flags.contains(BoneFlags::HAS_LOCAL_AXIS) {
                self.vec3(b.local_axis_x)?;
                self.vec3(b.local_axis_z)?;
            }
            if flags.contains(BoneFlags::IS_EXTERNAL_PARENT_DEFORM) {
                self.i32(b.external_key)?;
            }
            if flags.contains(BoneFlags::IS_IK) {
                let ik = b.ik.clone().unwrap_or_default();
                self.bone_index(ik.target_index)?;
                self.i32(ik.loop_count)?;
                self.f32(ik.unit_rotation)?;
                self.count(ik.links.len())?;
                for link in &ik.links {
                    self.bone_index(link.bone_index)?;
                    self.u8(link.angle_limit as u8)?;
                    if link.angle_limit {
                        self.vec3(link.min_angle)?;
                        self.vec3(link.max_angle)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_morphs(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.morphs.len())?;
        for morph in model.morphs.iter_by_index() {
            self.text(&morph.name)?;
            self.text(&morph.english_name)?;
            self.u8(morph.panel.to_u8())?;
            self.u8(morph.morph_type.to_u8())?;
            self.count(morph.offsets.len())?;
            for offset in &morph.offsets {
                match offset {
                    MorphOffset::Group { morph_index, factor } => {
                        self.signed_index(self.sizes.morph, *morph_index)?;
                        self.f32(*factor)?;
                    }
                    MorphOffset::Vertex { vertex_index, position } => {
                        self.vertex_index(*vertex_index)?;
                        self.vec3(*position)?;
                    }
                    MorphOffset::Bone { bone_index, translation, rotation } => {
                        self.bone_index(*bone_index)?;
                        self.vec3(*translation)?;
                        self.vec4(Vec4::from(*rotation))?;
                    }
                    MorphOffset::Uv { vertex_index, uv } => {
                        self.vertex_index(*vertex_index)?;
                        self.vec4(*uv)?;
                    }
                    MorphOffset::Material(m) => {
                        self.signed_index(self.sizes.material, m.material_index)?;
                        self.u8(match m.mode {
                            MaterialMorphMode::Multiply => 0,
                            MaterialMorphMode::Add => 1,
                        })?;
                        self.vec4(m.diffuse)?;
                        self.vec3(m.specular)?;
                        self.f32(m.specular_power)?;
                        self.vec3(m.ambient)?;
                        self.vec4(m.edge_color)?;
                        self.f32(m.edge_size)?;
                        self.vec4(m.texture_factor)?;
                        self.vec4(m.sphere_texture_factor)?;
                        self.vec4(m.toon_texture_factor)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_display_slots(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.display_slots.len())?;
        for slot in model.display_slots.iter_by_index() {
            self.text(&slot.name)?;
            self.text(&slot.english_name)?;
            self.u8(slot.special as u8)?;
            self.count(slot.references.len())?;
            for r in &slot.references {
                match *r {
                    DisplayReference::Bone(b) => {
                        self.u8(0)?;
                        self.bone_index(b)?;
                    }
                    DisplayReference::Morph(m) => {
                        self.u8(1)?;
                        self.signed_index(self.sizes.morph, m)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_rigid_bodies(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.rigid_bodies.len())?;
        for rb in model.rigid_bodies.iter_by_index() {
            self.text(&rb.name)?;
            self.text(&rb.english_name)?;
            self.bone_index(rb.bone_index)?;
            self.u8(rb.collision_group)?;
            self.u16(rb.collision_group_mask)?;
            self.u8(rb.shape.to_u8())?;
            self.vec3(rb.size)?;
            self.vec3(rb.position)?;
            self.vec3(rb.rotation)?;
            self.f32(rb.param.mass)?;
            self.f32(rb.param.linear_damping)?;
            self.f32(rb.param.angular_damping)?;
            self.f32(rb.param.restitution)?;
            self.f32(rb.param.friction)?;
            self.u8(rb.physics_type.to_u8())?;
        }
        Ok(())
    }

    fn write_joints(&mut self, model: &PmxModel) -> Result<()> {
        self.count(model.joints.len())?;
        let rb = self.sizes.rigid_body;
        for j in model.joints.iter_by_index() {
            self.text(&j.name)?;
            self.text(&j.english_name)?;
            self.u8(j.joint_type)?;
            self.signed_index(rb, j.rigid_body_index_a)?;
            self.signed_index(rb, j.rigid_body_index_b)?;
            self.vec3(j.position)?;
            self.vec3(j.rotation)?;
            self.vec3(j.param.translation_limit_min)?;
            self.vec3(j.param.translation_limit_max)?;
            self.vec3(j.param.rotation_limit_min)?;
            self.vec3(j.param.rotation_limit_max)?;
            self.vec3(j.param.spring_constant_translation)?;
            self.vec3(j.param.spring_constant_rotation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Bone, DisplaySlot, Face, Ik, IkLink, Joint, Material, MaterialMorphOffset, Morph,
        MorphType, PhysicsType, RigidBody, Shape, Texture, Vertex,
    };
    use crate::pmx::read_pmx;
    use crate::MmdError;
    use glam::Quat;

    fn sample_model(encoding: TextEncoding) -> PmxModel {
        let mut model = PmxModel::new();
        model.encoding = encoding;
        model.extended_uv_count = 1;
        model.name = "テスト".to_string();
        model.english_name = "test".to_string();
        model.comment = "コメント".to_string();

        let mut root = Bone::new("センター");
        root.tail = BoneTail::Offset(Vec3::new(0.0, 1.0, 0.0));
        model.bones.append(root);
        let mut arm = Bone::new("左腕");
        arm.parent_index = 0;
        arm.position = Vec3::new(1.0, 2.0, 0.5);
        arm.flags |= BoneFlags::IS_EXTERNAL_ROTATION | BoneFlags::HAS_FIXED_AXIS;
        arm.tail = BoneTail::Bone(-1);
        arm.effect_index = 0;
        arm.effect_factor = -0.5;
        arm.fixed_axis = Vec3::X;
        model.bones.append(arm);
        let mut ik = Bone::new("左足ＩＫ");
        ik.flags |= BoneFlags::IS_IK | BoneFlags::CAN_TRANSLATE | BoneFlags::HAS_LOCAL_AXIS;
        ik.layer = 1;
        ik.local_axis_x = Vec3::new(0.0, 1.0, 0.0);
        ik.ik = Some(Ik {
            target_index: 1,
            loop_count: 40,
            unit_rotation: 2.0,
            links: vec![
                IkLink::with_limits(1, Vec3::new(-3.14, 0.0, 0.0), Vec3::new(-0.01, 0.0, 0.0)),
                IkLink::new(0),
            ],
        });
        model.bones.append(ik);

        for i in 0..3 {
            model.vertices.append(Vertex {
                position: Vec3::new(i as f32, 0.5, -1.0),
                uv: Vec2::new(0.25, 0.75),
                extended_uvs: [Vec4::new(1.0, 2.0, 3.0, 4.0), Vec4::ZERO, Vec4::ZERO, Vec4::ZERO],
                deform: match i {
                    0 => Deform::Bdef1 { bone: 0 },
                    1 => Deform::Bdef2 { bones: [0, 1], weight: 0.25 },
                    _ => Deform::Sdef {
                        bones: [0, 1],
                        weight: 0.5,
                        c: Vec3::ONE,
                        r0: Vec3::X,
                        r1: Vec3::Y,
                    },
                },
                ..Default::default()
            });
        }
        model.faces.append(Face::new(0, 1, 2));
        model.textures.append(Texture::new("tex.png"));

        let mut material = Material::new("材質1");
        material.texture_index = 0;
        material.toon = ToonSharing::Shared(3);
        material.vertices_count = 3;
        material.memo = "memo".to_string();
        model.materials.append(material);

        let mut morph = Morph::new("あ", MorphType::Vertex);
        morph.offsets.push(MorphOffset::Vertex {
            vertex_index: 2,
            position: Vec3::new(0.0, 0.1, 0.0),
        });
        model.morphs.append(morph);
        let mut bone_morph = Morph::new("bone", MorphType::Bone);
        bone_morph.offsets.push(MorphOffset::Bone {
            bone_index: 1,
            translation: Vec3::ONE,
            rotation: Quat::from_rotation_y(0.3),
        });
        model.morphs.append(bone_morph);
        let mut material_morph = Morph::new("mat", MorphType::Material);
        material_morph.offsets.push(MorphOffset::Material(MaterialMorphOffset {
            material_index: -1,
            mode: MaterialMorphMode::Add,
            diffuse: Vec4::ONE,
            specular: Vec3::ZERO,
            specular_power: 1.0,
            ambient: Vec3::ZERO,
            edge_color: Vec4::ZERO,
            edge_size: 0.0,
            texture_factor: Vec4::ONE,
            sphere_texture_factor: Vec4::ONE,
            toon_texture_factor: Vec4::ONE,
        }));
        model.morphs.append(material_morph);
        let mut group = Morph::new("group", MorphType::Group);
        group.offsets.push(MorphOffset::Group { morph_index: 0, factor: 0.5 });
        model.morphs.append(group);

        let mut slot = DisplaySlot::new("Root", "Root", true);
        slot.references.push(DisplayReference::Bone(0));
        slot.references.push(DisplayReference::Morph(0));
        model.display_slots.append(slot);

        model.rigid_bodies.append(RigidBody {
            name: "rb".to_string(),
            bone_index: 1,
            collision_group: 3,
            collision_group_mask: 0xFFF7,
            shape: Shape::Capsule,
            size: Vec3::new(0.5, 2.0, 0.0),
            physics_type: PhysicsType::DynamicBone,
            ..Default::default()
        });
        model.joints.append(Joint {
            name: "j".to_string(),
            rigid_body_index_a: 0,
            rigid_body_index_b: -1,
            ..Default::default()
        });
        model
    }

    #[test]
    fn test_round_trip_byte_identical() {
        for encoding in [TextEncoding::Utf16Le, TextEncoding::Utf8] {
            let model = sample_model(encoding);
            let mut first = Vec::new();
            write_pmx(&model, &mut first).unwrap();

            let loaded = read_pmx(first.as_slice()).unwrap();
            assert_eq!(loaded.bones.len(), 3);
            assert_eq!(loaded.name, "テスト");
            assert_eq!(loaded.morphs.get(1).unwrap(), model.morphs.get(1).unwrap());
            assert_eq!(loaded.vertices.get(2).unwrap().deform, model.vertices.get(2).unwrap().deform);

            let mut second = Vec::new();
            write_pmx(&loaded, &mut second).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_minimal_widths() {
        let model = sample_model(TextEncoding::Utf8);
        let mut bytes = Vec::new();
        write_pmx(&model, &mut bytes).unwrap();
        assert_eq!(&bytes[0..4], b"PMX ");
        assert_eq!(bytes[8], 8);
        assert_eq!(&bytes[11..17], &[1, 1, 1, 1, 1, 1]);

        let mut big = PmxModel::new();
        for _ in 0..300 {
            big.vertices.append(Vertex::default());
        }
        for i in 0..200 {
            big.bones.append(Bone::new(format!("b{}", i)));
        }
        let mut bytes = Vec::new();
        write_pmx(&big, &mut bytes).unwrap();
        assert_eq!(bytes[11], 2);
        assert_eq!(bytes[14], 2);
    }

    #[test]
    fn test_version_21_soft_body_section() {
        let mut model = sample_model(TextEncoding::Utf16Le);
        model.version = 2.1;
        let mut bytes = Vec::new();
        write_pmx(&model, &mut bytes).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
        let loaded = read_pmx(bytes.as_slice()).unwrap();
        assert!((loaded.version - 2.1).abs() < 1e-6);
        assert!(loaded.soft_body_section);
    }

    #[test]
    fn test_version_21_without_soft_body_tail() {
        let mut model = sample_model(TextEncoding::Utf16Le);
        model.version = 2.1;
        model.soft_body_section = false;
        let mut bytes = Vec::new();
        write_pmx(&model, &mut bytes).unwrap();

        let loaded = read_pmx(bytes.as_slice()).unwrap();
        assert!(!loaded.soft_body_section);
        let mut rewritten = Vec::new();
        write_pmx(&loaded, &mut rewritten).unwrap();
        assert_eq!(rewritten, bytes);
    }

    #[test]
    fn test_version_21_joint_types_round_trip() {
        let mut model = sample_model(TextEncoding::Utf16Le);
        model.version = 2.1;
        for joint in model.joints.iter_mut() {
            joint.joint_type = 1;
        }
        let mut bytes = Vec::new();
        write_pmx(&model, &mut bytes).unwrap();
        let loaded = read_pmx(bytes.as_slice()).unwrap();
        assert_eq!(loaded.joints.len(), model.joints.len());
        assert!(loaded.joints.iter().all(|j| j.joint_type == 1));
    }

    #[test]
    fn test_huge_text_length_is_parse_error() {
        let mut bytes = Vec::new();
        write_pmx(&sample_model(TextEncoding::Utf8), &mut bytes).unwrap();
        // 模型名长度字段紧跟 17 字节的头部
        bytes[17..21].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(read_pmx(bytes.as_slice()), Err(MmdError::ParseFailed(_))));
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut bytes = Vec::new();
        write_pmx(&sample_model(TextEncoding::Utf8), &mut bytes).unwrap();

        let mut bad_sig = bytes.clone();
        bad_sig[0] = b'X';
        assert!(matches!(read_pmx(bad_sig.as_slice()), Err(MmdError::BadFormat(_))));

        let mut bad_version = bytes.clone();
        bad_version[4..8].copy_from_slice(&3.0f32.to_le_bytes());
        assert!(matches!(read_pmx(bad_version.as_slice()), Err(MmdError::BadFormat(_))));

        let mut bad_width = bytes.clone();
        bad_width[12] = 3;
        assert!(matches!(read_pmx(bad_width.as_slice()), Err(MmdError::BadFormat(_))));

        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(read_pmx(truncated), Err(MmdError::ParseFailed(_))));
    }
}

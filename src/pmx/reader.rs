//! PMX 读取

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use glam::{Quat, Vec2, Vec3, Vec4};

use super::{text, valid_index_size, IndexSizes, SIGNATURE};
use crate::model::{
    Bone, BoneFlags, BoneTail, Deform, DisplayReference, DisplaySlot, DrawFlags, Face, Ik, IkLink,
    Joint, JointParam, MaterialMorphMode, MaterialMorphOffset, Material, Morph, MorphOffset,
    MorphPanel, MorphType, PhysicsType, PmxModel, RigidBody, RigidBodyParam, Shape, SphereMode,
    TextEncoding, Texture, ToonSharing, Vertex,
};
use crate::{MmdError, Result};

/// 从文件读取 PMX
pub fn read_pmx_file<P: AsRef<Path>>(path: P) -> Result<PmxModel> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MmdError::FileNotFound(path.to_path_buf()),
        _ => MmdError::Io(e),
    })?;
    let mut model = read_pmx(BufReader::new(file))?;
    model.path = Some(path.to_path_buf());
    Ok(model)
}

/// 从任意字节流读取 PMX
pub fn read_pmx<R: Read>(reader: R) -> Result<PmxModel> {
    let mut p = PmxReader {
        reader,
        encoding: TextEncoding::Utf16Le,
        extended_uv_count: 0,
        sizes: IndexSizes {
            vertex: 1,
            texture: 1,
            material: 1,
            bone: 1,
            morph: 1,
            rigid_body: 1,
        },
    };
    let mut model = PmxModel::new();
    p.read_header(&mut model)?;
    p.read_vertices(&mut model)?;
    p.read_faces(&mut model)?;
    p.read_textures(&mut model)?;
    p.read_materials(&mut model)?;
    p.read_bones(&mut model)?;
    p.read_morphs(&mut model)?;
    p.read_display_slots(&mut model)?;
    p.read_rigid_bodies(&mut model)?;
    p.read_joints(&mut model)?;
    model.soft_body_section = model.version > 2.05 && p.skip_soft_bodies()?;

    log::info!(
        "PMX loaded: {} (v{:.1}) vertices={}, faces={}, materials={}, bones={}, morphs={}, rigid bodies={}, joints={}",
        model.name,
        model.version,
        model.vertices.len(),
        model.faces.len(),
        model.materials.len(),
        model.bones.len(),
        model.morphs.len(),
        model.rigid_bodies.len(),
        model.joints.len()
    );
    Ok(model)
}

fn parse_failed(what: &str) -> impl FnOnce(std::io::Error) -> MmdError + '_ {
    move |e| MmdError::ParseFailed(format!("{}: {}", what, e))
}

struct PmxReader<R: Read> {
    reader: R,
    encoding: TextEncoding,
    extended_uv_count: u8,
    sizes: IndexSizes,
}

impl<R: Read> PmxReader<R> {
    fn u8(&mut self, what: &str) -> Result<u8> {
        self.reader.read_u8().map_err(parse_failed(what))
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        self.reader.read_u16::<LittleEndian>().map_err(parse_failed(what))
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.reader.read_i32::<LittleEndian>().map_err(parse_failed(what))
    }

    fn f32(&mut self, what: &str) -> Result<f32> {
        self.reader.read_f32::<LittleEndian>().map_err(parse_failed(what))
    }

    fn vec2(&mut self, what: &str) -> Result<Vec2> {
        Ok(Vec2::new(self.f32(what)?, self.f32(what)?))
    }

    fn vec3(&mut self, what: &str) -> Result<Vec3> {
        Ok(Vec3::new(self.f32(what)?, self.f32(what)?, self.f32(what)?))
    }

    fn vec4(&mut self, what: &str) -> Result<Vec4> {
        Ok(Vec4::new(
            self.f32(what)?,
            self.f32(what)?,
            self.f32(what)?,
            self.f32(what)?,
        ))
    }

    fn count(&mut self, what: &str) -> Result<usize> {
        let n = self.i32(what)?;
        if n < 0 {
            return Err(MmdError::ParseFailed(format!("{}: negative count {}", what, n)));
        }
        Ok(n as usize)
    }

    fn text(&mut self, what: &str) -> Result<String> {
        let len = self.count(what)?;
        let mut buf = Vec::new();
        (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(parse_failed(what))?;
        if buf.len() < len {
            return Err(MmdError::ParseFailed(format!(
                "{}: text of {} bytes truncated at {}",
                what,
                len,
                buf.len()
            )));
        }
        Ok(text::decode(&buf, self.encoding))
    }

    fn vertex_index(&mut self, what: &str) -> Result<u32> {
        Ok(match self.sizes.vertex {
            1 => self.u8(what)? as u32,
            2 => self.u16(what)? as u32,
            _ => self.i32(what)? as u32,
        })
    }

    fn signed_index(&mut self, size: u8, what: &str) -> Result<i32> {
        Ok(match size {
            1 => self.reader.read_i8().map_err(parse_failed(what))? as i32,
            2 => self.reader.read_i16::<LittleEndian>().map_err(parse_failed(what))? as i32,
            _ => self.i32(what)?,
        })
    }

    fn bone_index(&mut self, what: &str) -> Result<i32> {
        self.signed_index(self.sizes.bone, what)
    }

    fn read_header(&mut self, model: &mut PmxModel) -> Result<()> {
        let mut signature = [0u8; 4];
        self.reader
            .read_exact(&mut signature)
            .map_err(parse_failed("signature"))?;
        if signature[..3] != SIGNATURE[..3] {
            return Err(MmdError::BadFormat(format!("invalid PMX signature {:?}", signature)));
        }

        let version = self.f32("version")?;
        if (version - 2.0).abs() > 0.01 && (version - 2.1).abs() > 0.01 {
            return Err(MmdError::BadFormat(format!("unsupported PMX version {}", version)));
        }
        model.version = version;

        let header_size = self.u8("header size")? as usize;
        if header_size < 8 {
            return Err(MmdError::BadFormat(format!("header size {} too small", header_size)));
        }
        let mut globals = vec![0u8; header_size];
        self.reader
            .read_exact(&mut globals)
            .map_err(parse_failed("header globals"))?;

        self.encoding = match globals[0] {
            0 => TextEncoding::Utf16Le,
            1 => TextEncoding::Utf8,
            other => return Err(MmdError::BadFormat(format!("unknown text encoding {}", other))),
        };
        if globals[1] > 4 {
            return Err(MmdError::BadFormat(format!(
                "extended UV count {} out of range",
                globals[1]
            )));
        }
        self.extended_uv_count = globals[1];
        self.sizes = IndexSizes {
            vertex: globals[2],
            texture: globals[3],
            material: globals[4],
            bone: globals[5],
            morph: globals[6],
            rigid_body: globals[7],
        };
        if !globals[2..8].iter().all(|&s| valid_index_size(s)) {
            return Err(MmdError::BadFormat(format!(
                "invalid index sizes {:?}",
                &globals[2..8]
            )));
        }

        model.encoding = self.encoding;
        model.extended_uv_count = self.extended_uv_count;
        model.name = self.text("model name")?;
        model.english_name = self.text("model english name")?;
        model.comment = self.text("comment")?;
        model.english_comment = self.text("english comment")?;
        Ok(())
    }

    fn read_vertices(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("vertex count")?;
        for _ in 0..count {
            let mut v = Vertex {
                position: self.vec3("vertex position")?,
                normal: self.vec3("vertex normal")?,
                uv: self.vec2("vertex uv")?,
                ..Default::default()
            };
            for i in 0..self.extended_uv_count as usize {
                v.extended_uvs[i] = self.vec4("vertex extended uv")?;
            }

            let what = "vertex deform";
            v.deform = match self.u8(what)? {
                0 => Deform::Bdef1 {
                    bone: self.bone_index(what)?,
                },
                1 => Deform::Bdef2 {
                    bones: [self.bone_index(what)?, self.bone_index(what)?],
                    weight: self.f32(what)?,
                },
                kind @ (2 | 4) => {
                    let bones = [
                        self.bone_index(what)?,
                        self.bone_index(what)?,
                        self.bone_index(what)?,
                        self.bone_index(what)?,
                    ];
                    let weights = [
                        self.f32(what)?,
                        self.f32(what)?,
                        self.f32(what)?,
                        self.f32(what)?,
                    ];
                    if kind == 2 {
                        Deform::Bdef4 { bones, weights }
                    } else {
                        Deform::Qdef { bones, weights }
                    }
                }
                3 => Deform::Sdef {
                    bones: [self.bone_index(what)?, self.bone_index(what)?],
                    weight: self.f32(what)?,
                    c: self.vec3(what)?,
                    r0: self.vec3(what)?,
                    r1: self.vec3(what)?,
                },
                other => {
                    return Err(MmdError::ParseFailed(format!("unknown deform type {}", other)))
                }
            };
            v.edge_factor = self.f32("vertex edge factor")?;
            model.vertices.append(v);
        }
        log::debug!("PMX vertices: {}", count);
        Ok(())
    }

    fn read_faces(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("face count")?;
        if count % 3 != 0 {
            return Err(MmdError::ParseFailed(format!(
                "face index count {} is not a multiple of 3",
                count
            )));
        }
        for _ in 0..count / 3 {
            let a = self.vertex_index("face")?;
            let b = self.vertex_index("face")?;
            let c = self.vertex_index("face")?;
            model.faces.append(Face::new(a, b, c));
        }
        Ok(())
    }

    fn read_textures(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("texture count")?;
        for _ in 0..count {
            let name = self.text("texture name")?;
            model.textures.append(Texture::new(name));
        }
        Ok(())
    }

    fn read_materials(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("material count")?;
        let tex = self.sizes.texture;
        for _ in 0..count {
            let what = "material";
            let mut m = Material::new(self.text(what)?);
            m.english_name = self.text(what)?;
            m.diffuse = self.vec4(what)?;
            m.specular = self.vec3(what)?;
            m.specular_power = self.f32(what)?;
            m.ambient = self.vec3(what)?;
            m.draw_flags = DrawFlags::from_bits_retain(self.u8(what)?);
            m.edge_color = self.vec4(what)?;
            m.edge_size = self.f32(what)?;
            m.texture_index = self.signed_index(tex, what)?;
            m.sphere_texture_index = self.signed_index(tex, what)?;
            let mode = self.u8(what)?;
            m.sphere_mode = SphereMode::from_u8(mode)
                .ok_or_else(|| MmdError::ParseFailed(format!("unknown sphere mode {}", mode)))?;
            m.toon = match self.u8(what)? {
                0 => ToonSharing::Individual(self.signed_index(tex, what)?),
                _ => ToonSharing::Shared(self.u8(what)?),
            };
            m.memo = self.text(what)?;
            m.vertices_count = self.i32(what)?;
            model.materials.append(m);
        }
        Ok(())
    }

    fn read_bones(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("bone count")?;
        for _ in 0..count {
            let what = "bone";
            let mut b = Bone::new(self.text(what)?);
            b.english_name = self.text(what)?;
            b.position = self.vec3(what)?;
            b.parent_index = self.bone_index(what)?;
            b.layer = self.i32(what)?;
            b.flags = BoneFlags::from_bits_retain(self.u16(what)?);

            b.tail = if b.flags.contains(BoneFlags::TAIL_IS_BONE) {
                BoneTail::Bone(self.bone_index(what)?)
            } else {
                BoneTail::Offset(self.vec3(what)?)
            };
            if b.flags.intersects(BoneFlags::IS_EXTERNAL_ROTATION | BoneFlags::IS_EXTERNAL_TRANSLATION) {
                b.effect_index = self.bone_index(what)?;
                b.effect_factor = self.f32(what)?;
            }
            if b.flags.contains(BoneFlags::HAS_FIXED_AXIS) {
                b.fixed_axis = self.vec3(what)?;
            }
            if b.flags.contains(BoneFlags::HAS_LOCAL_AXIS) {
                b.local_axis_x = self.vec3(what)?;
                b.local_axis_z = self.vec3(what)?;
            }
            if b.flags.contains(BoneFlags::IS_EXTERNAL_PARENT_DEFORM) {
                b.external_key = self.i32(what)?;
            }
            if b.flags.contains(BoneFlags::IS_IK) {
                let what = "bone ik";
                let mut ik = Ik {
                    target_index: self.bone_index(what)?,
                    loop_count: self.i32(what)?,
                    unit_rotation: self.f32(what)?,
                    links: Vec::new(),
                };
                let links = self.count(what)?;
                for _ in 0..links {
                    let mut link = IkLink::new(self.bone_index(what)?);
                    link.angle_limit = self.u8(what)? == 1;
                    if link.angle_limit {
                        link.min_angle = self.vec3(what)?;
                        link.max_angle = self.vec3(what)?;
                    }
                    ik.links.push(link);
                }
                b.ik = Some(ik);
            }
            model.bones.append(b);
        }
        Ok(())
    }

    fn read_morphs(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("morph count")?;
        for _ in 0..count {
            let what = "morph";
            let name = self.text(what)?;
            let english_name = self.text(what)?;
            let panel_raw = self.u8(what)?;
            let panel = MorphPanel::from_u8(panel_raw)
                .ok_or_else(|| MmdError::ParseFailed(format!("unknown morph panel {}", panel_raw)))?;
            let type_raw = self.u8(what)?;
            let morph_type = MorphType::from_u8(type_raw)
                .ok_or_else(|| MmdError::ParseFailed(format!("unsupported morph type {}", type_raw)))?;

            let mut morph = Morph::new(name, morph_type);
            morph.english_name = english_name;
            morph.panel = panel;
            let offsets = self.count(what)?;
            morph.offsets.reserve(offsets);
            for _ in 0..offsets {
                let offset = self.read_morph_offset(morph_type)?;
                morph.offsets.push(offset);
            }
            model.morphs.append(morph);
        }
        Ok(())
    }

    fn read_morph_offset(&mut self, morph_type: MorphType) -> Result<MorphOffset> {
        let what = "morph offset";
        Ok(match morph_type {
            MorphType::Group => MorphOffset::Group {
                morph_index: self.signed_index(self.sizes.morph, what)?,
                factor: self.f32(what)?,
            },
            MorphType::Vertex | MorphType::AfterVertex => MorphOffset::Vertex {
                vertex_index: self.vertex_index(what)?,
                position: self.vec3(what)?,
            },
            MorphType::Bone => {
                let bone_index = self.bone_index(what)?;
                let translation = self.vec3(what)?;
                let q = self.vec4(what)?;
                MorphOffset::Bone {
                    bone_index,
                    translation,
                    rotation: Quat::from_xyzw(q.x, q.y, q.z, q.w),
                }
            }
            MorphType::Uv
            | MorphType::ExtendedUv1
            | MorphType::ExtendedUv2
            | MorphType::ExtendedUv3
            | MorphType::ExtendedUv4 => MorphOffset::Uv {
                vertex_index: self.vertex_index(what)?,
                uv: self.vec4(what)?,
            },
            MorphType::Material => {
                let material_index = self.signed_index(self.sizes.material, what)?;
                let mode = match self.u8(what)? {
                    0 => MaterialMorphMode::Multiply,
                    1 => MaterialMorphMode::Add,
                    other => {
                        return Err(MmdError::ParseFailed(format!(
                            "unknown material morph mode {}",
                            other
                        )))
                    }
                };
                MorphOffset::Material(MaterialMorphOffset {
                    material_index,
                    mode,
                    diffuse: self.vec4(what)?,
                    specular: self.vec3(what)?,
                    specular_power: self.f32(what)?,
                    ambient: self.vec3(what)?,
                    edge_color: self.vec4(what)?,
                    edge_size: self.f32(what)?,
                    texture_factor: self.vec4(what)?,
                    sphere_texture_factor: self.vec4(what)?,
                    toon_texture_factor: self.vec4(what)?,
                })
            }
        })
    }

    fn read_display_slots(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("display slot count")?;
        for _ in 0..count {
            let what = "display slot";
            let name = self.text(what)?;
            let english_name = self.text(what)?;
            let special = self.u8(what)? != 0;
            let mut slot = DisplaySlot::new(name, english_name, special);
            let refs = self.count(what)?;
            for _ in 0..refs {
                let reference = match self.u8(what)? {
                    0 => DisplayReference::Bone(self.bone_index(what)?),
                    1 => DisplayReference::Morph(self.signed_index(self.sizes.morph, what)?),
                    other => {
                        return Err(MmdError::ParseFailed(format!(
                            "unknown display reference type {}",
                            other
                        )))
                    }
                };
                slot.references.push(reference);
            }
            model.display_slots.append(slot);
        }
        Ok(())
    }

    fn read_rigid_bodies(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("rigid body count")?;
        for _ in 0..count {
            let what = "rigid body";
            let mut rb = RigidBody {
                index: -1,
                name: self.text(what)?,
                english_name: self.text(what)?,
                bone_index: self.bone_index(what)?,
                collision_group: self.u8(what)?,
                collision_group_mask: self.u16(what)?,
                ..Default::default()
            };
            let shape = self.u8(what)?;
            rb.shape = Shape::from_u8(shape)
                .ok_or_else(|| MmdError::ParseFailed(format!("unknown rigid body shape {}", shape)))?;
            rb.size = self.vec3(what)?;
            rb.position = self.vec3(what)?;
            rb.rotation = self.vec3(what)?;
            rb.param = RigidBodyParam {
                mass: self.f32(what)?,
                linear_damping: self.f32(what)?,
                angular_damping: self.f32(what)?,
                restitution: self.f32(what)?,
                friction: self.f32(what)?,
            };
            let physics_type = self.u8(what)?;
            rb.physics_type = PhysicsType::from_u8(physics_type).ok_or_else(|| {
                MmdError::ParseFailed(format!("unknown physics type {}", physics_type))
            })?;
            model.rigid_bodies.append(rb);
        }
        Ok(())
    }

    fn read_joints(&mut self, model: &mut PmxModel) -> Result<()> {
        let count = self.count("joint count")?;
        let rb = self.sizes.rigid_body;
        for _ in 0..count {
            let what = "joint";
            let name = self.text(what)?;
            let english_name = self.text(what)?;
            // 2.1 的 0..=5 种类记录布局相同
            let joint_type = self.u8(what)?;
            let joint = Joint {
                index: -1,
                name,
                english_name,
                joint_type,
                rigid_body_index_a: self.signed_index(rb, what)?,
                rigid_body_index_b: self.signed_index(rb, what)?,
                position: self.vec3(what)?,
                rotation: self.vec3(what)?,
                param: JointParam {
                    translation_limit_min: self.vec3(what)?,
                    translation_limit_max: self.vec3(what)?,
                    rotation_limit_min: self.vec3(what)?,
                    rotation_limit_max: self.vec3(what)?,
                    spring_constant_translation: self.vec3(what)?,
                    spring_constant_rotation: self.vec3(what)?,
                },
            };
            model.joints.append(joint);
        }
        Ok(())
    }

    /// 2.1 的 SoftBody 段：数量为 0 时正常消费，否则忽略剩余数据。返回段是否存在
    fn skip_soft_bodies(&mut self) -> Result<bool> {
        match self.reader.read_i32::<LittleEndian>() {
            Ok(0) => Ok(true),
            Ok(n) => {
                log::warn!("PMX soft bodies ({}) are not supported, ignored", n);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(MmdError::Io(e)),
        }
    }
}

//! Morph 求值
//!
//! 把当前权重下的所有 Morph 折算成每帧偏移，
//! 顶点偏移交给 [`crate::Skinner`]，骨骼偏移叠加到 [`BonePose`]。

mod manager;

pub use manager::MorphWeights;

use glam::{Quat, Vec3, Vec4};

use crate::model::{Material, MaterialMorphMode, MaterialMorphOffset, MorphOffset, MorphType, PmxModel};
use crate::skeleton::BonePose;
use crate::skinning::{VertexBuffer, VertexDelta};

/// 材质参数的一组系数，乘算时初值为 1，加算时初值为 0
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialFactors {
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_power: f32,
    pub ambient: Vec3,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_factor: Vec4,
    pub sphere_texture_factor: Vec4,
    pub toon_texture_factor: Vec4,
}

impl MaterialFactors {
    pub fn splat(v: f32) -> Self {
        Self {
            diffuse: Vec4::splat(v),
            specular: Vec3::splat(v),
            specular_power: v,
            ambient: Vec3::splat(v),
            edge_color: Vec4::splat(v),
            edge_size: v,
            texture_factor: Vec4::splat(v),
            sphere_texture_factor: Vec4::splat(v),
            toon_texture_factor: Vec4::splat(v),
        }
    }
}

/// 单个材质的 Morph 结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialDelta {
    pub multiply: MaterialFactors,
    pub add: MaterialFactors,
}

impl Default for MaterialDelta {
    fn default() -> Self {
        Self {
            multiply: MaterialFactors::splat(1.0),
            add: MaterialFactors::splat(0.0),
        }
    }
}

impl MaterialDelta {
    fn accumulate(&mut self, offset: &MaterialMorphOffset, weight: f32) {
        match offset.mode {
            MaterialMorphMode::Multiply => {
                let lerp4 = |a: Vec4, m: Vec4| a * (Vec4::ONE + (m - Vec4::ONE) * weight);
                let lerp3 = |a: Vec3, m: Vec3| a * (Vec3::ONE + (m - Vec3::ONE) * weight);
                let lerp1 = |a: f32, m: f32| a * (1.0 + (m - 1.0) * weight);
                let f = &mut self.multiply;
                f.diffuse = lerp4(f.diffuse, offset.diffuse);
                f.specular = lerp3(f.specular, offset.specular);
                f.specular_power = lerp1(f.specular_power, offset.specular_power);
                f.ambient = lerp3(f.ambient, offset.ambient);
                f.edge_color = lerp4(f.edge_color, offset.edge_color);
                f.edge_size = lerp1(f.edge_size, offset.edge_size);
                f.texture_factor = lerp4(f.texture_factor, offset.texture_factor);
                f.sphere_texture_factor = lerp4(f.sphere_texture_factor, offset.sphere_texture_factor);
                f.toon_texture_factor = lerp4(f.toon_texture_factor, offset.toon_texture_factor);
            }
            MaterialMorphMode::Add => {
                let f = &mut self.add;
                f.diffuse += offset.diffuse * weight;
                f.specular += offset.specular * weight;
                f.specular_power += offset.specular_power * weight;
                f.ambient += offset.ambient * weight;
                f.edge_color += offset.edge_color * weight;
                f.edge_size += offset.edge_size * weight;
                f.texture_factor += offset.texture_factor * weight;
                f.sphere_texture_factor += offset.sphere_texture_factor * weight;
                f.toon_texture_factor += offset.toon_texture_factor * weight;
            }
        }
    }

    /// 先乘后加
    pub fn apply(&self, material: &Material) -> Material {
        let m = &self.multiply;
        let a = &self.add;
        Material {
            diffuse: material.diffuse * m.diffuse + a.diffuse,
            specular: material.specular * m.specular + a.specular,
            specular_power: material.specular_power * m.specular_power + a.specular_power,
            ambient: material.ambient * m.ambient + a.ambient,
            edge_color: material.edge_color * m.edge_color + a.edge_color,
            edge_size: material.edge_size * m.edge_size + a.edge_size,
            ..material.clone()
        }
    }
}

/// 一帧的 Morph 偏移
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MorphDeltas {
    /// 骨骼变形前的顶点位置与主 UV 偏移
    pub vertices: Vec<VertexDelta>,
    /// 扩展 UV 1..=4 的偏移
    pub extended_uvs: Vec<[Vec4; 4]>,
    /// 蒙皮之后叠加的顶点位置偏移
    pub after_skin: Vec<Vec3>,
    pub bones: Vec<(Vec3, Quat)>,
    pub materials: Vec<MaterialDelta>,
}

impl MorphDeltas {
    fn new(model: &PmxModel) -> Self {
        let vertex_count = model.vertices.len();
        Self {
            vertices: vec![VertexDelta::default(); vertex_count],
            extended_uvs: vec![[Vec4::ZERO; 4]; vertex_count],
            after_skin: vec![Vec3::ZERO; vertex_count],
            bones: vec![(Vec3::ZERO, Quat::IDENTITY); model.bones.len()],
            materials: vec![MaterialDelta::default(); model.materials.len()],
        }
    }

    /// 骨骼偏移叠加到动作姿势上
    pub fn apply_to_pose(&self, pose: &mut BonePose) {
        for (bone, (translation, rotation)) in self.bones.iter().enumerate() {
            if *translation != Vec3::ZERO || *rotation != Quat::IDENTITY {
                pose.add_offset(bone, *translation, *rotation);
            }
        }
    }

    pub fn apply_after_skin(&self, buffer: &mut VertexBuffer) {
        for (position, offset) in buffer.positions.iter_mut().zip(&self.after_skin) {
            *position += *offset;
        }
    }

    fn apply_morph(&mut self, model: &PmxModel, index: i32, weight: f32, depth: u32) {
        let Ok(morph) = model.morphs.get(index) else {
            return;
        };
        for offset in &morph.offsets {
            match offset {
                MorphOffset::Group { morph_index, factor } => {
                    if depth == 0 {
                        self.apply_morph(model, *morph_index, weight * factor, depth + 1);
                    }
                }
                MorphOffset::Vertex { vertex_index, position } => {
                    let i = *vertex_index as usize;
                    let target = if morph.morph_type == MorphType::AfterVertex {
                        self.after_skin.get_mut(i)
                    } else {
                        self.vertices.get_mut(i).map(|d| &mut d.position)
                    };
                    if let Some(target) = target {
                        *target += *position * weight;
                    }
                }
                MorphOffset::Uv { vertex_index, uv } => {
                    let i = *vertex_index as usize;
                    match morph.morph_type.uv_channel() {
                        Some(0) => {
                            if let Some(d) = self.vertices.get_mut(i) {
                                d.uv += *uv * weight;
                            }
                        }
                        Some(channel) => {
                            if let Some(slots) = self.extended_uvs.get_mut(i) {
                                slots[channel - 1] += *uv * weight;
                            }
                        }
                        None => {}
                    }
                }
                MorphOffset::Bone { bone_index, translation, rotation } => {
                    if let Some(slot) = usize::try_from(*bone_index)
                        .ok()
                        .and_then(|b| self.bones.get_mut(b))
                    {
                        let weighted = Quat::from_xyzw(
                            rotation.x * weight,
                            rotation.y * weight,
                            rotation.z * weight,
                            1.0 - (1.0 - rotation.w) * weight,
                        )
                        .normalize();
                        slot.0 += *translation * weight;
                        slot.1 = (slot.1 * weighted).normalize();
                    }
                }
                MorphOffset::Material(material) => {
                    if material.material_index < 0 {
                        for delta in &mut self.materials {
                            delta.accumulate(material, weight);
                        }
                    } else if let Some(delta) = self.materials.get_mut(material.material_index as usize) {
                        delta.accumulate(material, weight);
                    }
                }
            }
        }
    }
}

/// 按当前权重计算所有 Morph 的偏移；组 Morph 只展开一层
pub fn apply_morphs(model: &PmxModel, weights: &MorphWeights) -> MorphDeltas {
    let mut deltas = MorphDeltas::new(model);
    for (index, weight) in weights.active() {
        deltas.apply_morph(model, index, weight, 0);
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bone, Morph, Vertex};

    fn model() -> PmxModel {
        let mut model = PmxModel::new();
        for _ in 0..3 {
            model.vertices.append(Vertex::default());
        }
        model.bones.append(Bone::new("head"));
        model.materials.append(Material::new("skin"));
        model.materials.append(Material::new("hair"));

        let mut smile = Morph::new("smile", MorphType::Vertex);
        smile.offsets.push(MorphOffset::Vertex {
            vertex_index: 1,
            position: Vec3::new(0.0, 1.0, 0.0),
        });
        model.morphs.append(smile);

        let mut nod = Morph::new("nod", MorphType::Bone);
        nod.offsets.push(MorphOffset::Bone {
            bone_index: 0,
            translation: Vec3::new(0.0, 0.0, 2.0),
            rotation: Quat::from_rotation_x(1.0),
        });
        model.morphs.append(nod);

        let mut scroll = Morph::new("scroll", MorphType::Uv);
        scroll.offsets.push(MorphOffset::Uv {
            vertex_index: 2,
            uv: Vec4::new(0.5, 0.0, 0.0, 0.0),
        });
        model.morphs.append(scroll);

        let mut fade = Morph::new("fade", MorphType::Material);
        fade.offsets.push(MorphOffset::Material(MaterialMorphOffset {
            material_index: -1,
            mode: MaterialMorphMode::Multiply,
            diffuse: Vec4::new(1.0, 1.0, 1.0, 0.0),
            specular: Vec3::ONE,
            specular_power: 1.0,
            ambient: Vec3::ONE,
            edge_color: Vec4::ONE,
            edge_size: 1.0,
            texture_factor: Vec4::ONE,
            sphere_texture_factor: Vec4::ONE,
            toon_texture_factor: Vec4::ONE,
        }));
        model.morphs.append(fade);

        let mut both = Morph::new("both", MorphType::Group);
        both.offsets.push(MorphOffset::Group { morph_index: 0, factor: 0.5 });
        both.offsets.push(MorphOffset::Group { morph_index: 2, factor: 1.0 });
        model.morphs.append(both);

        let mut nested = Morph::new("nested", MorphType::Group);
        nested.offsets.push(MorphOffset::Group { morph_index: 4, factor: 1.0 });
        model.morphs.append(nested);
        model
    }

    #[test]
    fn test_vertex_and_uv_deltas_scale_by_weight() {
        let model = model();
        let mut weights = MorphWeights::new(&model);
        weights.set_by_name("smile", 0.5);
        weights.set_by_name("scroll", 1.0);
        let deltas = apply_morphs(&model, &weights);
        assert_eq!(deltas.vertices[1].position, Vec3::new(0.0, 0.5, 0.0));
        assert_eq!(deltas.vertices[2].uv.x, 0.5);
        assert_eq!(deltas.vertices[0], VertexDelta::default());
    }

    #[test]
    fn test_bone_delta_feeds_pose() {
        let model = model();
        let mut weights = MorphWeights::new(&model);
        weights.set_by_name("nod", 1.0);
        let deltas = apply_morphs(&model, &weights);
        let mut pose = BonePose::rest(1);
        deltas.apply_to_pose(&mut pose);
        assert_eq!(pose.translation(0), Vec3::new(0.0, 0.0, 2.0));
        assert!((pose.rotation(0).dot(Quat::from_rotation_x(1.0)).abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_group_recurses_one_level() {
        let model = model();
        let mut weights = MorphWeights::new(&model);
        weights.set_by_name("both", 0.5);
        let deltas = apply_morphs(&model, &weights);
        assert_eq!(deltas.vertices[1].position.y, 0.25);
        assert_eq!(deltas.vertices[2].uv.x, 0.25);

        let mut weights = MorphWeights::new(&model);
        weights.set_by_name("nested", 1.0);
        let deltas = apply_morphs(&model, &weights);
        assert_eq!(deltas.vertices[1].position, Vec3::ZERO);
    }

    #[test]
    fn test_material_multiply_applies_to_all() {
        let model = model();
        let mut weights = MorphWeights::new(&model);
        weights.set_by_name("fade", 0.5);
        let deltas = apply_morphs(&model, &weights);
        assert_eq!(deltas.materials.len(), 2);
        for (delta, material) in deltas.materials.iter().zip(model.materials.iter_by_index()) {
            let faded = delta.apply(material);
            assert!((faded.diffuse.w - 0.5).abs() < 1e-6);
            assert_eq!(faded.diffuse.x, 1.0);
        }
    }
}

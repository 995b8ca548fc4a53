//! 把解析出的对象树转换成 PMX 模型

use std::collections::HashMap;

use glam::{Vec2, Vec3, Vec4};

use super::{XChild, XObject};
use crate::model::{Deform, Face, Material, PmxModel, SphereMode, Vertex};
use crate::{MmdError, Result};

/// `.x` 的长度单位换算到 MMD
const POSITION_SCALE: f32 = 10.0;
const EDGE_SIZE: f32 = 10.0;

/// 按顺序读取展平后的数值
struct Values<'a> {
    data: &'a [f64],
    pos: usize,
    what: &'a str,
}

impl<'a> Values<'a> {
    fn new(object: &'a XObject) -> Self {
        Self {
            data: &object.values,
            pos: 0,
            what: &object.template,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn f32(&mut self) -> Result<f32> {
        let v = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| MmdError::ParseFailed(format!("{}: not enough values", self.what)))?;
        self.pos += 1;
        Ok(v as f32)
    }

    fn count(&mut self) -> Result<usize> {
        let v = self.f32()?;
        if v < 0.0 || v.fract() != 0.0 {
            return Err(MmdError::ParseFailed(format!("{}: bad count {}", self.what, v)));
        }
        Ok(v as usize)
    }

    /// 读取元素个数，每个元素至少占 `per_item` 个数值；超出剩余数值时报错
    fn bounded_count(&mut self, per_item: usize) -> Result<usize> {
        let n = self.count()?;
        if n.saturating_mul(per_item.max(1)) > self.remaining() {
            return Err(MmdError::ParseFailed(format!(
                "{}: count {} exceeds remaining {} values",
                self.what,
                n,
                self.remaining()
            )));
        }
        Ok(n)
    }

    fn vec2(&mut self) -> Result<Vec2> {
        Ok(Vec2::new(self.f32()?, self.f32()?))
    }

    fn vec3(&mut self) -> Result<Vec3> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn vec4(&mut self) -> Result<Vec4> {
        Ok(Vec4::new(self.f32()?, self.f32()?, self.f32()?, self.f32()?))
    }

    /// 多边形列表：面数，然后每个面为 (顶点数, 索引...)
    fn polygons(&mut self, vertex_count: usize) -> Result<Vec<Vec<u32>>> {
        // 每个面至少有顶点数和 3 个索引
        let face_count = self.bounded_count(4)?;
        let mut faces = Vec::with_capacity(face_count);
        for _ in 0..face_count {
            let n = self.bounded_count(1)?;
            if n < 3 {
                return Err(MmdError::ParseFailed(format!("{}: face with {} vertices", self.what, n)));
            }
            let mut indices = Vec::with_capacity(n);
            for _ in 0..n {
                let i = self.count()?;
                if i >= vertex_count {
                    return Err(MmdError::ParseFailed(format!(
                        "{}: index {} out of {}",
                        self.what, i, vertex_count
                    )));
                }
                indices.push(i as u32);
            }
            faces.push(indices);
        }
        Ok(faces)
    }
}

/// 多边形按扇形拆成三角形
fn triangulate(polygon: &[u32]) -> impl Iterator<Item = [u32; 3]> + '_ {
    (1..polygon.len() - 1).map(move |i| [polygon[0], polygon[i], polygon[i + 1]])
}

/// `name*sphere` 形式拆分；单独的 `.sph` 视为只有球面贴图
pub(crate) fn split_texture_name(value: &str) -> (Option<String>, Option<String>) {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    if let Some((texture, sphere)) = value.split_once('*') {
        return (non_empty(texture), non_empty(sphere));
    }
    if value.trim().to_lowercase().ends_with(".sph") {
        return (None, non_empty(value));
    }
    (non_empty(value), None)
}

fn apply_sphere_mode(material: &mut Material) {
    material.sphere_mode = if material.texture_index >= 0 && material.sphere_texture_index < 0 {
        SphereMode::None
    } else {
        SphereMode::Multiply
    };
}

fn default_material(model: &PmxModel) -> Material {
    let mut material = Material::new(format!("材質{:02}", model.materials.len() + 1));
    material.edge_color = Vec4::new(0.0, 0.0, 0.0, 1.0);
    material.edge_size = EDGE_SIZE;
    apply_sphere_mode(&mut material);
    material
}

fn build_material(object: &XObject, model: &mut PmxModel) -> Result<Material> {
    let mut material = default_material(model);
    let mut values = Values::new(object);
    if values.remaining() >= 11 {
        material.diffuse = values.vec4()?;
        material.specular_power = values.f32()?;
        material.specular = values.vec3()?;
        material.ambient = values.vec3()?;
    } else {
        log::warn!("x material {:?} has {} values, using defaults", object.name, values.remaining());
    }

    for texture in object.objects().filter(|o| o.template == "TextureFilename") {
        let Some(file) = texture.strings.first() else {
            continue;
        };
        let (main, sphere) = split_texture_name(file);
        if let Some(main) = main {
            material.texture_index = model.ensure_texture(&main);
        }
        if let Some(sphere) = sphere {
            material.sphere_texture_index = model.ensure_texture(&sphere);
        }
    }
    apply_sphere_mode(&mut material);
    Ok(material)
}

/// 处理顶层对象
pub fn build_model(objects: &[XObject], model: &mut PmxModel) -> Result<()> {
    let named: HashMap<&str, &XObject> = objects
        .iter()
        .filter_map(|o| o.name.as_deref().map(|n| (n, o)))
        .collect();

    for object in objects {
        match object.template.as_str() {
            "Header" => {
                if let [major, minor, flags] = object.values[..] {
                    model.comment = format!("X File Version {}.{}, flags: {}", major, minor, flags);
                }
            }
            "Mesh" => add_mesh(object, &named, model)?,
            "Material" => {}
            other => log::warn!("skipping unknown x template {}", other),
        }
    }
    Ok(())
}

fn add_mesh(mesh: &XObject, named: &HashMap<&str, &XObject>, model: &mut PmxModel) -> Result<()> {
    let base = model.vertices.len() as u32;
    let mut values = Values::new(mesh);

    let vertex_count = values.bounded_count(3)?;
    for _ in 0..vertex_count {
        let position = values.vec3()? * POSITION_SCALE;
        model.vertices.append(Vertex {
            position,
            normal: Vec3::Y,
            deform: Deform::Bdef1 { bone: 0 },
            edge_factor: 1.0,
            ..Vertex::default()
        });
    }
    let polygons = values.polygons(vertex_count)?;

    let mut normals_set = false;
    let mut material_list = None;
    for child in mesh.objects() {
        match child.template.as_str() {
            "MeshTextureCoords" => {
                let mut uvs = Values::new(child);
                let n = uvs.count()?;
                for i in 0..n.min(vertex_count) {
                    let uv = uvs.vec2()?;
                    model.vertices.get_mut((base as usize + i) as i32)?.uv = uv;
                }
            }
            "MeshNormals" => {
                apply_mesh_normals(child, &polygons, base, vertex_count, model)?;
                normals_set = true;
            }
            "MeshMaterialList" => material_list = Some(child),
            other => log::warn!("skipping unknown x template {} in Mesh", other),
        }
    }
    if !normals_set {
        apply_face_normals(&polygons, base, vertex_count, model)?;
    }

    let material_base = model.materials.len();
    let groups: Vec<Vec<usize>> = match material_list {
        Some(list) => {
            let (materials, groups) = read_material_list(list, polygons.len(), named, model)?;
            for material in materials {
                model.materials.append(material);
            }
            groups
        }
        None => {
            let material = default_material(model);
            model.materials.append(material);
            vec![(0..polygons.len()).collect()]
        }
    };

    for (m, polygon_indices) in groups.iter().enumerate() {
        let mut triangles = 0;
        for &p in polygon_indices {
            for [a, b, c] in triangulate(&polygons[p]) {
                model.faces.append(Face::new(a + base, b + base, c + base));
                triangles += 1;
            }
        }
        model.materials.get_mut((material_base + m) as i32)?.vertices_count = triangles * 3;
    }

    log::debug!(
        "x mesh {:?}: {} vertices, {} polygons, {} materials",
        mesh.name,
        vertex_count,
        polygons.len(),
        groups.len()
    );
    Ok(())
}

/// 返回材质和每个材质拥有的多边形；索引不足时沿用最后一个
fn read_material_list(
    list: &XObject,
    polygon_count: usize,
    named: &HashMap<&str, &XObject>,
    model: &mut PmxModel,
) -> Result<(Vec<Material>, Vec<Vec<usize>>)> {
    let mut values = Values::new(list);
    let material_count = values.count()?;
    if material_count > list.children.len().max(polygon_count) {
        return Err(MmdError::ParseFailed(format!(
            "MeshMaterialList: {} materials for {} polygons",
            material_count, polygon_count
        )));
    }
    let index_count = values.count()?;
    let mut groups = vec![Vec::new(); material_count];
    let mut last = 0;
    for p in 0..polygon_count {
        if p < index_count {
            last = values.count()?;
        }
        if last >= material_count {
            return Err(MmdError::ParseFailed(format!(
                "MeshMaterialList: material {} out of {}",
                last, material_count
            )));
        }
        groups[last].push(p);
    }

    let mut materials = Vec::with_capacity(material_count);
    for child in &list.children {
        if materials.len() == material_count {
            break;
        }
        let object = match child {
            XChild::Object(o) if o.template == "Material" => Some(o),
            XChild::Object(o) => {
                log::warn!("skipping unknown x template {} in MeshMaterialList", o.template);
                continue;
            }
            XChild::Reference(name) => {
                let found = named.get(name.as_str()).copied();
                if found.is_none() {
                    log::warn!("x material reference {} not found", name);
                }
                found
            }
        };
        let material = match object {
            Some(o) => build_material(o, model)?,
            None => default_material(model),
        };
        materials.push(material);
    }
    while materials.len() < material_count {
        materials.push(default_material(model));
    }
    // 名字按全局材质序号生成
    for (i, material) in materials.iter_mut().enumerate() {
        material.name = format!("材質{:02}", model.materials.len() + i + 1);
    }
    Ok((materials, groups))
}

fn set_normals(model: &mut PmxModel, base: u32, accumulated: &[Vec3]) -> Result<()> {
    for (i, normal) in accumulated.iter().enumerate() {
        if *normal == Vec3::ZERO {
            continue;
        }
        model.vertices.get_mut((base as usize + i) as i32)?.normal = normal.normalize();
    }
    Ok(())
}

fn apply_mesh_normals(
    object: &XObject,
    polygons: &[Vec<u32>],
    base: u32,
    vertex_count: usize,
    model: &mut PmxModel,
) -> Result<()> {
    let mut values = Values::new(object);
    let normal_count = values.bounded_count(3)?;
    let normals = (0..normal_count)
        .map(|_| values.vec3())
        .collect::<Result<Vec<_>>>()?;

    let mut accumulated = vec![Vec3::ZERO; vertex_count];
    if values.remaining() == 0 {
        for (slot, normal) in accumulated.iter_mut().zip(&normals) {
            *slot = *normal;
        }
        return set_normals(model, base, &accumulated);
    }

    let normal_faces = values.polygons(normal_count)?;
    if normal_faces.len() != polygons.len() {
        return Err(MmdError::ParseFailed(format!(
            "MeshNormals: {} faces, mesh has {}",
            normal_faces.len(),
            polygons.len()
        )));
    }
    for (polygon, normal_face) in polygons.iter().zip(&normal_faces) {
        if normal_face.len() < polygon.len() {
            return Err(MmdError::ParseFailed("MeshNormals: face is too short".into()));
        }
        for (&v, &n) in polygon.iter().zip(normal_face) {
            accumulated[v as usize] += normals[n as usize];
        }
    }
    set_normals(model, base, &accumulated)
}

fn apply_face_normals(
    polygons: &[Vec<u32>],
    base: u32,
    vertex_count: usize,
    model: &mut PmxModel,
) -> Result<()> {
    let positions: Vec<Vec3> = (0..vertex_count)
        .map(|i| model.vertices.get((base as usize + i) as i32).map(|v| v.position))
        .collect::<Result<_>>()?;
    let mut accumulated = vec![Vec3::ZERO; vertex_count];
    for polygon in polygons {
        for [a, b, c] in triangulate(polygon) {
            let (pa, pb, pc) = (positions[a as usize], positions[b as usize], positions[c as usize]);
            let normal = (pb - pa).cross(pc - pa);
            for v in [a, b, c] {
                accumulated[v as usize] += normal;
            }
        }
    }
    set_normals(model, base, &accumulated)
}

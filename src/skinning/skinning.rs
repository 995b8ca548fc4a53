//! 蒙皮计算
//!
//! 每个顶点独立计算，用 rayon 并行。

use glam::{Mat4, Quat, Vec2, Vec3};
use rayon::prelude::*;

use super::{VertexBuffer, VertexDelta};
use crate::math::slerp_shortest;
use crate::model::{Deform, PmxModel};
use crate::skeleton::BoneMatrices;

/// 预处理后的 SDEF 参数，R0/R1 已做中心修正
#[derive(Clone, Copy, Debug)]
struct SdefParams {
    bones: [i32; 2],
    weight: f32,
    c: Vec3,
    r0: Vec3,
    r1: Vec3,
}

#[derive(Clone, Debug)]
enum SkinWeights {
    Linear(Vec<(i32, f32)>),
    Sdef(SdefParams),
}

#[derive(Clone, Debug)]
struct SkinVertex {
    position: Vec3,
    normal: Vec3,
    uv: Vec2,
    weights: SkinWeights,
}

/// 从模型的静止顶点构造，之后每帧调用 [`Skinner::skin`]
#[derive(Clone, Debug, Default)]
pub struct Skinner {
    vertices: Vec<SkinVertex>,
}

impl Skinner {
    pub fn new(model: &PmxModel) -> Self {
        let vertices = model
            .vertices
            .iter_by_index()
            .map(|v| SkinVertex {
                position: v.position,
                normal: v.normal,
                uv: v.uv,
                weights: prepare_weights(&v.deform),
            })
            .collect();
        Self { vertices }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// `deltas` 为空时不应用 Morph 偏移，否则长度应与顶点数一致
    pub fn skin(&self, matrices: &BoneMatrices, deltas: &[VertexDelta]) -> VertexBuffer {
        let mut out = VertexBuffer::default();
        self.skin_into(matrices, deltas, &mut out);
        out
    }

    /// 复用输出缓冲区
    pub fn skin_into(&self, matrices: &BoneMatrices, deltas: &[VertexDelta], out: &mut VertexBuffer) {
        let n = self.vertices.len();
        out.positions.resize(n, Vec3::ZERO);
        out.normals.resize(n, Vec3::Y);
        out.uvs.resize(n, Vec2::ZERO);

        let skinning = matrices.skinning_matrices();
        let matrix = |bone: i32| -> Mat4 {
            if bone < 0 {
                return Mat4::IDENTITY;
            }
            skinning.get(bone as usize).copied().unwrap_or(Mat4::IDENTITY)
        };

        out.positions
            .par_iter_mut()
            .zip(out.normals.par_iter_mut())
            .zip(out.uvs.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((pos, nor), uv))| {
                let vertex = &self.vertices[i];
                let delta = deltas.get(i).copied().unwrap_or_default();
                let p = vertex.position + delta.position;
                *uv = vertex.uv + delta.uv.truncate().truncate();

                let (sp, sn) = match &vertex.weights {
                    SkinWeights::Linear(weights) => skin_linear(weights, p, vertex.normal, &matrix),
                    SkinWeights::Sdef(sdef) => skin_sdef(sdef, p, vertex.normal, &matrix),
                };
                *pos = sp;
                *nor = sn;
            });
    }
}

fn prepare_weights(deform: &Deform) -> SkinWeights {
    match deform {
        Deform::Sdef { bones, weight, c, r0, r1 } => {
            let w0 = weight.clamp(0.0, 1.0);
            let w1 = 1.0 - w0;
            let cr0 = (*c + *r0) * 0.5;
            let cr1 = (*c + *r1) * 0.5;
            let rw = cr0 * w0 + cr1 * w1;
            SkinWeights::Sdef(SdefParams {
                bones: *bones,
                weight: w0,
                c: *c,
                r0: *c + cr0 - rw,
                r1: *c + cr1 - rw,
            })
        }
        other => SkinWeights::Linear(other.normalized_weights()),
    }
}

fn skin_linear(
    weights: &[(i32, f32)],
    position: Vec3,
    normal: Vec3,
    matrix: &impl Fn(i32) -> Mat4,
) -> (Vec3, Vec3) {
    let mut p = Vec3::ZERO;
    let mut n = Vec3::ZERO;
    for &(bone, w) in weights {
        let m = matrix(bone);
        p += m.transform_point3(position) * w;
        n += m.transform_vector3(normal) * w;
    }
    (p, n.normalize_or(normal))
}

/// 球面混合：旋转部分用两骨骼四元数的插值，平移部分按修正后的中心线性混合
fn skin_sdef(
    sdef: &SdefParams,
    position: Vec3,
    normal: Vec3,
    matrix: &impl Fn(i32) -> Mat4,
) -> (Vec3, Vec3) {
    let m0 = matrix(sdef.bones[0]);
    let m1 = matrix(sdef.bones[1]);
    let w0 = sdef.weight;
    let w1 = 1.0 - w0;

    let q0 = Quat::from_mat4(&m0).normalize();
    let q1 = Quat::from_mat4(&m1).normalize();
    let q = slerp_shortest(q0, q1, w1);

    let p = q * (position - sdef.c)
        + m0.transform_point3(sdef.r0) * w0
        + m1.transform_point3(sdef.r1) * w1;
    (p, (q * normal).normalize_or(normal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bone, Vertex};
    use glam::Vec4;

    fn model_with(deforms: Vec<(Vec3, Deform)>) -> PmxModel {
        let mut model = PmxModel::new();
        for i in 0..4 {
            model.bones.append(Bone::new(format!("bone{}", i)));
        }
        for (position, deform) in deforms {
            model.vertices.append(Vertex {
                position,
                normal: Vec3::Y,
                deform,
                ..Vertex::default()
            });
        }
        model
    }

    fn matrices(globals: Vec<Mat4>) -> BoneMatrices {
        let rest_positions = vec![Vec3::ZERO; globals.len()];
        BoneMatrices { globals, rest_positions }
    }

    #[test]
    fn test_bdef1_follows_bone() {
        let model = model_with(vec![(Vec3::new(1.0, 0.0, 0.0), Deform::Bdef1 { bone: 1 })]);
        let skinner = Skinner::new(&model);
        let m = matrices(vec![
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)),
            Mat4::IDENTITY,
            Mat4::IDENTITY,
        ]);
        let out = skinner.skin(&m, &[]);
        assert!((out.positions[0] - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-5);
        assert!((out.normals[0] - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_bdef4_opposite_rotations_cancel() {
        let model = model_with(vec![(
            Vec3::new(1.0, 0.0, 0.0),
            Deform::Bdef4 {
                bones: [0, 1, 2, 3],
                weights: [0.25, 0.25, 0.25, 0.25],
            },
        )]);
        let skinner = Skinner::new(&model);
        let plus = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let minus = Mat4::from_rotation_z(-std::f32::consts::FRAC_PI_2);
        let out = skinner.skin(&matrices(vec![plus, plus, minus, minus]), &[]);
        assert!(out.positions[0].length() < 1e-5, "got {:?}", out.positions[0]);
    }

    #[test]
    fn test_bdef4_zero_weights_ignored_and_partial_normalized() {
        let model = model_with(vec![
            (
                Vec3::new(1.0, 0.0, 0.0),
                Deform::Bdef4 {
                    bones: [0, 1, 2, 3],
                    weights: [0.5, 0.5, 0.0, 0.0],
                },
            ),
            (
                Vec3::new(1.0, 0.0, 0.0),
                Deform::Bdef4 {
                    bones: [0, 1, 2, 3],
                    weights: [0.25, 0.25, 0.0, 0.0],
                },
            ),
        ]);
        let skinner = Skinner::new(&model);
        let far = Mat4::from_translation(Vec3::new(1000.0, -1000.0, 1000.0));
        let m = matrices(vec![
            Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)),
            Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0)),
            far,
            far,
        ]);
        let out = skinner.skin(&m, &[]);
        for p in &out.positions {
            assert!((*p - Vec3::new(4.0, 0.0, 0.0)).length() < 1e-4, "got {:?}", p);
        }
    }

    #[test]
    fn test_bdef2_blends_and_null_bone_is_identity() {
        let model = model_with(vec![(
            Vec3::ZERO,
            Deform::Bdef2 {
                bones: [0, -1],
                weight: 0.5,
            },
        )]);
        let skinner = Skinner::new(&model);
        let m = matrices(vec![Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0)); 4]);
        let out = skinner.skin(&m, &[]);
        assert!((out.positions[0] - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_sdef_identity_and_rigid_motion() {
        let p = Vec3::new(0.3, 1.2, -0.4);
        let model = model_with(vec![(
            p,
            Deform::Sdef {
                bones: [0, 1],
                weight: 0.6,
                c: Vec3::new(0.0, 1.0, 0.0),
                r0: Vec3::new(0.0, 1.5, 0.0),
                r1: Vec3::new(0.0, 0.5, 0.0),
            },
        )]);
        let skinner = Skinner::new(&model);

        let out = skinner.skin(&matrices(vec![Mat4::IDENTITY; 4]), &[]);
        assert!((out.positions[0] - p).length() < 1e-5);

        let rigid = Mat4::from_rotation_translation(
            Quat::from_rotation_y(0.7),
            Vec3::new(1.0, -2.0, 3.0),
        );
        let out = skinner.skin(&matrices(vec![rigid; 4]), &[]);
        assert!((out.positions[0] - rigid.transform_point3(p)).length() < 1e-4);
        assert!((out.normals[0] - rigid.transform_vector3(Vec3::Y)).length() < 1e-4);
    }

    #[test]
    fn test_deltas_move_rest_position_and_uv() {
        let model = model_with(vec![(Vec3::ZERO, Deform::Bdef1 { bone: 0 })]);
        let skinner = Skinner::new(&model);
        let deltas = [VertexDelta {
            position: Vec3::new(0.0, 0.5, 0.0),
            uv: Vec4::new(0.25, 0.0, 0.0, 0.0),
        }];
        let rotate = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let out = skinner.skin(&matrices(vec![rotate; 4]), &deltas);
        assert!((out.positions[0] - Vec3::new(-0.5, 0.0, 0.0)).length() < 1e-5);
        assert!((out.uvs[0] - Vec2::new(0.25, 0.0)).length() < 1e-6);
        assert_eq!(out.positions_raw().len(), 3);
    }
}

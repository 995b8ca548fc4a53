//! 数学工具
//!
//! 模型数据保持 PMX 原生的左手坐标系，仅在与物理引擎交互时通过 [`inv_z`] 转换。

pub use glam::{EulerRot, Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

use rapier3d::na::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};

/// 旋转比较阈值
pub const ROTATION_EPSILON: f32 = 1e-6;

/// Z 轴镜像：MMD（左手）与物理世界（右手）互转，`S * m * S`，S = diag(1, 1, -1)
pub fn inv_z(m: Mat4) -> Mat4 {
    let s = Mat4::from_scale(Vec3::new(1.0, 1.0, -1.0));
    s * m * s
}

pub fn flip_z(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y, -v.z)
}

/// 最短弧 slerp：当两四元数点积为负时翻转 `to` 的符号
pub fn slerp_shortest(from: Quat, to: Quat, t: f32) -> Quat {
    let to = if from.dot(to) < 0.0 { -to } else { to };
    from.slerp(to, t).normalize()
}

/// `slerp(identity, q, t)`，付与和 SDEF 使用
pub fn scale_rotation(q: Quat, t: f32) -> Quat {
    slerp_shortest(Quat::IDENTITY, q, t)
}

/// 四元数表示的旋转角（弧度，0..=π）
pub fn rotation_angle(q: Quat) -> f32 {
    2.0 * q.w.abs().clamp(0.0, 1.0).acos()
}

/// 把旋转投影到固定轴：保留绕 `axis` 的分量，角度符号取决于旋转轴与固定轴的方向
pub fn to_fixed_axis_rotation(q: Quat, axis: Vec3) -> Quat {
    let axis = axis.normalize_or_zero();
    if axis == Vec3::ZERO {
        return q;
    }
    let (q_axis, angle) = q.to_axis_angle();
    if angle.abs() < ROTATION_EPSILON {
        return Quat::IDENTITY;
    }
    let signed = if q_axis.dot(axis) < 0.0 { -angle } else { angle };
    Quat::from_axis_angle(axis, signed)
}

/// 绕单轴的带符号旋转角，`atan2` 保证符号正确
pub fn signed_angle_about(q: Quat, axis: Vec3) -> f32 {
    let q = if q.w < 0.0 { -q } else { q };
    let projected = Vec3::new(q.x, q.y, q.z).dot(axis.normalize_or_zero());
    2.0 * projected.atan2(q.w)
}

/// 由本地 X/Z 轴构造正交旋转矩阵（Y 由 Z×X 导出）
pub fn local_axis_frame(x_axis: Vec3, z_axis: Vec3) -> Mat3 {
    let x = x_axis.normalize_or_zero();
    let y = z_axis.cross(x).normalize_or_zero();
    if x == Vec3::ZERO || y == Vec3::ZERO {
        return Mat3::IDENTITY;
    }
    let z = x.cross(y).normalize();
    Mat3::from_cols(x, y, z)
}

/// MMD 刚体欧拉角（弧度）转四元数，顺序 Y·X·Z
pub fn rigid_body_rotation(euler: Vec3) -> Quat {
    Quat::from_rotation_y(euler.y) * Quat::from_rotation_x(euler.x) * Quat::from_rotation_z(euler.z)
}

/// 矩阵的平移分量
pub fn translation_of(m: &Mat4) -> Vec3 {
    m.w_axis.truncate()
}

/// 矩阵的旋转分量（忽略缩放）
pub fn rotation_of(m: &Mat4) -> Quat {
    let (_, rotation, _) = m.to_scale_rotation_translation();
    rotation.normalize()
}

/// glam 矩阵转物理引擎的 Isometry（丢弃缩放）
pub fn mat4_to_isometry(m: &Mat4) -> Isometry3<f32> {
    let (_, r, t) = m.to_scale_rotation_translation();
    Isometry3::from_parts(Translation3::new(t.x, t.y, t.z), to_na_rotation(r))
}

pub fn isometry_to_mat4(iso: &Isometry3<f32>) -> Mat4 {
    let t = iso.translation.vector;
    Mat4::from_rotation_translation(from_na_rotation(&iso.rotation), Vec3::new(t.x, t.y, t.z))
}

pub fn to_na_vector(v: Vec3) -> Vector3<f32> {
    Vector3::new(v.x, v.y, v.z)
}

pub fn from_na_vector(v: &Vector3<f32>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

pub fn to_na_rotation(q: Quat) -> UnitQuaternion<f32> {
    let q = q.normalize();
    UnitQuaternion::new_normalize(Quaternion::new(q.w, q.x, q.y, q.z))
}

pub fn from_na_rotation(q: &UnitQuaternion<f32>) -> Quat {
    let q = q.quaternion();
    Quat::from_xyzw(q.i, q.j, q.k, q.w).normalize()
}

/// 两矩阵逐元素近似相等
pub fn mat4_near(a: &Mat4, b: &Mat4, eps: f32) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| (x - y).abs() <= eps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_inv_z_is_involution() {
        let m = Mat4::from_rotation_translation(
            Quat::from_euler(EulerRot::XYZ, 0.3, -0.2, 1.1),
            Vec3::new(1.0, 2.0, 3.0),
        );
        assert!(mat4_near(&inv_z(inv_z(m)), &m, 1e-6));
        assert!((translation_of(&inv_z(m)).z + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_slerp_shortest_flips_sign() {
        let q = Quat::from_rotation_z(FRAC_PI_2);
        let negated = -q;
        assert!(negated.w < 0.0);
        let r = scale_rotation(negated, 1.0);
        assert!((r.length() - 1.0).abs() < 1e-6);
        assert!(r.dot(q).abs() > 1.0 - 1e-6);
        let half = scale_rotation(negated, 0.5);
        assert!((rotation_angle(half) - FRAC_PI_2 / 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_fixed_axis_projection() {
        let q = Quat::from_axis_angle(Vec3::new(0.0, 0.0, -1.0), 0.5);
        let fixed = to_fixed_axis_rotation(q, Vec3::Z);
        assert!((signed_angle_about(fixed, Vec3::Z) + 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_signed_angle_about_axis() {
        let q = Quat::from_rotation_x(-0.7);
        assert!((signed_angle_about(q, Vec3::X) + 0.7).abs() < 1e-5);
        let q = Quat::from_rotation_x(PI * 0.9);
        assert!((signed_angle_about(q, Vec3::X) - PI * 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_isometry_conversion_keeps_pose() {
        let m = Mat4::from_rotation_translation(
            Quat::from_euler(EulerRot::YXZ, 0.4, -1.2, 0.3),
            Vec3::new(-2.0, 5.0, 1.5),
        );
        let back = isometry_to_mat4(&mat4_to_isometry(&m));
        assert!(mat4_near(&back, &m, 1e-5));
        let v = Vec3::new(1.0, -2.0, 3.0);
        assert_eq!(from_na_vector(&to_na_vector(v)), v);
    }

    #[test]
    fn test_local_axis_frame_orthonormal() {
        let frame = local_axis_frame(Vec3::new(1.0, 1.0, 0.0), Vec3::Z);
        assert!((frame.x_axis.length() - 1.0).abs() < 1e-6);
        assert!(frame.x_axis.dot(frame.y_axis).abs() < 1e-6);
        assert!((frame.determinant() - 1.0).abs() < 1e-5);
    }
}

//! 风场
//!
//! 确定性的阵风模型：两个不同频率的正弦叠加，不使用随机数，
//! 相同的步进序列得到相同的力。

use std::f64::consts::PI;

use glam::Vec3;
use rapier3d::prelude::*;

use super::config::WindConfig;
use super::rigid_body::PhysicsBody;
use crate::math::{flip_z, from_na_vector, to_na_vector};
use crate::model::Shape;

/// 相对风速平方小于该值时不施力
const MIN_RELATIVE_SPEED2: f64 = 1e-12;
/// 升力方向长度平方小于该值时不施加升力
const MIN_LIFT_DIR2: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct WindField {
    config: WindConfig,
    /// 风启用后累计的模拟时间（秒）
    time: f32,
}

impl Default for WindField {
    fn default() -> Self {
        Self::from_config(WindConfig::default())
    }
}

impl WindField {
    pub fn from_config(config: WindConfig) -> Self {
        Self { config, time: 0.0 }
    }

    pub fn config(&self) -> &WindConfig {
        &self.config
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn enable(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && self.config.speed != 0.0
    }

    /// 设置风向、风速和阵风强度。`direction` 为 `None` 时保留原风向，负的阵风强度取 0
    pub fn set_wind(&mut self, direction: Option<Vec3>, speed: f32, randomness: f32) {
        if let Some(direction) = direction {
            self.config.direction = direction;
        }
        self.config.speed = speed;
        self.config.randomness = randomness.max(0.0);
    }

    /// 负的系数和非正的频率不修改原值
    pub fn set_advanced(&mut self, drag_coeff: f32, lift_coeff: f32, turbulence_freq_hz: f32) {
        if drag_coeff >= 0.0 {
            self.config.drag_coeff = drag_coeff;
        }
        if lift_coeff >= 0.0 {
            self.config.lift_coeff = lift_coeff;
        }
        if turbulence_freq_hz > 0.0 {
            self.config.turbulence_freq_hz = turbulence_freq_hz;
        }
    }

    pub fn set_max_acceleration(&mut self, max_acceleration: f32) {
        self.config.max_acceleration = max_acceleration;
    }

    /// 时间 `t` 处的阵风系数
    pub fn gust(&self, t: f32) -> f32 {
        let r = self.config.randomness.clamp(0.0, 1.0) as f64;
        let f = (self.config.turbulence_freq_hz as f64).max(1e-4);
        let t = t as f64;
        let wave = 0.6 * (2.0 * PI * f * t).sin() + 0.4 * (2.0 * PI * 1.73 * f * t + 0.9).sin();
        (1.0 + r * wave) as f32
    }

    /// 时间 `t` 处的风速向量（物理坐标系）
    pub fn wind_velocity(&self, t: f32) -> Vec3 {
        let dir = self.config.direction.normalize_or_zero();
        flip_z(dir * self.config.speed * self.gust(t))
    }

    /// 计算一个刚体受到的风力（物理坐标系）。`mass` 用于加速度钳制
    pub fn force(
        &self,
        wind: Vec3,
        body_velocity: Vec3,
        shape: Shape,
        size: Vec3,
        mass: f32,
    ) -> Option<Vec3> {
        let rel = (body_velocity - wind).as_dvec3();
        let speed2 = rel.length_squared();
        if speed2 < MIN_RELATIVE_SPEED2 {
            return None;
        }
        let n = rel / speed2.sqrt();
        let area = cross_section_area(shape, size, self.config.direction) as f64;

        let drag = -(self.config.drag_coeff as f64) * area * speed2 * n;

        let kl = self.config.lift_coeff as f64;
        let mut lift = glam::DVec3::ZERO;
        if kl > 0.0 {
            let up = glam::DVec3::Y;
            let l = up - up.dot(n) * n;
            let l2 = l.length_squared();
            if l2 > MIN_LIFT_DIR2 {
                lift = kl * area * speed2 * (l / l2.sqrt());
            }
        }

        let mut total = (drag + lift).as_vec3();
        let max_a = self.config.max_acceleration;
        if max_a > 0.0 && mass > 0.0 {
            let magnitude = total.length();
            if magnitude > 0.0 && magnitude / mass > max_a {
                total *= mass * max_a / magnitude;
            }
        }
        Some(total)
    }

    /// 推进风的时间并对动态刚体施加力，返回受力的刚体数
    pub fn apply<'a>(
        &mut self,
        dt: f32,
        set: &mut RigidBodySet,
        bodies: impl IntoIterator<Item = &'a PhysicsBody>,
    ) -> usize {
        if !self.is_active() {
            return 0;
        }
        self.time += dt;
        let wind = self.wind_velocity(self.time);

        let mut pushed = 0;
        for body in bodies {
            if body.is_kinematic() {
                continue;
            }
            let Some(rb) = body.handle.and_then(|h| set.get_mut(h)) else {
                continue;
            };
            let velocity = from_na_vector(rb.linvel());
            if let Some(force) =
                self.force(wind, velocity, body.shape, body.applied_size, rb.mass())
            {
                rb.add_force(to_na_vector(force), true);
                pushed += 1;
            }
        }
        pushed
    }
}

/// 风向上的近似迎风面积。忽略形状自身的旋转；零向量风向返回 1
pub fn cross_section_area(shape: Shape, size: Vec3, direction: Vec3) -> f32 {
    let d = direction.normalize_or_zero();
    if d == Vec3::ZERO {
        return 1.0;
    }
    let d = d.abs();
    match shape {
        Shape::Sphere => std::f32::consts::PI * size.x * size.x,
        Shape::Box => {
            let (wx, wy, wz) = (2.0 * size.x, 2.0 * size.y, 2.0 * size.z);
            d.x * (wy * wz) + d.y * (wx * wz) + d.z * (wx * wy)
        }
        Shape::Capsule => {
            let (r, h) = (size.x, size.y);
            let axial = std::f32::consts::PI * r * r;
            let side = 2.0 * r * h + axial;
            d.y * axial + (1.0 - d.y) * side
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn windy() -> WindField {
        let mut wind = WindField::default();
        wind.enable(true);
        wind.set_wind(Some(Vec3::X), 10.0, 0.5);
        wind
    }

    #[test]
    fn test_gust_is_deterministic() {
        let a = windy();
        let b = windy();
        for i in 0..20 {
            let t = i as f32 * 0.13;
            assert_eq!(a.gust(t), b.gust(t));
        }
        let mut calm = windy();
        calm.set_wind(None, 10.0, 0.0);
        assert_eq!(calm.gust(1.234), 1.0);
    }

    #[test]
    fn test_negative_randomness_and_advanced_guards() {
        let mut wind = WindField::default();
        wind.set_wind(None, 3.0, -1.0);
        assert_eq!(wind.config().randomness, 0.0);
        assert_eq!(wind.config().direction, Vec3::X);
        wind.set_advanced(-1.0, 0.5, 0.0);
        assert_eq!(wind.config().drag_coeff, 0.8);
        assert_eq!(wind.config().lift_coeff, 0.5);
        assert_eq!(wind.config().turbulence_freq_hz, 0.5);
        assert!(!wind.is_active());
    }

    #[test]
    fn test_cross_section_area() {
        assert!((cross_section_area(Shape::Sphere, Vec3::new(1.0, 0.0, 0.0), Vec3::X) - PI).abs() < 1e-6);
        assert!((cross_section_area(Shape::Box, Vec3::new(1.0, 2.0, 3.0), Vec3::X) - 24.0).abs() < 1e-5);
        let capsule = Vec3::new(0.5, 2.0, 0.0);
        assert!((cross_section_area(Shape::Capsule, capsule, Vec3::Y) - PI * 0.25).abs() < 1e-6);
        assert!(
            (cross_section_area(Shape::Capsule, capsule, Vec3::X) - (2.0 + PI * 0.25)).abs() < 1e-5
        );
        assert_eq!(cross_section_area(Shape::Box, Vec3::ONE, Vec3::ZERO), 1.0);
    }

    #[test]
    fn test_drag_pushes_along_wind() {
        let mut wind = windy();
        wind.set_advanced(0.8, 0.0, 0.5);
        let v = wind.wind_velocity(0.0);
        let force = wind
            .force(v, Vec3::ZERO, Shape::Sphere, Vec3::new(0.5, 0.0, 0.0), 1000.0)
            .unwrap();
        assert!(force.x > 0.0);
        assert!(force.y.abs() < 1e-4 && force.z.abs() < 1e-4);
        assert!(wind.force(v, v, Shape::Sphere, Vec3::ONE, 1.0).is_none());
    }

    #[test]
    fn test_acceleration_clamp() {
        let wind = windy();
        let force = wind
            .force(Vec3::new(100.0, 0.0, 0.0), Vec3::ZERO, Shape::Box, Vec3::ONE, 0.5)
            .unwrap();
        assert!((force.length() / 0.5 - 80.0).abs() < 1e-2);
    }

    #[test]
    fn test_wind_direction_flips_z() {
        let mut wind = windy();
        wind.set_wind(Some(Vec3::new(0.0, 0.0, 2.0)), 5.0, 0.0);
        let v = wind.wind_velocity(0.0);
        assert!((v - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-6);
    }
}

//! 物理全局配置
//!
//! 进程级配置，引擎创建时读取一次；单个模型的 Joint 约束参数可以在引擎上覆盖。

use glam::Vec3;
use once_cell::sync::Lazy;
use std::f32::consts::{FRAC_PI_6, PI};
use std::sync::{PoisonError, RwLock};

/// 跟随差分时允许旋转速度的默认最大角度
pub const DEFAULT_FOLLOW_DELTA_MAX_RADIANS: f32 = FRAC_PI_6;

/// Joint 约束参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointConstraintConfig {
    pub erp: f32,
    pub stop_erp: f32,
    pub cfm: f32,
    pub stop_cfm: f32,
    /// 关闭 Joint 两端刚体之间的碰撞
    pub disable_collisions: bool,
}

impl Default for JointConstraintConfig {
    fn default() -> Self {
        Self {
            erp: 0.8,
            stop_erp: 0.8,
            cfm: 0.01,
            stop_cfm: 0.01,
            disable_collisions: false,
        }
    }
}

/// 风参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindConfig {
    pub enabled: bool,
    /// MMD 坐标系中的风向
    pub direction: Vec3,
    pub speed: f32,
    /// 阵风强度 0..1
    pub randomness: f32,
    pub turbulence_freq_hz: f32,
    pub drag_coeff: f32,
    pub lift_coeff: f32,
    /// 风力产生的加速度上限
    pub max_acceleration: f32,
}

impl Default for WindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            direction: Vec3::X,
            speed: 0.0,
            randomness: 0.0,
            turbulence_freq_hz: 0.5,
            drag_coeff: 0.8,
            lift_coeff: 0.2,
            max_acceleration: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsConfig {
    // ========== Joint ==========
    pub joint: JointConstraintConfig,

    // ========== 骨骼跟随 ==========
    /// 差分跟随时旋转速度的最大角度（弧度），超过则只移动位置
    pub follow_delta_max_radians: f32,

    // ========== 风 ==========
    pub wind: WindConfig,

    // ========== 模拟参数 ==========
    /// 约束求解器迭代次数
    pub solver_iterations: usize,
    /// `step` 未指定时使用的最大子步数
    pub max_substeps: u32,
    /// `step` 未指定时使用的固定步长（秒）
    pub fixed_timestep: f32,

    // ========== CCD ==========
    pub ccd_min_radius: f32,
    pub ccd_min_threshold: f32,
    pub ccd_radius_scale: f32,
    pub ccd_threshold_scale: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            joint: JointConstraintConfig::default(),
            follow_delta_max_radians: DEFAULT_FOLLOW_DELTA_MAX_RADIANS,
            wind: WindConfig::default(),
            solver_iterations: 8,
            max_substeps: 2,
            fixed_timestep: 1.0 / 60.0,
            ccd_min_radius: 0.005,
            ccd_min_threshold: 0.02,
            ccd_radius_scale: 0.2,
            ccd_threshold_scale: 0.5,
        }
    }
}

impl PhysicsConfig {
    /// 经过钳制的差分跟随角度上限
    pub fn follow_delta_limit(&self) -> f32 {
        clamp_follow_delta_max_radians(self.follow_delta_max_radians)
    }
}

/// NaN、无穷或非正数回到默认值，超过 π 取 π
pub fn clamp_follow_delta_max_radians(radians: f32) -> f32 {
    if !radians.is_finite() || radians <= 0.0 {
        return DEFAULT_FOLLOW_DELTA_MAX_RADIANS;
    }
    radians.min(PI)
}

/// 全局配置实例
static PHYSICS_CONFIG: Lazy<RwLock<PhysicsConfig>> =
    Lazy::new(|| RwLock::new(PhysicsConfig::default()));

/// 获取当前配置（只读）
pub fn get_config() -> PhysicsConfig {
    PHYSICS_CONFIG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn set_config(config: PhysicsConfig) {
    *PHYSICS_CONFIG
        .write()
        .unwrap_or_else(PoisonError::into_inner) = config;
}

/// 重置为默认配置
pub fn reset_config() {
    set_config(PhysicsConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_delta_clamp() {
        assert_eq!(clamp_follow_delta_max_radians(f32::NAN), DEFAULT_FOLLOW_DELTA_MAX_RADIANS);
        assert_eq!(clamp_follow_delta_max_radians(-1.0), DEFAULT_FOLLOW_DELTA_MAX_RADIANS);
        assert_eq!(clamp_follow_delta_max_radians(0.0), DEFAULT_FOLLOW_DELTA_MAX_RADIANS);
        assert_eq!(clamp_follow_delta_max_radians(PI * 2.0), PI);
        assert_eq!(clamp_follow_delta_max_radians(0.2), 0.2);
    }

    #[test]
    fn test_defaults() {
        let config = PhysicsConfig::default();
        assert_eq!(config.joint.erp, 0.8);
        assert_eq!(config.joint.cfm, 0.01);
        assert!(!config.joint.disable_collisions);
        assert!(!config.wind.enabled);
        assert_eq!(config.wind.direction, Vec3::X);
        assert_eq!(config.wind.max_acceleration, 80.0);
        assert!((config.follow_delta_limit() - FRAC_PI_6).abs() < 1e-7);
    }

    #[test]
    fn test_set_and_reset_global() {
        let mut config = get_config();
        config.ccd_min_radius = 0.125;
        set_config(config);
        assert_eq!(get_config().ccd_min_radius, 0.125);
        reset_config();
        assert_eq!(get_config().ccd_min_radius, 0.005);
    }
}

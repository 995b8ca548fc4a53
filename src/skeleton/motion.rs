//! 动作采样与每帧骨骼数据

use std::collections::{BTreeMap, HashMap};

use glam::{Mat4, Quat, Vec3};

use super::BoneGraph;
use crate::math::slerp_shortest;

/// MMD 插值曲线，控制点归一化到 0..1
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BezierCurve {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Default for BezierCurve {
    fn default() -> Self {
        Self::linear()
    }
}

impl BezierCurve {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn linear() -> Self {
        Self::new(0.25, 0.25, 0.75, 0.75)
    }

    /// 从 0..127 的整数控制点创建
    pub fn from_bytes(data: [u8; 4]) -> Self {
        Self::new(
            data[0] as f32 / 127.0,
            data[1] as f32 / 127.0,
            data[2] as f32 / 127.0,
            data[3] as f32 / 127.0,
        )
    }

    /// 求 x(s) = t 时的 y(s)，牛顿迭代
    pub fn evaluate(&self, t: f32) -> f32 {
        if t <= 0.0 {
            return 0.0;
        }
        if t >= 1.0 {
            return 1.0;
        }

        let mut s = t;
        for _ in 0..15 {
            let dx = self.dx(s);
            if dx.abs() < 1e-6 {
                break;
            }
            let next = (s - (self.x(s) - t) / dx).clamp(0.0, 1.0);
            if (next - s).abs() < 1e-6 {
                s = next;
                break;
            }
            s = next;
        }
        self.y(s)
    }

    fn x(&self, s: f32) -> f32 {
        let r = 1.0 - s;
        3.0 * r * r * s * self.x1 + 3.0 * r * s * s * self.x2 + s * s * s
    }

    fn y(&self, s: f32) -> f32 {
        let r = 1.0 - s;
        3.0 * r * r * s * self.y1 + 3.0 * r * s * s * self.y2 + s * s * s
    }

    fn dx(&self, s: f32) -> f32 {
        let r = 1.0 - s;
        3.0 * r * r * self.x1 + 6.0 * r * s * (self.x2 - self.x1) + 3.0 * s * s * (1.0 - self.x2)
    }
}

/// 骨骼关键帧；插值曲线描述从上一帧到本帧的过渡
#[derive(Clone, Debug, PartialEq)]
pub struct BoneKeyframe {
    pub frame: u32,
    pub translation: Vec3,
    pub rotation: Quat,
    pub curve_x: BezierCurve,
    pub curve_y: BezierCurve,
    pub curve_z: BezierCurve,
    pub curve_rotation: BezierCurve,
}

impl BoneKeyframe {
    pub fn new(frame: u32, translation: Vec3, rotation: Quat) -> Self {
        Self {
            frame,
            translation,
            rotation,
            curve_x: BezierCurve::linear(),
            curve_y: BezierCurve::linear(),
            curve_z: BezierCurve::linear(),
            curve_rotation: BezierCurve::linear(),
        }
    }
}

/// 按骨骼名保存的动作
#[derive(Clone, Debug, Default)]
pub struct BoneMotion {
    tracks: HashMap<String, BTreeMap<u32, BoneKeyframe>>,
}

impl BoneMotion {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一帧重复插入时覆盖
    pub fn insert(&mut self, bone_name: impl Into<String>, keyframe: BoneKeyframe) {
        self.tracks
            .entry(bone_name.into())
            .or_default()
            .insert(keyframe.frame, keyframe);
    }

    pub fn bone_names(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    pub fn max_frame(&self) -> u32 {
        self.tracks
            .values()
            .filter_map(|track| track.keys().next_back().copied())
            .max()
            .unwrap_or(0)
    }

    /// 采样单根骨骼，没有关键帧时返回 `None`
    pub fn sample(&self, bone_name: &str, frame: f32) -> Option<(Vec3, Quat)> {
        let track = self.tracks.get(bone_name)?;
        let frame = frame.max(0.0);
        let base = frame.floor() as u32;

        let prev = track.range(..=base).next_back().map(|(_, k)| k);
        let next = track.range(base + 1..).next().map(|(_, k)| k);
        match (prev, next) {
            (Some(p), Some(n)) => {
                let span = (n.frame - p.frame) as f32;
                let t = ((frame - p.frame as f32) / span).clamp(0.0, 1.0);
                let lerp = |a: f32, b: f32, curve: &BezierCurve| a + (b - a) * curve.evaluate(t);
                let translation = Vec3::new(
                    lerp(p.translation.x, n.translation.x, &n.curve_x),
                    lerp(p.translation.y, n.translation.y, &n.curve_y),
                    lerp(p.translation.z, n.translation.z, &n.curve_z),
                );
                let rotation = slerp_shortest(p.rotation, n.rotation, n.curve_rotation.evaluate(t));
                Some((translation, rotation))
            }
            (Some(k), None) | (None, Some(k)) => Some((k.translation, k.rotation)),
            (None, None) => None,
        }
    }

    /// 为图中所有骨骼采样一帧
    pub fn pose(&self, graph: &BoneGraph, frame: f32) -> BonePose {
        let mut pose = BonePose::rest(graph.len());
        for node in graph.nodes() {
            if let Some((t, r)) = self.sample(&node.name, frame) {
                pose.translations[node.index] = t;
                pose.rotations[node.index] = r;
            }
        }
        pose
    }
}

/// 一帧的骨骼本地姿势（按骨骼索引）
#[derive(Clone, Debug, PartialEq)]
pub struct BonePose {
    pub translations: Vec<Vec3>,
    pub rotations: Vec<Quat>,
}

impl BonePose {
    pub fn rest(bone_count: usize) -> Self {
        Self {
            translations: vec![Vec3::ZERO; bone_count],
            rotations: vec![Quat::IDENTITY; bone_count],
        }
    }

    pub fn len(&self) -> usize {
        self.translations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty()
    }

    pub fn set(&mut self, bone: usize, translation: Vec3, rotation: Quat) {
        if bone < self.len() {
            self.translations[bone] = translation;
            self.rotations[bone] = rotation;
        }
    }

    pub fn translation(&self, bone: usize) -> Vec3 {
        self.translations.get(bone).copied().unwrap_or(Vec3::ZERO)
    }

    pub fn rotation(&self, bone: usize) -> Quat {
        self.rotations.get(bone).copied().unwrap_or(Quat::IDENTITY)
    }

    /// 叠加骨骼 Morph 的偏移
    pub fn add_offset(&mut self, bone: usize, translation: Vec3, rotation: Quat) {
        if bone < self.len() {
            self.translations[bone] += translation;
            self.rotations[bone] = (self.rotations[bone] * rotation).normalize();
        }
    }
}

/// 全部骨骼的全局矩阵
#[derive(Clone, Debug, PartialEq)]
pub struct BoneMatrices {
    pub globals: Vec<Mat4>,
    pub rest_positions: Vec<Vec3>,
}

impl BoneMatrices {
    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    /// 全局矩阵；-1 或越界视为单位矩阵
    pub fn global(&self, bone: i32) -> Mat4 {
        if bone < 0 {
            return Mat4::IDENTITY;
        }
        self.globals.get(bone as usize).copied().unwrap_or(Mat4::IDENTITY)
    }

    /// 蒙皮矩阵 = 全局矩阵 · 静止位置的逆平移
    pub fn skinning_matrix(&self, bone: i32) -> Mat4 {
        if bone < 0 || bone as usize >= self.globals.len() {
            return Mat4::IDENTITY;
        }
        let i = bone as usize;
        self.globals[i] * Mat4::from_translation(-self.rest_positions[i])
    }

    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        (0..self.globals.len() as i32)
            .map(|i| self.skinning_matrix(i))
            .collect()
    }
}

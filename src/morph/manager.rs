//! Morph 权重表

use std::collections::HashMap;

use crate::model::PmxModel;

/// 按 Morph 索引保存当前权重
#[derive(Clone, Debug, Default)]
pub struct MorphWeights {
    weights: Vec<f32>,
    names: HashMap<String, i32>,
}

impl MorphWeights {
    pub fn new(model: &PmxModel) -> Self {
        let names = model
            .morphs
            .iter()
            .map(|m| (m.name.clone(), m.index))
            .collect();
        Self {
            weights: vec![0.0; model.morphs.len()],
            names,
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn get(&self, index: i32) -> f32 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.weights.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    /// 权重限制在 0..=1
    pub fn set(&mut self, index: i32, weight: f32) {
        if let Some(slot) = usize::try_from(index).ok().and_then(|i| self.weights.get_mut(i)) {
            *slot = weight.clamp(0.0, 1.0);
        }
    }

    /// 找不到名字时返回 false
    pub fn set_by_name(&mut self, name: &str, weight: f32) -> bool {
        match self.names.get(name) {
            Some(&index) => {
                self.set(index, weight);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = 0.0);
    }

    /// 权重非零的 (索引, 权重)
    pub fn active(&self) -> impl Iterator<Item = (i32, f32)> + '_ {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0.0)
            .map(|(i, w)| (i as i32, *w))
    }
}

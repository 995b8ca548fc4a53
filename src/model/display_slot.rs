//! 表示枠

use crate::collection::{Indexed, Named};

/// 表示枠中的元素
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayReference {
    Bone(i32),
    Morph(i32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisplaySlot {
    pub index: i32,
    pub name: String,
    pub english_name: String,
    /// 特殊枠（Root / 表情）
    pub special: bool,
    pub references: Vec<DisplayReference>,
}

impl DisplaySlot {
    pub fn new(name: impl Into<String>, english_name: impl Into<String>, special: bool) -> Self {
        Self {
            index: -1,
            name: name.into(),
            english_name: english_name.into(),
            special,
            references: Vec::new(),
        }
    }
}

impl Indexed for DisplaySlot {
    fn index(&self) -> i32 {
        self.index
    }
    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

impl Named for DisplaySlot {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

//! 稳定索引容器
//!
//! 实体之间通过索引互相引用，因此在中间插入时不得改变已有实体的索引。
//! 物理顺序（`values`）与逻辑索引通过 `index_to_pos` 映射解耦。

use std::collections::HashMap;

use crate::{MmdError, Result};

/// 带有逻辑索引的实体
pub trait Indexed {
    fn index(&self) -> i32;
    fn set_index(&mut self, index: i32);
}

/// 带有名称的实体
pub trait Named: Indexed {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
}

/// 按逻辑索引访问的稠密容器
#[derive(Clone, Debug)]
pub struct IndexedCollection<T: Indexed> {
    values: Vec<T>,
    index_to_pos: Vec<usize>,
}

impl<T: Indexed> Default for IndexedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Indexed> IndexedCollection<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            index_to_pos: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            index_to_pos: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, index: i32) -> bool {
        index >= 0 && (index as usize) < self.index_to_pos.len()
    }

    fn position(&self, index: i32) -> Result<usize> {
        if !self.contains(index) {
            return Err(MmdError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self.index_to_pos[index as usize])
    }

    pub fn get(&self, index: i32) -> Result<&T> {
        let pos = self.position(index)?;
        Ok(&self.values[pos])
    }

    pub fn get_mut(&mut self, index: i32) -> Result<&mut T> {
        let pos = self.position(index)?;
        Ok(&mut self.values[pos])
    }

    /// 追加到末尾，分配新索引
    pub fn append(&mut self, mut value: T) -> i32 {
        let index = self.values.len() as i32;
        value.set_index(index);
        self.index_to_pos.push(self.values.len());
        self.values.push(value);
        index
    }

    /// 覆盖 `value.index()` 位置上的实体
    pub fn update(&mut self, value: T) -> Result<()> {
        let pos = self.position(value.index())?;
        self.values[pos] = value;
        Ok(())
    }

    /// 物理上插入到 `pos`，分配新索引（= 当前长度），已有实体的索引不变
    pub fn insert_at(&mut self, pos: usize, mut value: T) -> i32 {
        let pos = pos.min(self.values.len());
        let index = self.values.len() as i32;
        value.set_index(index);
        self.values.insert(pos, value);
        self.rebuild_positions();
        index
    }

    fn rebuild_positions(&mut self) {
        self.index_to_pos = vec![0; self.values.len()];
        for (pos, value) in self.values.iter().enumerate() {
            self.index_to_pos[value.index() as usize] = pos;
        }
    }

    /// 逻辑索引在物理顺序中的位置
    pub fn position_of(&self, index: i32) -> Option<usize> {
        self.position(index).ok()
    }

    /// 物理顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.values.iter_mut()
    }

    /// 逻辑索引顺序遍历（写出文件时使用）
    pub fn iter_by_index(&self) -> impl Iterator<Item = &T> {
        self.index_to_pos.iter().map(move |&pos| &self.values[pos])
    }

    /// 物理顺序中的最后一个实体
    pub fn last(&self) -> Option<&T> {
        self.values.last()
    }
}

/// 支持名称查找的容器；重名时名称指向最先加入的实体
#[derive(Clone, Debug)]
pub struct NamedCollection<T: Named> {
    inner: IndexedCollection<T>,
    name_to_index: HashMap<String, i32>,
}

impl<T: Named> Default for NamedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Named> NamedCollection<T> {
    pub fn new() -> Self {
        Self {
            inner: IndexedCollection::new(),
            name_to_index: HashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: IndexedCollection::with_capacity(capacity),
            name_to_index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, index: i32) -> bool {
        self.inner.contains(index)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn get(&self, index: i32) -> Result<&T> {
        self.inner.get(index)
    }

    pub fn get_mut(&mut self, index: i32) -> Result<&mut T> {
        self.inner.get_mut(index)
    }

    pub fn index_of(&self, name: &str) -> Option<i32> {
        self.name_to_index.get(name).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Result<&T> {
        let index = self
            .index_of(name)
            .ok_or_else(|| MmdError::NameNotFound(name.to_string()))?;
        self.inner.get(index)
    }

    pub fn get_mut_by_name(&mut self, name: &str) -> Result<&mut T> {
        let index = self
            .index_of(name)
            .ok_or_else(|| MmdError::NameNotFound(name.to_string()))?;
        self.inner.get_mut(index)
    }

    /// 追加（文件中允许重名）
    pub fn append(&mut self, value: T) -> i32 {
        let name = value.name().to_string();
        let index = self.inner.append(value);
        self.name_to_index.entry(name).or_insert(index);
        index
    }

    /// 追加，名称已存在时返回 `NameConflict`
    pub fn append_unique(&mut self, value: T) -> Result<i32> {
        if self.contains_name(value.name()) {
            return Err(MmdError::NameConflict(value.name().to_string()));
        }
        Ok(self.append(value))
    }

    /// 物理插入到 `pos`，名称必须唯一
    pub fn insert_at(&mut self, pos: usize, value: T) -> Result<i32> {
        if self.contains_name(value.name()) {
            return Err(MmdError::NameConflict(value.name().to_string()));
        }
        let name = value.name().to_string();
        let index = self.inner.insert_at(pos, value);
        self.name_to_index.insert(name, index);
        Ok(index)
    }

    /// 覆盖同索引实体，名称必须一致（改名请用 [`rename`](Self::rename)）
    pub fn update(&mut self, value: T) -> Result<()> {
        let current = self.inner.get(value.index())?;
        if current.name() != value.name() {
            return Err(MmdError::NameMismatch {
                expected: current.name().to_string(),
                actual: value.name().to_string(),
            });
        }
        self.inner.update(value)
    }

    pub fn rename(&mut self, index: i32, name: &str) -> Result<()> {
        if let Some(existing) = self.index_of(name) {
            if existing == index {
                return Ok(());
            }
            return Err(MmdError::NameConflict(name.to_string()));
        }
        let entity = self.inner.get_mut(index)?;
        let old = entity.name().to_string();
        entity.set_name(name.to_string());
        if self.name_to_index.get(&old) == Some(&index) {
            self.name_to_index.remove(&old);
        }
        self.name_to_index.insert(name.to_string(), index);
        Ok(())
    }

    pub fn position_of(&self, index: i32) -> Option<usize> {
        self.inner.position_of(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.inner.iter_mut()
    }

    pub fn iter_by_index(&self) -> impl Iterator<Item = &T> {
        self.inner.iter_by_index()
    }

    pub fn last(&self) -> Option<&T> {
        self.inner.last()
    }
}

//! DirectX `.x` 导入
//!
//! 三种方言（文本、二进制、MSZIP 压缩二进制）先解析成同一棵 [`XObject`] 树，
//! 再由 [`mesh`] 统一转换成 PMX 模型。

mod binary;
mod mesh;
pub mod mszip;
mod text;

use std::fs;
use std::path::Path;

use crate::model::PmxModel;
use crate::{MmdError, Result};

/// 头部长度（`xof 0303txt 0032`）
pub const HEADER_SIZE: usize = 16;

/// 文件方言
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XFormat {
    Text,
    Binary,
    CompressedBinary,
}

/// 数据对象中的一个子节点
#[derive(Clone, Debug, PartialEq)]
pub enum XChild {
    Object(XObject),
    /// `{ 名字 }` 形式的引用
    Reference(String),
}

/// 一个数据对象：模板名、可选实例名、按出现顺序展平的数值和字符串
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XObject {
    pub template: String,
    pub name: Option<String>,
    pub values: Vec<f64>,
    pub strings: Vec<String>,
    pub children: Vec<XChild>,
}

impl XObject {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn objects(&self) -> impl Iterator<Item = &XObject> {
        self.children.iter().filter_map(|c| match c {
            XChild::Object(o) => Some(o),
            XChild::Reference(_) => None,
        })
    }
}

/// 根据 16 字节头部判断方言
pub fn detect(data: &[u8]) -> Result<XFormat> {
    if data.len() < HEADER_SIZE {
        return Err(MmdError::ParseFailed("x header is truncated".into()));
    }
    if &data[0..4] != b"xof " {
        return Err(MmdError::BadFormat("missing xof signature".into()));
    }
    match &data[8..12] {
        b"txt " => Ok(XFormat::Text),
        b"bin " | b"tzip" => Ok(XFormat::Binary),
        b"bzip" => Ok(XFormat::CompressedBinary),
        other => Err(MmdError::BadFormat(format!(
            "unsupported x format {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// 解析整个 `.x` 文件内容
pub fn read_x(data: &[u8]) -> Result<PmxModel> {
    let format = detect(data)?;
    let objects = match format {
        XFormat::Text => text::parse(&data[HEADER_SIZE..])?,
        XFormat::Binary => binary::parse(data)?,
        XFormat::CompressedBinary => {
            let inflated = mszip::decompress(data)?;
            binary::parse(&inflated)?
        }
    };
    log::debug!("x file ({:?}) parsed: {} top-level objects", format, objects.len());

    let mut model = PmxModel::new();
    mesh::build_model(&objects, &mut model)?;
    model.ensure_center_bone()?;

    log::info!(
        "X loaded: vertices={}, faces={}, materials={}, textures={}",
        model.vertices.len(),
        model.faces.len(),
        model.materials.len(),
        model.textures.len()
    );
    Ok(model)
}

pub fn read_x_file<P: AsRef<Path>>(path: P) -> Result<PmxModel> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MmdError::FileNotFound(path.to_path_buf()),
        _ => MmdError::Io(e),
    })?;
    let mut model = read_x(&data)?;
    if let Some(stem) = path.file_stem() {
        model.name = stem.to_string_lossy().into_owned();
    }
    model.path = Some(path.to_path_buf());
    Ok(model)
}

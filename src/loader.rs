//! 按扩展名加载模型

use std::path::{Path, PathBuf};

use crate::model::PmxModel;
use crate::pmx::read_pmx_file;
use crate::xfile::read_x_file;
use crate::{MmdError, Result};

const SUPPORTED: &str = ".pmx or .x";

/// 读取 `.pmx` 或 `.x`，并检查索引一致性
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<PmxModel> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(MmdError::FileNotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let model = match extension.as_str() {
        "pmx" => read_pmx_file(path)?,
        "x" => read_x_file(path)?,
        _ => {
            return Err(MmdError::BadExtension {
                path: path.to_path_buf(),
                expected: SUPPORTED.to_string(),
            })
        }
    };
    model.validate()?;
    Ok(model)
}

/// 纹理相对模型所在目录的完整路径
pub fn texture_path(model: &PmxModel, texture_index: i32) -> Option<PathBuf> {
    let texture = model.textures.get(texture_index).ok()?;
    let dir = model
        .path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    // 模型里常见 Windows 分隔符
    let relative: PathBuf = texture.name.split(['\\', '/']).collect();
    Some(dir.join(relative))
}

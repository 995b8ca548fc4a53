//! PMX 2.0 / 2.1 二进制读写

mod reader;
pub mod text;
mod writer;

pub use reader::{read_pmx, read_pmx_file};
pub use writer::{write_pmx, write_pmx_file};

/// 文件签名
pub const SIGNATURE: &[u8; 4] = b"PMX ";

/// 头部中各索引的字节宽度
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexSizes {
    pub vertex: u8,
    pub texture: u8,
    pub material: u8,
    pub bone: u8,
    pub morph: u8,
    pub rigid_body: u8,
}

impl IndexSizes {
    /// 顶点索引为无符号，最小宽度
    pub fn for_vertex_count(count: usize) -> u8 {
        if count < 0x100 {
            1
        } else if count < 0x10000 {
            2
        } else {
            4
        }
    }

    /// 其余索引为有符号（-1 表示无），最小宽度
    pub fn for_signed_count(count: usize) -> u8 {
        if count < 0x80 {
            1
        } else if count < 0x8000 {
            2
        } else {
            4
        }
    }
}

pub(crate) fn valid_index_size(size: u8) -> bool {
    matches!(size, 1 | 2 | 4)
}

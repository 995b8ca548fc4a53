//! 文本编码转换（UTF-16LE / UTF-8 / Shift-JIS）

use encoding_rs::{SHIFT_JIS, UTF_16LE};

use crate::model::TextEncoding;

pub fn decode(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Utf16Le => {
            let (decoded, _) = UTF_16LE.decode_without_bom_handling(bytes);
            decoded.into_owned()
        }
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
    }
}

pub fn encode(text: &str, encoding: TextEncoding) -> Vec<u8> {
    match encoding {
        // encoding_rs 不支持编码为 UTF-16
        TextEncoding::Utf16Le => text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect(),
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
    }
}

/// 解码 Shift-JIS 字符串，截断到第一个 NUL
pub fn decode_shift_jis(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let (decoded, _, _) = SHIFT_JIS.decode(&bytes[..end]);
    decoded.into_owned()
}

pub fn encode_shift_jis(text: &str) -> Vec<u8> {
    let (encoded, _, _) = SHIFT_JIS.encode(text);
    encoded.into_owned()
}

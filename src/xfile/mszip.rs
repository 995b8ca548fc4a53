//! MSZIP 解压
//!
//! 布局：16 字节头部，4 字节解压后总长度（含头部），然后若干块；
//! 每块为 u16 解压长度、u16 压缩长度、可选 `CK` 标记和原始 DEFLATE 数据。
//! 块之间共享 32 KiB 历史窗口。

use byteorder::{ByteOrder, LittleEndian};
use miniz_oxide::inflate::core::inflate_flags::TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF;
use miniz_oxide::inflate::core::{decompress as inflate, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use super::HEADER_SIZE;
use crate::{MmdError, Result};

const SIZE_FIELD: usize = 4;
const BLOCK_MAGIC: &[u8; 2] = b"CK";
/// DEFLATE 的最大压缩比
const MAX_INFLATE_RATIO: usize = 1032;
/// 输出缓冲区的余量，满缓冲时解码器不会在块尾前停下
const OUTPUT_SLACK: usize = 258;

fn truncated(what: &str) -> MmdError {
    MmdError::ParseFailed(format!("mszip: truncated {}", what))
}

/// 返回头部 + 解压后的记号流
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE + SIZE_FIELD {
        return Err(truncated("header"));
    }
    let final_size = LittleEndian::read_u32(&data[HEADER_SIZE..]) as usize;
    if final_size < HEADER_SIZE {
        return Err(MmdError::ParseFailed(format!("mszip: bad final size {}", final_size)));
    }
    let body_size = final_size - HEADER_SIZE;
    if body_size > data.len().saturating_mul(MAX_INFLATE_RATIO) {
        return Err(MmdError::ParseFailed(format!(
            "mszip: final size {} is impossible for {} input bytes",
            final_size,
            data.len()
        )));
    }

    let mut body: Vec<u8> = Vec::with_capacity(body_size);
    let mut pos = HEADER_SIZE + SIZE_FIELD;
    let mut blocks = 0;
    while pos < data.len() && body.len() < body_size {
        let header = data.get(pos..pos + 4).ok_or_else(|| truncated("block header"))?;
        let uncompressed = LittleEndian::read_u16(&header[0..2]) as usize;
        let compressed = LittleEndian::read_u16(&header[2..4]) as usize;
        pos += 4;
        let mut block = data
            .get(pos..pos + compressed)
            .ok_or_else(|| truncated("block"))?;
        pos += compressed;
        if block.starts_with(BLOCK_MAGIC) {
            block = &block[2..];
        }

        inflate_block(block, uncompressed, &mut body)?;
        blocks += 1;
    }
    if body.len() < body_size {
        return Err(truncated("data"));
    }
    body.truncate(body_size);
    log::debug!("mszip: {} blocks, {} bytes", blocks, final_size);

    let mut out = Vec::with_capacity(final_size);
    out.extend_from_slice(&data[..HEADER_SIZE]);
    out.extend_from_slice(&body);
    Ok(out)
}

/// 解压一块并追加到 `history` 末尾；之前的输出作为回溯字典
fn inflate_block(block: &[u8], uncompressed: usize, history: &mut Vec<u8>) -> Result<()> {
    let start = history.len();
    history.resize(start + uncompressed + OUTPUT_SLACK, 0);
    let mut state = DecompressorOxide::new();
    let (status, _, written) = inflate(
        &mut state,
        block,
        history,
        start,
        TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF,
    );
    match status {
        TINFLStatus::Done if written == uncompressed => {
            history.truncate(start + written);
            Ok(())
        }
        TINFLStatus::Done | TINFLStatus::HasMoreOutput => Err(MmdError::ParseFailed(format!(
            "mszip: block inflated to {} bytes, expected {}",
            written, uncompressed
        ))),
        other => Err(MmdError::ParseFailed(format!("mszip: inflate failed: {:?}", other))),
    }
}

/// 测试用压缩：按 `block_size` 切块，每块独立压缩
#[cfg(test)]
pub(crate) fn compress(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut out = data[..HEADER_SIZE].to_vec();
    out[8..12].copy_from_slice(b"bzip");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    for chunk in data[HEADER_SIZE..].chunks(block_size) {
        let deflated = miniz_oxide::deflate::compress_to_vec(chunk, 6);
        out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        out.extend_from_slice(&((deflated.len() + 2) as u16).to_le_bytes());
        out.extend_from_slice(BLOCK_MAGIC);
        out.extend_from_slice(&deflated);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 低位优先的位写入器，Huffman 码按高位优先写入
    struct BitWriter {
        bytes: Vec<u8>,
        bit: u32,
    }

    impl BitWriter {
        fn put(&mut self, value: u32, bits: u32) {
            for i in 0..bits {
                if self.bit % 8 == 0 {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 == 1 {
                    let last = self.bytes.len() - 1;
                    self.bytes[last] |= 1 << (self.bit % 8);
                }
                self.bit += 1;
            }
        }

        fn code(&mut self, code: u32, bits: u32) {
            for i in (0..bits).rev() {
                self.put((code >> i) & 1, 1);
            }
        }
    }

    #[test]
    fn test_round_trip_multiple_blocks() {
        let mut data = b"xof 0303bin 0032".to_vec();
        data.extend((0..5000u32).map(|i| (i % 251) as u8));
        let packed = compress(&data, 1024);
        let unpacked = decompress(&packed).unwrap();
        assert_eq!(&unpacked[HEADER_SIZE..], &data[HEADER_SIZE..]);
        assert_eq!(&unpacked[8..12], b"bzip");
    }

    #[test]
    fn test_second_block_reads_history() {
        // 第二块只有一个 (长度 4, 距离 4) 的回溯，必须依赖第一块的输出
        let mut bits = BitWriter { bytes: Vec::new(), bit: 0 };
        bits.put(1, 1); // BFINAL
        bits.put(1, 2); // 固定 Huffman
        bits.code(0b0000010, 7); // 258: 长度 4
        bits.code(3, 5); // 距离 4
        bits.code(0, 7); // 256: 块结束
        let second = bits.bytes;

        let first = miniz_oxide::deflate::compress_to_vec(b"abcd", 6);
        let mut packed = b"xof 0303bzip0032".to_vec();
        packed.extend_from_slice(&24u32.to_le_bytes());
        packed.extend_from_slice(&4u16.to_le_bytes());
        packed.extend_from_slice(&((first.len() + 2) as u16).to_le_bytes());
        packed.extend_from_slice(b"CK");
        packed.extend_from_slice(&first);
        packed.extend_from_slice(&4u16.to_le_bytes());
        packed.extend_from_slice(&(second.len() as u16).to_le_bytes());
        packed.extend_from_slice(&second);

        let unpacked = decompress(&packed).unwrap();
        assert_eq!(&unpacked[HEADER_SIZE..], b"abcdabcd");
    }

    #[test]
    fn test_impossible_final_size_fails() {
        let mut packed = b"xof 0303bzip0032".to_vec();
        packed.extend_from_slice(&u32::MAX.to_le_bytes());
        packed.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decompress(&packed), Err(MmdError::ParseFailed(_))));
    }

    #[test]
    fn test_truncated_block_fails() {
        let mut data = b"xof 0303bin 0032".to_vec();
        data.extend_from_slice(&[7u8; 100]);
        let mut packed = compress(&data, 64);
        packed.truncate(packed.len() - 3);
        assert!(matches!(decompress(&packed), Err(MmdError::ParseFailed(_))));
    }
}

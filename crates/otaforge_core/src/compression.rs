use crate::error::{PatchError, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Cursor, Read, Write};

/// Compression variants found in boot image ramdisks and kernels, detected by
/// magic prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressedFormat {
    Gzip,
    Xz,
    Lzma,
    Zstd,
    Lz4Legacy,
    Raw,
}

impl CompressedFormat {
    pub fn name(self) -> &'static str {
        match self {
            CompressedFormat::Gzip => "gzip",
            CompressedFormat::Xz => "xz",
            CompressedFormat::Lzma => "lzma",
            CompressedFormat::Zstd => "zstd",
            CompressedFormat::Lz4Legacy => "lz4-legacy",
            CompressedFormat::Raw => "raw",
        }
    }
}

// lz4-legacy streams are sequences of blocks, each at most this big when
// uncompressed.
const LZ4_LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;
const LZ4_LEGACY_MAGIC: u32 = 0x184c2102;

pub fn detect_format(data: &[u8]) -> Option<CompressedFormat> {
    if data.len() >= 6
        && data[0] == 0xfd
        && &data[1..5] == b"7zXZ"
        && data[5] == 0x00
    {
        return Some(CompressedFormat::Xz);
    }

    match data {
        [0x1f, 0x8b, ..] => Some(CompressedFormat::Gzip),
        [0x5d, 0x00, 0x00, ..] => Some(CompressedFormat::Lzma),
        [0x28, 0xb5, 0x2f, 0xfd, ..] => Some(CompressedFormat::Zstd),
        [0x02, 0x21, 0x4c, 0x18, ..] => Some(CompressedFormat::Lz4Legacy),
        _ => None,
    }
}

/// Decompress `data` according to its magic. Unknown magic is an error unless
/// `raw_if_unknown` is set, in which case the input is passed through as
/// `Raw` (used for kernels, which may be uncompressed).
pub fn decompress(data: &[u8], raw_if_unknown: bool) -> Result<(Vec<u8>, CompressedFormat)> {
    let format = match detect_format(data) {
        Some(f) => f,
        None if raw_if_unknown => return Ok((data.to_vec(), CompressedFormat::Raw)),
        None => {
            return Err(PatchError::UnsupportedFormat(format!(
                "unknown compression magic: {:02x?}",
                &data[..data.len().min(6)]
            )));
        }
    };

    let mut output = Vec::new();

    match format {
        CompressedFormat::Gzip => {
            let mut decoder = GzDecoder::new(data);
            decoder
                .read_to_end(&mut output)
                .map_err(|e| PatchError::Corrupt(format!("gzip stream: {e}")))?;
        }
        CompressedFormat::Xz => {
            let mut reader = Cursor::new(data);
            lzma_rs::xz_decompress(&mut reader, &mut output)
                .map_err(|e| PatchError::Corrupt(format!("xz stream: {e:?}")))?;
        }
        CompressedFormat::Lzma => {
            let mut reader = Cursor::new(data);
            lzma_rs::lzma_decompress(&mut reader, &mut output)
                .map_err(|e| PatchError::Corrupt(format!("lzma stream: {e:?}")))?;
        }
        CompressedFormat::Zstd => {
            output = zstd::stream::decode_all(Cursor::new(data))
                .map_err(|e| PatchError::Corrupt(format!("zstd stream: {e}")))?;
        }
        CompressedFormat::Lz4Legacy => {
            output = lz4_legacy_decompress(data)?;
        }
        CompressedFormat::Raw => unreachable!(),
    }

    Ok((output, format))
}

pub fn compress(format: CompressedFormat, data: &[u8]) -> Result<Vec<u8>> {
    match format {
        CompressedFormat::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressedFormat::Xz => {
            let mut output = Vec::new();
            lzma_rs::xz_compress(&mut &data[..], &mut output)
                .map_err(|e| PatchError::Corrupt(format!("xz compression: {e:?}")))?;
            Ok(output)
        }
        CompressedFormat::Lzma => {
            let mut output = Vec::new();
            lzma_rs::lzma_compress(&mut &data[..], &mut output)
                .map_err(|e| PatchError::Corrupt(format!("lzma compression: {e:?}")))?;
            Ok(output)
        }
        CompressedFormat::Zstd => {
            zstd::stream::encode_all(Cursor::new(data), 0)
                .map_err(|e| PatchError::Corrupt(format!("zstd compression: {e}")))
        }
        CompressedFormat::Lz4Legacy => Ok(lz4_legacy_compress(data)),
        CompressedFormat::Raw => Ok(data.to_vec()),
    }
}

fn lz4_legacy_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut offset = 4usize;
    let mut buf = vec![0u8; LZ4_LEGACY_BLOCK_SIZE];

    while offset + 4 <= data.len() {
        let word = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        offset += 4;

        // Concatenated legacy streams repeat the magic between members.
        if word == LZ4_LEGACY_MAGIC {
            continue;
        }

        let block_size = word as usize;
        if offset + block_size > data.len() {
            return Err(PatchError::Corrupt("truncated lz4-legacy block".into()));
        }

        let n = lz4_flex::block::decompress_into(&data[offset..offset + block_size], &mut buf)
            .map_err(|e| PatchError::Corrupt(format!("lz4-legacy block: {e}")))?;
        output.extend_from_slice(&buf[..n]);
        offset += block_size;
    }

    Ok(output)
}

fn lz4_legacy_compress(data: &[u8]) -> Vec<u8> {
    let mut output = Vec::new();
    output.extend_from_slice(&LZ4_LEGACY_MAGIC.to_le_bytes());

    for chunk in data.chunks(LZ4_LEGACY_BLOCK_SIZE) {
        let compressed = lz4_flex::block::compress(chunk);
        output.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        output.extend_from_slice(&compressed);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"the quick brown fox jumps over the lazy dog";

    #[test]
    fn test_detect_known_magics() {
        assert_eq!(
            detect_format(&[0x1f, 0x8b, 0x08]),
            Some(CompressedFormat::Gzip)
        );
        assert_eq!(
            detect_format(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]),
            Some(CompressedFormat::Xz)
        );
        assert_eq!(
            detect_format(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Some(CompressedFormat::Zstd)
        );
        assert_eq!(
            detect_format(&[0x02, 0x21, 0x4c, 0x18, 0x00]),
            Some(CompressedFormat::Lz4Legacy)
        );
        assert_eq!(detect_format(b"070701-something"), None);
    }

    #[test]
    fn test_round_trip_all_formats() {
        for format in [
            CompressedFormat::Gzip,
            CompressedFormat::Xz,
            CompressedFormat::Lzma,
            CompressedFormat::Zstd,
            CompressedFormat::Lz4Legacy,
        ] {
            let compressed = compress(format, SAMPLE).unwrap();
            let (decompressed, detected) = decompress(&compressed, false).unwrap();
            assert_eq!(decompressed, SAMPLE, "format {}", format.name());
            assert_eq!(detected, format, "format {}", format.name());
        }
    }

    #[test]
    fn test_unknown_magic_is_error() {
        let result = decompress(b"not compressed at all", false);
        assert!(matches!(result, Err(PatchError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unknown_magic_raw_fallback() {
        let (data, format) = decompress(b"not compressed at all", true).unwrap();
        assert_eq!(data, b"not compressed at all");
        assert_eq!(format, CompressedFormat::Raw);
    }

    #[test]
    fn test_compression_is_deterministic() {
        for format in [CompressedFormat::Gzip, CompressedFormat::Lz4Legacy] {
            let a = compress(format, SAMPLE).unwrap();
            let b = compress(format, SAMPLE).unwrap();
            assert_eq!(a, b);
        }
    }
}

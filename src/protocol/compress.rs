//! Compressor dispatch for OP_COMPRESSED payloads.

use std::io::Read;

use super::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub fn from_u8(id: u8) -> Result<Self, DecodeError> {
        match id {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Snappy),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Zstd),
            other => Err(DecodeError::UnknownCompressor(other)),
        }
    }
}

pub fn decompress(id: CompressorId, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match id {
        CompressorId::Noop => Ok(data.to_vec()),
        // Mongo uses snappy's raw block format, not the framed one.
        CompressorId::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| DecodeError::DecompressionFailed(e.to_string())),
        CompressorId::Zlib => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;
            Ok(out)
        }
        CompressorId::Zstd => zstd::stream::decode_all(data)
            .map_err(|e| DecodeError::DecompressionFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_copies_input() {
        assert_eq!(decompress(CompressorId::Noop, b"abc").unwrap(), b"abc");
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(matches!(
            CompressorId::from_u8(7),
            Err(DecodeError::UnknownCompressor(7))
        ));
    }

    #[test]
    fn garbage_snappy_fails() {
        assert!(matches!(
            decompress(CompressorId::Snappy, &[0xff, 0xff, 0xff]),
            Err(DecodeError::DecompressionFailed(_))
        ));
    }
}

use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use bon::Builder;
use liblzma::stream::{Check, MtStreamBuilder, Stream};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use std::num::NonZero;
use validator::Validate;

/// Default compression level (balance of speed vs size)
static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
/// Maximum threads to prevent resource exhaustion
static DEFAULT_MAX_PARALLELIZATION: usize = 32;
/// Uncompressed size of one multi-threaded xz block
pub static MT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Configuration for XZ (LZMA) compression of the archive stream
///
/// Multi-threaded xz emits output one block at a time. Blocks are capped at
/// [`MT_BLOCK_SIZE`] so output keeps flowing whatever the level and thread count.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct XzConfig {
    /// Compression level (0-9), defaults to 3
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,

    /// Number of compression threads, defaults to half of the available cores
    #[validate(range(min = 1))]
    thread: Option<u32>,
}

impl XzConfig {
    fn effective_thread(&self) -> u32 {
        self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| core / 2)
                .map(|t| t.clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
                .unwrap_or(1)
        })
    }
}

impl<W: Write> CompressorBuilder<W> for XzConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        let thread = self.effective_thread();

        tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

        let stream = if thread == 1 {
            Stream::new_easy_encoder(level, Check::Crc64)?
        } else {
            MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .block_size(MT_BLOCK_SIZE)
                .encoder()?
        };
        Ok(XzEncoder::new_stream(writer, stream).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::finish::Finish;
    use liblzma::read::XzDecoder;
    use std::io::{Cursor, Read};

    #[test]
    fn test_xz_config_default() {
        let config = XzConfig::default();
        assert!(config.level.is_none());
        assert!(config.thread.is_none());
        assert!(config.validate().is_ok());
        assert!(config.effective_thread() >= 1);
    }

    #[test]
    fn test_xz_config_validation() {
        assert!(XzConfig::builder().level(0).thread(1).build().validate().is_ok());
        assert!(XzConfig::builder().level(9).thread(8).build().validate().is_ok());
        assert!(XzConfig::builder().level(10).build().validate().is_err());
        assert!(XzConfig::builder().thread(0).build().validate().is_err());
    }

    #[test]
    fn test_xz_config_rejects_unknown_fields() {
        let res = serde_json::from_str::<XzConfig>(r#"{"level":1,"threads":2}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_build_compressor_single_and_multi_thread() {
        for thread in [1, 4] {
            let config = XzConfig::builder().level(1).thread(thread).build();
            let mut compressor = config.build_compressor(Cursor::new(Vec::new())).unwrap();
            assert!(matches!(compressor, Compressor::XzEncoder(_)));

            compressor.write_all(b"etcd member snapshot").unwrap();
            let compressed = compressor.finish().unwrap().into_inner();

            let mut decoded = String::new();
            XzDecoder::new(compressed.as_slice())
                .read_to_string(&mut decoded)
                .unwrap();
            assert_eq!(decoded, "etcd member snapshot");
        }
    }

    #[test]
    fn test_build_compressor_rejects_out_of_range_level() {
        for thread in [1, 2] {
            let config = XzConfig::builder().level(10).thread(thread).build();
            assert!(config.build_compressor(Cursor::new(Vec::new())).is_err());
        }
    }

    #[test]
    fn test_xz_config_serialization_skips_none() {
        let config = XzConfig::builder().level(6).build();
        let serialized = serde_json::to_string(&config).unwrap();
        assert_eq!(serialized, r#"{"level":6}"#);

        let deserialized: XzConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}

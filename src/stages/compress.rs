//! Streaming compression stage.
//!
//! Thin selection layer over the async-compression tokio encoders. The
//! chosen algorithm is recorded per-archive through the filename extension,
//! so restore can pick the matching decoder without side metadata.

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use tokio::io::{AsyncBufRead, AsyncRead};

use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlgo {
    Zstd,
    Gzip,
}

impl CompressAlgo {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "zstd" => Ok(CompressAlgo::Zstd),
            "gzip" => Ok(CompressAlgo::Gzip),
            other => Err(AgentError::Config(format!(
                "unknown compression algorithm '{}' (expected zstd or gzip)",
                other
            ))),
        }
    }

    /// Filename extension recorded in the remote path
    pub fn ext(&self) -> &'static str {
        match self {
            CompressAlgo::Zstd => "zst",
            CompressAlgo::Gzip => "gz",
        }
    }

    pub fn from_ext(ext: &str) -> Result<Self> {
        match ext {
            "zst" => Ok(CompressAlgo::Zstd),
            "gz" => Ok(CompressAlgo::Gzip),
            other => Err(AgentError::Compression(format!(
                "unknown compression extension '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressAlgo::Zstd => "zstd",
            CompressAlgo::Gzip => "gzip",
        }
    }
}

/// Wrap a raw byte source in the configured streaming compressor.
pub fn compress_reader<R>(
    algo: CompressAlgo,
    level: i32,
    reader: R,
) -> Box<dyn AsyncRead + Send + Unpin>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    match algo {
        CompressAlgo::Zstd => Box::new(ZstdEncoder::with_quality(reader, Level::Precise(level))),
        CompressAlgo::Gzip => Box::new(GzipEncoder::with_quality(reader, Level::Precise(level))),
    }
}

/// Wrap a compressed byte source in the matching streaming decompressor.
pub fn decompress_reader<R>(algo: CompressAlgo, reader: R) -> Box<dyn AsyncRead + Send + Unpin>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    match algo {
        CompressAlgo::Zstd => Box::new(ZstdDecoder::new(reader)),
        CompressAlgo::Gzip => Box::new(GzipDecoder::new(reader)),
    }
}

use std::io::Write;

use anyhow::{bail, Context, Result};

/// Request body compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl Compression {
    /// Parse a configured compression name. Empty means none.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "none" | "" => Self::None,
            "gzip" => Self::Gzip,
            "zstd" => Self::Zstd,
            "zlib" => Self::Zlib,
            "snappy" => Self::Snappy,
            other => bail!("unsupported compression: {other}"),
        })
    }

    /// `Content-Encoding` header value, if the body is encoded.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).context("gzip write")?;
                encoder.finish().context("gzip finish")
            }
            Self::Zstd => zstd::encode_all(data, 0).context("zstd encode"),
            Self::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).context("zlib write")?;
                encoder.finish().context("zlib finish")
            }
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .context("snappy encode"),
        }
    }
}

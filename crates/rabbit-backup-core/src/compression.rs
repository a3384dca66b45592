//! Compression codecs wrapping archive containers.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, BufReader, Read, Write};

use crate::config::CompressionType;
use crate::{Error, Result};

/// Default compression level for zstd
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Default compression level for gzip (best compression)
pub const DEFAULT_GZIP_LEVEL: i32 = 9;

/// Default level for the given codec
pub fn default_level(compression: CompressionType) -> i32 {
    match compression {
        CompressionType::Gzip => DEFAULT_GZIP_LEVEL,
        CompressionType::Zstd => DEFAULT_ZSTD_LEVEL,
        CompressionType::Lz4 | CompressionType::None => 0,
    }
}

/// Get file extension for compression type
pub fn extension(compression: CompressionType) -> &'static str {
    match compression {
        CompressionType::None => "tar",
        CompressionType::Gzip => "tgz",
        CompressionType::Zstd => "tar.zst",
        CompressionType::Lz4 => "tar.lz4",
    }
}

/// Detect compression type from file extension
pub fn detect_from_extension(key: &str) -> CompressionType {
    if key.ends_with(".tgz") || key.ends_with(".tar.gz") {
        CompressionType::Gzip
    } else if key.ends_with(".zst") {
        CompressionType::Zstd
    } else if key.ends_with(".lz4") {
        CompressionType::Lz4
    } else {
        CompressionType::None
    }
}

/// Streaming compressor over an inner writer.
pub enum Encoder<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Create an encoder for the given codec and level
    pub fn new(inner: W, compression: CompressionType, level: i32) -> Result<Self> {
        Ok(match compression {
            CompressionType::None => Encoder::None(inner),
            CompressionType::Gzip => {
                let level = level.clamp(0, 9) as u32;
                Encoder::Gzip(GzEncoder::new(inner, flate2::Compression::new(level)))
            }
            CompressionType::Zstd => Encoder::Zstd(
                zstd::Encoder::new(inner, level)
                    .map_err(|e| Error::Compression(format!("Failed to create zstd encoder: {}", e)))?,
            ),
            CompressionType::Lz4 => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
        })
    }

    /// Finalize the compressed stream and hand back the inner writer
    pub fn finish(self) -> Result<W> {
        match self {
            Encoder::None(w) => Ok(w),
            Encoder::Gzip(e) => e
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish gzip stream: {}", e))),
            Encoder::Zstd(e) => e
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish zstd stream: {}", e))),
            Encoder::Lz4(e) => e
                .finish()
                .map_err(|e| Error::Compression(format!("Failed to finish lz4 stream: {}", e))),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::None(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
            Encoder::Lz4(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::None(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
            Encoder::Lz4(e) => e.flush(),
        }
    }
}

/// Wrap a reader with the decompressor for the given codec
pub fn decoder<R: Read + 'static>(reader: R, compression: CompressionType) -> Result<Box<dyn Read>> {
    Ok(match compression {
        CompressionType::None => Box::new(reader),
        CompressionType::Gzip => Box::new(GzDecoder::new(reader)),
        CompressionType::Zstd => Box::new(
            zstd::Decoder::with_buffer(BufReader::new(reader))
                .map_err(|e| Error::Compression(format!("Failed to create zstd decoder: {}", e)))?,
        ),
        CompressionType::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
    })
}

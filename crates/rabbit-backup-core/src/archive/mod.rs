//! Archive units: compressed tar containers of batched messages.
//!
//! ## Unit layout
//!
//! ```text
//! <index>_messages_<count>.tgz
//! └── gzip (or zstd / lz4 / none)
//!     └── tar
//!         ├── PAX header: SCHILY.xattr.amqp.routingKey=orders.created
//!         │               SCHILY.xattr.amqp.Headers.int.retries=3
//!         ├── 3f0c…-uuid   (mode 0644, message body)
//!         └── ...
//! ```
//!
//! Entry names carry no meaning; entries are unpacked in the order they
//! were appended.

mod reader;
mod writer;

pub use reader::{ArchiveReader, Messages};
pub use writer::{ArchiveWriter, ArchiveWriterConfig, SealedUnit};

use crate::compression;
use crate::config::CompressionType;

/// PAX record prefix under which metadata entries are stored
pub const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// File mode of every message entry
pub const ENTRY_MODE: u32 = 0o644;

/// Storage key for a sealed unit
pub fn unit_key(index: u64, message_count: usize, compression: CompressionType) -> String {
    format!(
        "{}_messages_{}.{}",
        index,
        message_count,
        compression::extension(compression)
    )
}

/// Parse `(index, message_count)` back out of a unit key or file name
pub fn parse_unit_key(key: &str) -> Option<(u64, usize)> {
    let name = key.rsplit('/').next()?;
    let (index, rest) = name.split_once("_messages_")?;
    let count = rest.split('.').next()?;
    Some((index.parse().ok()?, count.parse().ok()?))
}

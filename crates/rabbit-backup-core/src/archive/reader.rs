//! Archive reader producing the messages held by a sealed unit.

use bytes::Bytes;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, trace};

use super::PAX_XATTR_PREFIX;
use crate::codec::{self, MetadataEntry};
use crate::compression;
use crate::config::CompressionType;
use crate::message::Message;
use crate::{Error, Result};

/// Reader over one archive unit.
///
/// Messages are produced lazily with only the current entry held in memory.
/// Reading again requires reopening the source.
pub struct ArchiveReader {
    archive: tar::Archive<Box<dyn Read>>,
    source_name: String,
}

impl ArchiveReader {
    /// Wrap a raw unit stream compressed with `compression`
    pub fn new<R: Read + 'static>(
        reader: R,
        compression: CompressionType,
        source_name: impl Into<String>,
    ) -> Result<Self> {
        let source_name = source_name.into();
        let decoder = compression::decoder(reader, compression)
            .map_err(|e| Error::decode(&source_name, e))?;

        Ok(Self {
            archive: tar::Archive::new(decoder),
            source_name,
        })
    }

    /// Open a unit file, detecting the codec from its extension
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let file = File::open(path)?;
        let compression = compression::detect_from_extension(&name);
        debug!("Opening {} ({:?})", name, compression);
        Self::new(file, compression, name)
    }

    /// Read a unit held in memory, detecting the codec from its key
    pub fn from_bytes(data: Bytes, key: &str) -> Result<Self> {
        Self::new(
            Cursor::new(data),
            compression::detect_from_extension(key),
            key,
        )
    }

    /// Iterate over the unit's messages in stored order
    pub fn messages(&mut self) -> Result<Messages<'_>> {
        let entries = self
            .archive
            .entries()
            .map_err(|e| Error::decode(&self.source_name, e))?;

        Ok(Messages {
            entries,
            source_name: &self.source_name,
            done: false,
        })
    }
}

/// Lazy sequence of messages from one unit.
///
/// Ends after the first decode error.
pub struct Messages<'a> {
    entries: tar::Entries<'a, Box<dyn Read>>,
    source_name: &'a str,
    done: bool,
}

impl Messages<'_> {
    fn next_message(&mut self) -> Result<Option<Message>> {
        for entry in self.entries.by_ref() {
            let mut entry = entry.map_err(|e| Error::decode(self.source_name, e))?;

            if entry.header().entry_type() != tar::EntryType::Regular {
                trace!(
                    "Skipping {:?} entry in {}",
                    entry.header().entry_type(),
                    self.source_name
                );
                continue;
            }

            let metadata = read_metadata(&mut entry)
                .map_err(|e| Error::decode(self.source_name, e))?;

            let mut body = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut body)
                .map_err(|e| Error::decode(self.source_name, e))?;

            return Ok(Some(codec::decode(body, &metadata)));
        }

        Ok(None)
    }
}

impl Iterator for Messages<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Collect the metadata stored in an entry's PAX records
fn read_metadata<R: Read>(entry: &mut tar::Entry<'_, R>) -> std::io::Result<MetadataEntry> {
    let mut metadata = MetadataEntry::new();

    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(metadata);
    };

    for extension in extensions {
        let extension = extension?;
        let (Ok(key), Ok(value)) = (extension.key(), extension.value()) else {
            continue;
        };
        if let Some(key) = key.strip_prefix(PAX_XATTR_PREFIX) {
            metadata.insert(key.to_string(), value.to_string());
        }
    }

    Ok(metadata)
}

//! Archive writer that batches messages into sealed units.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{unit_key, ENTRY_MODE, PAX_XATTR_PREFIX};
use crate::codec;
use crate::compression::{self, Encoder};
use crate::config::{BackupOptions, CompressionType};
use crate::error::BrokerError;
use crate::message::{AckRequest, Message};
use crate::metrics::PerformanceMetrics;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Configuration for the archive writer
#[derive(Debug, Clone)]
pub struct ArchiveWriterConfig {
    /// Messages per unit before it is sealed (default: 1000)
    pub batch_size: usize,
    /// Compression codec wrapping the tar stream
    pub compression: CompressionType,
    /// Codec level
    pub compression_level: i32,
}

impl Default for ArchiveWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            compression: CompressionType::Gzip,
            compression_level: compression::DEFAULT_GZIP_LEVEL,
        }
    }
}

impl From<&BackupOptions> for ArchiveWriterConfig {
    fn from(options: &BackupOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            compression: options.compression,
            compression_level: options.effective_compression_level(),
        }
    }
}

/// A unit that has been persisted and can no longer change
#[derive(Debug, Clone)]
pub struct SealedUnit {
    /// Storage key (`<index>_messages_<count>.<ext>`)
    pub key: String,
    /// Final path or URL reported by the storage backend
    pub location: String,
    /// Unit index, starting at 1
    pub index: u64,
    /// Messages held by the unit
    pub message_count: usize,
    /// Highest delivery tag in the unit, if any message carried one
    pub max_delivery_tag: Option<u64>,
    /// Sum of message body sizes
    pub uncompressed_size: u64,
    /// Size of the persisted unit
    pub compressed_size: u64,
    /// Persisted bytes
    pub data: Bytes,
}

type UnitBuilder = tar::Builder<Encoder<Vec<u8>>>;

/// Groups accepted messages into archive units.
///
/// A unit is sealed when it holds `batch_size` messages, or on [`finish`]
/// if it is non-empty. Sealing persists the unit and only then emits one
/// cumulative [`AckRequest`] for the highest delivery tag it holds, so a
/// crash at any point leaves unpersisted messages unacknowledged.
///
/// [`finish`]: ArchiveWriter::finish
pub struct ArchiveWriter {
    config: ArchiveWriterConfig,
    storage: Arc<dyn StorageBackend>,
    acks: mpsc::Sender<AckRequest>,
    metrics: Arc<PerformanceMetrics>,
    mirror: Option<Arc<dyn StorageBackend>>,
    uploads: JoinSet<()>,

    /// Open unit
    builder: UnitBuilder,
    /// Messages in the open unit
    count: usize,
    /// Highest delivery tag in the open unit
    max_tag: Option<u64>,
    /// Body bytes in the open unit
    uncompressed_bytes: u64,
    /// Index the open unit will be sealed under
    next_index: u64,
}

impl ArchiveWriter {
    /// Create a writer with an empty open unit
    pub fn new(
        config: ArchiveWriterConfig,
        storage: Arc<dyn StorageBackend>,
        acks: mpsc::Sender<AckRequest>,
        metrics: Arc<PerformanceMetrics>,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }
        let builder = open_unit(&config)?;

        Ok(Self {
            config,
            storage,
            acks,
            metrics,
            mirror: None,
            uploads: JoinSet::new(),
            builder,
            count: 0,
            max_tag: None,
            uncompressed_bytes: 0,
            next_index: 1,
        })
    }

    /// Also upload every sealed unit to `mirror`, best effort
    pub fn with_mirror(mut self, mirror: Arc<dyn StorageBackend>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Messages in the open unit
    pub fn pending(&self) -> usize {
        self.count
    }

    /// Append a message to the open unit, sealing it once it is full
    pub async fn accept(&mut self, message: Message) -> Result<Option<SealedUnit>> {
        self.append(&message)?;

        if self.count >= self.config.batch_size {
            return self.seal().await.map(Some);
        }
        Ok(None)
    }

    /// Seal the trailing unit if it holds anything and wait for mirror uploads.
    pub async fn finish(mut self) -> Result<Option<SealedUnit>> {
        let sealed = if self.count > 0 {
            Some(self.seal().await?)
        } else {
            None
        };

        while let Some(result) = self.uploads.join_next().await {
            if let Err(e) = result {
                warn!("Upload task failed: {}", e);
            }
        }

        Ok(sealed)
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        let metadata = codec::encode(message);
        let records: Vec<(String, &[u8])> = metadata
            .iter()
            .map(|(key, value)| (format!("{}{}", PAX_XATTR_PREFIX, key), value.as_bytes()))
            .collect();

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(message.body.len() as u64);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        let name = uuid::Uuid::new_v4().to_string();
        self.builder
            .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))
            .and_then(|_| {
                self.builder
                    .append_data(&mut header, &name, message.body.as_ref())
            })
            .map_err(|e| Error::Compression(format!("Failed to append message to unit: {}", e)))?;

        self.count += 1;
        self.uncompressed_bytes += message.body.len() as u64;
        if let Some(tag) = message.delivery_tag {
            self.max_tag = Some(self.max_tag.map_or(tag, |max| max.max(tag)));
        }
        self.metrics.record_message(message.body.len() as u64);

        Ok(())
    }

    async fn seal(&mut self) -> Result<SealedUnit> {
        let start = Instant::now();
        let key = unit_key(self.next_index, self.count, self.config.compression);

        let builder = std::mem::replace(&mut self.builder, open_unit(&self.config)?);
        let data = builder
            .into_inner()
            .map_err(|e| Error::Compression(format!("Failed to finish tar stream: {}", e)))
            .and_then(Encoder::finish)
            .map(Bytes::from)?;

        self.storage
            .put(&key, data.clone())
            .await
            .map_err(|e| Error::Persist {
                key: key.clone(),
                message: e.to_string(),
            })?;

        let sealed = SealedUnit {
            location: self.storage.location(&key),
            key,
            index: self.next_index,
            message_count: self.count,
            max_delivery_tag: self.max_tag,
            uncompressed_size: self.uncompressed_bytes,
            compressed_size: data.len() as u64,
            data,
        };
        self.metrics
            .record_unit(sealed.compressed_size, start.elapsed());

        let ratio = if sealed.compressed_size > 0 {
            sealed.uncompressed_size as f64 / sealed.compressed_size as f64
        } else {
            1.0
        };
        info!(
            "Sealed {} with {} messages ({} -> {} bytes, {:.1}x compression)",
            sealed.location, sealed.message_count, sealed.uncompressed_size, sealed.compressed_size, ratio
        );

        if let Some(tag) = sealed.max_delivery_tag {
            self.acks
                .send(AckRequest::cumulative(tag))
                .await
                .map_err(|_| BrokerError::Ack {
                    tag,
                    message: "acknowledgement loop is no longer running".to_string(),
                })?;
            debug!("Requested cumulative ack up to delivery tag {}", tag);
        }

        if let Some(mirror) = &self.mirror {
            let mirror = Arc::clone(mirror);
            let key = sealed.key.clone();
            let data = sealed.data.clone();
            self.uploads.spawn(async move {
                match mirror.put(&key, data).await {
                    Ok(()) => info!("Uploaded {} to {}", key, mirror.location(&key)),
                    Err(e) => warn!("Failed to upload {}: {}", key, e),
                }
            });
        }

        self.count = 0;
        self.max_tag = None;
        self.uncompressed_bytes = 0;
        self.next_index += 1;

        Ok(sealed)
    }
}

fn open_unit(config: &ArchiveWriterConfig) -> Result<UnitBuilder> {
    let encoder = Encoder::new(Vec::new(), config.compression, config.compression_level)?;
    Ok(tar::Builder::new(encoder))
}

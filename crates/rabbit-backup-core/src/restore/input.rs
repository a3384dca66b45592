//! Enumerate the archive units a restore reads.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::archive::parse_unit_key;
use crate::{Error, Result};

/// Ordered list of unit files to restore.
///
/// A file is a single unit. A directory contributes its immediate regular
/// files; sub-directories and in-progress `.partial` files are skipped.
/// Files named like sealed units are ordered by unit index, anything else
/// follows in file name order.
#[derive(Debug, Clone)]
pub struct ArchiveInput {
    units: Vec<PathBuf>,
}

impl ArchiveInput {
    pub fn resolve(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| {
            Error::Config(format!("Cannot read input {}: {}", path.display(), e))
        })?;

        if metadata.is_file() {
            return Ok(Self {
                units: vec![path.to_path_buf()],
            });
        }

        let mut units = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if !entry.file_type()?.is_file() {
                debug!("Skipping {}: not a regular file", name);
                continue;
            }
            if name.ends_with(".partial") {
                debug!("Skipping unfinished unit {}", name);
                continue;
            }
            units.push(entry.path());
        }

        units.sort_by_cached_key(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let index = parse_unit_key(&name).map_or(u64::MAX, |(index, _)| index);
            (index, name)
        });

        info!("Found {} archive units in {}", units.len(), path.display());
        Ok(Self { units })
    }

    pub fn units(&self) -> &[PathBuf] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn into_units(self) -> Vec<PathBuf> {
        self.units
    }
}

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::record::SectorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Json,
    Cbor,
}

impl ArchiveFormat {
    pub fn from_path_and_option(path: &Path, format_opt: Option<&str>) -> Result<Self> {
        if let Some(format_str) = format_opt {
            return match format_str {
                "json" => Ok(ArchiveFormat::Json),
                "cbor" => Ok(ArchiveFormat::Cbor),
                _ => bail!("unsupported format: {}", format_str),
            };
        }

        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Ok(ArchiveFormat::Json),
            Some("cbor") => Ok(ArchiveFormat::Cbor),
            Some(ext) => bail!("unsupported file extension: .{}", ext),
            None => bail!("cannot determine archive format: no file extension"),
        }
    }
}

/// Every record of a storage directory, sorted by key
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SectorArchive {
    pub sectors: Vec<SectorRecord>,
}

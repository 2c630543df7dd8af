use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use super::format::{ArchiveFormat, SectorArchive};
use super::record::SectorRecord;
use crate::store::SectorStore;

fn is_cbor_eof(err: &ciborium::de::Error<std::io::Error>) -> bool {
    matches!(err, ciborium::de::Error::Io(io_err) if io_err.kind() == ErrorKind::UnexpectedEof)
}

pub fn read_archive(input: &Path, format: ArchiveFormat) -> Result<SectorArchive> {
    let input_file = File::open(input)
        .with_context(|| format!("failed to open archive at {}", input.display()))?;
    let reader = BufReader::new(input_file);

    match format {
        ArchiveFormat::Json => serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse JSON archive at {}", input.display())),
        ArchiveFormat::Cbor => {
            let mut sectors = Vec::new();
            let mut reader = reader;
            loop {
                match ciborium::from_reader::<SectorRecord, _>(&mut reader) {
                    Ok(record) => sectors.push(record),
                    Err(e) if is_cbor_eof(&e) => break,
                    Err(e) => {
                        return Err(anyhow::Error::msg(format!("{}", e))).with_context(|| {
                            format!("failed to parse CBOR archive at {}", input.display())
                        });
                    }
                }
            }
            Ok(SectorArchive { sectors })
        }
    }
}

pub fn write_archive(archive: &SectorArchive, output: &Path, format: ArchiveFormat) -> Result<()> {
    let output_file = File::create(output)
        .with_context(|| format!("failed to create archive at {}", output.display()))?;

    match format {
        ArchiveFormat::Json => {
            serde_json::to_writer_pretty(output_file, archive).with_context(|| {
                format!("failed to write JSON archive at {}", output.display())
            })?;
        }
        ArchiveFormat::Cbor => {
            let mut writer = BufWriter::new(output_file);
            for record in &archive.sectors {
                ciborium::into_writer(record, &mut writer).with_context(|| {
                    format!("failed to write CBOR archive at {}", output.display())
                })?;
            }
            writer
                .flush()
                .with_context(|| format!("failed to flush CBOR archive at {}", output.display()))?;
        }
    }

    Ok(())
}

/// Write every record in `store` to `output`, returning how many were written
pub fn export(store: &SectorStore, output: &Path, format: ArchiveFormat) -> Result<usize> {
    let mut archive = SectorArchive::default();
    for key in store.keys()? {
        let data = store.retrieve(key)?;
        debug!("exporting {} ({} bytes)", key, data.len());
        archive.sectors.push(SectorRecord::new(key, data));
    }
    write_archive(&archive, output, format)?;
    info!(
        "exported {} sectors from {} to {}",
        archive.sectors.len(),
        store.dir().display(),
        output.display()
    );
    Ok(archive.sectors.len())
}

/// Capture every record of the archive at `input` into `store`.
///
/// Existing records with the same key are overwritten.
pub fn import(input: &Path, store: &SectorStore, format: ArchiveFormat) -> Result<usize> {
    let archive = read_archive(input, format)?;
    for record in &archive.sectors {
        store.capture(record.key(), &record.data)?;
    }
    info!(
        "imported {} sectors from {} into {}",
        archive.sectors.len(),
        input.display(),
        store.dir().display()
    );
    Ok(archive.sectors.len())
}

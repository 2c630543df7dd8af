use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sector_rr::archive::{self, ArchiveFormat};
use sector_rr::cli::{Cli, Command};
use sector_rr::config::{Mode, MountConfig};
use sector_rr::store::{self, SectorStore};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Mount {
            target,
            mountpoint,
            datadir,
            replay,
            allow_other,
        } => mount(MountConfig {
            root: target,
            mountpoint,
            datadir,
            mode: Mode::from_replay_flag(replay),
            allow_other,
        }),
        Command::List { datadir } => list(&datadir),
        Command::Export {
            output,
            datadir,
            format,
        } => {
            let format = ArchiveFormat::from_path_and_option(&output, format.as_deref())?;
            archive::export(&existing_store(&datadir)?, &output, format)?;
            Ok(())
        }
        Command::Import {
            input,
            datadir,
            format,
        } => {
            let format = ArchiveFormat::from_path_and_option(&input, format.as_deref())?;
            store::ensure_dir(&datadir)?;
            archive::import(&input, &SectorStore::new(datadir), format)?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn mount(config: MountConfig) -> Result<()> {
    if !config.root.is_dir() {
        bail!("target {} is not a directory", config.root.display());
    }
    store::ensure_dir(&config.datadir)?;
    let config = Arc::new(MountConfig {
        root: absolute(&config.root)?,
        datadir: absolute(&config.datadir)?,
        ..config
    });
    info!(
        "{} mode: {} -> {}",
        config.mode,
        config.root.display(),
        config.mountpoint.display()
    );
    sector_rr::fuse::mount(config)
}

/// Resolve `path` against the current directory so it survives a later chdir
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("failed to resolve {}", path.display()))
}

fn existing_store(datadir: &Path) -> Result<SectorStore> {
    if !datadir.is_dir() {
        bail!("storage directory {} does not exist", datadir.display());
    }
    Ok(SectorStore::new(datadir))
}

fn list(datadir: &Path) -> Result<()> {
    let store = existing_store(datadir)?;
    let keys = store.keys()?;
    for key in &keys {
        let size = std::fs::metadata(store.record_path(*key))
            .with_context(|| format!("failed to stat record for {}", key))?
            .len();
        let note = if size < u64::from(key.length) {
            "  (short read)"
        } else {
            ""
        };
        println!("{}\t{}\t{}{}", key.offset, key.length, size, note);
    }
    info!("{} sectors in {}", keys.len(), datadir.display());
    Ok(())
}

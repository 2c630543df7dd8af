use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_DATADIR;

/// Capture and replay raw sector reads through a passthrough FUSE mount
#[derive(Parser, Debug)]
#[command(author, version, about, propagate_version = true)]
pub struct Cli {
    /// Log every filesystem operation, not just reads and writes
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount TARGET on MOUNTPOINT, capturing or replaying every read
    Mount {
        /// Directory to be mounted
        target: PathBuf,
        /// Directory on which the target is mounted
        mountpoint: PathBuf,
        /// Directory where sector records are stored
        #[arg(long, value_name = "DIR", default_value = DEFAULT_DATADIR)]
        datadir: PathBuf,
        /// Serve reads from previously captured sectors instead of the target
        #[arg(long, visible_alias = "emulate")]
        replay: bool,
        /// Let users other than the mounting user access the mount
        #[arg(long)]
        allow_other: bool,
    },
    /// List the sector records in a storage directory
    List {
        /// Directory where sector records are stored
        #[arg(long, value_name = "DIR", default_value = DEFAULT_DATADIR)]
        datadir: PathBuf,
    },
    /// Write every sector record of a storage directory to one archive file
    Export {
        /// Archive to write (extension determines format: .json or .cbor)
        output: PathBuf,
        /// Directory where sector records are stored
        #[arg(long, value_name = "DIR", default_value = DEFAULT_DATADIR)]
        datadir: PathBuf,
        /// Archive format (json or cbor). If not specified, inferred from file extension
        #[arg(
            short = 'f',
            long = "format",
            value_name = "FORMAT",
            value_parser = ["json", "cbor"]
        )]
        format: Option<String>,
    },
    /// Restore sector records from an archive file into a storage directory
    Import {
        /// Archive to read (extension determines format: .json or .cbor)
        input: PathBuf,
        /// Directory where sector records are stored
        #[arg(long, value_name = "DIR", default_value = DEFAULT_DATADIR)]
        datadir: PathBuf,
        /// Archive format (json or cbor). If not specified, inferred from file extension
        #[arg(
            short = 'f',
            long = "format",
            value_name = "FORMAT",
            value_parser = ["json", "cbor"]
        )]
        format: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn emulate_is_an_alias_for_replay() {
        let cli = Cli::parse_from(["sector-rr", "mount", "/srv/disk", "/mnt/disk", "--emulate"]);
        match cli.command {
            Command::Mount {
                replay, datadir, ..
            } => {
                assert!(replay);
                assert_eq!(datadir, PathBuf::from(DEFAULT_DATADIR));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

mod convert;
mod format;
mod record;

pub use convert::{export, import, read_archive, write_archive};
pub use format::{ArchiveFormat, SectorArchive};
pub use record::SectorRecord;

use std::io;

use libc::c_int;
use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single filesystem operation
#[derive(Debug, Error)]
pub enum OpError {
    #[error("backing store: {0}")]
    Backing(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown file handle {0}")]
    BadHandle(u64),
}

impl From<nix::Error> for OpError {
    fn from(e: nix::Error) -> Self {
        OpError::Backing(e.into())
    }
}

impl OpError {
    /// The errno reported back to the filesystem client.
    ///
    /// Backing errors keep their own code; anything from the sector store,
    /// a missing sector included, is an I/O error.
    pub fn errno(&self) -> c_int {
        match self {
            OpError::Backing(e) => e.raw_os_error().unwrap_or(libc::EIO),
            OpError::Store(_) => libc::EIO,
            OpError::BadHandle(_) => libc::EBADF,
        }
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SectorKey;

    #[test]
    fn errno_mapping() {
        let denied = OpError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(denied.errno(), libc::EACCES);

        let synthetic = OpError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(synthetic.errno(), libc::EIO);

        let missing = OpError::from(StoreError::SectorNotFound(SectorKey::new(4096, 512)));
        assert_eq!(missing.errno(), libc::EIO);

        assert_eq!(OpError::BadHandle(9).errno(), libc::EBADF);
        assert_eq!(OpError::from(nix::Error::ENOTEMPTY).errno(), libc::ENOTEMPTY);
    }
}

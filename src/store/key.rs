use std::fmt;
use std::str::FromStr;

/// Suffix shared by every record file in a storage directory
const RECORD_SUFFIX: &str = ".r";

/// Identifies one captured read: the offset it started at and the length
/// the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorKey {
    pub offset: u64,
    pub length: u32,
}

impl SectorKey {
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// Name of the record file holding this key's payload
    pub fn file_name(&self) -> String {
        format!("{}.{}{}", self.offset, self.length, RECORD_SUFFIX)
    }

    /// Exclusive end of the byte range this key covers
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(u64::from(self.length))
    }

    /// Whether `[offset, offset + len)` touches this key's range
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        self.length > 0 && len > 0 && offset < self.end() && self.offset < end
    }
}

impl fmt::Display for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {} length {}", self.offset, self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a sector record name: {0}")]
pub struct ParseKeyError(String);

impl FromStr for SectorKey {
    type Err = ParseKeyError;

    /// Parses a record file name such as `4096.512.r`
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseKeyError(name.to_string());
        let stem = name.strip_suffix(RECORD_SUFFIX).ok_or_else(invalid)?;
        let (offset, length) = stem.split_once('.').ok_or_else(invalid)?;
        // u64/u32 parsing accepts a leading '+', which file_name never writes
        if !is_decimal(offset) || !is_decimal(length) {
            return Err(invalid());
        }
        Ok(Self {
            offset: offset.parse().map_err(|_| invalid())?,
            length: length.parse().map_err(|_| invalid())?,
        })
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

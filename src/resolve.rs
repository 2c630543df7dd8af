use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Maps paths seen by filesystem clients onto the backing directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Strip one leading `/` from `virtual_path` and join it onto the root.
    ///
    /// No other normalization happens: `..` segments are kept, and a second
    /// leading `/` makes the result an absolute path outside the root.
    pub fn resolve(&self, virtual_path: &Path) -> PathBuf {
        let bytes = virtual_path.as_os_str().as_bytes();
        let relative = bytes.strip_prefix(b"/").unwrap_or(bytes);
        self.root.join(OsStr::from_bytes(relative))
    }

    /// Rewrite an absolute symlink target so it is relative to the root.
    ///
    /// Relative targets are returned unchanged.
    pub fn relativize(&self, target: &Path) -> PathBuf {
        if target.is_relative() {
            return target.to_path_buf();
        }
        let from: Vec<Component<'_>> = self.root.components().collect();
        let to: Vec<Component<'_>> = target.components().collect();
        let common = from
            .iter()
            .zip(to.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut relative = PathBuf::new();
        for _ in common..from.len() {
            relative.push("..");
        }
        for component in &to[common..] {
            relative.push(component.as_os_str());
        }
        if relative.as_os_str().is_empty() {
            relative.push(".");
        }
        relative
    }
}

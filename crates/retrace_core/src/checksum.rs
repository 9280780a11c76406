//! Code-unit checksums.
//!
//! Uses BLAKE3. A recording stores one checksum per code unit so a replay
//! against modified code is refused before any event is consumed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

/// A BLAKE3 digest (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Checksum of in-memory data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Checksum of a file's contents
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn of_file(path: &Path) -> io::Result<Self> {
        Ok(Self::compute(&std::fs::read(path)?))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, ChecksumError> {
        let bytes = hex::decode(hex).map_err(|_| ChecksumError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChecksumError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Checksum-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    /// Invalid hex encoding
    #[error("Invalid hex encoding")]
    InvalidHex,
    /// Invalid length (not 32 bytes)
    #[error("Invalid checksum length: {0} (expected 32)")]
    InvalidLength(usize),
}

/// Checksums of every regular file under `root`, keyed by `/`-separated
/// relative path. Directories are walked in name order.
///
/// # Errors
///
/// Returns error if any entry cannot be read
pub fn checksum_tree(root: &Path) -> io::Result<BTreeMap<String, Checksum>> {
    let mut out = BTreeMap::new();
    walk(root, "", &mut out)?;
    Ok(out)
}

fn walk(dir: &Path, prefix: &str, out: &mut BTreeMap<String, Checksum>) -> io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&entry.path(), &key, out)?;
        } else if kind.is_file() {
            out.insert(key, Checksum::of_file(&entry.path())?);
        }
    }
    Ok(())
}

/// Key of the running executable in [`program_checksums`]
pub const EXECUTABLE_KEY: &str = "<executable>";

/// Checksums identifying the running program: the executable image under
/// [`EXECUTABLE_KEY`], plus every file under `source_root` keyed by its
/// relative path.
///
/// # Errors
///
/// Returns error if the executable or any source file cannot be read
pub fn program_checksums(source_root: Option<&Path>) -> io::Result<BTreeMap<String, Checksum>> {
    let mut out = match source_root {
        Some(root) => checksum_tree(root)?,
        None => BTreeMap::new(),
    };
    out.insert(
        EXECUTABLE_KEY.to_string(),
        Checksum::of_file(&std::env::current_exe()?)?,
    );
    Ok(out)
}

/// Human-readable differences between two checksum tables, one line per
/// differing key. Empty when the tables match.
#[must_use]
pub fn diff_checksums(
    recorded: &BTreeMap<String, Checksum>,
    current: &BTreeMap<String, Checksum>,
) -> Vec<String> {
    let mut lines = Vec::new();
    for (key, expected) in recorded {
        match current.get(key) {
            None => lines.push(format!("{}: missing (recorded {})", key, expected)),
            Some(actual) if actual != expected => {
                lines.push(format!("{}: changed ({} -> {})", key, expected, actual));
            }
            Some(_) => {}
        }
    }
    for key in current.keys().filter(|k| !recorded.contains_key(*k)) {
        lines.push(format!("{}: added", key));
    }
    lines
}

//! Deterministic content hashing for source trees, resources and build fingerprints.

use std::{
    fmt::{Debug, Display, Formatter},
    fs,
    io,
    path::Path,
};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash {
    hash: [u8; 32],
}

impl ContentHash {
    pub fn hex(&self) -> String {
        self.hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// convert to hex the first 64 bits of this hash
    pub fn shorthex(&self) -> String {
        self.hash
            .iter()
            .map(|b| format!("{:02x}", b))
            .take(8)
            .collect()
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.shorthex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub fn hash_content(bytes: &[u8]) -> ContentHash {
    ContentHash {
        hash: Sha256::digest(bytes).into(),
    }
}

/// Hash of the canonical json form of `value`. Object keys are sorted at every
/// level so two structurally equal values always hash the same.
pub fn hash_object<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, serde_json::Error> {
    let canonical = canonicalize(serde_json::to_value(value)?);
    Ok(hash_content(&serde_json::to_vec(&canonical)?))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHash {
    /// Relative to the hashed root, `/` separated.
    pub name: String,
    pub hash: ContentHash,
}

/// Every regular file below `root` with its content hash, sorted by path.
/// Symlinks are followed, the same way the binary build archive does.
pub fn directory_listing(root: &Path) -> io::Result<Vec<FileHash>> {
    let mut listing = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        listing.push(FileHash {
            hash: hash_content(&fs::read(entry.path())?),
            name,
        });
    }
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(listing)
}

/// Hash of a whole tree: paths and contents matter, traversal order does not.
pub fn hash_directory(root: &Path) -> io::Result<ContentHash> {
    let listing = directory_listing(root)?;
    hash_object(&listing).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

//! Common types used throughout Capsule.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Identifier namespace inside a container.
///
/// Files, directories, and notes each draw ids from their own dense sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    File,
    Directory,
    Note,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdKind::File => "file",
            IdKind::Directory => "directory",
            IdKind::Note => "note",
        };
        f.write_str(name)
    }
}

/// A directory path inside a container, split into name segments.
///
/// This is a logical path matched against the directory forest, not a
/// filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirSegments {
    segments: Vec<String>,
}

impl DirSegments {
    /// The root path.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Create a path from name segments.
    ///
    /// # Errors
    /// - Returns error if a segment is empty or contains a separator
    pub fn from_segments(segments: Vec<String>) -> crate::Result<Self> {
        for seg in &segments {
            if seg.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path segment cannot be empty".to_string(),
                ));
            }
            if seg.contains('/') || seg.contains('\\') {
                return Err(crate::Error::InvalidInput(format!(
                    "Path segment '{}' cannot contain separators",
                    seg
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Parse a `/`-separated path. Leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        Self::from_segments(trimmed.split('/').map(String::from).collect())
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for DirSegments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            write!(f, "/{}", self.segments.join("/"))
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SensitiveBytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

use std::fmt;

use crate::error::ThumbnailFailure;

/// One file revision reported by the repository since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Change (changelist) number that produced the revision.
    pub change: u64,
    /// Depot path, e.g. `//depot/art/hero.psd`.
    pub path: String,
    pub revision: u32,
    /// Size of the revision's content in bytes.
    pub size: u64,
    /// Repository file type, e.g. `binary+l` or `symlink`.
    pub file_type: String,
}

impl ChangeEvent {
    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Lower-cased extension of the file name, without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }

    /// `path#revision`, the form used in log lines and repository commands.
    pub fn revision_spec(&self) -> String {
        format!("{}#{}", self.path, self.revision)
    }
}

/// Content handed to a converter.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SourceImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Uppercase hexadecimal MD5 of thumbnail bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Digest(format!("{:X}", md5::compute(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ThumbnailResult = Result<Digest, ThumbnailFailure>;

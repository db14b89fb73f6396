//! Eligibility checks applied to every change event before any content is
//! fetched.

use std::collections::HashSet;

use thiserror::Error;
use thumbservice_config::FilterConfig;

use crate::events::ChangeEvent;

/// Base file types that never carry image content.
const NON_CONTENT_TYPES: &[&str] = &["symlink"];

#[derive(Debug, Clone)]
pub struct FilterPolicy {
    max_file_size: Option<u64>,
    extensions: HashSet<String>,
}

impl FilterPolicy {
    pub fn new<I, S>(max_file_size: Option<u64>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            // 0 is "no limit", as in the configuration file.
            max_file_size: max_file_size.filter(|limit| *limit > 0),
            extensions: extensions
                .into_iter()
                .map(|ext| {
                    ext.as_ref().trim_start_matches('.').to_ascii_lowercase()
                })
                .collect(),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.max_file_size, &config.extensions)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterRejection {
    #[error("file size: {size} is larger than the maxFileSize")]
    TooLarge { size: u64, limit: u64 },

    #[error(
        "unsupported file type {file_type} ({})",
        .extension.as_deref().unwrap_or("no extension")
    )]
    UnsupportedType {
        file_type: String,
        extension: Option<String>,
    },

    /// The revision already carries a thumbnail digest.
    #[error("already has a {name} attribute")]
    ThumbnailPresent { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(FilterRejection),
}

/// Decide whether `event` should be converted. Size is checked first so an
/// oversize file is always reported as such, whatever its type.
pub fn accepts(event: &ChangeEvent, policy: &FilterPolicy) -> Verdict {
    if let Some(limit) = policy.max_file_size
        && event.size > limit
    {
        return Verdict::Reject(FilterRejection::TooLarge {
            size: event.size,
            limit,
        });
    }

    let extension = event.extension();
    let base_type = event
        .file_type
        .split('+')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let content_type = !NON_CONTENT_TYPES.contains(&base_type.as_str());
    let allowed = extension
        .as_ref()
        .is_some_and(|ext| policy.extensions.contains(ext));

    if content_type && allowed {
        Verdict::Accept
    } else {
        Verdict::Reject(FilterRejection::UnsupportedType {
            file_type: event.file_type.clone(),
            extension,
        })
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in the JSON file.
///
/// Every field is optional here; presence and value rules are applied when
/// the loader composes a [`Configuration`](crate::Configuration).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_executable: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_size: Option<FileThumbnailSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_arguments: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_timeout_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_conversions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p4_executable: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_change: Option<u64>,
    /// `-1` means "up to the head change at startup".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_change: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversions: Option<Vec<FileConversion>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct FileThumbnailSize {
    pub width: u32,
    pub height: u32,
}

/// One entry of the `conversions` list: a tool used for the files whose
/// extension it lists.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConversion {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convert_to_png: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_extension: Option<String>,
}

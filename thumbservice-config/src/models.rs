use std::path::{Path, PathBuf};
use std::time::Duration;

/// Attribute key written on each converted depot file.
pub const DEFAULT_ATTRIBUTE_NAME: &str = "thumb";

/// Placeholder replaced by the scratch copy of the source file.
pub const FILE_IN_PLACEHOLDER: &str = "$FILEIN";
/// Placeholder replaced by the path the converter must write to.
pub const FILE_OUT_PLACEHOLDER: &str = "$FILEOUT";
/// Placeholder replaced by the configured thumbnail width.
pub const WIDTH_PLACEHOLDER: &str = "$WIDTH";
/// Placeholder replaced by the configured thumbnail height.
pub const HEIGHT_PLACEHOLDER: &str = "$HEIGHT";

/// Raster formats accepted when no `extensions` list is configured.
/// Layered formats (psd, xcf, tiff) are included.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "bmp", "gif", "ico", "jpeg", "jpg", "png", "ppm", "psd", "tga", "tif",
    "tiff", "webp", "xcf",
];

/// Validated, immutable daemon configuration.
///
/// Loaded once at startup. Nothing mutates it afterwards; callers share it
/// behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub connection: ConnectionConfig,
    pub polling: PollingConfig,
    pub filter: FilterConfig,
    pub conversion: ConversionConfig,
    pub attribute_name: String,
    pub log_file: Option<PathBuf>,
    pub metadata: ConfigMetadata,
}

impl Configuration {
    pub fn client(&self) -> &str {
        &self.connection.client
    }

    pub fn poll_interval(&self) -> Duration {
        self.polling.interval
    }

    pub fn conversion_executable(&self) -> &Path {
        &self.conversion.executable
    }
}

/// Repository connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Workspace (client) name; never empty.
    pub client: String,
    /// `host:port` of the repository server.
    pub port: Option<String>,
    pub user: Option<String>,
    /// `p4` command line client used by the CLI adapter.
    pub p4_executable: PathBuf,
    /// Start here instead of at the persisted counter.
    pub first_change: Option<u64>,
    pub final_change: Option<FinalChange>,
}

/// Last change to process before the daemon stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalChange {
    Change(u64),
    /// Whatever the head change is when the first poll runs.
    Head,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub max_concurrent_conversions: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Upper bound on source size in bytes; `None` is unbounded.
    pub max_file_size: Option<u64>,
    /// Lower-cased extensions without the leading dot.
    pub extensions: Vec<String>,
}

/// Conversion tools. `rules` are tried first, by extension; `executable`
/// handles everything else.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Resolved, executable path of the default conversion tool.
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub timeout: Duration,
    pub thumbnail_size: ThumbnailSize,
    pub rules: Vec<ConversionRule>,
}

/// A tool dedicated to some extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRule {
    /// Lower-cased, without the leading dot.
    pub extensions: Vec<String>,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    /// Ask the tool for a `.png` file. Otherwise the output is named with
    /// `thumbnail_extension`, or the source extension when that is unset.
    pub convert_to_png: bool,
    pub thumbnail_extension: Option<String>,
}

impl ConversionRule {
    pub fn handles(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self {
            width: 160,
            height: 160,
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: PathBuf,
}

pub(crate) fn default_arguments() -> Vec<String> {
    vec![
        FILE_IN_PLACEHOLDER.to_string(),
        FILE_OUT_PLACEHOLDER.to_string(),
    ]
}

pub(crate) fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}

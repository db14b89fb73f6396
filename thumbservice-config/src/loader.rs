use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::{
    models::{
        ConfigMetadata, Configuration, ConnectionConfig, ConversionConfig,
        ConversionRule, DEFAULT_ATTRIBUTE_NAME, FILE_IN_PLACEHOLDER,
        FILE_OUT_PLACEHOLDER, FilterConfig, FinalChange, PollingConfig,
        ThumbnailSize, default_arguments, default_extensions,
    },
    sources::{FileConfig, FileConversion},
    validation::{self, ConfigWarnings},
};

const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_CONVERSION_TIMEOUT_SECS: f64 = 30.0;
const DEFAULT_SHUTDOWN_GRACE_SECS: f64 = 5.0;
const DEFAULT_P4_EXECUTABLE: &str = "p4";

/// Fatal configuration failure.
///
/// The `Display` text of each variant is the single diagnostic line printed
/// before the process exits; tooling greps for these exact strings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot find configuration file : {}", path.display())]
    NotFound { path: PathBuf },
    #[error("Error: Couldn't open config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Error: JSON format failure: {source}")]
    MalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No client is provided. p4thumb requires a client.")]
    MissingClient,
    #[error(
        "The conversion executable cannot be found. Checked: {}",
        path.display()
    )]
    ConversionExecutableMissing { path: PathBuf },
    #[error("Error: invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error(
        "The conversion for extension(s): \"{extensions}\" will fail. {reason}"
    )]
    InvalidConversion { extensions: String, reason: String },
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Configuration,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: Into<PathBuf>>(config_path: P) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigError> {
        let file_config = self.load_file_config()?;
        let config = self.compose_config(file_config)?;
        let warnings = validation::collect_warnings(&config);
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(&self) -> Result<FileConfig, ConfigError> {
        let path = &self.config_path;
        if !path.is_file() {
            return Err(ConfigError::NotFound { path: path.clone() });
        }

        let contents =
            fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;

        // Syntax first: a document that is not JSON at all is reported
        // differently from JSON with the wrong shape.
        let document: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|source| ConfigError::MalformedJson {
                path: path.clone(),
                source,
            })?;

        serde_json::from_value(document).map_err(|err| {
            ConfigError::InvalidValue {
                field: "document",
                reason: err.to_string(),
            }
        })
    }

    fn compose_config(
        &self,
        file: FileConfig,
    ) -> Result<Configuration, ConfigError> {
        let FileConfig {
            client,
            port,
            user,
            max_file_size,
            conversion_executable,
            poll_interval_seconds,
            log_file,
            attribute_name,
            thumbnail_size,
            conversion_arguments,
            conversion_timeout_seconds,
            extensions,
            max_concurrent_conversions,
            shutdown_grace_seconds,
            p4_executable,
            first_change,
            final_change,
            conversions,
        } = file;

        let client = client
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingClient)?;

        let executable = resolve_conversion_executable(conversion_executable)?;

        let interval = seconds_field(
            "pollIntervalSeconds",
            poll_interval_seconds.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        )?;
        let timeout = seconds_field(
            "conversionTimeoutSeconds",
            conversion_timeout_seconds
                .unwrap_or(DEFAULT_CONVERSION_TIMEOUT_SECS),
        )?;
        let shutdown_grace = seconds_field(
            "shutdownGraceSeconds",
            shutdown_grace_seconds.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        )?;

        let max_concurrent_conversions =
            max_concurrent_conversions.unwrap_or(1);
        if max_concurrent_conversions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxConcurrentConversions",
                reason: "must be at least 1".to_string(),
            });
        }

        let arguments = match conversion_arguments {
            Some(arguments) => validate_arguments(arguments)?,
            None => default_arguments(),
        };

        let thumbnail_size = match thumbnail_size {
            Some(size) if size.width == 0 || size.height == 0 => {
                return Err(ConfigError::InvalidValue {
                    field: "thumbnailSize",
                    reason: format!(
                        "{}x{} has a zero dimension",
                        size.width, size.height
                    ),
                });
            }
            Some(size) => ThumbnailSize {
                width: size.width,
                height: size.height,
            },
            None => ThumbnailSize::default(),
        };

        let rules = conversions
            .unwrap_or_default()
            .into_iter()
            .map(conversion_rule)
            .collect::<Result<Vec<_>, _>>()?;

        // Files routed to a dedicated tool are eligible too.
        let mut extensions = match extensions {
            Some(list) => normalize_extensions(list)?,
            None => default_extensions(),
        };
        extensions.extend(
            rules.iter().flat_map(|rule| rule.extensions.iter().cloned()),
        );
        extensions.sort();
        extensions.dedup();

        // A limit of 0 means no limit.
        let max_file_size = max_file_size.filter(|limit| *limit > 0);

        let attribute_name = attribute_name
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|| DEFAULT_ATTRIBUTE_NAME.to_string());
        if attribute_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "attributeName",
                reason: "must not be empty".to_string(),
            });
        }

        // 0 leaves either end of the range unset.
        let first_change = first_change.filter(|change| *change > 0);
        let final_change = match final_change {
            None | Some(0) => None,
            Some(-1) => Some(FinalChange::Head),
            Some(change) => match u64::try_from(change) {
                Ok(change) => Some(FinalChange::Change(change)),
                Err(_) => {
                    return Err(ConfigError::InvalidValue {
                        field: "finalChange",
                        reason: format!(
                            "{change} is neither a change number nor -1"
                        ),
                    });
                }
            },
        };

        if let (Some(first), Some(FinalChange::Change(last))) =
            (first_change, final_change)
            && last < first
        {
            return Err(ConfigError::InvalidValue {
                field: "finalChange",
                reason: format!(
                    "end of range {last} precedes the start {first}"
                ),
            });
        }

        Ok(Configuration {
            connection: ConnectionConfig {
                client,
                port: non_blank(port),
                user: non_blank(user),
                p4_executable: p4_executable
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_P4_EXECUTABLE)),
                first_change,
                final_change,
            },
            polling: PollingConfig {
                interval,
                max_concurrent_conversions,
                shutdown_grace,
            },
            filter: FilterConfig {
                max_file_size,
                extensions,
            },
            conversion: ConversionConfig {
                executable,
                arguments,
                timeout,
                thumbnail_size,
                rules,
            },
            attribute_name,
            log_file,
            metadata: ConfigMetadata {
                config_path: self.config_path.clone(),
            },
        })
    }
}

/// Load and validate the configuration at `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigLoad, ConfigError> {
    ConfigLoader::new(path.as_ref()).load()
}

fn resolve_conversion_executable(
    configured: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    let path = configured.unwrap_or_default();
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ConversionExecutableMissing { path });
    }
    // Bare names go through PATH; anything with a separator is checked as is.
    which::which(&path)
        .map_err(|_| ConfigError::ConversionExecutableMissing { path })
}

fn seconds_field(
    field: &'static str,
    seconds: f64,
) -> Result<Duration, ConfigError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("{seconds} is not a positive number of seconds"),
        });
    }
    Duration::try_from_secs_f64(seconds).map_err(|err| {
        ConfigError::InvalidValue {
            field,
            reason: err.to_string(),
        }
    })
}

fn validate_arguments(
    arguments: Vec<String>,
) -> Result<Vec<String>, ConfigError> {
    match missing_placeholder(&arguments) {
        Some(placeholder) => Err(ConfigError::InvalidValue {
            field: "conversionArguments",
            reason: format!(
                "the mandatory \"{placeholder}\" argument is missing"
            ),
        }),
        None => Ok(arguments),
    }
}

/// `$FILEIN` may be embedded in a larger argument; `$FILEOUT` must stand
/// alone.
fn missing_placeholder(arguments: &[String]) -> Option<&'static str> {
    if !arguments.iter().any(|arg| arg.contains(FILE_IN_PLACEHOLDER)) {
        Some(FILE_IN_PLACEHOLDER)
    } else if !arguments.iter().any(|arg| arg == FILE_OUT_PLACEHOLDER) {
        Some(FILE_OUT_PLACEHOLDER)
    } else {
        None
    }
}

fn conversion_rule(
    entry: FileConversion,
) -> Result<ConversionRule, ConfigError> {
    let FileConversion {
        extensions,
        exec_path,
        arguments,
        convert_to_png,
        thumbnail_extension,
    } = entry;

    let listed = extensions.join(", ");
    let invalid = |reason: String| ConfigError::InvalidConversion {
        extensions: listed.clone(),
        reason,
    };

    let extensions = normalize_extensions(extensions)
        .map_err(|_| invalid("No extensions are listed.".to_string()))?;
    let executable = resolve_conversion_executable(exec_path).map_err(|_| {
        invalid("The conversion executable cannot be found.".to_string())
    })?;
    let arguments = arguments.unwrap_or_else(default_arguments);
    if let Some(placeholder) = missing_placeholder(&arguments) {
        return Err(invalid(format!(
            "The mandatory \"{placeholder}\" argument is missing."
        )));
    }

    Ok(ConversionRule {
        extensions,
        executable,
        arguments,
        convert_to_png: convert_to_png.unwrap_or(true),
        thumbnail_extension: thumbnail_extension
            .map(|ext| {
                ext.trim().trim_start_matches('.').to_ascii_lowercase()
            })
            .filter(|ext| !ext.is_empty()),
    })
}

fn normalize_extensions(
    list: Vec<String>,
) -> Result<Vec<String>, ConfigError> {
    let mut normalized: Vec<String> = list
        .into_iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();

    if normalized.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "extensions",
            reason: "at least one extension is required".to_string(),
        });
    }
    Ok(normalized)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

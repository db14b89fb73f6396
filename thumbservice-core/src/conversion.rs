//! Thumbnail conversion through external executables.
//!
//! [`ExternalConverter`] runs one tool. [`ConverterRouter`] picks the tool
//! for a file from the configured `conversions` entries by extension and
//! falls back to `conversionExecutable`. Whatever the tool writes is handed
//! on as PNG.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::ImageFormat;
use thumbservice_config::{
    ConversionConfig, ConversionRule, FILE_IN_PLACEHOLDER,
    FILE_OUT_PLACEHOLDER, HEIGHT_PLACEHOLDER, ThumbnailSize,
    WIDTH_PLACEHOLDER,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConversionError;
use crate::events::SourceImage;

const OUTPUT_STEM: &str = "thumbnail";
const PNG_EXTENSION: &str = "png";
const FALLBACK_INPUT_NAME: &str = "source";

/// Turns source content into thumbnail bytes.
#[async_trait]
pub trait ThumbnailConverter: Send + Sync {
    async fn convert(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<u8>, ConversionError>;
}

/// Runs `<executable> <arguments…>` in a scratch directory and reads back
/// the file it wrote.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    executable: PathBuf,
    arguments: Vec<String>,
    timeout: Duration,
    size: ThumbnailSize,
    /// Extension of the file the tool is asked to write. `None` reuses the
    /// source extension.
    output_extension: Option<String>,
    abort: CancellationToken,
}

impl ExternalConverter {
    /// The default tool, `conversionExecutable`, writing PNG.
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            arguments: config.arguments.clone(),
            timeout: config.timeout,
            size: config.thumbnail_size,
            output_extension: Some(PNG_EXTENSION.to_string()),
            abort: CancellationToken::new(),
        }
    }

    /// The tool of one `conversions` entry. Timeout and thumbnail size are
    /// shared with the default tool.
    pub fn for_rule(rule: &ConversionRule, config: &ConversionConfig) -> Self {
        let output_extension = if rule.convert_to_png {
            Some(PNG_EXTENSION.to_string())
        } else {
            rule.thumbnail_extension.clone()
        };
        Self {
            executable: rule.executable.clone(),
            arguments: rule.arguments.clone(),
            timeout: config.timeout,
            size: config.thumbnail_size,
            output_extension,
            abort: CancellationToken::new(),
        }
    }

    /// Kill the running conversion when `abort` fires.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    fn output_file_name(&self, source_name: &str) -> String {
        let extension = self
            .output_extension
            .as_deref()
            .or_else(|| source_extension(source_name))
            .unwrap_or(PNG_EXTENSION);
        format!("{OUTPUT_STEM}.{extension}")
    }

    fn arguments_for(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let width = self.size.width.to_string();
        let height = self.size.height.to_string();
        let values = [
            (FILE_IN_PLACEHOLDER, input.as_ref()),
            (FILE_OUT_PLACEHOLDER, output.as_ref()),
            (WIDTH_PLACEHOLDER, width.as_str()),
            (HEIGHT_PLACEHOLDER, height.as_str()),
        ];
        self.arguments
            .iter()
            .map(|arg| substitute(arg, &values))
            .collect()
    }
}

#[async_trait]
impl ThumbnailConverter for ExternalConverter {
    async fn convert(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<u8>, ConversionError> {
        // Removed on drop, whatever the outcome.
        let scratch = tempfile::Builder::new()
            .prefix("thumbservice-")
            .tempdir()?;
        let output_name = self.output_file_name(&source.name);
        let input = scratch
            .path()
            .join(input_file_name(&source.name, &output_name));
        let output_path = scratch.path().join(&output_name);
        tokio::fs::write(&input, &source.bytes).await?;

        let args = self.arguments_for(&input, &output_path);
        debug!(
            "running {} {}",
            self.executable.display(),
            args.join(" ")
        );

        let child = Command::new(&self.executable)
            .args(&args)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the wait future drops the child, which kills it.
        let waited =
            tokio::time::timeout(self.timeout, child.wait_with_output());
        let finished = tokio::select! {
            biased;
            _ = self.abort.cancelled() => {
                return Err(ConversionError::Cancelled);
            }
            finished = waited => finished,
        };
        let output = finished
            .map_err(|_| ConversionError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ConversionError::ExecutionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            });
        }

        let bytes = match tokio::fs::read(&output_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(bad_output("converter wrote no output file"));
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            return Err(bad_output("converter wrote an empty output file"));
        }
        to_png(bytes)
    }
}

/// Chooses the tool for each source file by its extension.
#[derive(Debug, Clone)]
pub struct ConverterRouter {
    routes: Vec<(ConversionRule, ExternalConverter)>,
    fallback: ExternalConverter,
}

impl ConverterRouter {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            routes: config
                .rules
                .iter()
                .map(|rule| {
                    (rule.clone(), ExternalConverter::for_rule(rule, config))
                })
                .collect(),
            fallback: ExternalConverter::new(config),
        }
    }

    /// Kill the running conversion, whichever tool runs it, when `abort`
    /// fires.
    pub fn with_abort(self, abort: CancellationToken) -> Self {
        Self {
            routes: self
                .routes
                .into_iter()
                .map(|(rule, converter)| {
                    (rule, converter.with_abort(abort.clone()))
                })
                .collect(),
            fallback: self.fallback.with_abort(abort),
        }
    }

    /// First entry listing the extension of `name`, else the default tool.
    pub fn route(&self, name: &str) -> &ExternalConverter {
        source_extension(name)
            .and_then(|extension| {
                self.routes
                    .iter()
                    .find(|(rule, _)| rule.handles(extension))
            })
            .map_or(&self.fallback, |(_, converter)| converter)
    }
}

#[async_trait]
impl ThumbnailConverter for ConverterRouter {
    async fn convert(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<u8>, ConversionError> {
        self.route(&source.name).convert(source).await
    }
}

/// Replace every placeholder in one left-to-right pass, so substituted
/// values are never scanned again.
fn substitute(arg: &str, values: &[(&str, &str)]) -> String {
    let mut substituted = String::with_capacity(arg.len());
    let mut rest = arg;
    'scan: while !rest.is_empty() {
        for (placeholder, value) in values {
            if let Some(tail) = rest.strip_prefix(placeholder) {
                substituted.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            substituted.push(ch);
        }
        rest = chars.as_str();
    }
    substituted
}

/// PNG passes through untouched; any other decodable image is re-encoded.
fn to_png(bytes: Vec<u8>) -> Result<Vec<u8>, ConversionError> {
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Png) => Ok(bytes),
        Ok(format) => {
            let decoded =
                image::load_from_memory_with_format(&bytes, format).map_err(
                    |err| bad_output(&format!("cannot decode output: {err}")),
                )?;
            let mut png = Cursor::new(Vec::new());
            decoded.write_to(&mut png, ImageFormat::Png).map_err(|err| {
                bad_output(&format!("cannot re-encode output as PNG: {err}"))
            })?;
            Ok(png.into_inner())
        }
        Err(_) => Err(bad_output(
            "converter output is not a recognizable image",
        )),
    }
}

fn bad_output(reason: &str) -> ConversionError {
    ConversionError::ExecutionFailed {
        exit_code: Some(0),
        stderr: reason.to_string(),
    }
}

fn source_extension(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Keep the source name so tools can sniff the format from the extension,
/// but never let it escape the scratch directory or collide with the
/// output file.
fn input_file_name<'a>(name: &'a str, output_name: &str) -> &'a str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => FALLBACK_INPUT_NAME,
        base if base == output_name => FALLBACK_INPUT_NAME,
        base => base,
    }
}

//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thumbservice_config::{
    ConfigMetadata, Configuration, ConnectionConfig, ConversionConfig,
    FilterConfig, PollingConfig, ThumbnailSize,
};
use thumbservice_core::{ConversionError, SourceImage, ThumbnailConverter};
use tokio::sync::Notify;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

pub fn config(max_file_size: Option<u64>, lanes: usize) -> Configuration {
    Configuration {
        connection: ConnectionConfig {
            client: "art-ws".into(),
            port: Some("localhost:1666".into()),
            user: Some("thumbs".into()),
            p4_executable: PathBuf::from("p4"),
            first_change: None,
            final_change: None,
        },
        polling: PollingConfig {
            interval: Duration::from_millis(10),
            max_concurrent_conversions: lanes,
            shutdown_grace: Duration::from_millis(50),
        },
        filter: FilterConfig {
            max_file_size,
            extensions: ["png", "jpg", "psd"].map(String::from).to_vec(),
        },
        conversion: ConversionConfig {
            executable: PathBuf::from("/bin/sh"),
            arguments: vec!["$FILEIN".into(), "$FILEOUT".into()],
            timeout: Duration::from_secs(5),
            thumbnail_size: ThumbnailSize::default(),
            rules: Vec::new(),
        },
        attribute_name: "thumb".into(),
        log_file: None,
        metadata: ConfigMetadata::default(),
    }
}

/// Deterministic converter: the thumbnail is the source bytes behind a
/// fixed prefix. Sources whose name contains `broken` fail.
#[derive(Debug, Default)]
pub struct StampConverter {
    pub calls: Mutex<Vec<String>>,
}

pub fn stamp(bytes: &[u8]) -> Vec<u8> {
    let mut thumbnail = b"thumb:".to_vec();
    thumbnail.extend_from_slice(bytes);
    thumbnail
}

#[async_trait]
impl ThumbnailConverter for StampConverter {
    async fn convert(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<u8>, ConversionError> {
        self.calls.lock().push(source.name.clone());
        if source.name.contains("broken") {
            return Err(ConversionError::ExecutionFailed {
                exit_code: Some(1),
                stderr: "unreadable image".into(),
            });
        }
        Ok(stamp(&source.bytes))
    }
}

/// Converter that parks its first conversion until released, so a test can
/// act while a tick is in flight.
#[derive(Debug, Default)]
pub struct GatedConverter {
    /// Notified when the first conversion starts.
    pub entered: Notify,
    /// Lets the first conversion finish.
    pub release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl ThumbnailConverter for GatedConverter {
    async fn convert(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<u8>, ConversionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(stamp(&source.bytes))
    }
}

/// In-memory log destination for the fmt layer.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route this thread's events (at debug and above) into the capture.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_target(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: self.buffer.clone(),
        }
    }
}

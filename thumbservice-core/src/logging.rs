//! Process-wide event log.
//!
//! Every line goes to one sink, either stdout or an append-only file, behind
//! a mutex taken once per line. The `tracing` fmt layer formats each event
//! into a single buffer before writing, so lines from concurrent lanes never
//! interleave. Sink failures are dropped here and never reach the caller.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::{MakeWriter, format::Writer, time::FormatTime};

/// Timestamp layout of operational lines.
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Route one message through the installed subscriber at `severity`.
pub fn log(severity: Severity, message: &str) {
    match severity {
        Severity::Debug => debug!("{message}"),
        Severity::Info => info!("{message}"),
        Severity::Warning => warn!("{message}"),
        Severity::Error => error!("{message}"),
    }
}

#[derive(Debug)]
enum LogSink {
    Stdout,
    File(File),
    #[cfg(test)]
    Memory(Vec<u8>),
}

impl LogSink {
    fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            LogSink::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            LogSink::File(file) => {
                file.write_all(bytes)?;
                file.flush()
            }
            #[cfg(test)]
            LogSink::Memory(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
        }
    }
}

/// Shared handle to the log destination.
#[derive(Debug, Clone)]
pub struct EventLog {
    sink: Arc<Mutex<LogSink>>,
}

impl EventLog {
    pub fn stdout() -> Self {
        Self::from_sink(LogSink::Stdout)
    }

    /// Append to `path`, creating it if needed.
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_sink(LogSink::File(file)))
    }

    fn from_sink(sink: LogSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Write `message` as a bare line with no timestamp or severity. Used for
    /// fatal startup diagnostics.
    pub fn fatal(&self, message: &str) {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        self.write_bytes(line.as_bytes());
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let mut sink = self.sink.lock();
        let _ = sink.write_line(bytes);
    }

    #[cfg(test)]
    fn memory() -> Self {
        Self::from_sink(LogSink::Memory(Vec::new()))
    }

    #[cfg(test)]
    fn captured(&self) -> String {
        match &*self.sink.lock() {
            LogSink::Memory(buffer) => {
                String::from_utf8_lossy(buffer).into_owned()
            }
            _ => String::new(),
        }
    }
}

/// `io::Write` adapter handed to the fmt layer, one per event.
#[derive(Debug)]
pub struct EventLogWriter {
    log: EventLog,
}

impl Write for EventLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for EventLog {
    type Writer = EventLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventLogWriter { log: self.clone() }
    }
}

/// Local wall-clock timestamps, `2024/05/01 13:45:10`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Install the global subscriber writing `timestamp SEVERITY message` lines
/// to `log`. `RUST_LOG` overrides `default_directive`.
pub fn install(
    log: &EventLog,
    default_directive: &str,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::{
        EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log.clone())
                .with_timer(LocalTimestamp)
                .with_target(false)
                .with_ansi(false),
        )
        .try_init()
}

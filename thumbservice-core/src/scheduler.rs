//! Timer-driven polling loop.
//!
//! Each tick lists the changes submitted since the adapter cursor and runs
//! every resulting event through filter, conversion and attribute write.
//! A failing event is logged and never stops the tick; a failing poll is
//! logged and retried on the next tick. In [`ProcessingMode::ClearThumbnails`]
//! the attribute is removed instead of written.

use std::sync::Arc;

use futures::{StreamExt, stream};
use thumbservice_config::Configuration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attribute::AttributeWriter;
use crate::conversion::ThumbnailConverter;
use crate::error::{AdapterError, ThumbnailFailure};
use crate::events::{ChangeEvent, Digest, SourceImage, ThumbnailResult};
use crate::filter::{self, FilterPolicy, FilterRejection, Verdict};
use crate::lanes::PathLanes;
use crate::logging::{self, Severity};
use crate::repository::RepositoryClient;

/// Shown in the connection banner for settings left to the client defaults.
const UNSET_LABEL: &str = "(default)";

/// What each accepted file revision is put through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Convert, unless the revision already carries a thumbnail digest.
    #[default]
    Convert,
    /// Convert every accepted revision.
    ForceConvert,
    /// Remove the thumbnail digest instead of converting.
    ClearThumbnails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Processing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested.
    Shutdown,
    /// The configured change range has been fully processed.
    Exhausted,
}

/// Per-tick counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub events: usize,
    pub converted: usize,
    pub cleared: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Events abandoned because the shutdown deadline passed.
    pub skipped: usize,
}

impl TickSummary {
    fn merge(self, other: TickSummary) -> TickSummary {
        TickSummary {
            events: self.events + other.events,
            converted: self.converted + other.converted,
            cleared: self.cleared + other.cleared,
            rejected: self.rejected + other.rejected,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
        }
    }

    fn record(&mut self, result: &ThumbnailResult) {
        self.events += 1;
        match result {
            Ok(_) => self.converted += 1,
            Err(failure) => self.record_failure(failure),
        }
    }

    fn record_clear(&mut self, result: &Result<(), ThumbnailFailure>) {
        self.events += 1;
        match result {
            Ok(()) => self.cleared += 1,
            Err(failure) => self.record_failure(failure),
        }
    }

    fn record_failure(&mut self, failure: &ThumbnailFailure) {
        match failure {
            ThumbnailFailure::Rejected(_) => self.rejected += 1,
            _ => self.failed += 1,
        }
    }

    fn record_skipped(&mut self) {
        self.events += 1;
        self.skipped += 1;
    }
}

pub struct PollScheduler {
    config: Arc<Configuration>,
    client: Arc<dyn RepositoryClient>,
    converter: Arc<dyn ThumbnailConverter>,
    writer: AttributeWriter,
    policy: FilterPolicy,
    mode: ProcessingMode,
    shutdown: CancellationToken,
    abort: CancellationToken,
    state: SchedulerState,
    connected: bool,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("client", &self.config.client())
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("connected", &self.connected)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PollScheduler {
    pub fn new(
        config: Arc<Configuration>,
        client: Arc<dyn RepositoryClient>,
        converter: Arc<dyn ThumbnailConverter>,
    ) -> Self {
        let writer =
            AttributeWriter::new(client.clone(), config.attribute_name.clone());
        let policy = FilterPolicy::from_config(&config.filter);
        Self {
            config,
            client,
            converter,
            writer,
            policy,
            mode: ProcessingMode::default(),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            state: SchedulerState::Idle,
            connected: false,
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    /// `shutdown` stops new ticks from starting; `abort` additionally
    /// abandons the events left in the current tick.
    pub fn with_cancellation(
        mut self,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        self.shutdown = shutdown;
        self.abort = abort;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Poll until shutdown is requested or the change range is exhausted,
    /// then release the adapter.
    pub async fn run(&mut self) -> StopReason {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break StopReason::Shutdown,
                _ = ticker.tick() => {}
            }

            // Failures are logged where they happen; the next tick retries.
            let _ = self.tick().await;

            if self.client.is_exhausted() {
                info!("All changes processed.");
                break StopReason::Exhausted;
            }
        };

        self.client.disconnect().await;
        self.connected = false;
        self.state = SchedulerState::Stopped;
        info!("Thumbnail service stopped");
        reason
    }

    /// One poll: connect if needed, list new changes, process them.
    pub async fn tick(&mut self) -> Result<TickSummary, AdapterError> {
        self.state = SchedulerState::Polling;
        let listed = self.poll().await;
        let events = match listed {
            Ok(events) => events,
            Err(err) => {
                self.state = SchedulerState::Idle;
                return Err(err);
            }
        };

        if events.is_empty() {
            debug!("No changes to process. Waiting for new submissions.");
            self.state = SchedulerState::Idle;
            return Ok(TickSummary::default());
        }

        self.state = SchedulerState::Processing;
        let summary = self.process_batch(events).await;
        let done = match self.mode {
            ProcessingMode::ClearThumbnails => {
                format!("{} cleared", summary.cleared)
            }
            _ => format!("{} converted", summary.converted),
        };
        info!(
            "Processed {} file revisions: {done}, {} rejected, {} failed, \
             {} skipped",
            summary.events, summary.rejected, summary.failed, summary.skipped
        );
        self.state = SchedulerState::Idle;
        Ok(summary)
    }

    async fn poll(&mut self) -> Result<Vec<ChangeEvent>, AdapterError> {
        self.ensure_connected().await?;

        let listed = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Ok(Vec::new()),
            listed = self.client.changes_since() => listed,
        };
        listed.inspect_err(|err| {
            warn!("Failed to list submitted changes: {err}");
            // Re-check the session before the next listing.
            self.connected = false;
        })
    }

    async fn ensure_connected(&mut self) -> Result<(), AdapterError> {
        if self.connected {
            return Ok(());
        }

        let connection = &self.config.connection;
        let target = format!(
            "port={}, client={}, user={}",
            connection.port.as_deref().unwrap_or(UNSET_LABEL),
            connection.client,
            connection.user.as_deref().unwrap_or(UNSET_LABEL),
        );
        match self.client.connect().await {
            Ok(()) => {
                info!("Starting connection: {target}");
                self.connected = true;
                Ok(())
            }
            Err(err) => {
                warn!("Connection check failed: {target}: {err}");
                Err(err)
            }
        }
    }

    async fn process_batch(&self, events: Vec<ChangeEvent>) -> TickSummary {
        let limit = self.config.polling.max_concurrent_conversions.max(1);
        if limit == 1 {
            return self.run_lane(events).await;
        }

        let lanes = PathLanes::from_events(events);
        debug!("{} events in {} lanes", lanes.event_count(), lanes.len());
        stream::iter(lanes.into_lanes())
            .map(|lane| {
                self.run_lane(
                    lane.entries.into_iter().map(|(_, event)| event).collect(),
                )
            })
            .buffer_unordered(limit)
            .fold(TickSummary::default(), |total, lane| async move {
                total.merge(lane)
            })
            .await
    }

    /// Process `events` one after another, in order.
    async fn run_lane(&self, events: Vec<ChangeEvent>) -> TickSummary {
        let mut summary = TickSummary::default();
        for event in &events {
            if self.abort.is_cancelled() {
                summary.record_skipped();
                continue;
            }
            let outcome = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                outcome = self.handle_event(event) => Some(outcome),
            };
            match outcome {
                Some(outcome) => summary = summary.merge(outcome),
                None => {
                    warn!(
                        "Abandoned {}: shutdown deadline reached",
                        event.revision_spec()
                    );
                    summary.record_skipped();
                }
            }
        }
        summary
    }

    async fn handle_event(&self, event: &ChangeEvent) -> TickSummary {
        let mut outcome = TickSummary::default();
        match self.mode {
            ProcessingMode::ClearThumbnails => {
                outcome.record_clear(&self.clear_event(event).await);
            }
            _ => outcome.record(&self.process_event(event).await),
        }
        outcome
    }

    /// Run one event through filter, fetch, conversion and attribute write,
    /// logging exactly one line for the outcome.
    pub async fn process_event(&self, event: &ChangeEvent) -> ThumbnailResult {
        let result = self.thumbnail_for(event).await;
        let (severity, message) = describe_outcome(event, &result);
        logging::log(severity, &message);
        result.map(|(digest, _)| digest)
    }

    /// Remove the thumbnail digest from one revision. Size does not matter
    /// here, only whether the file could have been given a thumbnail.
    pub async fn clear_event(
        &self,
        event: &ChangeEvent,
    ) -> Result<(), ThumbnailFailure> {
        let result = match filter::accepts(event, &self.policy) {
            Verdict::Reject(
                rejection @ FilterRejection::UnsupportedType { .. },
            ) => Err(ThumbnailFailure::Rejected(rejection)),
            _ => self
                .writer
                .clear(&event.path, event.revision)
                .await
                .map_err(ThumbnailFailure::Write),
        };
        let (severity, message) =
            describe_clear(event, self.writer.name(), &result);
        logging::log(severity, &message);
        result
    }

    async fn thumbnail_for(
        &self,
        event: &ChangeEvent,
    ) -> Result<(Digest, usize), ThumbnailFailure> {
        if let Verdict::Reject(rejection) =
            filter::accepts(event, &self.policy)
        {
            return Err(ThumbnailFailure::Rejected(rejection));
        }

        if self.mode == ProcessingMode::Convert {
            let current = self
                .writer
                .current(&event.path, event.revision)
                .await
                .map_err(ThumbnailFailure::Fetch)?;
            if current.is_some() {
                return Err(ThumbnailFailure::Rejected(
                    FilterRejection::ThumbnailPresent {
                        name: self.writer.name().to_string(),
                    },
                ));
            }
        }

        let content = self
            .client
            .fetch_content(&event.path, event.revision)
            .await
            .map_err(ThumbnailFailure::Fetch)?;
        let source = SourceImage::new(event.file_name(), content);

        let thumbnail = self
            .converter
            .convert(&source)
            .await
            .map_err(ThumbnailFailure::Conversion)?;

        let digest = self
            .writer
            .write(&event.path, event.revision, &thumbnail)
            .await
            .map_err(ThumbnailFailure::Write)?;
        Ok((digest, thumbnail.len()))
    }
}

fn describe_outcome(
    event: &ChangeEvent,
    result: &Result<(Digest, usize), ThumbnailFailure>,
) -> (Severity, String) {
    let spec = event.revision_spec();
    match result {
        Ok((_, bytes)) => {
            (Severity::Info, format!("{bytes} byte thumbnail from {spec}"))
        }
        Err(ThumbnailFailure::Rejected(
            rejection @ FilterRejection::TooLarge { .. },
        )) => (Severity::Info, format!("{} {rejection}", event.path)),
        Err(ThumbnailFailure::Rejected(rejection)) => {
            (Severity::Debug, format!("Skipping {spec}: {rejection}"))
        }
        Err(ThumbnailFailure::Fetch(err)) => {
            (Severity::Warning, format!("Failed to fetch {spec}: {err}"))
        }
        Err(ThumbnailFailure::Conversion(err)) => (
            Severity::Warning,
            format!("Can't convert image file {spec}: {err}"),
        ),
        Err(ThumbnailFailure::Write(err)) => (
            Severity::Warning,
            format!(
                "Failed to write thumbnail attribute for {spec}: {}",
                err.source
            ),
        ),
    }
}

fn describe_clear(
    event: &ChangeEvent,
    name: &str,
    result: &Result<(), ThumbnailFailure>,
) -> (Severity, String) {
    let spec = event.revision_spec();
    match result {
        Ok(()) => (
            Severity::Info,
            format!("Cleared {name} attribute from {spec}"),
        ),
        Err(ThumbnailFailure::Rejected(rejection)) => {
            (Severity::Debug, format!("Skipping {spec}: {rejection}"))
        }
        Err(ThumbnailFailure::Write(err)) => (
            Severity::Warning,
            format!(
                "Failed to clear thumbnail attribute for {spec}: {}",
                err.source
            ),
        ),
        Err(failure) => {
            (Severity::Warning, format!("Failed to clear {spec}: {failure}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttributeWriteError, ConversionError};

    fn event() -> ChangeEvent {
        ChangeEvent {
            change: 9,
            path: "//depot/art/hero.png".into(),
            revision: 4,
            size: 2048,
            file_type: "binary+F".into(),
        }
    }

    #[test]
    fn success_line_reports_size_and_revision() {
        let (severity, line) =
            describe_outcome(&event(), &Ok((Digest::of(b"x"), 512)));
        assert_eq!(severity, Severity::Info);
        assert_eq!(line, "512 byte thumbnail from //depot/art/hero.png#4");
    }

    #[test]
    fn oversize_line_matches_the_documented_text() {
        let failure = ThumbnailFailure::Rejected(FilterRejection::TooLarge {
            size: 2048,
            limit: 1024,
        });
        let (_, line) = describe_outcome(&event(), &Err(failure));
        assert_eq!(
            line,
            "//depot/art/hero.png file size: 2048 is larger than the \
             maxFileSize"
        );
    }

    #[test]
    fn failure_lines_name_the_revision() {
        let conversion =
            ThumbnailFailure::Conversion(ConversionError::Cancelled);
        let (severity, line) = describe_outcome(&event(), &Err(conversion));
        assert_eq!(severity, Severity::Warning);
        assert!(
            line.starts_with("Can't convert image file //depot/art/hero.png#4")
        );

        let write = ThumbnailFailure::Write(AttributeWriteError::from(
            AdapterError::Connection("gone".into()),
        ));
        let (_, line) = describe_outcome(&event(), &Err(write));
        assert_eq!(
            line,
            "Failed to write thumbnail attribute for //depot/art/hero.png#4: \
             connection failed: gone"
        );
    }

    #[test]
    fn summaries_merge_fieldwise() {
        let mut a = TickSummary::default();
        a.record(&Ok(Digest::of(b"1")));
        a.record_skipped();
        let mut b = TickSummary::default();
        b.record(&Err(ThumbnailFailure::Conversion(
            ConversionError::Cancelled,
        )));
        b.record_clear(&Ok(()));
        let total = a.merge(b);
        assert_eq!(
            total,
            TickSummary {
                events: 4,
                converted: 1,
                cleared: 1,
                rejected: 0,
                failed: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn clear_lines_name_the_attribute_and_revision() {
        let (severity, line) = describe_clear(&event(), "thumb", &Ok(()));
        assert_eq!(severity, Severity::Info);
        assert_eq!(line, "Cleared thumb attribute from //depot/art/hero.png#4");

        let write = ThumbnailFailure::Write(AttributeWriteError::from(
            AdapterError::Connection("gone".into()),
        ));
        let (severity, line) = describe_clear(&event(), "thumb", &Err(write));
        assert_eq!(severity, Severity::Warning);
        assert_eq!(
            line,
            "Failed to clear thumbnail attribute for //depot/art/hero.png#4: \
             connection failed: gone"
        );
    }
}

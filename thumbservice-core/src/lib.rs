//! Core of the thumbnail service.
//!
//! A [`PollScheduler`] asks a [`RepositoryClient`] for file revisions
//! submitted since the last poll, filters them, converts each eligible image
//! with a [`ThumbnailConverter`], and records the MD5 digest of the thumbnail
//! as an attribute on the source revision. Everything is logged through the
//! process-wide [`logging::EventLog`].

pub mod attribute;
pub mod conversion;
pub mod error;
pub mod events;
pub mod filter;
pub mod lanes;
pub mod logging;
pub mod repository;
pub mod scheduler;

pub use attribute::AttributeWriter;
pub use conversion::{
    ConverterRouter, ExternalConverter, ThumbnailConverter,
};
pub use error::{
    AdapterError, AttributeWriteError, ConversionError, FailureCause,
    ThumbnailFailure,
};
pub use events::{ChangeEvent, Digest, SourceImage, ThumbnailResult};
pub use filter::{FilterPolicy, FilterRejection, Verdict, accepts};
pub use lanes::{Lane, PathLanes};
pub use logging::{EventLog, Severity};
pub use repository::{
    AttributeWrite, InMemoryRepository, P4CommandClient, RepositoryClient,
};
pub use scheduler::{
    PollScheduler, ProcessingMode, SchedulerState, StopReason, TickSummary,
};

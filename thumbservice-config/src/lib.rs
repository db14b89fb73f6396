//! Configuration loading for the thumbnail service.
//!
//! The daemon reads a single JSON file at startup. [`ConfigLoader`] parses it
//! into the raw [`FileConfig`](sources::FileConfig) model, applies defaults,
//! and validates the fields the daemon cannot run without (`client` and
//! `conversionExecutable`), plus every entry of the optional `conversions`
//! list. Every failure is a [`ConfigError`] whose display
//! text is the one-line diagnostic printed before the process exits.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigError, ConfigLoad, ConfigLoader, load};
pub use models::{
    ConfigMetadata, Configuration, ConnectionConfig, ConversionConfig,
    ConversionRule, DEFAULT_ATTRIBUTE_NAME, DEFAULT_EXTENSIONS,
    FILE_IN_PLACEHOLDER, FILE_OUT_PLACEHOLDER, FilterConfig, FinalChange,
    HEIGHT_PLACEHOLDER, PollingConfig, ThumbnailSize, WIDTH_PLACEHOLDER,
};
pub use validation::{ConfigWarning, ConfigWarnings};

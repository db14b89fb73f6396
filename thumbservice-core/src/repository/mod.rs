//! Repository client contract and its implementations.
//!
//! The scheduler only ever talks to [`RepositoryClient`]. The cursor that
//! decides which changes are "new" lives behind the trait and advances when
//! changes are listed, so every event is handed out at most once.

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::events::ChangeEvent;

pub mod memory;
pub mod p4;

pub use memory::{AttributeWrite, InMemoryRepository};
pub use p4::P4CommandClient;

#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Open (or verify) the session. Called before every poll while
    /// disconnected.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// File revisions submitted after the cursor, in submission order.
    async fn changes_since(&self) -> Result<Vec<ChangeEvent>, AdapterError>;

    async fn fetch_content(
        &self,
        path: &str,
        revision: u32,
    ) -> Result<Vec<u8>, AdapterError>;

    /// Set attribute `name` to `value` on `path#revision`.
    async fn write_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
        value: &str,
    ) -> Result<(), AdapterError>;

    /// Current value of attribute `name` on `path#revision`, if set.
    async fn read_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<Option<String>, AdapterError>;

    /// Remove attribute `name` from `path#revision`.
    async fn clear_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<(), AdapterError>;

    async fn disconnect(&self);

    /// True once a bounded change range has been fully listed.
    fn is_exhausted(&self) -> bool;
}

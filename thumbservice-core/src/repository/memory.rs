use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::RepositoryClient;
use crate::error::AdapterError;
use crate::events::ChangeEvent;

/// One recorded `write_attribute` or `clear_attribute` call. For a clear,
/// `value` holds what was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWrite {
    pub path: String,
    pub revision: u32,
    pub name: String,
    pub value: String,
}

/// Repository held entirely in memory.
///
/// Each [`submit`](Self::submit) creates a new change with the next change
/// number. Used as the stub backend and as the test double for scheduler
/// scenarios.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    failing_connects: u32,
    next_change: u64,
    cursor: u64,
    final_change: Option<u64>,
    final_at_head: bool,
    changes: BTreeMap<u64, Vec<ChangeEvent>>,
    contents: HashMap<(String, u32), Vec<u8>>,
    heads: HashMap<String, u32>,
    attributes: HashMap<(String, u32), BTreeMap<String, String>>,
    writes: Vec<AttributeWrite>,
    clears: Vec<AttributeWrite>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop reporting changes after `change` and report exhaustion once the
    /// cursor reaches it.
    pub fn with_final_change(self, change: u64) -> Self {
        self.state.lock().final_change = Some(change);
        self
    }

    /// Bound the range by whatever change is newest when changes are first
    /// listed.
    pub fn with_final_change_at_head(self) -> Self {
        self.state.lock().final_at_head = true;
        self
    }

    /// Submit a new revision of `path` as its own change and return the
    /// resulting event.
    pub fn submit(
        &self,
        path: &str,
        file_type: &str,
        content: Vec<u8>,
    ) -> ChangeEvent {
        let mut state = self.state.lock();
        state.next_change += 1;
        let change = state.next_change;
        let revision = {
            let head = state.heads.entry(path.to_string()).or_insert(0);
            *head += 1;
            *head
        };
        let event = ChangeEvent {
            change,
            path: path.to_string(),
            revision,
            size: content.len() as u64,
            file_type: file_type.to_string(),
        };
        state.contents.insert((path.to_string(), revision), content);
        state.changes.entry(change).or_default().push(event.clone());
        event
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        let mut state = self.state.lock();
        state.failing_connects = count;
        state.connected = false;
    }

    /// Drop the session as if the server went away.
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Option<String> {
        self.state
            .lock()
            .attributes
            .get(&(path.to_string(), revision))
            .and_then(|attrs| attrs.get(name).cloned())
    }

    /// Attribute value on the head revision of `path`.
    pub fn head_attribute(&self, path: &str, name: &str) -> Option<String> {
        let revision = *self.state.lock().heads.get(path)?;
        self.attribute(path, revision, name)
    }

    pub fn attribute_writes(&self) -> Vec<AttributeWrite> {
        self.state.lock().writes.clone()
    }

    pub fn cleared_attributes(&self) -> Vec<AttributeWrite> {
        self.state.lock().clears.clone()
    }

    fn missing(&self, path: &str, revision: u32) -> AdapterError {
        if self.state.lock().heads.contains_key(path) {
            AdapterError::StaleRevision {
                path: path.to_string(),
                revision,
            }
        } else {
            AdapterError::NotFound(format!("{path}#{revision}"))
        }
    }
}

#[async_trait]
impl RepositoryClient for InMemoryRepository {
    async fn connect(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AdapterError::Connection(
                "in-memory repository is unavailable".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn changes_since(&self) -> Result<Vec<ChangeEvent>, AdapterError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(AdapterError::Connection("not connected".to_string()));
        }

        if state.final_at_head && state.final_change.is_none() {
            state.final_change = Some(state.next_change);
        }
        let upper = state.final_change.unwrap_or(u64::MAX);
        let from = state.cursor.saturating_add(1);
        if from > upper {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let mut last = state.cursor;
        for (change, batch) in state.changes.range(from..=upper) {
            events.extend(batch.iter().cloned());
            last = *change;
        }
        state.cursor = last;
        Ok(events)
    }

    async fn fetch_content(
        &self,
        path: &str,
        revision: u32,
    ) -> Result<Vec<u8>, AdapterError> {
        let content = self
            .state
            .lock()
            .contents
            .get(&(path.to_string(), revision))
            .cloned();
        content.ok_or_else(|| self.missing(path, revision))
    }

    async fn write_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
        value: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let key = (path.to_string(), revision);
        if !state.contents.contains_key(&key) {
            drop(state);
            return Err(self.missing(path, revision));
        }
        state
            .attributes
            .entry(key)
            .or_default()
            .insert(name.to_string(), value.to_string());
        state.writes.push(AttributeWrite {
            path: path.to_string(),
            revision,
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn read_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<Option<String>, AdapterError> {
        let key = (path.to_string(), revision);
        let state = self.state.lock();
        if !state.contents.contains_key(&key) {
            drop(state);
            return Err(self.missing(path, revision));
        }
        Ok(state
            .attributes
            .get(&key)
            .and_then(|attrs| attrs.get(name).cloned()))
    }

    async fn clear_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<(), AdapterError> {
        let key = (path.to_string(), revision);
        let mut state = self.state.lock();
        if !state.contents.contains_key(&key) {
            drop(state);
            return Err(self.missing(path, revision));
        }
        let removed = state
            .attributes
            .get_mut(&key)
            .and_then(|attrs| attrs.remove(name))
            .unwrap_or_default();
        state.clears.push(AttributeWrite {
            path: path.to_string(),
            revision,
            name: name.to_string(),
            value: removed,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    fn is_exhausted(&self) -> bool {
        let state = self.state.lock();
        state
            .final_change
            .is_some_and(|last| state.cursor >= last)
    }
}

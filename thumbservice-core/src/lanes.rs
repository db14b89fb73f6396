//! Per-path grouping of a poll batch.
//!
//! Revisions of the same file must be processed in submission order so the
//! last attribute written is the newest one. Different files are
//! independent, so each path gets its own serial lane and lanes may run
//! concurrently.

use std::collections::HashMap;

use crate::events::ChangeEvent;

/// Events for one path, in submission order.
#[derive(Debug, Clone)]
pub struct Lane {
    pub path: String,
    /// `(sequence, event)`; sequence is the event's position in the batch.
    pub entries: Vec<(usize, ChangeEvent)>,
}

/// Arena of lanes keyed by path. Lanes are kept in order of each path's
/// first appearance in the batch.
#[derive(Debug, Default)]
pub struct PathLanes {
    lanes: Vec<Lane>,
    index: HashMap<String, usize>,
}

impl PathLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        let mut lanes = Self::new();
        for (sequence, event) in events.into_iter().enumerate() {
            lanes.push(sequence, event);
        }
        lanes
    }

    pub fn push(&mut self, sequence: usize, event: ChangeEvent) {
        let slot = match self.index.get(&event.path) {
            Some(&slot) => slot,
            None => {
                let slot = self.lanes.len();
                self.index.insert(event.path.clone(), slot);
                self.lanes.push(Lane {
                    path: event.path.clone(),
                    entries: Vec::new(),
                });
                slot
            }
        };
        self.lanes[slot].entries.push((sequence, event));
    }

    /// Number of lanes (distinct paths).
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Total number of events across all lanes.
    pub fn event_count(&self) -> usize {
        self.lanes.iter().map(|lane| lane.entries.len()).sum()
    }

    pub fn into_lanes(self) -> Vec<Lane> {
        self.lanes
    }
}

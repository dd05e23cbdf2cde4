//! Stateful reassembly of tool invocations across fragmented producer
//! events.
//!
//! Some local models emit an `input-start`/`input-end` pair with no
//! argument deltas and deliver the full arguments later as a whole
//! tool-call event; others repeat the whole call after streaming it. The
//! tracker absorbs both so downstream always sees exactly one open/delta/
//! stop lifecycle per call id.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

/// Emission addressed to the transcoder for a single tool call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrackedEmission {
    /// Open a tool_use content block.
    Start {
        id: String,
        name: String,
    },
    /// Append a partial-JSON input delta to the call's block.
    Delta {
        id: String,
        partial_json: String,
    },
    /// Close the call's block.
    Stop {
        id: String,
    },
}

#[derive(Debug)]
struct Entry {
    has_received_deltas: bool,
}

/// Tool-call state machine keyed by call id, living for one stream.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    open: HashMap<String, Entry>,
    closed: HashSet<String>,
}

impl ToolCallTracker {
    /// Create an empty tracker for a new response stream.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn input_start(&mut self, id: &str, name: &str) -> Vec<TrackedEmission> {
        self.open.insert(
            id.to_string(),
            Entry {
                has_received_deltas: false,
            },
        );

        vec![TrackedEmission::Start {
            id: id.to_string(),
            name: name.to_string(),
        }]
    }

    pub(crate) fn input_delta(&mut self, id: &str, fragment: &str) -> Vec<TrackedEmission> {
        let Some(entry) = self.open.get_mut(id) else {
            log::warn!("Dropping tool input delta for unknown call id {id}");
            return Vec::new();
        };

        entry.has_received_deltas = true;

        vec![TrackedEmission::Delta {
            id: id.to_string(),
            partial_json: fragment.to_string(),
        }]
    }

    /// A deltaless end keeps the entry pending: the producer still owes us
    /// the arguments via a whole tool-call event.
    pub(crate) fn input_end(&mut self, id: &str) -> Vec<TrackedEmission> {
        let Some(entry) = self.open.get(id) else {
            return Vec::new();
        };

        if entry.has_received_deltas {
            self.open.remove(id);
            self.closed.insert(id.to_string());
            vec![TrackedEmission::Stop { id: id.to_string() }]
        } else {
            Vec::new()
        }
    }

    pub(crate) fn whole_call(&mut self, id: &str, name: &str, input: &Value) -> Vec<TrackedEmission> {
        if self.closed.contains(id) {
            return Vec::new();
        }

        let serialized = input.to_string();

        match self.open.remove(id) {
            Some(entry) if !entry.has_received_deltas => {
                self.closed.insert(id.to_string());
                vec![
                    TrackedEmission::Delta {
                        id: id.to_string(),
                        partial_json: serialized,
                    },
                    TrackedEmission::Stop { id: id.to_string() },
                ]
            }
            Some(_) => {
                // The streamed deltas already carried the input; the whole
                // call only closes the block.
                self.closed.insert(id.to_string());
                vec![TrackedEmission::Stop { id: id.to_string() }]
            }
            None => {
                self.closed.insert(id.to_string());
                vec![
                    TrackedEmission::Start {
                        id: id.to_string(),
                        name: name.to_string(),
                    },
                    TrackedEmission::Delta {
                        id: id.to_string(),
                        partial_json: serialized,
                    },
                    TrackedEmission::Stop { id: id.to_string() },
                ]
            }
        }
    }

    /// Close every still-pending entry at stream end.
    pub(crate) fn finish(&mut self) -> Vec<TrackedEmission> {
        let mut emissions: Vec<TrackedEmission> = self
            .open
            .drain()
            .map(|(id, _)| TrackedEmission::Stop { id })
            .collect();

        // Drain order is arbitrary; stable output keeps downstream
        // deterministic.
        emissions.sort_by(|a, b| {
            let (TrackedEmission::Stop { id: a }, TrackedEmission::Stop { id: b }) = (a, b) else {
                return std::cmp::Ordering::Equal;
            };
            a.cmp(b)
        });

        for emission in &emissions {
            if let TrackedEmission::Stop { id } = emission {
                self.closed.insert(id.clone());
            }
        }

        emissions
    }
}

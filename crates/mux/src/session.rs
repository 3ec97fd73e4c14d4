//! Feed session state machine
//!
//! Interprets decoded frames from one upstream connection: buffers the
//! initial snapshot backlog, flushes it in bounded batches, detects the
//! end-of-snapshot marker, and forwards everything after it as individual
//! live updates. Pure state transitions, no I/O — the provider task drives
//! it and ships the resulting events to the dispatcher.

use serde_json::Value;
use tracing::trace;

use crate::protocol::ProviderState;
use gridmux_frame::{Command, Frame};
use gridmux_metadata::ProviderConfig;

/// Phrases that mark the end of the snapshot backlog when the feed does not
/// document an exact token. Matched case-insensitively as substrings.
pub const FALLBACK_END_PHRASES: [&str; 2] = ["end of snapshot", "snapshot complete"];

/// Events produced by the session, broadcast by the dispatcher to every
/// subscriber of the owning provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ProviderState),
    SnapshotBatch {
        records: Vec<Value>,
        is_partial: bool,
        total_received: usize,
    },
    SnapshotComplete,
    Live(Value),
    Error(String),
}

pub struct FeedSession {
    state: ProviderState,
    batch_threshold: usize,
    end_token: Option<String>,
    /// Connect-only providers have nothing to snapshot and never buffer.
    buffering: bool,
    buffer: Vec<Value>,
    snapshot_rows: usize,
    messages_received: u64,
}

impl FeedSession {
    pub fn new(config: &ProviderConfig, batch_threshold: usize) -> Self {
        Self {
            state: ProviderState::Connecting,
            batch_threshold,
            end_token: config.snapshot_end_token.clone(),
            buffering: !config.is_connect_only(),
            buffer: Vec::new(),
            snapshot_rows: 0,
            messages_received: 0,
        }
    }

    pub fn state(&self) -> ProviderState {
        self.state
    }

    /// Records parsed since the session started.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Snapshot rows received in the current snapshot cycle.
    pub fn snapshot_rows(&self) -> usize {
        self.snapshot_rows
    }

    /// Called once the upstream handshake has gone out. Connect-only
    /// sessions have no snapshot phase and go straight to streaming.
    pub fn handshake_complete(&mut self) {
        self.state = if self.buffering {
            ProviderState::AwaitingSnapshot
        } else {
            ProviderState::Streaming
        };
    }

    /// Re-arm for a fresh snapshot cycle without reconnecting.
    pub fn refresh(&mut self) -> Vec<ProviderEvent> {
        if !self.buffering {
            return Vec::new();
        }
        self.state = ProviderState::AwaitingSnapshot;
        self.buffer.clear();
        self.snapshot_rows = 0;
        vec![ProviderEvent::Status(ProviderState::AwaitingSnapshot)]
    }

    pub fn on_frame(&mut self, frame: &Frame) -> Vec<ProviderEvent> {
        match frame.command {
            Command::Message => self.on_message(frame),
            Command::Error => {
                let message = frame
                    .body
                    .clone()
                    .unwrap_or_else(|| "upstream error".to_string());
                vec![ProviderEvent::Error(message)]
            }
            // CONNECTED acks and receipts carry no application data.
            _ => Vec::new(),
        }
    }

    fn on_message(&mut self, frame: &Frame) -> Vec<ProviderEvent> {
        let body = frame.body.as_deref().unwrap_or("");

        if self.is_end_marker(body) {
            return self.finish_snapshot();
        }

        let record: Value = match serde_json::from_str(body) {
            Ok(record) => record,
            Err(_) => {
                // Unparseable records are dropped, uncounted, state untouched.
                trace!(len = body.len(), "dropping unparseable record");
                return Vec::new();
            }
        };
        self.messages_received += 1;

        match self.state {
            ProviderState::AwaitingSnapshot => {
                self.buffer.push(record);
                self.snapshot_rows += 1;
                if self.buffer.len() >= self.batch_threshold {
                    let records = std::mem::take(&mut self.buffer);
                    vec![ProviderEvent::SnapshotBatch {
                        records,
                        is_partial: true,
                        total_received: self.snapshot_rows,
                    }]
                } else {
                    Vec::new()
                }
            }
            _ => vec![ProviderEvent::Live(record)],
        }
    }

    fn finish_snapshot(&mut self) -> Vec<ProviderEvent> {
        if self.state != ProviderState::AwaitingSnapshot {
            // Marker outside a snapshot cycle is noise.
            return Vec::new();
        }
        self.state = ProviderState::Streaming;

        let mut events = Vec::new();
        if self.buffering {
            let records = std::mem::take(&mut self.buffer);
            events.push(ProviderEvent::SnapshotBatch {
                records,
                is_partial: false,
                total_received: self.snapshot_rows,
            });
        }
        events.push(ProviderEvent::SnapshotComplete);
        events.push(ProviderEvent::Status(ProviderState::Streaming));
        events
    }

    fn is_end_marker(&self, body: &str) -> bool {
        // A documented exact token takes the fallback phrases out of play,
        // so prose records mentioning a snapshot cannot end the cycle.
        if let Some(ref token) = self.end_token {
            return body.trim() == token;
        }
        let lowered = body.to_lowercase();
        FALLBACK_END_PHRASES
            .iter()
            .any(|phrase| lowered.contains(phrase))
    }
}

//! Lifecycle events emitted by the engine.
//!
//! Delivery is fire-and-forget: [`EventSink::emit`] returns nothing and a sink
//! that cannot deliver drops the event. Events serialise one per line (NDJSON).

use std::io::{self, Write};
use std::sync::{Arc, Mutex, mpsc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::plugins::Hook;
use crate::types::{CompanyId, Segment, Stage, TurnId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    TurnStarted {
        companies: usize,
        segments: usize,
    },
    StageStarted {
        stage: Stage,
    },
    StageCompleted {
        stage: Stage,
        succeeded: usize,
        failed: usize,
    },
    /// Already committed by an earlier run; not recomputed.
    CompanySkipped {
        company: CompanyId,
    },
    SegmentFailed {
        segment: Segment,
        companies: Vec<CompanyId>,
        reason: String,
    },
    CompanyFailed {
        company: CompanyId,
        stage: Stage,
        reason: String,
    },
    PluginFailed {
        plugin: String,
        hook: Hook,
        reason: String,
    },
    TurnCompleted {
        completed: usize,
        skipped: usize,
        failed: usize,
        duration_ms: u64,
    },
    TurnFailed {
        completed: usize,
        failed: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub turn: TurnId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn now(turn: TurnId, kind: EventKind) -> Self {
        Event { turn, timestamp: Utc::now(), kind }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Collects events in memory, in emission order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drain collected events, leaving the log empty.
    pub fn take(&self) -> Vec<Event> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards events to a receiver; a dropped receiver silently discards them.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        ChannelSink { tx: Mutex::new(tx) }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

/// Mirrors events into the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let turn = event.turn;
        match &event.kind {
            EventKind::SegmentFailed { segment, reason, .. } => warn!(%turn, %segment, %reason, "segment failed"),
            EventKind::CompanyFailed { company, stage, reason } => {
                warn!(%turn, %company, %stage, %reason, "company failed")
            }
            EventKind::PluginFailed { plugin, hook, reason } => warn!(%turn, %plugin, %hook, %reason, "plugin failed"),
            EventKind::TurnFailed { reason, .. } => warn!(%turn, %reason, "turn failed"),
            kind => info!(%turn, ?kind, "event"),
        }
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Fanout { sinks }
    }
}

impl EventSink for Fanout {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Write events as NDJSON, one object per line.
pub fn write_ndjson<W: Write>(events: &[Event], mut writer: W) -> io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writeln!(writer)?;
    }
    writer.flush()
}

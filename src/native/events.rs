//! Evaluation events for observers.
//!
//! The dispatcher reports what it decided and what it ran through a
//! sink reference; nothing in the evaluation path depends on anyone
//! listening. The default sink drops everything.

use std::sync::Mutex;

use crate::native::analyzer::NativeKind;

/// One observable step of a native evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    /// The analyzer routed a set function onto the native path.
    NativeSelected { function: String, kind: NativeKind },
    /// A cached list answered the read; no SQL ran.
    ServedFromCache,
    /// Statement text, reported immediately before execution.
    ExecutingSql(String),
    /// An explicitly native function fell back to in-memory
    /// evaluation under the `warn` alert policy.
    FallbackWarning { function: String, reason: String },
}

/// Receives evaluation events. Shared across statements, so
/// implementations synchronize internally.
pub trait NativeEventSink: Send + Sync {
    fn notify(&self, event: NativeEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NativeEventSink for NoopSink {
    fn notify(&self, _event: NativeEvent) {}
}

/// Records every event, for assertions on dispatcher behavior.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<NativeEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NativeEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Statement texts in execution order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                NativeEvent::ExecutingSql(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn warning_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, NativeEvent::FallbackWarning { .. }))
            .count()
    }

    pub fn cache_hits(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, NativeEvent::ServedFromCache))
            .count()
    }
}

impl NativeEventSink for CollectingSink {
    fn notify(&self, event: NativeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

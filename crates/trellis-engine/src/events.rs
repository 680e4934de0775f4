//! Typed execution events and observer fan-out.
//!
//! Observers are invoked synchronously in subscription order; emission
//! clones the observer list first so no lock is held across callbacks, and a
//! panicking observer is caught and logged rather than propagated.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::StageStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub pipeline_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PipelineStarted {
        graph_name: String,
        node_count: usize,
    },
    PipelineCompleted {
        visited: Vec<String>,
        duration_ms: u64,
    },
    PipelineFailed {
        reason: String,
    },
    StageStarted {
        node_id: String,
        handler_type: String,
    },
    StageCompleted {
        node_id: String,
        status: StageStatus,
    },
    StageFailed {
        node_id: String,
        reason: String,
    },
    StageRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ParallelStarted {
        node_id: String,
        branch_count: usize,
    },
    ParallelBranchStarted {
        node_id: String,
        branch: String,
    },
    ParallelBranchCompleted {
        node_id: String,
        branch: String,
        status: StageStatus,
    },
    ParallelCompleted {
        node_id: String,
        succeeded: usize,
        failed: usize,
    },
    InterviewStarted {
        node_id: String,
    },
    InterviewCompleted {
        node_id: String,
        choice: String,
    },
    InterviewTimeout {
        node_id: String,
    },
    CheckpointSaved {
        node_id: String,
    },
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Closure adapter so tests and the CLI can subscribe with a plain function.
pub struct FnObserver<F: Fn(&Event) + Send + Sync>(pub F);

impl<F: Fn(&Event) + Send + Sync> EventObserver for FnObserver<F> {
    fn on_event(&self, event: &Event) {
        (self.0)(event)
    }
}

/// Opaque handle returned by [`EventEmitter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<Mutex<EmitterInner>>,
}

#[derive(Default)]
struct EmitterInner {
    next_id: u64,
    observers: Vec<(u64, Arc<dyn EventObserver>)>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, observer));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .lock()
            .unwrap()
            .observers
            .retain(|(oid, _)| *oid != id.0);
    }

    pub fn emit(&self, pipeline_id: &str, kind: EventKind) {
        let event = Event {
            timestamp: Utc::now(),
            pipeline_id: pipeline_id.to_string(),
            kind,
        };
        let observers: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .observers
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                tracing::warn!(pipeline = pipeline_id, "event observer panicked");
            }
        }
    }
}

/// Observer that records every event, for tests and status displays.
#[derive(Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<Event>>,
}

impl CollectingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Names of event kinds, in emission order.
    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| kind_name(&e.kind).to_string())
            .collect()
    }
}

impl EventObserver for CollectingObserver {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::PipelineStarted { .. } => "pipeline_started",
        EventKind::PipelineCompleted { .. } => "pipeline_completed",
        EventKind::PipelineFailed { .. } => "pipeline_failed",
        EventKind::StageStarted { .. } => "stage_started",
        EventKind::StageCompleted { .. } => "stage_completed",
        EventKind::StageFailed { .. } => "stage_failed",
        EventKind::StageRetrying { .. } => "stage_retrying",
        EventKind::ParallelStarted { .. } => "parallel_started",
        EventKind::ParallelBranchStarted { .. } => "parallel_branch_started",
        EventKind::ParallelBranchCompleted { .. } => "parallel_branch_completed",
        EventKind::ParallelCompleted { .. } => "parallel_completed",
        EventKind::InterviewStarted { .. } => "interview_started",
        EventKind::InterviewCompleted { .. } => "interview_completed",
        EventKind::InterviewTimeout { .. } => "interview_timeout",
        EventKind::CheckpointSaved { .. } => "checkpoint_saved",
    }
}

//! Event Healer
//!
//! Watches cluster events per namespace, classifies them, tracks repeated
//! failures per pod and deletes pods stuck in known failure loops so their
//! controllers can recreate them. Deletion only happens after every safety
//! gate passes and within a process-wide rate limit; in dry-run mode the
//! whole decision path runs but nothing is deleted.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod k8s;
pub mod limiter;
pub mod pipeline;
pub mod safety;
pub mod source;
pub mod types;
pub mod watch;

pub use classifier::{Classification, Classifier, ReasonTable, SkipReason};
pub use config::HealerConfig;
pub use engine::{DecisionEngine, RemediationState, Resolution, Transition, TransitionCause};
pub use error::{Error, Result};
pub use executor::{ActionExecutor, ActionOutcome, ClusterActions, PodSnapshot};
pub use limiter::RemediationRateLimiter;
pub use pipeline::{EventProcessor, NamespacePipeline, PipelineStats, Processed};
pub use source::{EventSource, EventStream, SourceError};
pub use types::{EventCategory, NormalizedEvent, ObjectRef, RawEvent, WatchEventKind};
pub use watch::{WatchCursor, WatchItem, WatchManager};

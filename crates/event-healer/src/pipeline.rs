//! Per-namespace processing pipeline.
//!
//! Each watched namespace gets one [`NamespacePipeline`]: a single task that
//! pulls items from its [`WatchManager`] and pushes them through the
//! classifier, the decision engine and, when an object crosses the failure
//! threshold, the safety gates and the executor. Everything for a namespace
//! happens in order on that task; the only state shared across namespaces is
//! the remediation rate limiter.

use crate::classifier::{Classification, Classifier};
use crate::config::HealerConfig;
use crate::engine::{DecisionEngine, Resolution, Transition};
use crate::error::Result;
use crate::executor::{ActionExecutor, ActionOutcome, ClusterActions};
use crate::history::HistoryStore;
use crate::limiter::RemediationRateLimiter;
use crate::safety::{self, SafetyVerdict, Suppression, REMEDIABLE_KIND};
use crate::source::EventSource;
use crate::types::{NormalizedEvent, ObjectRef};
use crate::watch::{WatchItem, WatchManager};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Counters reported when a pipeline stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub events: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub unattributed: u64,
    pub transitions: u64,
    pub suppressed: u64,
    pub applied: u64,
    pub simulated: u64,
    pub failed: u64,
    pub resyncs: u64,
    pub evicted: u64,
}

/// What handling one watch item produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Processed {
    pub record: Option<NormalizedEvent>,
    pub transitions: Vec<Transition>,
    pub outcome: Option<ActionOutcome>,
}

/// Classifier, histories, engine and executor for one namespace
pub struct EventProcessor {
    classifier: Classifier,
    store: HistoryStore,
    engine: DecisionEngine,
    executor: ActionExecutor,
    limiter: Arc<RemediationRateLimiter>,
    cancel: CancellationToken,
    stats: PipelineStats,
}

impl EventProcessor {
    pub fn new(
        config: &HealerConfig,
        executor: ActionExecutor,
        limiter: Arc<RemediationRateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            classifier: Classifier::new(config.reason_table(), config.classifier_settings()),
            store: HistoryStore::new(config.history_capacity, config.idle_eviction()),
            engine: DecisionEngine::new(config.engine_settings()),
            executor,
            limiter,
            cancel,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn histories(&self) -> &HistoryStore {
        &self.store
    }

    /// Process one item from the watch
    pub async fn handle(&mut self, item: WatchItem, now: DateTime<Utc>) -> Processed {
        let raw = match item {
            WatchItem::Resync { bookmark } => {
                self.stats.resyncs += 1;
                self.classifier.note_resync(&bookmark, &self.store);
                return Processed::default();
            }
            WatchItem::Event(raw) => raw,
        };

        self.stats.events += 1;
        let record = match self.classifier.classify(&raw, &mut self.store, now) {
            Classification::Skipped(reason) => {
                self.stats.skipped += 1;
                debug!(kind = %raw.kind, reason = ?reason, event_reason = %raw.reason_or_empty(), "Skipping event");
                return Processed::default();
            }
            Classification::Record(record) => record,
        };

        let mut processed = Processed {
            record: Some(record.clone()),
            ..Processed::default()
        };

        if record.duplicate {
            self.stats.duplicates += 1;
            debug!(object = %record.object, reason = %record.reason, count = record.count, "Folded redelivered event");
            return processed;
        }

        info!(
            object = %record.object,
            uid = %record.object.uid,
            category = %record.category,
            reason = %record.reason,
            count = record.count,
            occurrences = record.occurrences,
            age_secs = record.age.num_seconds(),
            "Classified event"
        );

        if !record.object.is_identified() {
            self.stats.unattributed += 1;
            return processed;
        }

        let Some(history) = self.store.get_mut(&record.object.uid) else {
            return processed;
        };
        let step = self.engine.observe(&record, history, now);
        self.note_transitions(&step.transitions);
        processed.transitions = step.transitions;

        if step.pending {
            let (transitions, outcome) = self.remediate(&record.object, now).await;
            processed.transitions.extend(transitions);
            processed.outcome = outcome;
        }
        processed
    }

    /// Expire timers and evict idle objects
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let transitions = self.engine.tick(&mut self.store, now);
        self.note_transitions(&transitions);

        for uid in self.store.evict_idle(now) {
            self.engine.forget(&uid);
            self.stats.evicted += 1;
        }
        transitions
    }

    /// Run the safety gates for a pending object and act on the verdict
    async fn remediate(
        &mut self,
        object: &ObjectRef,
        now: DateTime<Utc>,
    ) -> (Vec<Transition>, Option<ActionOutcome>) {
        let snapshot = if object.kind == REMEDIABLE_KIND {
            let inspected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                result = self.executor.inspect(object) => Some(result),
            };
            match inspected {
                None => {
                    return (self.settle(object, Resolution::Suppress(Suppression::Cancelled), now), None)
                }
                Some(Err(err)) => {
                    warn!(object = %object, error = %err, "Could not inspect pod; not remediating");
                    let resolution = Resolution::Suppress(Suppression::InspectionFailed(err.to_string()));
                    return (self.settle(object, resolution, now), None);
                }
                Some(Ok(snapshot)) => snapshot,
            }
        } else {
            None
        };

        let Some(history) = self.store.get(&object.uid) else {
            return (Vec::new(), None);
        };
        let cooldown = self.engine.settings().cooldown;
        let resolution = match safety::evaluate(object, snapshot.as_ref(), history, cooldown, now) {
            SafetyVerdict::Pass if self.cancel.is_cancelled() => Resolution::Suppress(Suppression::Cancelled),
            SafetyVerdict::Pass => match self.limiter.try_acquire(now).await {
                Ok(()) => Resolution::Approve,
                Err(err) => {
                    warn!(object = %object, error = %err, "Remediation deferred by rate limit");
                    Resolution::Suppress(Suppression::RateLimited)
                }
            },
            SafetyVerdict::Suppress(reason) => Resolution::Suppress(reason),
            SafetyVerdict::Gone => Resolution::Gone,
        };

        let approved = resolution == Resolution::Approve;
        let mut transitions = self.settle(object, resolution, now);
        if !approved {
            return (transitions, None);
        }

        let outcome = self.executor.execute(object).await;
        match &outcome {
            ActionOutcome::Applied => self.stats.applied += 1,
            ActionOutcome::Simulated => self.stats.simulated += 1,
            ActionOutcome::Failed(_) => self.stats.failed += 1,
        }
        info!(
            object = %object,
            uid = %object.uid,
            outcome = %outcome,
            dry_run = self.executor.is_dry_run(),
            "Remediation action finished"
        );

        if let Some(history) = self.store.get_mut(&object.uid) {
            let after = self.engine.record_outcome(object, &outcome, history);
            self.note_transitions(&after);
            transitions.extend(after);
        }
        (transitions, Some(outcome))
    }

    fn settle(&mut self, object: &ObjectRef, resolution: Resolution, now: DateTime<Utc>) -> Vec<Transition> {
        if let Resolution::Suppress(reason) = &resolution {
            self.stats.suppressed += 1;
            info!(object = %object, reason = %reason, "Remediation suppressed");
        }
        let Some(history) = self.store.get_mut(&object.uid) else {
            return Vec::new();
        };
        let transitions = self.engine.resolve(object, resolution, history, now);
        self.note_transitions(&transitions);
        transitions
    }

    fn note_transitions(&mut self, transitions: &[Transition]) {
        for transition in transitions {
            self.stats.transitions += 1;
            info!(
                object = %transition.object,
                uid = %transition.object.uid,
                from = %transition.from,
                to = %transition.to,
                cause = %transition.cause,
                "State transition"
            );
        }
    }
}

/// Watch plus processor for one namespace, run as its own task
pub struct NamespacePipeline {
    namespace: String,
    watch: WatchManager,
    processor: EventProcessor,
    tick: Duration,
    cancel: CancellationToken,
}

impl NamespacePipeline {
    pub fn new(
        namespace: impl Into<String>,
        config: &HealerConfig,
        source: Arc<dyn EventSource>,
        actions: Arc<dyn ClusterActions>,
        limiter: Arc<RemediationRateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        let namespace = namespace.into();
        let watch = WatchManager::new(
            source,
            namespace.clone(),
            config.watch.start_bookmark.clone(),
            config.watch_settings(),
            cancel.clone(),
        );
        let executor = ActionExecutor::new(actions, config.dry_run);
        let processor = EventProcessor::new(config, executor, limiter, cancel.clone());

        Self {
            namespace,
            watch,
            processor,
            tick: config.tick_interval(),
            cancel,
        }
    }

    /// Run until cancelled or the event source fails permanently
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn run(mut self) -> Result<PipelineStats> {
        info!(
            dry_run = self.processor.executor.is_dry_run(),
            tick_secs = self.tick.as_secs(),
            "Starting namespace pipeline"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.processor.tick(Utc::now());
                }
                item = self.watch.next() => match item? {
                    Some(item) => {
                        self.processor.handle(item, Utc::now()).await;
                    }
                    None => break,
                },
            }
        }

        let stats = self.processor.stats().clone();
        info!(
            events = stats.events,
            transitions = stats.transitions,
            applied = stats.applied,
            simulated = stats.simulated,
            suppressed = stats.suppressed,
            failed = stats.failed,
            resyncs = stats.resyncs,
            bookmark = ?self.watch.cursor().bookmark(),
            "Namespace pipeline stopped"
        );
        Ok(stats)
    }
}


//! Per-object remediation state machine.
//!
//! ```text
//! Healthy --failure--> Suspect --count >= threshold--> PendingRemediation
//!    ^                    |                               |      |       |
//!    |   healthy signal / timer expired                   |      |       gone
//!    +--------------------+                     suppressed|      |pass   v
//!    +----------------------------------------------------+      |   Remediated
//!    +--cooldown elapsed / action failed-- Cooldown <------------+
//! ```
//!
//! `PendingRemediation` only exists between [`DecisionEngine::observe`]
//! requesting an evaluation and [`DecisionEngine::resolve`] settling it. The
//! engine itself performs no I/O: the caller runs the safety checks and the
//! executor and reports back.

use crate::executor::ActionOutcome;
use crate::history::{HistoryStore, ObjectHistory};
use crate::safety::Suppression;
use crate::types::{EventCategory, NormalizedEvent, ObjectRef};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Remediation state of one object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemediationState {
    #[default]
    Healthy,
    /// Failure evidence seen, below threshold
    Suspect,
    /// Threshold crossed, safety checks running
    PendingRemediation,
    /// Action taken, further actions suppressed until the cooldown elapses
    Cooldown,
    /// Object generation ended; terminal
    Remediated,
}

impl fmt::Display for RemediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Suspect => write!(f, "Suspect"),
            Self::PendingRemediation => write!(f, "PendingRemediation"),
            Self::Cooldown => write!(f, "Cooldown"),
            Self::Remediated => write!(f, "Remediated"),
        }
    }
}

/// What drove a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionCause {
    FailureObserved,
    ThresholdReached,
    HealthySignal,
    FailureTimerExpired,
    SafetyChecksPassed,
    Suppressed(Suppression),
    ObjectGone,
    CooldownElapsed,
    ActionFailed(String),
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailureObserved => write!(f, "failure observed"),
            Self::ThresholdReached => write!(f, "failure threshold reached"),
            Self::HealthySignal => write!(f, "healthy signal"),
            Self::FailureTimerExpired => write!(f, "failure timer expired"),
            Self::SafetyChecksPassed => write!(f, "safety checks passed"),
            Self::Suppressed(reason) => write!(f, "suppressed: {reason}"),
            Self::ObjectGone => write!(f, "object no longer exists"),
            Self::CooldownElapsed => write!(f, "cooldown elapsed"),
            Self::ActionFailed(reason) => write!(f, "action failed: {reason}"),
        }
    }
}

/// One state change, as recorded in the decision trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub object: ObjectRef,
    pub from: RemediationState,
    pub to: RemediationState,
    pub cause: TransitionCause,
}

/// How the caller settled a pending remediation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// All gates passed; the action is being emitted
    Approve,
    Suppress(Suppression),
    Gone,
}

/// Result of observing one event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub transitions: Vec<Transition>,
    /// The object entered `PendingRemediation` and needs safety checks
    pub pending: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Consecutive failures needed to consider remediation
    pub threshold: u32,
    pub cooldown: Duration,
    /// How long a suspect may go without a repeat before it is cleared
    pub failure_window: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::minutes(10),
            failure_window: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectMachine {
    object: ObjectRef,
    state: RemediationState,
    last_failure_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    /// Episode an action was emitted for
    acted_episode: Option<u64>,
    /// Episode barred from further action after a failed action
    blocked_episode: Option<u64>,
}

impl ObjectMachine {
    fn new(object: ObjectRef) -> Self {
        Self {
            object,
            state: RemediationState::Healthy,
            last_failure_at: None,
            cooldown_until: None,
            acted_episode: None,
            blocked_episode: None,
        }
    }

    fn move_to(
        &mut self,
        to: RemediationState,
        cause: TransitionCause,
        transitions: &mut Vec<Transition>,
    ) {
        transitions.push(Transition {
            object: self.object.clone(),
            from: self.state,
            to,
            cause,
        });
        self.state = to;
    }

    fn episode_handled(&self, episode: u64) -> bool {
        self.acted_episode == Some(episode) || self.blocked_episode == Some(episode)
    }
}

#[derive(Debug)]
pub struct DecisionEngine {
    settings: EngineSettings,
    machines: HashMap<String, ObjectMachine>,
}

impl DecisionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            machines: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self, uid: &str) -> RemediationState {
        self.machines
            .get(uid)
            .map_or(RemediationState::Healthy, |machine| machine.state)
    }

    pub fn tracked(&self) -> usize {
        self.machines.len()
    }

    /// Feed one classified event into the object's state machine
    pub fn observe(
        &mut self,
        event: &NormalizedEvent,
        history: &mut ObjectHistory,
        now: DateTime<Utc>,
    ) -> Step {
        let mut step = Step::default();
        if event.duplicate || !event.object.is_identified() {
            return step;
        }

        let settings = self.settings;
        let machine = self
            .machines
            .entry(event.object.uid.clone())
            .or_insert_with(|| ObjectMachine::new(event.object.clone()));

        expire_timers(machine, history, &settings, now, &mut step.transitions);

        match (machine.state, event.category) {
            (RemediationState::Healthy, category) if category.is_failure() => {
                machine.last_failure_at = Some(now);
                machine.move_to(
                    RemediationState::Suspect,
                    TransitionCause::FailureObserved,
                    &mut step.transitions,
                );
                step.pending = check_threshold(machine, history, &settings, &mut step.transitions);
            }
            (RemediationState::Suspect, category) if category.is_failure() => {
                machine.last_failure_at = Some(now);
                step.pending = check_threshold(machine, history, &settings, &mut step.transitions);
            }
            (RemediationState::Suspect, EventCategory::Informational) => {
                history.reset_failures();
                machine.last_failure_at = None;
                machine.move_to(
                    RemediationState::Healthy,
                    TransitionCause::HealthySignal,
                    &mut step.transitions,
                );
            }
            (RemediationState::Remediated, _) => {
                debug!(object = %event.object, "Ignoring event for an ended object generation");
            }
            // Cooldown folds further evidence; Transient and Unknown never move the machine
            _ => {}
        }

        step
    }

    /// Settle a pending remediation once safety checks ran
    pub fn resolve(
        &mut self,
        object: &ObjectRef,
        resolution: Resolution,
        history: &mut ObjectHistory,
        now: DateTime<Utc>,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let cooldown = self.settings.cooldown;
        let Some(machine) = self.machines.get_mut(&object.uid) else {
            return transitions;
        };
        if machine.state != RemediationState::PendingRemediation {
            warn!(object = %object, state = %machine.state, "Resolution for an object that is not pending; ignoring");
            return transitions;
        }

        match resolution {
            Resolution::Approve => {
                machine.acted_episode = Some(history.episode());
                machine.cooldown_until = Some(now + cooldown);
                history.mark_remediated(now);
                machine.move_to(
                    RemediationState::Cooldown,
                    TransitionCause::SafetyChecksPassed,
                    &mut transitions,
                );
            }
            Resolution::Suppress(reason) => {
                // The object must build up a fresh run of failures before it is reconsidered
                history.reset_failures();
                machine.last_failure_at = None;
                machine.move_to(
                    RemediationState::Healthy,
                    TransitionCause::Suppressed(reason),
                    &mut transitions,
                );
            }
            Resolution::Gone => {
                machine.move_to(
                    RemediationState::Remediated,
                    TransitionCause::ObjectGone,
                    &mut transitions,
                );
            }
        }
        transitions
    }

    /// Record what the executor did with an approved action
    pub fn record_outcome(
        &mut self,
        object: &ObjectRef,
        outcome: &ActionOutcome,
        history: &mut ObjectHistory,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let Some(machine) = self.machines.get_mut(&object.uid) else {
            return transitions;
        };

        if let ActionOutcome::Failed(reason) = outcome {
            machine.blocked_episode = Some(history.episode());
            machine.cooldown_until = None;
            history.clear_remediation();
            machine.move_to(
                RemediationState::Healthy,
                TransitionCause::ActionFailed(reason.clone()),
                &mut transitions,
            );
        }
        transitions
    }

    /// Apply elapsed-time transitions to every tracked object
    pub fn tick(&mut self, store: &mut HistoryStore, now: DateTime<Utc>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let settings = self.settings;
        for (uid, machine) in &mut self.machines {
            if let Some(history) = store.get_mut(uid) {
                expire_timers(machine, history, &settings, now, &mut transitions);
            }
        }
        transitions
    }

    /// Drop state for objects whose history was evicted
    pub fn forget(&mut self, uid: &str) {
        if let Some(machine) = self.machines.remove(uid) {
            debug!(object = %machine.object, state = %machine.state, "Forgetting idle object");
        }
    }
}

fn expire_timers(
    machine: &mut ObjectMachine,
    history: &mut ObjectHistory,
    settings: &EngineSettings,
    now: DateTime<Utc>,
    transitions: &mut Vec<Transition>,
) {
    match machine.state {
        RemediationState::Cooldown if machine.cooldown_until.is_some_and(|until| now >= until) => {
            machine.cooldown_until = None;
            machine.move_to(
                RemediationState::Healthy,
                TransitionCause::CooldownElapsed,
                transitions,
            );
        }
        RemediationState::Suspect
            if machine
                .last_failure_at
                .is_some_and(|at| now - at > settings.failure_window) =>
        {
            history.reset_failures();
            machine.last_failure_at = None;
            machine.move_to(
                RemediationState::Healthy,
                TransitionCause::FailureTimerExpired,
                transitions,
            );
        }
        _ => {}
    }
}

fn check_threshold(
    machine: &mut ObjectMachine,
    history: &ObjectHistory,
    settings: &EngineSettings,
    transitions: &mut Vec<Transition>,
) -> bool {
    if history.consecutive_failures() < settings.threshold {
        return false;
    }
    if machine.episode_handled(history.episode()) {
        debug!(
            object = %machine.object,
            episode = history.episode(),
            "Failure episode already handled; not remediating again"
        );
        return false;
    }
    machine.move_to(
        RemediationState::PendingRemediation,
        TransitionCause::ThresholdReached,
        transitions,
    );
    true
}

//! Lifecycle state machine for driver-backed objects
//!
//! A [`LifecycleMachine`] reconciles the *expected* state requested by callers
//! with the *current* state observed from a [`Driver`]. Transitions happen one
//! hop at a time through a transitional state:
//!
//! ```text
//! offline --load--> [loading] --> stopped --start--> [starting] --> running
//!    ^                              |  ^                                |
//!    +------ [unloading] <-unload---+  +--------- [stopping] <--stop----+
//! ```
//!
//! After each hop the machine compares current and expected again and starts
//! the next hop if they still differ, so `offline -> running` is two
//! independently recoverable hops.
//!
//! The machine runs as a single task that owns all of its state; callers and
//! the driver talk to it through a channel. That keeps hops strictly
//! sequential without any locking around the state itself.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{self, Driver, DriverVerb, Monitor, MonitorEvent, VerbOptions, VerbOutcome};
use crate::error::{PaddockError, PaddockResult};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Offline,
    Loading,
    Stopped,
    Starting,
    Running,
    Stopping,
    Unloading,
}

impl LifecycleState {
    pub const STABLE: [LifecycleState; 3] = [
        LifecycleState::Offline,
        LifecycleState::Stopped,
        LifecycleState::Running,
    ];

    /// Stable states are the only valid expectations
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            LifecycleState::Offline | LifecycleState::Stopped | LifecycleState::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Offline => "offline",
            LifecycleState::Loading => "loading",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Unloading => "unloading",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = PaddockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offline" => Ok(LifecycleState::Offline),
            "loading" => Ok(LifecycleState::Loading),
            "stopped" => Ok(LifecycleState::Stopped),
            "starting" => Ok(LifecycleState::Starting),
            "running" => Ok(LifecycleState::Running),
            "stopping" => Ok(LifecycleState::Stopping),
            "unloading" => Ok(LifecycleState::Unloading),
            _ => Err(PaddockError::bad_attr("state", s)),
        }
    }
}

/// One row of the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub verb: DriverVerb,
    pub transitional: LifecycleState,
    pub target: LifecycleState,
}

/// The next hop from `current` towards `expected`, if any
pub fn transition_rule(
    current: LifecycleState,
    expected: LifecycleState,
) -> Option<TransitionRule> {
    use LifecycleState::*;

    let rule = |verb, transitional, target| {
        Some(TransitionRule {
            verb,
            transitional,
            target,
        })
    };

    match (current, expected) {
        (Offline, Stopped) | (Offline, Running) => rule(DriverVerb::Load, Loading, Stopped),
        (Stopped, Offline) => rule(DriverVerb::Unload, Unloading, Offline),
        (Stopped, Running) => rule(DriverVerb::Start, Starting, Running),
        (Running, Stopped) | (Running, Offline) => rule(DriverVerb::Stop, Stopping, Stopped),
        _ => None,
    }
}

/// Why a hop ended without reaching its target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransitionFault {
    /// A verb failed, or the driver fell back to the hop's origin state
    Driver { verb: DriverVerb, message: String },
    /// The driver reported a state the in-flight hop does not accept
    BadState {
        expected: LifecycleState,
        state: LifecycleState,
        accepts: Vec<LifecycleState>,
    },
    /// No outcome arrived within the verb timeout
    Timeout {
        verb: DriverVerb,
        #[serde(with = "humantime_serde")]
        after: Duration,
    },
    /// The driver reported an error outside any hop outcome
    Reported { message: String },
}

impl fmt::Display for TransitionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionFault::Driver { verb, message } => write!(f, "{} failed: {}", verb, message),
            TransitionFault::BadState {
                expected,
                state,
                accepts,
            } => write!(
                f,
                "BADSTATE: expected={} state={} accepts={:?}",
                expected, state, accepts
            ),
            TransitionFault::Timeout { verb, after } => {
                write!(f, "{} timed out after {:?}", verb, after)
            }
            TransitionFault::Reported { message } => write!(f, "driver error: {}", message),
        }
    }
}

impl From<TransitionFault> for PaddockError {
    fn from(fault: TransitionFault) -> Self {
        match fault {
            TransitionFault::Driver { verb, message } => PaddockError::driver(verb.to_string(), message),
            TransitionFault::BadState {
                expected,
                state,
                accepts,
            } => PaddockError::BadState {
                expected: expected.to_string(),
                state: state.to_string(),
                accepts: accepts.iter().map(ToString::to_string).collect(),
            },
            TransitionFault::Timeout { verb, after } => PaddockError::Timeout {
                operation: verb.to_string(),
                duration: after,
            },
            TransitionFault::Reported { message } => PaddockError::driver("monitor", message),
        }
    }
}

/// Events broadcast by a machine
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Current state changed
    State {
        current: LifecycleState,
        previous: LifecycleState,
    },
    /// Current matches expected; nothing in flight
    Done(LifecycleState),
    /// A hop failed, or the driver reported an error
    Error(TransitionFault),
    /// The driver reported a status payload
    Status(serde_json::Value),
}

/// The hop currently in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopSnapshot {
    pub verb: DriverVerb,
    pub origin: LifecycleState,
    pub target: LifecycleState,
}

/// Point-in-time view of a machine, cheap to read from any task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub current: LifecycleState,
    pub expected: LifecycleState,
    pub hop: Option<HopSnapshot>,
    pub status: Option<serde_json::Value>,
    pub fault: Option<TransitionFault>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub initial: LifecycleState,
    pub verb_timeout: Option<Duration>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            initial: LifecycleState::Offline,
            verb_timeout: Some(Duration::from_secs(120)),
        }
    }
}

type SettleResult = Result<LifecycleState, TransitionFault>;

pub(crate) enum MachineInput {
    SetExpected {
        target: LifecycleState,
        reply: oneshot::Sender<bool>,
        waiter: Option<oneshot::Sender<SettleResult>>,
    },
    Monitor(MonitorEvent),
    VerbFinished {
        hop: u64,
        result: PaddockResult<VerbOutcome>,
    },
    Advance {
        hop: u64,
    },
    HopTimeout {
        hop: u64,
    },
    RequestStatus,
    Shutdown,
}

/// Receiving half of a machine's channel, created before the driver
pub struct MachineInbox {
    tx: mpsc::UnboundedSender<MachineInput>,
    rx: mpsc::UnboundedReceiver<MachineInput>,
}

/// Create the channel a machine listens on. The [`Monitor`] goes to the
/// driver, the inbox to [`LifecycleMachine::spawn`].
pub fn channel() -> (Monitor, MachineInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Monitor::new(tx.clone()), MachineInbox { tx, rx })
}

/// Handle to a running lifecycle machine
pub struct LifecycleMachine {
    id: String,
    tx: mpsc::UnboundedSender<MachineInput>,
    events: broadcast::Sender<LifecycleEvent>,
    snapshot: watch::Receiver<MachineSnapshot>,
}

impl fmt::Debug for LifecycleMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("LifecycleMachine")
            .field("id", &self.id)
            .field("current", &snapshot.current)
            .field("expected", &snapshot.expected)
            .finish()
    }
}

impl LifecycleMachine {
    /// Start the machine task for `driver`. Must be called inside a Tokio runtime.
    pub fn spawn(
        id: impl Into<String>,
        driver: Arc<dyn Driver>,
        inbox: MachineInbox,
        options: MachineOptions,
    ) -> Self {
        let id = id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let initial = MachineSnapshot {
            current: options.initial,
            expected: options.initial,
            hop: None,
            status: None,
            fault: None,
            updated_at: Utc::now(),
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);

        let task = MachineTask {
            id: id.clone(),
            driver,
            current: options.initial,
            expected: options.initial,
            hop: None,
            next_hop: 0,
            status: None,
            fault: None,
            verb_timeout: options.verb_timeout,
            waiters: Vec::new(),
            events: events.clone(),
            snapshot: snapshot_tx,
            tx: inbox.tx.clone(),
        };
        tokio::spawn(task.run(inbox.rx));

        Self {
            id,
            tx: inbox.tx,
            events,
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current(&self) -> LifecycleState {
        self.snapshot.borrow().current
    }

    pub fn expected(&self) -> LifecycleState {
        self.snapshot.borrow().expected
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Request `target`; returns whether a new transition was initiated.
    ///
    /// Fails with `BadAttr` for transitional states. While a hop is in flight
    /// the new expectation is picked up when that hop finishes.
    pub async fn set_expected_state(&self, target: LifecycleState) -> PaddockResult<bool> {
        self.request(target, None).await
    }

    /// Request `target` and wait until the machine is quiescent there, or
    /// until a hop fails on the way.
    pub async fn settle(&self, target: LifecycleState) -> PaddockResult<LifecycleState> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.request(target, Some(waiter_tx)).await?;
        match waiter_rx.await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(fault)) => Err(fault.into()),
            Err(_) => Err(self.gone()),
        }
    }

    /// Ask the driver for a status report
    pub fn request_status(&self) {
        let _ = self.tx.send(MachineInput::RequestStatus);
    }

    /// Stop the machine task; the driver is not touched
    pub fn shutdown(&self) {
        let _ = self.tx.send(MachineInput::Shutdown);
    }

    async fn request(
        &self,
        target: LifecycleState,
        waiter: Option<oneshot::Sender<SettleResult>>,
    ) -> PaddockResult<bool> {
        if !target.is_stable() {
            return Err(PaddockError::bad_attr("state", target));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MachineInput::SetExpected {
                target,
                reply: reply_tx,
                waiter,
            })
            .map_err(|_| self.gone())?;
        reply_rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> PaddockError {
        PaddockError::Internal {
            message: format!("lifecycle machine for '{}' has stopped", self.id),
        }
    }
}

impl Drop for LifecycleMachine {
    fn drop(&mut self) {
        let _ = self.tx.send(MachineInput::Shutdown);
    }
}

struct Hop {
    id: u64,
    rule: TransitionRule,
    origin: LifecycleState,
    timer: Option<JoinHandle<()>>,
    /// The verb returned `Pending`; until then an origin report predates it
    pending: bool,
}

impl Hop {
    fn accepts(&self) -> Vec<LifecycleState> {
        vec![self.rule.target, self.rule.transitional, self.origin]
    }
}

struct MachineTask {
    id: String,
    driver: Arc<dyn Driver>,
    current: LifecycleState,
    expected: LifecycleState,
    hop: Option<Hop>,
    next_hop: u64,
    status: Option<serde_json::Value>,
    fault: Option<TransitionFault>,
    verb_timeout: Option<Duration>,
    waiters: Vec<oneshot::Sender<SettleResult>>,
    events: broadcast::Sender<LifecycleEvent>,
    snapshot: watch::Sender<MachineSnapshot>,
    tx: mpsc::UnboundedSender<MachineInput>,
}

impl MachineTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MachineInput>) {
        debug!(id = %self.id, "Lifecycle machine started at {}", self.current);

        while let Some(input) = rx.recv().await {
            match input {
                MachineInput::SetExpected {
                    target,
                    reply,
                    waiter,
                } => {
                    let initiated = self.set_expected(target);
                    self.publish();
                    let _ = reply.send(initiated);
                    if let Some(waiter) = waiter {
                        if self.is_quiescent() {
                            let _ = waiter.send(Ok(self.current));
                        } else {
                            self.waiters.push(waiter);
                        }
                    }
                }
                MachineInput::Monitor(event) => self.on_monitor(event),
                MachineInput::VerbFinished { hop, result } => self.on_verb_finished(hop, result),
                MachineInput::Advance { hop } => {
                    if let Some(target) = self.hop_target(hop) {
                        self.finish_hop(target);
                    }
                }
                MachineInput::HopTimeout { hop } => self.on_timeout(hop),
                MachineInput::RequestStatus => self.request_status(),
                MachineInput::Shutdown => break,
            }
            self.publish();
        }

        if let Some(hop) = self.hop.take() {
            if let Some(timer) = hop.timer {
                timer.abort();
            }
        }
        debug!(id = %self.id, "Lifecycle machine stopped at {}", self.current);
    }

    fn is_quiescent(&self) -> bool {
        self.hop.is_none() && self.current == self.expected
    }

    fn set_expected(&mut self, target: LifecycleState) -> bool {
        if target == self.expected && (self.hop.is_some() || self.current == target) {
            return false;
        }

        debug!(id = %self.id, "Expectation {} -> {}", self.expected, target);
        self.expected = target;

        if self.hop.is_some() {
            // Picked up when the in-flight hop finishes
            return true;
        }
        if self.current == self.expected {
            self.done();
            return false;
        }
        self.evaluate()
    }

    /// Start the next hop if current and expected differ
    fn evaluate(&mut self) -> bool {
        if self.hop.is_some() || self.current == self.expected {
            return false;
        }
        let Some(rule) = transition_rule(self.current, self.expected) else {
            warn!(
                id = %self.id,
                "No transition from {} to {}", self.current, self.expected
            );
            return false;
        };

        let hop_id = self.next_hop;
        self.next_hop += 1;
        let origin = self.current;
        self.fault = None;

        if !self.driver.supports(rule.verb) {
            // Step over the hop on a later turn of the loop, never inline
            self.current = rule.transitional;
            self.hop = Some(Hop {
                id: hop_id,
                rule,
                origin,
                timer: None,
                pending: false,
            });
            let _ = self.tx.send(MachineInput::Advance { hop: hop_id });
            return true;
        }

        self.set_current(rule.transitional);
        info!(id = %self.id, "Invoking {} ({} -> {})", rule.verb, origin, rule.target);

        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = driver::invoke(&driver, rule.verb, &VerbOptions::default()).await;
            let _ = tx.send(MachineInput::VerbFinished {
                hop: hop_id,
                result,
            });
        });

        let timer = self.verb_timeout.map(|after| {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(MachineInput::HopTimeout { hop: hop_id });
            })
        });

        self.hop = Some(Hop {
            id: hop_id,
            rule,
            origin,
            timer,
            pending: false,
        });
        true
    }

    fn hop_target(&self, hop_id: u64) -> Option<LifecycleState> {
        self.hop
            .as_ref()
            .filter(|hop| hop.id == hop_id)
            .map(|hop| hop.rule.target)
    }

    fn on_verb_finished(&mut self, hop_id: u64, result: PaddockResult<VerbOutcome>) {
        let Some(hop) = self.hop.as_ref().filter(|hop| hop.id == hop_id) else {
            debug!(id = %self.id, "Ignoring stale verb result for hop {}", hop_id);
            return;
        };
        let (verb, target) = (hop.rule.verb, hop.rule.target);

        match result {
            Ok(VerbOutcome::Completed) => self.finish_hop(target),
            Ok(VerbOutcome::Pending) => {
                debug!(id = %self.id, "{} pending, waiting for driver report", verb);
                if let Some(hop) = self.hop.as_mut() {
                    hop.pending = true;
                }
            }
            Err(e) => self.fail_hop(
                None,
                TransitionFault::Driver {
                    verb,
                    message: e.to_string(),
                },
            ),
        }
    }

    fn on_timeout(&mut self, hop_id: u64) {
        let Some(hop) = self.hop.as_ref().filter(|hop| hop.id == hop_id) else {
            return;
        };
        let verb = hop.rule.verb;
        let after = self.verb_timeout.unwrap_or_default();
        self.fail_hop(None, TransitionFault::Timeout { verb, after });
    }

    fn on_monitor(&mut self, event: MonitorEvent) {
        debug!(id = %self.id, "MONITOR {:?}", event);
        match event {
            MonitorEvent::State(state) => self.on_reported_state(state),
            MonitorEvent::Status(status) => {
                self.status = Some(status.clone());
                self.emit(LifecycleEvent::Status(status));
            }
            MonitorEvent::Error(message) => {
                error!(id = %self.id, "Driver error: {}", message);
                let fault = TransitionFault::Reported { message };
                self.fault = Some(fault.clone());
                self.emit(LifecycleEvent::Error(fault));
            }
        }
    }

    fn on_reported_state(&mut self, state: LifecycleState) {
        if !state.is_stable() {
            debug!(id = %self.id, "Ignoring transitional report {}", state);
            return;
        }

        let Some(hop) = self.hop.as_ref() else {
            if state != self.current {
                info!(id = %self.id, "Driver reported {} (was {})", state, self.current);
                self.set_current(state);
                if self.current == self.expected {
                    self.done();
                } else {
                    self.evaluate();
                }
            }
            return;
        };

        let (verb, target, origin) = (hop.rule.verb, hop.rule.target, hop.origin);
        if state == target {
            self.finish_hop(state);
        } else if state == origin && !hop.pending {
            debug!(id = %self.id, "Ignoring {} report queued before {} returned", state, verb);
        } else if state == origin {
            self.fail_hop(
                None,
                TransitionFault::Driver {
                    verb,
                    message: format!("driver fell back to {} during {}", origin, verb),
                },
            );
        } else {
            let fault = TransitionFault::BadState {
                expected: self.expected,
                state,
                accepts: hop.accepts(),
            };
            self.fail_hop(Some(state), fault);
        }
    }

    fn finish_hop(&mut self, reached: LifecycleState) {
        if let Some(hop) = self.hop.take() {
            if let Some(timer) = hop.timer {
                timer.abort();
            }
        }
        self.set_current(reached);

        if self.current == self.expected {
            self.done();
        } else {
            self.evaluate();
        }
    }

    /// End the hop without reaching its target. The machine stays where the
    /// driver left it (`observed`) or falls back to the hop's origin, and does
    /// not retry by itself.
    fn fail_hop(&mut self, observed: Option<LifecycleState>, fault: TransitionFault) {
        let Some(hop) = self.hop.take() else {
            return;
        };
        if let Some(timer) = hop.timer {
            timer.abort();
        }

        match &fault {
            TransitionFault::BadState { .. } => error!(id = %self.id, "Transition state inconsistent: {}", fault),
            _ => error!(id = %self.id, "Transition error: {}", fault),
        }

        self.set_current(observed.unwrap_or(hop.origin));
        self.fault = Some(fault.clone());
        self.publish();
        self.emit(LifecycleEvent::Error(fault.clone()));
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(fault.clone()));
        }
    }

    fn done(&mut self) {
        debug!(id = %self.id, "READY {}", self.current);
        self.publish();
        self.emit(LifecycleEvent::Done(self.current));
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(self.current));
        }
    }

    fn request_status(&self) {
        let driver = Arc::clone(&self.driver);
        let monitor = Monitor::new(self.tx.clone());
        tokio::spawn(async move {
            if let Err(e) = driver.status().await {
                monitor.error(format!("status query failed: {}", e));
            }
        });
    }

    fn set_current(&mut self, state: LifecycleState) {
        if state == self.current {
            return;
        }
        let previous = self.current;
        self.current = state;
        debug!(id = %self.id, "TRANSIT {} -> {}", previous, state);
        self.emit(LifecycleEvent::State {
            current: state,
            previous,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = MachineSnapshot {
            current: self.current,
            expected: self.expected,
            hop: self.hop.as_ref().map(|hop| HopSnapshot {
                verb: hop.rule.verb,
                origin: hop.origin,
                target: hop.rule.target,
            }),
            status: self.status.clone(),
            fault: self.fault.clone(),
            updated_at: Utc::now(),
        };
        self.snapshot.send_replace(snapshot);
    }
}

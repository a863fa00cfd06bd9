use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PaddockResult;
use crate::lifecycle::{LifecycleState, MachineInput};

/// The four lifecycle verbs a driver can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverVerb {
    Load,
    Unload,
    Start,
    Stop,
}

impl fmt::Display for DriverVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverVerb::Load => "load",
            DriverVerb::Unload => "unload",
            DriverVerb::Start => "start",
            DriverVerb::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Options passed to every verb invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerbOptions {
    /// Kill immediately instead of asking politely (stop/unload only)
    pub force: bool,
}

/// How a verb invocation finished from the driver's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbOutcome {
    /// The hop reached its target state
    Completed,
    /// The driver will report the resulting state through its [`Monitor`]
    Pending,
}

/// Events a driver reports asynchronously
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Observed state; only stable states are honored
    State(LifecycleState),
    /// Driver-specific status payload
    Status(serde_json::Value),
    /// Out-of-band failure
    Error(String),
}

/// Handle a driver uses to report back to its lifecycle machine
#[derive(Clone)]
pub struct Monitor {
    tx: mpsc::UnboundedSender<MachineInput>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Monitor {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MachineInput>) -> Self {
        Self { tx }
    }

    pub fn report(&self, event: MonitorEvent) {
        if self.tx.send(MachineInput::Monitor(event)).is_err() {
            tracing::debug!("Monitor event dropped: lifecycle machine is gone");
        }
    }

    pub fn state(&self, state: LifecycleState) {
        self.report(MonitorEvent::State(state));
    }

    pub fn status(&self, status: serde_json::Value) {
        self.report(MonitorEvent::Status(status));
    }

    pub fn error(&self, message: impl ToString) {
        self.report(MonitorEvent::Error(message.to_string()));
    }
}

/// Contract implemented by every node driver (LXC, QEMU, shell scripts, ...)
///
/// `start` and `stop` are mandatory. `load` and `unload` are optional: a
/// driver that implements them must also say so through [`Driver::supports`],
/// otherwise the lifecycle machine steps over the hop without calling it.
///
/// A verb either finishes the hop itself by returning
/// [`VerbOutcome::Completed`], or returns [`VerbOutcome::Pending`] and later
/// reports the reached state through the [`Monitor`] it was created with.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registered name of the driver
    fn name(&self) -> &str;

    /// Whether the driver implements `verb`
    fn supports(&self, verb: DriverVerb) -> bool {
        matches!(verb, DriverVerb::Start | DriverVerb::Stop)
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        Ok(VerbOutcome::Completed)
    }

    async fn unload(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        Ok(VerbOutcome::Completed)
    }

    async fn start(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome>;

    async fn stop(&self, opts: &VerbOptions) -> PaddockResult<VerbOutcome>;

    /// Ask for a status report; the answer arrives as [`MonitorEvent::Status`]
    async fn status(&self) -> PaddockResult<()> {
        Ok(())
    }

    /// Driver-specific view for object dumps
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Dispatch `verb` on `driver`
pub async fn invoke(
    driver: &Arc<dyn Driver>,
    verb: DriverVerb,
    opts: &VerbOptions,
) -> PaddockResult<VerbOutcome> {
    match verb {
        DriverVerb::Load => driver.load(opts).await,
        DriverVerb::Unload => driver.unload(opts).await,
        DriverVerb::Start => driver.start(opts).await,
        DriverVerb::Stop => driver.stop(opts).await,
    }
}

/// Mock driver for testing
///
/// Completes every verb immediately and records the calls it received,
/// useful for exercising object lifecycles without any container runtime.
#[derive(Debug, Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverVerb>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DriverVerb> {
        self.calls.lock().clone()
    }

    fn record(&self, verb: DriverVerb) -> PaddockResult<VerbOutcome> {
        tracing::info!("Mock: {} requested", verb);
        self.calls.lock().push(verb);
        Ok(VerbOutcome::Completed)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, _verb: DriverVerb) -> bool {
        true
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.record(DriverVerb::Load)
    }

    async fn unload(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.record(DriverVerb::Unload)
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.record(DriverVerb::Start)
    }

    async fn stop(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.record(DriverVerb::Stop)
    }

    fn dump(&self) -> serde_json::Value {
        serde_json::json!({ "calls": self.calls.lock().len() })
    }
}

//! Shared helpers for paddock-core integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::sleep;

use paddock_core::config::{Config, ConfigBuilder};
use paddock_core::driver::{Driver, DriverVerb, Monitor, VerbOptions, VerbOutcome};
use paddock_core::lifecycle::{LifecycleEvent, LifecycleState};
use paddock_core::objects;
use paddock_core::registry::PluginRegistry;
use paddock_core::subnet::{MacPrefix, StaticInterfaces, SubnetAllocator};
use paddock_core::{Context, PaddockError, PaddockResult};

/// What a scripted verb does
#[derive(Debug, Clone)]
pub enum Script {
    /// Return `Completed`
    Complete,
    /// Return `Pending`, then report the state through the monitor
    Report(LifecycleState),
    /// Return an error
    Fail(String),
    /// Return `Pending` and never report anything
    Hang,
}

/// Driver whose verbs follow a script, recording every call
pub struct ScriptedDriver {
    monitor: Monitor,
    scripts: Mutex<HashMap<DriverVerb, Script>>,
    unsupported: HashSet<DriverVerb>,
    delay: Duration,
    calls: Mutex<Vec<DriverVerb>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(monitor: Monitor) -> Self {
        Self {
            monitor,
            scripts: Mutex::new(HashMap::new()),
            unsupported: HashSet::new(),
            delay: Duration::from_millis(5),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(self, verb: DriverVerb, script: Script) -> Self {
        self.scripts.lock().insert(verb, script);
        self
    }

    pub fn without(mut self, verb: DriverVerb) -> Self {
        self.unsupported.insert(verb);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_script(&self, verb: DriverVerb, script: Script) {
        self.scripts.lock().insert(verb, script);
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn calls(&self) -> Vec<DriverVerb> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run(&self, verb: DriverVerb) -> PaddockResult<VerbOutcome> {
        self.calls.lock().push(verb);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        sleep(self.delay).await;
        let script = self
            .scripts
            .lock()
            .get(&verb)
            .cloned()
            .unwrap_or(Script::Complete);

        let outcome = match script {
            Script::Complete => Ok(VerbOutcome::Completed),
            Script::Report(state) => {
                let monitor = self.monitor.clone();
                let delay = self.delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    monitor.state(state);
                });
                Ok(VerbOutcome::Pending)
            }
            Script::Fail(message) => Err(PaddockError::driver(verb.to_string(), message)),
            Script::Hang => Ok(VerbOutcome::Pending),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, verb: DriverVerb) -> bool {
        !self.unsupported.contains(&verb)
    }

    async fn load(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.run(DriverVerb::Load).await
    }

    async fn unload(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.run(DriverVerb::Unload).await
    }

    async fn start(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.run(DriverVerb::Start).await
    }

    async fn stop(&self, _opts: &VerbOptions) -> PaddockResult<VerbOutcome> {
        self.run(DriverVerb::Stop).await
    }

    async fn status(&self) -> PaddockResult<()> {
        self.monitor
            .status(serde_json::json!({ "calls": self.calls.lock().len() }));
        Ok(())
    }
}

/// Events currently queued on a subscription
pub fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// State transitions only, as (current, previous) pairs
pub fn transitions(events: &[LifecycleEvent]) -> Vec<(LifecycleState, LifecycleState)> {
    events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::State { current, previous } => Some((*current, *previous)),
            _ => None,
        })
        .collect()
}

/// Wait for the next event matching `pred`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<LifecycleEvent>,
    max_wait: Duration,
    mut pred: F,
) -> Result<LifecycleEvent, String>
where
    F: FnMut(&LifecycleEvent) -> bool,
{
    let deadline = Instant::now() + max_wait;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(left, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Ok(event),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(format!("subscription closed: {}", e)),
            Err(_) => return Err(format!("No matching event within {:?}", max_wait)),
        }
    }
}

/// Wait for a condition with simple polling
pub async fn wait_for_condition<F, Fut>(
    mut condition: F,
    max_wait: Duration,
    check_interval: Duration,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if condition().await {
            return Ok(());
        }
        sleep(check_interval).await;
    }
    Err(format!("Condition not met within {:?}", max_wait))
}

/// Configuration rooted in `workdir` with a single 10.0.0.0/8 pool
pub fn test_config(workdir: &std::path::Path) -> Config {
    ConfigBuilder::new()
        .workdir(workdir)
        .subnets(["10.0.0.0/8,24"])
        .verb_timeout(Duration::from_secs(5))
        .build()
        .expect("valid test config")
}

/// Allocator that sees the given host addresses instead of the real ones
pub fn test_allocator(config: &Config, host: Vec<Ipv4Addr>) -> SubnetAllocator {
    SubnetAllocator::with_interfaces(
        config.network.pool_specs().expect("valid pool specs"),
        config.network.reserved_ips,
        MacPrefix::default(),
        Arc::new(StaticInterfaces(host)),
    )
}

/// Context with the standard models, default plugins and no host interfaces
pub fn test_context(workdir: &std::path::Path) -> Context {
    let config = test_config(workdir);
    let allocator = test_allocator(&config, Vec::new());
    Context::with_parts(
        config,
        PluginRegistry::default(),
        allocator,
        objects::standard_models(),
    )
    .expect("valid context")
}

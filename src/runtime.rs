//! Runtime-facing surface of the broker.
//!
//! The host runtime and the broker meet across three small seams:
//!
//! - [`RuntimeHooks`] — what the broker needs *from* the runtime:
//!   debuggability checks, the JDWP option string, agent loading, and
//!   managed-thread attach for the worker.
//! - [`DebuggerController`] and [`DdmPublisher`] — what the runtime calls
//!   *on* the broker: the debugger-control callback pair and the DDM publish
//!   entry point. One implementation each, holding an `Arc` back-reference
//!   to the process-wide [`DebugBroker`].
//! - [`init`] / [`deinit`] — the plugin entry points that create and tear
//!   down the singleton.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::broker::{BrokerConfig, DebugBroker};

// ─── What the broker needs from the runtime ────────────────────────────────

/// Capabilities the embedding runtime provides to the broker.
///
/// All methods may be called from the broker worker thread.
pub trait RuntimeHooks: Send + Sync + 'static {
    /// Whether the process is debuggable at all.
    fn is_debuggable(&self) -> bool;

    /// Whether JDWP sessions are permitted for this process.
    fn is_jdwp_allowed(&self) -> bool;

    /// The JDWP option string baked into the agent load argument. May be
    /// empty.
    fn jdwp_options(&self) -> String;

    /// Load the in-process agent with the given argument string.
    ///
    /// # Errors
    ///
    /// The error should carry the agent's diagnostic; the broker logs it and
    /// gives up on debugging for this process lifetime.
    fn attach_agent(&self, arguments: &str) -> Result<()>;

    /// Attach the broker worker as a managed daemon thread, so the agent
    /// sees a valid thread context when it calls back into the runtime.
    fn attach_thread(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Detach the broker worker on exit.
    fn detach_thread(&self) {}
}

// ─── What the runtime calls on the broker ──────────────────────────────────

/// Debugger-control callback pair registered with the runtime.
pub trait DebuggerController: Send + Sync {
    /// Invoked once the runtime has determined the process is debuggable.
    fn start_debugger(&self);

    /// Invoked when the runtime begins shutting down.
    fn stop_debugger(&self);

    /// Whether debugging is possible *and* JDWP options are configured.
    fn is_debugger_configured(&self) -> bool;
}

/// DDM publish callback registered with the runtime; invoked on arbitrary
/// runtime threads.
pub trait DdmPublisher: Send + Sync {
    fn publish_ddm(&self, kind: u32, data: &[u8]);
}

/// The broker's [`DebuggerController`] implementation.
pub struct BrokerDebuggerController {
    broker: Arc<DebugBroker>,
}

impl BrokerDebuggerController {
    pub fn new(broker: Arc<DebugBroker>) -> Self {
        Self { broker }
    }
}

impl DebuggerController for BrokerDebuggerController {
    fn start_debugger(&self) {
        if !self.broker.is_debugging_possible() {
            log::error!(
                "[broker] not starting debugger since the process cannot load the jdwp agent"
            );
            return;
        }
        if let Err(e) = self.broker.start() {
            log::error!("[broker] failed to start debugger worker: {e:#}");
        }
    }

    fn stop_debugger(&self) {
        // Nothing to do here: by the time the runtime calls this, the agent
        // side has already wound down, and the real teardown is the plugin
        // deinit path (see `deinit`).
    }

    fn is_debugger_configured(&self) -> bool {
        self.broker.is_debugging_possible() && !self.broker.runtime().jdwp_options().is_empty()
    }
}

/// The broker's [`DdmPublisher`] implementation.
pub struct BrokerDdmPublisher {
    broker: Arc<DebugBroker>,
}

impl BrokerDdmPublisher {
    pub fn new(broker: Arc<DebugBroker>) -> Self {
        Self { broker }
    }
}

impl DdmPublisher for BrokerDdmPublisher {
    fn publish_ddm(&self, kind: u32, data: &[u8]) {
        self.broker.publish_ddm(kind, data);
    }
}

// ─── Process-level entry points ────────────────────────────────────────────

static INSTANCE: Mutex<Option<Arc<DebugBroker>>> = Mutex::new(None);

/// Construct the process-wide broker.
///
/// Called from the runtime plugin's init hook, before the runtime decides
/// whether the process is debuggable. The returned handle is also reachable
/// through [`instance`] for the registered callbacks.
///
/// # Errors
///
/// Fails if a broker already exists in this process.
pub fn init(config: BrokerConfig, runtime: Arc<dyn RuntimeHooks>) -> Result<Arc<DebugBroker>> {
    let mut slot = INSTANCE.lock().expect("broker instance mutex poisoned");
    if slot.is_some() {
        bail!("debug broker already initialised");
    }
    let broker = DebugBroker::new(config, runtime);
    *slot = Some(Arc::clone(&broker));
    Ok(broker)
}

/// The process-wide broker, if [`init`] has run.
pub fn instance() -> Option<Arc<DebugBroker>> {
    INSTANCE
        .lock()
        .expect("broker instance mutex poisoned")
        .clone()
}

/// Tear down the process-wide broker.
///
/// Sets the shutdown flag and signals the wakeup eventfd; the worker exits
/// within one poll cycle. The thread itself is not joined — process teardown
/// takes care of it, or call [`DebugBroker::join_worker`] first when
/// deterministic cleanup matters.
pub fn deinit() {
    let broker = INSTANCE
        .lock()
        .expect("broker instance mutex poisoned")
        .take();
    if let Some(broker) = broker {
        broker.shutdown();
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

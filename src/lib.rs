//! In-process debug-bridge broker for a managed-language runtime.
//!
//! # Purpose
//!
//! The broker advertises its process to the host-side debug daemon over a
//! well-known abstract UNIX socket, receives a debugger connection as a
//! transferred file descriptor, loads the in-process JDWP agent on demand,
//! hands the descriptor to that agent via `SCM_RIGHTS`, and keeps forwarding
//! small asynchronous DDM telemetry packets onto the same descriptor while a
//! debugger is attached. It survives debugger disconnects and daemon
//! restarts, retrying with bounded back-off until the runtime shuts down.
//!
//! # Architecture
//!
//! ```text
//! runtime init ──► init() ──► DebugBroker (process-wide)
//!                               │
//! runtime "debuggable" ──► DebuggerController::start_debugger()
//!                               │ spawns
//!                               ▼
//!                      broker worker thread (poll loop)
//!                        │ connect + %04x PID
//!                        ▼
//!    debug daemon ──SCM_RIGHTS(debugger fd)──► broker
//!                        │ attach_agent("…transport=fd_forward,address=N")
//!                        ▼
//!    agent ◄──seqpacket socketpair: ds-listen-start / ds-accept / ds-close──
//!    agent ◄──SCM_RIGHTS {read dup, write dup, write-lock dup}── broker
//!
//! runtime threads ──DdmPublisher::publish_ddm──► (write interlock) ──► debugger fd
//! ```
//!
//! The worker is the only mutator of connection state; DDM producers touch the
//! connection descriptor exclusively under the eventfd write interlock, which
//! is itself one of the descriptors handed to the agent so both sides of the
//! handoff keep coordinating writes on the shared socket.
//!
//! # Modules
//!
//! - [`broker`] - connection state machine, poll loop, daemon client, agent
//!   channel, DDM framing
//! - [`runtime`] - capability traits the host runtime calls through, plus the
//!   process-level `init()`/`deinit()` entry points
//! - [`constants`] - well-known names, timeouts, and retry bounds
//!
//! Linux-only: the implementation relies on `eventfd`, abstract-namespace
//! UNIX sockets, `POLLRDHUP`, and `SO_PEERCRED`.

// Rust guideline compliant 2026-02

pub mod broker;
pub mod constants;
pub mod runtime;

// Re-export commonly used types
pub use broker::{BrokerConfig, DebugBroker};
pub use runtime::{
    deinit, init, instance, BrokerDdmPublisher, BrokerDebuggerController, DdmPublisher,
    DebuggerController, RuntimeHooks,
};

//! Application-wide constants for the debug-bridge broker.
//!
//! This module centralizes the magic numbers shared across the broker so the
//! wire conventions inherited from the host platform stay in one place.
//!
//! # Categories
//!
//! - **Identity**: well-known names the daemon and runtime recognise
//! - **Timeouts**: control-socket send bounds
//! - **Retry**: daemon reconnect back-off window

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Abstract-namespace name of the debug daemon's control socket.
///
/// The daemon binds this name in the Linux abstract namespace (leading NUL
/// byte, no filesystem presence). The byte sequence is inherited from the
/// host platform's debug-daemon convention and must match it exactly.
pub const JDWP_CONTROL_NAME: &str = "jdwp-control";

/// Default shared-library name of the in-process JDWP agent.
///
/// Embedders override this through [`crate::BrokerConfig::agent_name`] when
/// the agent ships under a different soname.
pub const DEFAULT_AGENT_NAME: &str = "libjdwpagent.so";

/// Name of the broker worker thread.
///
/// Used both for the OS thread and for the managed-runtime attach, so the
/// agent sees a valid, recognisably-named thread context when it calls back
/// into the runtime during load.
pub const BROKER_THREAD_NAME: &str = "debug-broker";

// ============================================================================
// Timeouts
// ============================================================================

/// `SO_SNDTIMEO` applied to the daemon control socket.
///
/// Bounds the PID advertisement send; a daemon that accepts the connection
/// but never drains it must not wedge the broker worker forever.
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Retry
// ============================================================================

/// First delay after a failed daemon connect.
///
/// The daemon is frequently not running yet (debugging disabled, or the
/// daemon restarting); half a second keeps the first retry prompt without
/// hammering the socket.
pub const CONNECT_RETRY_INITIAL: Duration = Duration::from_millis(500);

/// Cap on the daemon connect back-off.
///
/// Each failure grows the delay by half (500 → 750 → 1125 → 1687 → 2000 ms);
/// two seconds keeps reconnects responsive while the process idles waiting
/// for the daemon to come back.
pub const CONNECT_RETRY_MAX: Duration = Duration::from_millis(2000);

//! Debug-bridge broker — connection state machine and descriptor plumbing.
//!
//! # Purpose
//!
//! A single worker thread multiplexes four descriptors and drives every
//! transition of a debug session: connecting to the host debug daemon,
//! adopting the debugger descriptor the daemon transfers, loading the JDWP
//! agent on first contact, handing the descriptor trio to the agent, and
//! tearing the session down when either side lets go. The broker outlives
//! debugger disconnects and daemon restarts; only runtime shutdown ends it.
//!
//! # Architecture
//!
//! ```text
//! DebuggerController::start_debugger()
//!        │ creates eventfds + agent socketpair, spawns worker
//!        ▼
//! worker ── connect_to_daemon (500 ms → 2 s back-off) ──► control_fd
//!        │
//!        ▼  poll { wakeup, agent sock, control sock, connection }
//!  ┌─────┴──────────────────────────────────────────────────────┐
//!  │ agent sock POLLIN  → ds-listen-*/ds-accept/ds-close        │
//!  │ control POLLIN     → adopt SCM_RIGHTS fd (under interlock) │
//!  │ control POLLRDHUP  → drop daemon, reconnect                │
//!  │ connection POLLIN  → load agent / re-send descriptor trio  │
//!  │ wakeup POLLIN      → drain; shutting_down decides          │
//!  └────────────────────────────────────────────────────────────┘
//!
//! any runtime thread ── publish_ddm ──(write interlock)──► connection fd
//! ```
//!
//! Only the worker mutates connection state. DDM producers read the
//! connection slot and write to the descriptor strictly under the eventfd
//! write interlock, which is also what serialises their writes against the
//! worker adopting or tearing down the descriptor.

// Rust guideline compliant 2026-02

pub(crate) mod agent;
pub(crate) mod daemon;
pub(crate) mod ddm;
pub(crate) mod eventfd;


use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};

use crate::constants::{BROKER_THREAD_NAME, DEFAULT_AGENT_NAME, JDWP_CONTROL_NAME};
use crate::runtime::RuntimeHooks;

use eventfd::{EventFd, ScopedEventFdLock, EVENTFD_LOCKED, EVENTFD_UNLOCKED};

/// Largest agent control datagram the broker reads in one go.
const AGENT_MESSAGE_MAX: usize = 256;

/// Retry an FD operation while it reports `EINTR`.
///
/// The value of the last attempt is returned verbatim, so callers still see
/// genuine errors as negative returns.
pub(crate) fn retry_eintr<F>(mut op: F) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let rc = op();
        if rc >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return rc;
        }
    }
}

fn flags_set(revents: libc::c_short, flags: libc::c_short) -> bool {
    revents & flags == flags
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// Static broker configuration, supplied by the runtime plugin hook.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Shared-library name or path of the JDWP agent to load on demand.
    pub agent_name: String,
    /// Abstract-namespace name of the daemon control socket (without the
    /// leading NUL byte).
    pub control_socket_name: String,
    /// Extra UID accepted by the peer credential check, for hosts where the
    /// debug daemon runs under a dedicated identity. Root and the process's
    /// own effective UID are always accepted.
    pub daemon_uid: Option<libc::uid_t>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            control_socket_name: JDWP_CONTROL_NAME.to_string(),
            daemon_uid: None,
        }
    }
}

// ─── Shared session state ──────────────────────────────────────────────────

/// Slot holding the transferred debugger descriptor, or −1 while absent.
///
/// Every install/take/read happens under the write interlock; the atomic
/// satisfies the memory model, the eventfd is the real lock. At most one
/// connection is ever held.
pub(crate) struct ConnectionSlot(AtomicI32);

impl ConnectionSlot {
    fn new() -> Self {
        Self(AtomicI32::new(-1))
    }

    /// The raw descriptor, if a connection is present.
    pub(crate) fn raw(&self) -> Option<RawFd> {
        let fd = self.0.load(Ordering::Acquire);
        (fd >= 0).then_some(fd)
    }

    pub(crate) fn is_some(&self) -> bool {
        self.raw().is_some()
    }

    /// Adopt a descriptor. Caller holds the write interlock and has checked
    /// the slot is empty.
    fn install(&self, fd: OwnedFd) {
        let prev = self.0.swap(fd.into_raw_fd(), Ordering::AcqRel);
        debug_assert_eq!(prev, -1, "connection slot already occupied");
    }

    /// Relinquish the descriptor for closing. Caller holds the write
    /// interlock.
    fn take(&self) -> Option<OwnedFd> {
        let raw = self.0.swap(-1, Ordering::AcqRel);
        // SAFETY: a non-negative value in the slot is a live descriptor this
        // slot exclusively owns.
        (raw >= 0).then(|| unsafe { OwnedFd::from_raw_fd(raw) })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        // A connection still held at teardown is closed with its slot.
        drop(self.take());
    }
}

/// Session state shared between the worker and DDM producers.
///
/// The four lifecycle flags are mutated only by the worker; they are atomics
/// so other threads (and assertions) may observe them without locking.
pub(crate) struct SessionShared {
    pub(crate) wakeup: EventFd,
    pub(crate) write_lock: EventFd,
    pub(crate) connection: ConnectionSlot,
    next_ddm_id: AtomicU32,
    /// Agent library attached; never cleared.
    pub(crate) agent_loaded: AtomicBool,
    /// Agent reported it is ready to receive a session.
    pub(crate) agent_listening: AtomicBool,
    /// Agent acknowledged ownership of the transferred descriptors.
    pub(crate) agent_has_socket: AtomicBool,
    /// Descriptor trio handed off for the current session.
    pub(crate) sent_agent_fds: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            wakeup: EventFd::new(EVENTFD_LOCKED).context("create wakeup eventfd")?,
            write_lock: EventFd::new(EVENTFD_UNLOCKED).context("create write-lock eventfd")?,
            connection: ConnectionSlot::new(),
            next_ddm_id: AtomicU32::new(1),
            agent_loaded: AtomicBool::new(false),
            agent_listening: AtomicBool::new(false),
            agent_has_socket: AtomicBool::new(false),
            sent_agent_fds: AtomicBool::new(false),
        })
    }

    /// Allocate a DDM packet id: a plain counter with the sign bit forced
    /// on, so runtime-originated packets never collide with debugger ids.
    pub(crate) fn next_ddm_id(&self) -> u32 {
        self.next_ddm_id.fetch_add(1, Ordering::Relaxed) | ddm::DDM_ID_HIGH_BIT
    }
}

// ─── Broker ────────────────────────────────────────────────────────────────

/// The process-wide debug-bridge broker.
///
/// Created by the runtime plugin's init hook (see [`crate::runtime::init`]),
/// reached afterwards only through the registered callback surfaces. The
/// session state and worker thread come into being when the runtime decides
/// the process is debuggable and invokes the start callback.
pub struct DebugBroker {
    config: BrokerConfig,
    runtime: Arc<dyn RuntimeHooks>,
    shutting_down: AtomicBool,
    session: OnceLock<Arc<SessionShared>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DebugBroker {
    pub fn new(config: BrokerConfig, runtime: Arc<dyn RuntimeHooks>) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime,
            shutting_down: AtomicBool::new(false),
            session: OnceLock::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn RuntimeHooks> {
        &self.runtime
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Whether this process may host a debugger at all.
    pub fn is_debugging_possible(&self) -> bool {
        self.runtime.is_debuggable() && self.runtime.is_jdwp_allowed()
    }

    /// Create the session descriptors and spawn the broker worker.
    ///
    /// # Errors
    ///
    /// Fails when the worker is already running or when eventfd/socketpair
    /// creation fails — a misconfigured host; the error aborts the start but
    /// must not take the process down.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if self.session.get().is_some() {
            bail!("debugger worker already started");
        }
        let session = Arc::new(SessionShared::new()?);
        let (agent_local, agent_remote) =
            agent::create_control_socketpair().context("create agent control socketpair")?;
        if self.session.set(Arc::clone(&session)).is_err() {
            bail!("debugger worker already started");
        }

        let broker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(BROKER_THREAD_NAME.to_owned())
            .spawn(move || {
                // The agent may call back into the runtime while loading, so
                // the worker must carry a valid managed-thread context.
                if let Err(e) = broker.runtime.attach_thread(BROKER_THREAD_NAME) {
                    log::error!("[broker] failed to attach worker thread to the runtime: {e:#}");
                    return;
                }
                PollLoop {
                    broker: Arc::clone(&broker),
                    session,
                    agent_local,
                    agent_remote,
                    control: None,
                }
                .run();
                broker.runtime.detach_thread();
                log::debug!("[broker] worker thread exiting");
            })
            .context("spawn broker worker thread")?;

        *self
            .worker
            .lock()
            .expect("worker handle mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Request shutdown and kick the poll loop awake.
    ///
    /// The worker observes `POLLIN` on the wakeup eventfd, re-checks the
    /// flag at its loop boundary, and exits within one poll cycle.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if let Some(session) = self.session.get() {
            session.wakeup.signal();
        }
    }

    /// Wait for the worker thread to exit.
    ///
    /// [`crate::runtime::deinit`] only signals — the original teardown rides
    /// process exit — but embedders and tests that need deterministic
    /// cleanup call this after [`DebugBroker::shutdown`].
    pub fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .expect("worker handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Frame and send one DDM chunk to the attached debugger.
    ///
    /// Safe to call from any runtime thread. Without a live connection (or
    /// before the debugger worker has started) the chunk is dropped with a
    /// warning.
    pub fn publish_ddm(&self, kind: u32, data: &[u8]) {
        match self.session.get() {
            Some(session) => ddm::publish(session, kind, data),
            None => log::warn!(
                "[ddm] not sending {} chunk ({} bytes): debugger worker not started",
                ddm::fourcc(kind),
                data.len()
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&Arc<SessionShared>> {
        self.session.get()
    }
}

// ─── Poll loop ─────────────────────────────────────────────────────────────

/// Worker-owned connection state machine.
///
/// Runs on the dedicated broker thread; every descriptor mutation happens
/// here. `agent_remote` is held open for the process lifetime because its
/// descriptor number is baked into the agent load string.
struct PollLoop {
    broker: Arc<DebugBroker>,
    session: Arc<SessionShared>,
    agent_local: OwnedFd,
    agent_remote: OwnedFd,
    control: Option<OwnedFd>,
}

impl PollLoop {
    /// Outer loop: keep a daemon control connection until shutdown.
    fn run(mut self) {
        while !self.broker.is_shutting_down() {
            if self.control.is_none() {
                match daemon::connect_to_daemon(
                    self.broker.config(),
                    &self.broker.shutting_down,
                ) {
                    Ok(Some(sock)) => self.control = Some(sock),
                    Ok(None) => return, // shutdown while waiting for the daemon
                    Err(e) => {
                        log::error!("[broker] failed to set up daemon connection: {e:#}");
                        return;
                    }
                }
            }
            if !self.poll_connection() {
                return;
            }
        }
    }

    /// Inner loop: one established control connection.
    ///
    /// Returns `false` when the worker must exit (poll failure, agent load
    /// failure); `true` hands control back to the outer loop, which
    /// reconnects if the daemon was lost.
    fn poll_connection(&mut self) -> bool {
        while !self.broker.is_shutting_down() {
            let Some(control_fd) = self.control.as_ref().map(|fd| fd.as_raw_fd()) else {
                return true;
            };
            let agent_loaded = self.session.agent_loaded.load(Ordering::Relaxed);
            let agent_has_socket = self.session.agent_has_socket.load(Ordering::Relaxed);
            let sent_agent_fds = self.session.sent_agent_fds.load(Ordering::Relaxed);

            // An fd of -1 excludes the slot from the wait.
            let mut pollfds = [
                libc::pollfd {
                    fd: self.session.wakeup.raw(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: if agent_loaded { self.agent_local.as_raw_fd() } else { -1 },
                    events: libc::POLLIN,
                    revents: 0,
                },
                // Watch the daemon socket for transfers and hangup, but only
                // while no debugger connection is held.
                libc::pollfd {
                    fd: if self.session.connection.is_some() { -1 } else { control_fd },
                    events: libc::POLLIN | libc::POLLRDHUP,
                    revents: 0,
                },
                // The debugger talking before the agent owns the socket is
                // what triggers agent load and descriptor (re-)handoff.
                libc::pollfd {
                    fd: if !agent_has_socket && !sent_agent_fds {
                        self.session.connection.raw().unwrap_or(-1)
                    } else {
                        -1
                    },
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let res = retry_eintr(|| {
                // SAFETY: pollfds is a live array of 4 entries; indefinite wait.
                (unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) })
                    as libc::ssize_t
            });
            if res < 0 {
                log::error!("[broker] poll failed: {}", std::io::Error::last_os_error());
                return false;
            }

            let [wakeup_poll, agent_poll, control_poll, connection_poll] = pollfds;
            if flags_set(agent_poll.revents, libc::POLLIN) {
                self.handle_agent_message();
            } else if flags_set(control_poll.revents, libc::POLLIN) {
                if !self.handle_daemon_offer() {
                    // Something went wrong receiving from the daemon; retry
                    // the control connection from scratch.
                    self.control = None;
                    return true;
                }
            } else if flags_set(control_poll.revents, libc::POLLRDHUP) {
                // The daemon dropped the control connection. With the agent
                // owning a live session this should be unreachable; log and
                // carry on reconnecting rather than bring the process down.
                if self.session.agent_has_socket.load(Ordering::Relaxed) {
                    log::error!("[broker] daemon hangup while the agent owns the connection");
                }
                self.control = None;
                return true;
            } else if flags_set(connection_poll.revents, libc::POLLIN) {
                if !self.handle_debugger_data() {
                    return false;
                }
            } else if flags_set(wakeup_poll.revents, libc::POLLIN) {
                // The value carries nothing; shutting_down decides at the
                // loop head.
                self.session.wakeup.drain();
            } else {
                log::trace!("[broker] poll woke without anything to do");
            }
        }
        true
    }

    /// Agent control socket has a datagram: dispatch it by prefix.
    fn handle_agent_message(&mut self) {
        let mut buf = [0u8; AGENT_MESSAGE_MAX];
        let n = retry_eintr(|| {
            // SAFETY: receives into a live fixed-size buffer.
            unsafe {
                libc::recv(
                    self.agent_local.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            }
        });
        if n < 0 {
            log::error!(
                "[broker] failed to read message from agent control socket, retrying: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        let datagram = &buf[..n as usize];
        match agent::AgentMessage::parse(datagram) {
            agent::AgentMessage::ListenStart => {
                log::debug!("[broker] agent is listening for a debugger session");
                self.session.agent_listening.store(true, Ordering::Relaxed);
                if self.session.connection.is_some() {
                    self.send_agent_fds();
                }
            }
            agent::AgentMessage::ListenEnd => {
                log::debug!("[broker] agent stopped listening");
                self.session.agent_listening.store(false, Ordering::Relaxed);
            }
            agent::AgentMessage::Accept => {
                log::debug!("[broker] agent took ownership of the debugger connection");
                self.session.agent_has_socket.store(true, Ordering::Relaxed);
                self.session.sent_agent_fds.store(false, Ordering::Relaxed);
            }
            agent::AgentMessage::Close => {
                log::debug!("[broker] agent closed the debugger connection");
                self.teardown_connection();
                self.session.agent_has_socket.store(false, Ordering::Relaxed);
                self.session.sent_agent_fds.store(false, Ordering::Relaxed);
            }
            agent::AgentMessage::Unknown => {
                log::error!(
                    "[broker] unknown message from agent: {:?}",
                    String::from_utf8_lossy(datagram)
                );
            }
        }
    }

    /// The daemon has a datagram for us: a transferred debugger descriptor.
    ///
    /// Returns `false` when the receive failed and the control connection
    /// must be re-established.
    fn handle_daemon_offer(&mut self) -> bool {
        let Some(control_fd) = self.control.as_ref().map(|fd| fd.as_raw_fd()) else {
            return true;
        };
        let mut adopted = false;
        {
            // Concurrent DDM publishes must not observe the slot mid-change.
            let _lock = ScopedEventFdLock::acquire(&self.session.write_lock);
            match daemon::recv_connection_fd(control_fd) {
                Err(e) => {
                    log::warn!("[broker] receiving descriptor from daemon failed: {e:#}");
                    return false;
                }
                Ok(new_fd) => {
                    if self.session.connection.is_some() {
                        // At most one debugger: accept the transfer, then
                        // close it. Refusing would need a daemon-side
                        // protocol that does not exist.
                        log::debug!("[broker] ignoring second debugger, accept then drop");
                        drop(new_fd);
                    } else {
                        log::debug!(
                            "[broker] debugger connection established on fd {}",
                            new_fd.as_raw_fd()
                        );
                        self.session.connection.install(new_fd);
                        adopted = true;
                    }
                }
            }
        }
        if adopted
            && self.session.agent_loaded.load(Ordering::Relaxed)
            && self.session.agent_listening.load(Ordering::Relaxed)
        {
            log::debug!("[broker] handing descriptors to the agent immediately");
            self.send_agent_fds();
        }
        true
    }

    /// The debugger is talking before the agent owns the socket: load the
    /// agent on first contact, or re-send the descriptors after a failed
    /// handoff.
    ///
    /// Returns `false` when the agent failed to load — unrecoverable for
    /// this process lifetime, the worker exits.
    fn handle_debugger_data(&mut self) -> bool {
        debug_assert!(!self.session.agent_has_socket.load(Ordering::Relaxed));
        if !self.session.agent_loaded.load(Ordering::Relaxed) {
            let argument = agent::load_argument(
                &self.broker.config.agent_name,
                &self.broker.runtime.jdwp_options(),
                self.agent_remote.as_raw_fd(),
            );
            log::info!("[broker] loading agent: {argument}");
            match self.broker.runtime.attach_agent(&argument) {
                Ok(()) => self.session.agent_loaded.store(true, Ordering::Relaxed),
                Err(e) => {
                    log::error!(
                        "[broker] failed to load agent {}: {e:#}",
                        self.broker.config.agent_name
                    );
                    return false;
                }
            }
        } else if self.session.agent_listening.load(Ordering::Relaxed)
            && !self.session.sent_agent_fds.load(Ordering::Relaxed)
        {
            log::debug!("[broker] re-sending descriptors on debugger data");
            self.send_agent_fds();
        }
        true
    }

    /// Send the {read, write, write-lock} descriptor trio to the agent.
    fn send_agent_fds(&mut self) {
        debug_assert!(!self.session.sent_agent_fds.load(Ordering::Relaxed));
        let Some(connection) = self.session.connection.raw() else {
            return;
        };
        match agent::send_connection_to_agent(
            self.agent_local.as_raw_fd(),
            connection,
            self.session.write_lock.raw(),
        ) {
            Ok(()) => {
                self.session.sent_agent_fds.store(true, Ordering::Relaxed);
                log::debug!("[broker] descriptors handed to the agent");
            }
            Err(e) => log::error!("[broker] failed to send descriptors to the agent: {e:#}"),
        }
    }

    /// Close the debugger connection under the write interlock, so
    /// concurrent DDM publishes never write into a dying descriptor.
    fn teardown_connection(&mut self) {
        let _lock = ScopedEventFdLock::acquire(&self.session.write_lock);
        drop(self.session.connection.take());
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

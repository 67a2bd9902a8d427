//! Client side of the debug daemon's control socket.
//!
//! # Protocol
//!
//! ```text
//! broker ──connect(abstract "jdwp-control", SOCK_SEQPACKET)──► daemon
//!        ── PID as "%04x" (exactly sizeof(pid_t) bytes) ──────►
//!        ◄── SCM_RIGHTS(debugger fd), one per datagram ────────
//!        ◄── POLLRDHUP on daemon exit ──────────────────────────
//! ```
//!
//! Connect failures back off from 500 ms, growing by half per failure and
//! capping at 2 s, forever — the daemon not running is the normal state on a
//! non-debugged device. A connected-but-untrusted peer or a failed PID send
//! aborts the attempt entirely: both indicate a misbehaving host rather than
//! a daemon that has not started yet.

// Rust guideline compliant 2026-02

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::constants::{CONNECT_RETRY_INITIAL, CONNECT_RETRY_MAX, CONTROL_SEND_TIMEOUT};

use super::BrokerConfig;

/// Wire width of the PID advertisement.
pub(crate) const PID_WIRE_LEN: usize = std::mem::size_of::<libc::pid_t>();

/// Format a PID for the daemon: lowercase hex, zero-padded, truncated to the
/// first `sizeof(pid_t)` characters so the wire width never varies.
pub(crate) fn encode_pid(pid: u32) -> [u8; PID_WIRE_LEN] {
    let hex = format!("{pid:04x}");
    let mut out = [0u8; PID_WIRE_LEN];
    out.copy_from_slice(&hex.as_bytes()[..PID_WIRE_LEN]);
    out
}

/// Grow a retry delay by half, capped at [`CONNECT_RETRY_MAX`].
pub(crate) fn next_backoff(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    Duration::from_millis((ms + ms / 2).min(CONNECT_RETRY_MAX.as_millis() as u64))
}

/// Build the abstract-namespace sockaddr for the daemon control socket.
///
/// The name occupies `sun_path[1..]`; `sun_path[0]` stays NUL, which is what
/// puts the address in the abstract namespace.
pub(crate) fn control_socket_addr(name: &str) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain data; all-zeroes is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if 1 + name.len() > addr.sun_path.len() {
        bail!(
            "control socket name too long ({} > {}): {name}",
            name.len(),
            addr.sun_path.len() - 1
        );
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, b) in name.as_bytes().iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    Ok((addr, len as libc::socklen_t))
}

/// Connect to the daemon control socket, retrying with back-off.
///
/// Returns `Ok(Some(fd))` once connected, trusted, and the PID has been
/// sent; `Ok(None)` if shutdown was requested while waiting for the daemon.
///
/// # Errors
///
/// Returns an error — and the caller gives up on the worker — when the
/// socket cannot be created, the connected peer fails the credential check,
/// or the PID send comes up short.
pub(crate) fn connect_to_daemon(
    config: &BrokerConfig,
    shutting_down: &AtomicBool,
) -> Result<Option<OwnedFd>> {
    let (addr, addr_len) = control_socket_addr(&config.control_socket_name)?;

    // SAFETY: socket takes no pointers; negative return is an error.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
    if raw < 0 {
        bail!(
            "could not create daemon control socket: {}",
            std::io::Error::last_os_error()
        );
    }
    // SAFETY: raw is a freshly-created descriptor we exclusively own.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let timeout = libc::timeval {
        tv_sec: CONTROL_SEND_TIMEOUT.as_secs() as libc::time_t,
        tv_usec: 0,
    };
    // SAFETY: passes a live timeval of the advertised size.
    let _ = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };

    let pid_msg = encode_pid(std::process::id());
    let mut delay = CONNECT_RETRY_INITIAL;

    while !shutting_down.load(Ordering::Relaxed) {
        // SAFETY: addr is a valid sockaddr_un of addr_len bytes.
        let rc = unsafe {
            libc::connect(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc == 0 {
            if !peer_is_trusted(sock.as_raw_fd(), config) {
                log::error!("[daemon] control socket peer is not trusted, aborting connection");
                // SAFETY: shutdown on a connected socket we own.
                if unsafe { libc::shutdown(sock.as_raw_fd(), libc::SHUT_RDWR) } != 0 {
                    log::error!(
                        "[daemon] trouble shutting down untrusted socket: {}",
                        std::io::Error::last_os_error()
                    );
                }
                bail!("daemon control socket peer failed the credential check");
            }

            let sent = super::retry_eintr(|| {
                // SAFETY: sends from a live fixed-size buffer.
                unsafe {
                    libc::send(
                        sock.as_raw_fd(),
                        pid_msg.as_ptr() as *const libc::c_void,
                        pid_msg.len(),
                        0,
                    )
                }
            });
            if sent as usize != pid_msg.len() {
                bail!(
                    "could not send PID to the debug daemon ({sent} of {} bytes): {}",
                    pid_msg.len(),
                    std::io::Error::last_os_error()
                );
            }
            log::info!("[daemon] PID {} sent to debug daemon", std::process::id());
            return Ok(Some(sock));
        }

        // The daemon not running yet is the expected case; keep this quiet.
        log::debug!(
            "[daemon] can't connect to control socket, will retry in {delay:?}: {}",
            std::io::Error::last_os_error()
        );
        std::thread::sleep(delay);
        delay = next_backoff(delay);
    }
    Ok(None)
}

/// Credential check on a freshly-connected control socket.
///
/// The peer is trusted when its UID is root, our own effective UID, or the
/// daemon identity the embedder configured.
fn peer_is_trusted(fd: RawFd, config: &BrokerConfig) -> bool {
    // SAFETY: ucred is plain data; getsockopt fills at most len bytes.
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        log::error!(
            "[daemon] SO_PEERCRED failed on control socket: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    // SAFETY: geteuid cannot fail.
    cred.uid == 0 || cred.uid == unsafe { libc::geteuid() } || config.daemon_uid == Some(cred.uid)
}

/// Receive one transferred debugger descriptor from the control socket.
///
/// The daemon sends a one-byte payload per descriptor; the payload content
/// is irrelevant, the `SCM_RIGHTS` ancillary data is the message.
///
/// # Errors
///
/// Returns an error on a failed or zero-length `recvmsg` (the daemon is
/// gone) or a datagram with no descriptor attached; the caller tears down
/// the control socket and reconnects.
pub(crate) fn recv_connection_fd(control: RawFd) -> Result<OwnedFd> {
    let mut dummy = [0u8; 1];
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    // SAFETY: msg references live iov and control buffers for the call.
    let rc = super::retry_eintr(|| unsafe { libc::recvmsg(control, &mut msg, 0) });
    if rc <= 0 {
        bail!(
            "receiving descriptor from the debug daemon failed (rc {rc}): {}",
            std::io::Error::last_os_error()
        );
    }

    // Walk the ancillary data for the first SCM_RIGHTS descriptor.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd: libc::c_int =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                if fd >= 0 {
                    return Ok(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    bail!("daemon datagram carried no descriptor in its ancillary data")
}

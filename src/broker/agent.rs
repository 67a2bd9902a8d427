//! Control channel between the broker and the in-process JDWP agent.
//!
//! The two sides share a `SOCK_SEQPACKET` socketpair created before the
//! agent is loaded; the remote end's descriptor number is baked into the
//! agent's load string (`…,transport=fd_forward,address=<fd>`), from which
//! the agent's transport library dups its own handle.
//!
//! Agent → broker traffic is four fixed ASCII tokens, one per datagram,
//! matched against the leading bytes only — the transport library owns the
//! exact byte patterns and may append framing of its own:
//!
//! | token             | meaning                                       |
//! |-------------------|-----------------------------------------------|
//! | `ds-listen-start` | agent is ready to receive a debugger session  |
//! | `ds-listen-end`   | agent stopped listening                       |
//! | `ds-accept`       | agent took ownership of the transferred fds   |
//! | `ds-close`        | agent finished with the debugger connection    |
//!
//! Broker → agent traffic is a single message kind: a one-byte payload
//! whose `SCM_RIGHTS` ancillary data carries three descriptors, in order
//! {read dup of the connection, write dup of the connection, dup of the
//! write-lock eventfd}, sent with `MSG_EOR`.

// Rust guideline compliant 2026-02

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{anyhow, Context, Result};

/// Agent is listening for a debugger session.
pub(crate) const LISTEN_START_MESSAGE: &[u8] = b"ds-listen-start";
/// Agent stopped listening.
pub(crate) const LISTEN_END_MESSAGE: &[u8] = b"ds-listen-end";
/// Agent took ownership of the transferred descriptors.
pub(crate) const ACCEPT_MESSAGE: &[u8] = b"ds-accept";
/// Agent is done with the debugger connection.
pub(crate) const CLOSE_MESSAGE: &[u8] = b"ds-close";

/// Dummy payload byte carried by the descriptor-handoff datagram; the
/// ancillary data is the message.
const HANDOFF_PAYLOAD: u8 = b'!';

/// Number of descriptors in the handoff trio.
const HANDOFF_FD_COUNT: usize = 3;

/// A control datagram from the agent, decoded by prefix match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentMessage {
    ListenStart,
    ListenEnd,
    Accept,
    Close,
    /// Anything else: logged by the caller and ignored, never fatal.
    Unknown,
}

impl AgentMessage {
    /// Classify a datagram by its leading bytes.
    pub(crate) fn parse(datagram: &[u8]) -> Self {
        if datagram.starts_with(LISTEN_START_MESSAGE) {
            AgentMessage::ListenStart
        } else if datagram.starts_with(LISTEN_END_MESSAGE) {
            AgentMessage::ListenEnd
        } else if datagram.starts_with(ACCEPT_MESSAGE) {
            AgentMessage::Accept
        } else if datagram.starts_with(CLOSE_MESSAGE) {
            AgentMessage::Close
        } else {
            AgentMessage::Unknown
        }
    }
}

/// Build the agent load argument.
///
/// Grammar: `<agent>=<options>[,]transport=fd_forward,address=<fd>` where
/// the comma is present iff the options are non-empty.
pub(crate) fn load_argument(agent_name: &str, jdwp_options: &str, control_fd: RawFd) -> String {
    let sep = if jdwp_options.is_empty() { "" } else { "," };
    format!("{agent_name}={jdwp_options}{sep}transport=fd_forward,address={control_fd}")
}

/// Create the seqpacket socketpair the broker and agent talk over.
///
/// Both ends are close-on-exec. `EINTR` is retried; any other failure is a
/// fatal misconfiguration and aborts broker start.
pub(crate) fn create_control_socketpair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    loop {
        // SAFETY: socketpair writes two valid descriptors into fds on success.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc == 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err).context("socketpair for agent control channel");
        }
    }
    // SAFETY: both descriptors are freshly created and exclusively ours.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Hand the debugger connection to the agent.
///
/// Sends one `MSG_EOR` datagram whose ancillary data bears three dups:
/// a read handle and a write handle on `connection`, and a handle on the
/// write-lock eventfd so the agent keeps coordinating with the broker's DDM
/// writers. The dups are closed here on every path once `sendmsg` returns —
/// on success the kernel has already queued its own references for the
/// receiver.
///
/// # Errors
///
/// Returns an error if a `dup` or the `sendmsg` fails; the caller logs and
/// leaves the session flags untouched so the handoff can be retried.
pub(crate) fn send_connection_to_agent(
    agent_sock: RawFd,
    connection: RawFd,
    write_lock: RawFd,
) -> Result<()> {
    let read_dup = dup_fd(connection).context("dup connection for agent read half")?;
    let write_dup = dup_fd(connection).context("dup connection for agent write half")?;
    let lock_dup = dup_fd(write_lock).context("dup write-lock eventfd for agent")?;

    let payload = [HANDOFF_PAYLOAD];
    let fd_bytes = HANDOFF_FD_COUNT * std::mem::size_of::<libc::c_int>();
    // CMSG_SPACE includes the cmsghdr header overhead.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_space as _,
        msg_flags: 0,
    };

    // Populate cmsghdr with SOL_SOCKET / SCM_RIGHTS and the descriptor trio.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data, read_dup.as_raw_fd());
        std::ptr::write_unaligned(data.add(1), write_dup.as_raw_fd());
        std::ptr::write_unaligned(data.add(2), lock_dup.as_raw_fd());
    }

    // SAFETY: msg references live iov and control buffers for the call.
    let n = super::retry_eintr(|| unsafe { libc::sendmsg(agent_sock, &msg, libc::MSG_EOR) });
    if n < 0 {
        return Err(anyhow!(
            "sendmsg agent descriptor handoff: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn dup_fd(fd: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: dup of a caller-supplied live descriptor; ownership of the
    // duplicate passes to the returned OwnedFd.
    let raw = unsafe { libc::dup(fd) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matches_by_prefix() {
        assert_eq!(AgentMessage::parse(b"ds-listen-start"), AgentMessage::ListenStart);
        assert_eq!(AgentMessage::parse(b"ds-listen-end"), AgentMessage::ListenEnd);
        assert_eq!(AgentMessage::parse(b"ds-accept"), AgentMessage::Accept);
        assert_eq!(AgentMessage::parse(b"ds-close"), AgentMessage::Close);
        assert_eq!(AgentMessage::parse(b"ds-nonsense"), AgentMessage::Unknown);
        assert_eq!(AgentMessage::parse(b""), AgentMessage::Unknown);
    }

    /// The transport library pads its tokens with a trailing NUL; only the
    /// leading bytes count.
    #[test]
    fn parse_ignores_trailing_bytes() {
        assert_eq!(AgentMessage::parse(b"ds-accept\0"), AgentMessage::Accept);
        assert_eq!(
            AgentMessage::parse(b"ds-listen-start\0extra"),
            AgentMessage::ListenStart
        );
    }

    #[test]
    fn load_argument_comma_iff_options() {
        assert_eq!(
            load_argument("libjdwpagent.so", "", 17),
            "libjdwpagent.so=transport=fd_forward,address=17"
        );
        assert_eq!(
            load_argument("libjdwpagent.so", "suspend=n,server=y", 17),
            "libjdwpagent.so=suspend=n,server=y,transport=fd_forward,address=17"
        );
    }

    /// The handoff must deliver exactly three working descriptors: writing
    /// through the received write dup appears at the far side of the
    /// connection, and the received lock dup is a live eventfd.
    #[test]
    fn handoff_transfers_three_usable_fds() {
        let (broker_end, agent_end) =
            create_control_socketpair().expect("agent control socketpair");
        let (conn_near, conn_far) = create_control_socketpair().expect("fake connection pair");
        let lock = crate::broker::eventfd::EventFd::new(1).expect("eventfd");

        send_connection_to_agent(broker_end.as_raw_fd(), conn_near.as_raw_fd(), lock.raw())
            .expect("handoff send");

        let (payload, fds) = recv_with_fds(agent_end.as_raw_fd());
        assert_eq!(payload, b"!");
        assert_eq!(fds.len(), 3, "expected the {{read, write, lock}} trio");

        // Write through the received write dup; it must surface at conn_far.
        let msg = b"agent speaks";
        let written = unsafe {
            libc::send(fds[1].as_raw_fd(), msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        assert_eq!(written as usize, msg.len());

        let mut buf = [0u8; 64];
        let n = unsafe {
            libc::recv(conn_far.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert_eq!(&buf[..n as usize], msg);

        // The lock dup is a functioning eventfd: the count of 1 is readable.
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                fds[2].as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n as usize, std::mem::size_of::<u64>());
        assert_eq!(value, 1);
    }

    /// Closing the broker's originals must not invalidate the agent's dups —
    /// the kernel copied the descriptor table entries at send time.
    #[test]
    fn handoff_dups_survive_original_close() {
        let (broker_end, agent_end) =
            create_control_socketpair().expect("agent control socketpair");
        let (conn_near, conn_far) = create_control_socketpair().expect("fake connection pair");
        let lock = crate::broker::eventfd::EventFd::new(1).expect("eventfd");

        send_connection_to_agent(broker_end.as_raw_fd(), conn_near.as_raw_fd(), lock.raw())
            .expect("handoff send");
        drop(conn_near);

        let (_, fds) = recv_with_fds(agent_end.as_raw_fd());
        assert_eq!(fds.len(), 3);

        let msg = b"still alive";
        let written = unsafe {
            libc::send(fds[1].as_raw_fd(), msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        assert_eq!(written as usize, msg.len());

        let mut buf = [0u8; 64];
        let n = unsafe {
            libc::recv(conn_far.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert_eq!(&buf[..n as usize], msg);
    }

    /// Receive one datagram, extracting any SCM_RIGHTS ancillary descriptors.
    fn recv_with_fds(sock: RawFd) -> (Vec<u8>, Vec<OwnedFd>) {
        let mut data_buf = vec![0u8; 64];
        let fd_size = std::mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE((fd_size * 4) as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: data_buf.len(),
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

        let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
        assert!(n >= 0, "recvmsg failed: {}", std::io::Error::last_os_error());
        data_buf.truncate(n as usize);

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data = libc::CMSG_DATA(cmsg);
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                    for i in 0..count {
                        let fd: libc::c_int =
                            std::ptr::read_unaligned(data.add(i * fd_size) as *const libc::c_int);
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        (data_buf, fds)
    }
}

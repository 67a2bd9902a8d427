//! DDM chunk framing onto the debugger connection.
//!
//! DDM telemetry rides the debugger wire as one command-packet kind
//! (command set 0xC7, command 0x01). Layout, all integers big-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     total length   = 23 + len(data)
//! 4       4     packet id      (bit 31 always set)
//! 8       1     flags          = 0 (command packet)
//! 9       1     command set    = 0xC7
//! 10      1     command        = 0x01
//! 11      4     chunk type     (four ASCII bytes)
//! 15      4     chunk length   = len(data)
//! 19      4     reserved       = 0
//! 23+…          payload bytes
//! ```
//!
//! Publishes happen on arbitrary runtime threads. The eventfd write
//! interlock pins the connection descriptor open for the duration of the
//! `writev`, which sends header and payload as a single two-segment
//! scatter-gather write.

// Rust guideline compliant 2026-02

use super::eventfd::ScopedEventFdLock;
use super::SessionShared;

/// Command-packet header length: 11 bytes of command framing, the chunk
/// type and chunk length words, and the reserved word.
pub(crate) const CHUNK_HEADER_LEN: usize = 11 + 4 + 4 + 4;

/// Command set reserved for DDM traffic.
pub(crate) const DDM_COMMAND_SET: u8 = 0xc7;

/// The single DDM command.
pub(crate) const DDM_COMMAND: u8 = 0x01;

/// Every emitted packet id carries the high bit.
pub(crate) const DDM_ID_HIGH_BIT: u32 = 0x8000_0000;

/// Encode the fixed 23-byte chunk header.
pub(crate) fn encode_chunk_header(
    packet_id: u32,
    kind: u32,
    data_len: u32,
) -> [u8; CHUNK_HEADER_LEN] {
    let mut header = [0u8; CHUNK_HEADER_LEN];
    header[0..4].copy_from_slice(&(CHUNK_HEADER_LEN as u32 + data_len).to_be_bytes());
    header[4..8].copy_from_slice(&packet_id.to_be_bytes());
    header[8] = 0; // flags: command packet
    header[9] = DDM_COMMAND_SET;
    header[10] = DDM_COMMAND;
    header[11..15].copy_from_slice(&kind.to_be_bytes());
    header[15..19].copy_from_slice(&data_len.to_be_bytes());
    // bytes 19..23 stay zero (reserved)
    header
}

/// Render a chunk type as its four ASCII characters for log messages.
///
/// Non-printable bytes become `.` so log lines stay single-line.
pub(crate) fn fourcc(kind: u32) -> String {
    kind.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Frame `data` as a DDM chunk and write it to the debugger connection.
///
/// Runs entirely under the write interlock. Without a connection the chunk
/// is dropped with a warning; a short write is logged as an error but is not
/// fatal — the connection continues.
pub(crate) fn publish(session: &SessionShared, kind: u32, data: &[u8]) {
    // Take the interlock early to fail fast; it also pins the connection
    // descriptor open until the writev below has finished.
    let _lock = ScopedEventFdLock::acquire(&session.write_lock);
    let Some(fd) = session.connection.raw() else {
        log::warn!(
            "[ddm] not sending {} chunk ({} bytes): no debugger connection",
            fourcc(kind),
            data.len()
        );
        return;
    };

    let header = encode_chunk_header(session.next_ddm_id(), kind, data.len() as u32);
    let iovs = [
        libc::iovec {
            iov_base: header.as_ptr() as *mut libc::c_void,
            iov_len: header.len(),
        },
        libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        },
    ];
    let total = header.len() + data.len();
    let res = super::retry_eintr(|| {
        // SAFETY: both iovecs reference live buffers for the duration of the
        // call; the descriptor is pinned open by the interlock above.
        unsafe { libc::writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int) }
    });
    if res < 0 || res as usize != total {
        log::error!(
            "[ddm] failed to send {} chunk to debugger ({res} of {total} bytes): {}",
            fourcc(kind),
            std::io::Error::last_os_error()
        );
    } else {
        log::trace!("[ddm] sent {} chunk to debugger ({total} bytes)", fourcc(kind));
    }
}

//! Peer identity retrieval for accepted UNIX socket connections
//! (`SO_PEERCRED` for uid, `SO_PEERSEC` for the security label).

use std::os::unix::io::RawFd;

use buxton_core::model::Label;

/// The effective uid of the process on the other end of the socket at `fd`.
pub fn peer_uid(fd: RawFd) -> std::io::Result<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(cred.uid)
}

/// The peer's security label (LSM-dependent `SO_PEERSEC`). Falls back to
/// the default label when the kernel has no label to offer — unlabelled
/// hosts and sandboxed test environments both take this path.
///
/// Called once at accept and again before dispatching every inbound
/// message, since the kernel may update the peer's label mid-connection.
pub fn peer_label(fd: RawFd) -> Label {
    let mut buf = vec![0u8; 256];
    let mut len = buf.len() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERSEC,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Label::default_label();
    }
    buf.truncate(len as usize);
    while buf.last() == Some(&0) {
        buf.pop();
    }
    match String::from_utf8(buf) {
        Ok(s) => Label::new(s).unwrap_or_else(|_| Label::default_label()),
        Err(_) => Label::default_label(),
    }
}

/// The network priority value Linux treats as the high-priority band for
/// `SO_PRIORITY` (on par with `TC_PRIO_INTERACTIVE`).
const HIGH_PRIORITY: libc::c_int = 6;

/// Mark `fd` as a high-priority socket at accept time. Best-effort: some
/// platforms/sandboxes reject `SO_PRIORITY`, and a client connection is no
/// less usable without it.
pub fn set_high_priority(fd: RawFd) {
    let value = HIGH_PRIORITY;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::debug!(error = %std::io::Error::last_os_error(), "SO_PRIORITY not supported, continuing");
    }
}

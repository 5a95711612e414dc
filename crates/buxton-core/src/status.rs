//! Status codes returned to clients in `STATUS` frames.
//!
//! Mirrors the taxonomy in spec §7: protocol / argument / permission /
//! existence / backend / resource errors each map to one of these.

/// Wire-level status code, carried as the int32 parameter 0 of every
/// `STATUS` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Failed = 1,
    BadArgs = 2,
    ServerDown = 3,
    SocketWrite = 4,
    SocketRead = 5,
    Oom = 6,
    MutexLock = 7,
    Callback = 8,
    MessageCorrupt = 9,
    ExceededMaxParams = 10,
    InvalidType = 11,
    InvalidControlField = 12,
    /// POSIX EPERM — caller lacks the required access or root privilege.
    EPerm = 13,
    /// POSIX EEXIST — group or key already exists.
    EExist = 14,
    /// POSIX ENOENT — group or key does not exist.
    ENoEnt = 15,
    /// Generic not-found outcome distinct from POSIX ENOENT (used for
    /// cross-layer lookups that simply found nothing).
    NotFound = 16,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::Failed,
            2 => Self::BadArgs,
            3 => Self::ServerDown,
            4 => Self::SocketWrite,
            5 => Self::SocketRead,
            6 => Self::Oom,
            7 => Self::MutexLock,
            8 => Self::Callback,
            9 => Self::MessageCorrupt,
            10 => Self::ExceededMaxParams,
            11 => Self::InvalidType,
            12 => Self::InvalidControlField,
            13 => Self::EPerm,
            14 => Self::EExist,
            15 => Self::ENoEnt,
            16 => Self::NotFound,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::BadArgs => "BAD_ARGS",
            Self::ServerDown => "SERVER_DOWN",
            Self::SocketWrite => "SOCKET_WRITE",
            Self::SocketRead => "SOCKET_READ",
            Self::Oom => "OOM",
            Self::MutexLock => "MUTEX_LOCK",
            Self::Callback => "CALLBACK",
            Self::MessageCorrupt => "MESSAGE_CORRUPT",
            Self::ExceededMaxParams => "EXCEEDED_MAX_PARAMS",
            Self::InvalidType => "INVALID_TYPE",
            Self::InvalidControlField => "INVALID_CONTROL_FIELD",
            Self::EPerm => "EPERM",
            Self::EExist => "EEXIST",
            Self::ENoEnt => "ENOENT",
            Self::NotFound => "NOT_FOUND",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_i32() {
        for code in [
            StatusCode::Ok,
            StatusCode::EPerm,
            StatusCode::ENoEnt,
            StatusCode::MessageCorrupt,
        ] {
            assert_eq!(StatusCode::from_i32(code.as_i32()), Some(code));
        }
    }

    #[test]
    fn unknown_value_is_none() {
        assert_eq!(StatusCode::from_i32(999), None);
    }
}

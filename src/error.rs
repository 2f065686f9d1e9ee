//! Defines the protocol-neutral error taxonomy shared by every subsystem.
//!
//! Both adapters translate these values into their wire status codes;
//! [`Nfs3Status`] carries the RFC 1813 numbers and [`Error::ntstatus`]
//! the MS-ERREF constants the SMB adapter needs.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive as _;

/// Result of core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Error {
    /// The file, directory, share, user or handle named by the
    /// request does not exist.
    NotFound,
    /// An object with the requested name already exists.
    AlreadyExists,
    /// An attempt was made to remove a directory that was not empty.
    NotEmpty,
    /// The caller specified a non-directory in a directory operation.
    NotADirectory,
    /// The caller specified a directory in a non-directory operation.
    IsADirectory,
    /// The caller does not have the permission level the operation
    /// requires on the target share.
    PermissionDenied,
    /// A modifying operation was attempted on a read-only share.
    ReadOnly,
    /// A name in the operation exceeded the backend's limit.
    NameTooLong,
    /// Invalid or unsupported argument for an operation.
    InvalidArgument,
    /// The operation would have grown a file beyond the backend's
    /// maximum file size.
    SizeLimitExceeded,
    /// Resource (quota) hard limit exceeded.
    QuotaExceeded,
    /// A hard error occurred in a backend while processing the
    /// requested operation.
    Io,
    /// The backend is unreachable. Reads are retried with backoff
    /// before this surfaces; writes surface immediately.
    BackendUnavailable,
    /// The server is inside its reclaim grace window and the request
    /// did not carry the reclaim flag.
    GracePeriodActive,
    /// A byte-range lock held by a different owner overlaps the
    /// requested range.
    LockConflict,
    /// A lease or delegation could not be granted because conflicting
    /// state exists.
    LockNotGranted,
    /// The delegation referenced by the request was revoked after an
    /// unanswered recall.
    DelegationRevoked,
    /// A v4.1 SEQUENCE carried a slot sequence id that is neither the
    /// successor nor a replay of the last-seen value.
    ReplayMisordered,
    /// The operation's deadline elapsed at a suspension point.
    Timeout,
    /// The operation was cancelled by server shutdown or by the caller.
    Cancelled,
    /// The backend does not advertise the capability the operation
    /// needs.
    Unsupported,
}

/// NFSv3 status numbers (RFC 1813 2.6) for adapter replies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum Nfs3Status {
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    Access = 13,
    Exist = 17,
    NotDir = 20,
    IsDir = 21,
    Inval = 22,
    FBig = 27,
    NoSpc = 28,
    RoFs = 30,
    NameTooLong = 63,
    NotEmpty = 66,
    DQuot = 69,
    Stale = 70,
    NotSupp = 10004,
    Jukebox = 10008,
}

impl Error {
    /// Maps the error onto the NFSv3 status an NFS adapter replies with.
    pub fn nfs3_status(self) -> Nfs3Status {
        match self {
            Error::NotFound => Nfs3Status::NoEnt,
            Error::AlreadyExists => Nfs3Status::Exist,
            Error::NotEmpty => Nfs3Status::NotEmpty,
            Error::NotADirectory => Nfs3Status::NotDir,
            Error::IsADirectory => Nfs3Status::IsDir,
            Error::PermissionDenied => Nfs3Status::Access,
            Error::ReadOnly => Nfs3Status::RoFs,
            Error::NameTooLong => Nfs3Status::NameTooLong,
            Error::InvalidArgument | Error::ReplayMisordered => Nfs3Status::Inval,
            Error::SizeLimitExceeded => Nfs3Status::FBig,
            Error::QuotaExceeded => Nfs3Status::DQuot,
            Error::Io => Nfs3Status::Io,
            Error::DelegationRevoked => Nfs3Status::Stale,
            Error::Unsupported => Nfs3Status::NotSupp,
            // Retryable-at-protocol-level conditions map to JUKEBOX so
            // v3 clients back off and retry.
            Error::BackendUnavailable
            | Error::GracePeriodActive
            | Error::LockConflict
            | Error::LockNotGranted
            | Error::Timeout
            | Error::Cancelled => Nfs3Status::Jukebox,
        }
    }

    /// Numeric form of [`Error::nfs3_status`] for XDR encoding.
    pub fn nfs3_code(self) -> u32 {
        // The enum only holds values that fit in u32.
        self.nfs3_status().to_u32().unwrap_or(Nfs3Status::Io as u32)
    }

    /// Maps the error onto the NTSTATUS an SMB adapter replies with.
    pub fn ntstatus(self) -> u32 {
        match self {
            Error::NotFound => 0xC000_0034,            // OBJECT_NAME_NOT_FOUND
            Error::AlreadyExists => 0xC000_0035,       // OBJECT_NAME_COLLISION
            Error::NotEmpty => 0xC000_0101,            // DIRECTORY_NOT_EMPTY
            Error::NotADirectory => 0xC000_0103,       // NOT_A_DIRECTORY
            Error::IsADirectory => 0xC000_00BA,        // FILE_IS_A_DIRECTORY
            Error::PermissionDenied => 0xC000_0022,    // ACCESS_DENIED
            Error::ReadOnly => 0xC000_00A2,            // MEDIA_WRITE_PROTECTED
            Error::NameTooLong => 0xC000_0106,         // NAME_TOO_LONG
            Error::InvalidArgument => 0xC000_000D,     // INVALID_PARAMETER
            Error::SizeLimitExceeded => 0xC000_007F,   // DISK_FULL
            Error::QuotaExceeded => 0xC000_0044,       // QUOTA_EXCEEDED
            Error::Io => 0xC000_0185,                  // IO_DEVICE_ERROR
            Error::BackendUnavailable => 0xC000_0022,  // retried before surfacing
            Error::GracePeriodActive => 0xC000_00AB,   // INSTANCE_NOT_AVAILABLE
            Error::LockConflict => 0xC000_0054,        // FILE_LOCK_CONFLICT
            Error::LockNotGranted => 0xC000_0055,      // LOCK_NOT_GRANTED
            Error::DelegationRevoked => 0xC000_0128,   // FILE_CLOSED
            Error::ReplayMisordered => 0xC000_000D,    // INVALID_PARAMETER
            Error::Timeout => 0xC000_00B5,             // IO_TIMEOUT
            Error::Cancelled => 0xC000_0120,           // CANCELLED
            Error::Unsupported => 0xC000_00BB,         // NOT_SUPPORTED
        }
    }

    /// Whether a read of this outcome may be retried by the coordinator.
    ///
    /// Deterministic refusals never retry.
    pub fn is_retryable_read(self) -> bool {
        matches!(self, Error::Io | Error::BackendUnavailable)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

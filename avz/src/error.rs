use crate::{evtchn::Port, DomId};
use thiserror_no_std::Error;

/// Recoverable failures of hypervisor operations.
///
/// These are the conditions a domain is expected to run into during normal
/// operation. They cross the hypercall boundary as a negative status, see
/// [`AvzError::errno`]. Broken invariants never show up here; they halt the
/// hypervisor instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvzError {
    #[error("no free memory slot")]
    NoSlot,
    #[error("image does not fit in the memory slot")]
    ImageTooLarge,
    #[error("no matching grant")]
    NoMatchingGrant,
    #[error("resource busy")]
    Busy,
    #[error("invalid event channel port {0}")]
    InvalidPort(Port),
    #[error("no such domain {0}")]
    InvalidDomain(DomId),
    #[error("no free event channel")]
    NoFreePort,
    #[error("virq {0} is already bound")]
    AlreadyBound(u32),
    #[error("malformed snapshot")]
    Snapshot,
    #[error("invalid argument")]
    Invalid,
}

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const ENOMEM: i64 = 12;
pub const EBUSY: i64 = 16;
pub const EEXIST: i64 = 17;
pub const EINVAL: i64 = 22;
pub const ENOSPC: i64 = 28;
pub const E2BIG: i64 = 7;

impl AvzError {
    /// Status written back into a hypercall argument block.
    pub fn errno(&self) -> i64 {
        -match self {
            AvzError::NoSlot => ENOMEM,
            AvzError::ImageTooLarge => E2BIG,
            AvzError::NoMatchingGrant => ENOENT,
            AvzError::Busy => EBUSY,
            AvzError::InvalidPort(_) | AvzError::Snapshot | AvzError::Invalid => EINVAL,
            AvzError::InvalidDomain(_) => EPERM,
            AvzError::NoFreePort => ENOSPC,
            AvzError::AlreadyBound(_) => EEXIST,
        }
    }
}

pub type Result<T> = core::result::Result<T, AvzError>;

/// Flatten a result into a hypercall status.
pub(crate) fn status<T: Into<i64>>(r: Result<T>) -> i64 {
    match r {
        Ok(v) => v.into(),
        Err(e) => e.errno(),
    }
}

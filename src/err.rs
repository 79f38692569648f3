/// Errors surfaced by the driver core.
///
/// Per-ioctl failures are returned to userspace through [`RocketError::to_errno`];
/// failures during job execution are only ever delivered through the job's
/// fences.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RocketError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("object not found")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("core reset retry budget exhausted")]
    ResetExhausted,
    #[error("dependency not bound yet, probe deferred")]
    Deferred,
    #[error("fatal probe error")]
    Fatal,
    #[error("no such device")]
    NoDevice,
    #[error("try again")]
    Again,
    #[error("job cancelled")]
    Cancelled,
    #[error("bad userspace address")]
    Fault,
}

impl RocketError {
    /// Negative errno returned to userspace for this error.
    pub const fn to_errno(self) -> i32 {
        match self {
            RocketError::InvalidArgument => -22,
            RocketError::NotFound => -2,
            RocketError::OutOfMemory => -12,
            RocketError::Busy => -16,
            RocketError::TimedOut => -110,
            RocketError::ResetExhausted => -5,
            RocketError::Deferred => -517,
            RocketError::Fatal => -6,
            RocketError::NoDevice => -19,
            RocketError::Again => -11,
            RocketError::Cancelled => -125,
            RocketError::Fault => -14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_linux() {
        assert_eq!(RocketError::InvalidArgument.to_errno(), -22);
        assert_eq!(RocketError::Busy.to_errno(), -16);
        assert_eq!(RocketError::TimedOut.to_errno(), -110);
        assert_eq!(RocketError::Deferred.to_errno(), -517);
    }
}

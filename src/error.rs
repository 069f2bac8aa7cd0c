use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

use crate::file::Mode;

pub type Result<T> = std::result::Result<T, DcdError>;

/// Everything that can go wrong while reading or writing a dcd trajectory.
#[derive(Debug, Error)]
pub enum DcdError {
    #[error("invalid file mode '{0}', expected 'r' or 'w'")]
    InvalidMode(String),

    /// A failure reported by the underlying file handle.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("corrupt dcd header: {0}")]
    CorruptHeader(String),

    /// The stream ended in the middle of a record.
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("failed to allocate a buffer of {bytes} bytes")]
    AllocationFailure { bytes: usize },

    /// The header and the actual file contents disagree.
    #[error("corrupt trajectory: {0}")]
    CorruptTrajectory(String),

    #[error("frame {index} is out of range for a trajectory of {nframes} frames")]
    OutOfRange { index: u64, nframes: u64 },

    #[error("no file is open")]
    NotOpen,

    #[error("operation requires mode '{expected}', but the file is open in mode '{found}'")]
    WrongMode { expected: Mode, found: Mode },

    #[error("the header has already been written")]
    HeaderAlreadyWritten,

    #[error("the header must be written before any frame")]
    HeaderNotWritten,

    #[error("{what} has length {found}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A count that does not fit in the 32-bit words of the format.
    #[error("{what} of {value} does not fit in a dcd file")]
    TooLarge { what: &'static str, value: u64 },

    #[error("the trajectory contains no frames")]
    EmptyTrajectory,

    /// Reading went past the last frame. Seek or restart iteration to continue.
    #[error("reached the end of the trajectory")]
    EndOfTrajectory,

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
}

impl DcdError {
    /// Returns `true` for the end-of-trajectory signal, which is a normal way for iteration to stop.
    pub fn is_end_of_trajectory(&self) -> bool {
        matches!(self, Self::EndOfTrajectory)
    }

    /// The native error code of an [`DcdError::Io`] failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for DcdError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            _ => Self::Io(err),
        }
    }
}

/// Allocate a zeroed buffer of `len` values, reporting failure instead of aborting.
pub(crate) fn try_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_: TryReserveError| DcdError::AllocationFailure {
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    buf.resize(len, T::default());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_become_unexpected_eof() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert!(matches!(DcdError::from(err), DcdError::UnexpectedEof));

        let err = io::Error::from_raw_os_error(9);
        let err = DcdError::from(err);
        assert!(matches!(err, DcdError::Io(_)));
        assert_eq!(err.raw_os_error(), Some(9));
    }

    #[test]
    fn zeroed_buffers() {
        let buf: Vec<f32> = try_zeroed(12).unwrap();
        assert_eq!(buf, vec![0.0; 12]);
        assert!(matches!(
            try_zeroed::<f64>(usize::MAX / 2),
            Err(DcdError::AllocationFailure { .. })
        ));
    }
}

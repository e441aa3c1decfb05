//! Error taxonomy for the upload service.

/// Type-erased error transported across trait boundaries.
pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while receiving and parsing a request body.
///
/// A `BadRequest` terminates the connection with a 400 reply, a `Server`
/// error with a 500 reply. Both put the receive state machine into its
/// terminal error state; later body chunks are ignored.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Numeric error codes carried in the `err` query parameter of error-page
/// redirects. The web front-end consumes these integers; the values are
/// design-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Filename = 0,
    Exists = 1,
    NotExist = 2,
    Size = 3,
    Quota = 4,
    Recv = 5,
    Internal = 6,
}

impl ErrorCode {
    /// The integer rendered into redirect URLs.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::Filename.code(), 0);
        assert_eq!(ErrorCode::Exists.code(), 1);
        assert_eq!(ErrorCode::NotExist.code(), 2);
        assert_eq!(ErrorCode::Size.code(), 3);
        assert_eq!(ErrorCode::Quota.code(), 4);
        assert_eq!(ErrorCode::Recv.code(), 5);
        assert_eq!(ErrorCode::Internal.code(), 6);
    }
}

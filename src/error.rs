/// Errors produced by the protocol codecs, the request queue and the manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No open link to the BMS when the request was issued, or the link
    /// went away before the response arrived.
    #[error("BMS connection unavailable")]
    ConnectionUnavailable,
    /// Service or characteristic discovery did not match the expected identifiers.
    #[error("device not recognized: {0}")]
    NotRecognizedDevice(String),
    /// The transport rejected a write.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// No matching response arrived before the request deadline.
    #[error("request timed out")]
    Timeout,
    /// CRC failure, short frame or an undecodable field.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// The frame does not belong to the codec it was handed to.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(&'static str),
    #[error("Value out of range")]
    RangeError,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the request queue may run the producer again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::WriteFailed(_)
                | Error::MalformedFrame(_)
                | Error::ProtocolMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

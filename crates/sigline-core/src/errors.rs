use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no authorization available, connection aborted")]
    AuthenticationMissing,
    #[error("abnormal close (code {code})")]
    AbnormalClose { code: u16 },
    #[error("unexpected close (code {code})")]
    UnexpectedClose { code: u16 },
    #[error("handshake did not complete before the connection timeout")]
    ConnectionTimeout,
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid backoff parameters: {0}")]
    InvalidBackoff(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("configuration error: {0}")]
    Config(String),
}

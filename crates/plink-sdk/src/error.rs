use plink_files::FsError;
use plink_protocol::ProtocolError;

/// Error taxonomy of the SDK surface.
///
/// Producer-context calls return these synchronously; inside the loop they
/// become `FAILED` events or condition updates instead, and the loop never
/// exits on a transient one.
#[derive(thiserror::Error, Debug)]
pub enum SdkError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("service returned {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("printer is not registered")]
    Unregistered,
    #[error("no token set")]
    NoToken,
    #[error("token is already set")]
    TokenAlreadySet,
    #[error("server url is not set")]
    NoServerUrl,
    #[error("fingerprint must be provided for printer type {0}")]
    FingerprintRequired(plink_protocol::PrinterType),
    #[error("registration was rejected by the service")]
    RegistrationRejected,
    #[error("registration code expired")]
    RegistrationExpired,
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("handler failed: {0}")]
    HandlerFailure(String),
    #[error("state transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: plink_protocol::State,
        to: plink_protocol::State,
    },
    #[error("transfer timed out")]
    TransferTimeout,
    #[error("transfer aborted: {0}")]
    TransferAborted(String),
    #[error("another transfer is running on storage `{0}`")]
    TransferRunning(String),
    #[error(transparent)]
    Filesystem(#[from] FsError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

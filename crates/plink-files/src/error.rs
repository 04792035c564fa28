use plink_protocol::ProtocolError;

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("`{0}` is already mounted")]
    AlreadyMounted(String),
    #[error("`{0}` is not mounted")]
    NotMounted(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("parent path not found: {0}")]
    PathNotFound(String),
    #[error("invalid name `{name}`: {reason}")]
    NameInvalid { name: String, reason: &'static str },
    #[error("folder not empty: {0}")]
    NotEmpty(String),
    #[error("not a folder: {0}")]
    NotAFolder(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("destination escapes storage `{0}`")]
    OutsideStorage(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

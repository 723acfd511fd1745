use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("plugin descriptor not found: {0}")]
    DescriptorNotFound(String),

    #[error("invalid plugin descriptor {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    #[error("invalid run-as identity '{0}'")]
    InvalidIdentity(String),

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("frame encoding error: {0}")]
    Frame(#[from] rkyv::rancor::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Resource manager error: {0}")]
    ResourceManager(String),

    #[error("Node manager error: {0}")]
    NodeManager(String),

    #[error("Cluster filesystem error: {0}")]
    Filesystem(String),

    #[error("Maximum resource capability is not yet known")]
    CapabilityUnknown,

    #[error("Credential serialization error: {0}")]
    Credentials(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolshiftError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] provider::ProviderError),

    #[error(transparent)]
    Migration(#[from] migration::MigrationError),

    #[error(transparent)]
    Switchover(#[from] switchover::SwitchoverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VolshiftError>;

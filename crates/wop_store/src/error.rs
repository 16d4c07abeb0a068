use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Identity already exists (pass force to replace)")]
    IdentityExists,

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] wop_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

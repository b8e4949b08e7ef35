#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Wrong type for key {key}: expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
    },

    #[error("Malformed reply from store: {0}")]
    MalformedReply(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

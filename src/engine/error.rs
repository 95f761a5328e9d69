use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// Overlaps the active booking with this id.
    Conflict(Ulid),
    Forbidden(&'static str),
    Validation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Conflict(id) => {
                write!(f, "property is not available for these dates (conflicts with booking {id})")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

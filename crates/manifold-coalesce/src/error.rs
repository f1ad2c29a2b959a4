use std::sync::Arc;

/// Errors surfaced by the coalescing primitives.
///
/// The enum is `Clone` so a single cached loader failure can be handed to
/// every waiter of a flight without re-running the loader.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A wait-bounded operation ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// The key has no live entry. Informational; callers typically retry or
    /// fall back.
    #[error("key not found")]
    NotFound,

    /// The governing cancellation handle fired while the caller was parked.
    #[error("cancelled")]
    Cancelled,

    /// A user-supplied loader failed. The original error is preserved and
    /// shared between all observers of the same load.
    #[error("load failed: {0}")]
    Load(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary loader error.
    pub fn load<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Load(Arc::from(err.into()))
    }

    /// Whether this is the distinguished timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_wraps_and_clones() {
        let err = Error::load(std::io::Error::new(std::io::ErrorKind::Other, "backend down"));
        let copy = err.clone();
        assert!(format!("{err}").contains("backend down"));
        assert!(format!("{copy}").contains("backend down"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_is_distinguished() {
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::NotFound.is_timeout());
    }
}

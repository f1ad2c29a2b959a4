/// Errors surfaced by the stream components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A router or pipeline was built without a shard function. Returned
    /// synchronously; no background task is started.
    #[error("shard func is missing")]
    ShardFuncMissing,

    /// The component was cancelled or its input queue is gone; the item was
    /// not accepted.
    #[error("stream is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::ShardFuncMissing.to_string(), "shard func is missing");
        assert_eq!(Error::Closed.to_string(), "stream is closed");
    }
}

use std::time::Duration;

/// Per-request options of `Router::run_aggregation`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Request-level timeout; falls back to the router's default.
    pub timeout: Option<Duration>,
    /// Caller declares the pipeline writes output. Write stages in the
    /// pipeline set this implicitly.
    pub has_write_stages: bool,
    /// Overrides the router's cursor batch size.
    pub batch_size: Option<usize>,
}

impl AggregateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn has_write_stages(mut self, writes: bool) -> Self {
        self.has_write_stages = writes;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

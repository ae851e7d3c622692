/// Settings for how an [`ExecutionContext`](crate::ExecutionContext) drives its dispatch ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Upper bound on the ticks a single `resolve` or `run_until_idle` call may run.
    pub max_ticks: Option<u64>,
    /// Yield to the tokio scheduler between ticks.
    pub yield_between_ticks: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_ticks: None, yield_between_ticks: true }
    }
}

impl DispatchConfig {
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    pub fn with_yield_between_ticks(mut self, yield_between_ticks: bool) -> Self {
        self.yield_between_ticks = yield_between_ticks;
        self
    }
}

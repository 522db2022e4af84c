use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing nodes within a wave.
    pub max_concurrent: usize,
    /// Overall run deadline; checked between waves.
    pub run_timeout: Option<Duration>,
    /// Hard cap on scheduling waves, a backstop against runaway loops.
    pub max_waves: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            run_timeout: None,
            max_waves: 100,
        }
    }
}

//! Embedder-facing VM configuration.
//!
//! Constructed in-process by whoever embeds the VM — there is no
//! file-based config format at this layer; this crate is a library meant
//! to be driven by a host embedder, not a standalone binary.

/// Tunables for a single `Vm` instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of segments to pre-reserve in the arena at construction.
    pub initial_arena_capacity: usize,
    /// Emit `tracing` spans for every step-machine transition, not just
    /// dispatch/delegate/failure. Off by default — it is useful for
    /// debugging a handler chain but adds overhead on the hot loop.
    pub trace_every_step: bool,
    /// Maximum ready-queue tasks the scheduler will service before
    /// `async_run` yields back to the host event loop even if more are
    /// ready, bounding single-poll latency. `0` means unbounded.
    pub scheduler_fairness_quota: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            initial_arena_capacity: 16,
            trace_every_step: false,
            scheduler_fairness_quota: 0,
        }
    }
}

impl VmConfig {
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    pub fn initial_arena_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_arena_capacity = capacity;
        self
    }

    pub fn trace_every_step(mut self, enabled: bool) -> Self {
        self.config.trace_every_step = enabled;
        self
    }

    pub fn scheduler_fairness_quota(mut self, quota: usize) -> Self {
        self.config.scheduler_fairness_quota = quota;
        self
    }

    pub fn build(self) -> VmConfig {
        self.config
    }
}

use std::time::Duration;

/// Delay before a generator thread issues its first access, letting the
/// rest of the harness finish wiring up before load starts.
pub const DEFAULT_BOOT_WAIT: Duration = Duration::from_millis(50);

/// Delay between successive accesses from a single generator thread.
pub const DEFAULT_GENERATOR_DELAY: Duration = Duration::from_millis(5);

/// Largest access size a generator will pick, in bytes.
pub const GENERATOR_MAX_ACCESS_SIZE: usize = 8;

/// Backend size for the Type-1 pair's shared memory region.
pub const TYPE1_BACKEND_SIZE: usize = 16 * 1024 * 1024;

/// Backend size for the Type-2 pair's shared memory region, sized to cover
/// both bias-table entries above `CFMWS_BASE_ADDR`.
pub const TYPE2_BACKEND_SIZE: usize = 256 * 1024 * 1024;

/// Reads `HARNESS_GENERATOR_DELAY_MS` for the per-access delay, falling back
/// to [`DEFAULT_GENERATOR_DELAY`] on anything unparseable or unset.
pub fn generator_delay() -> Duration {
    std::env::var("HARNESS_GENERATOR_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_GENERATOR_DELAY)
}

/// Reads `HARNESS_GENERATORS_ENABLED` (`"0"` disables, anything else or
/// unset leaves the generators running).
pub fn generators_enabled() -> bool {
    std::env::var("HARNESS_GENERATORS_ENABLED").map(|v| v != "0").unwrap_or(true)
}

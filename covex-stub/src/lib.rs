//! Stub runtime: the interpose protocol every `covex`-generated replacement
//! function runs, plus the macros (`interpose!`, `interpose_allocator!`,
//! `interpose_variadic!`) that generate those functions.
//!
//! Multi-threaded test processes are not supported: `count` in the BCA is
//! mutated without synchronization because the whole protocol assumes a
//! single-threaded test. Running a multi-threaded test under `covex`
//! produces undefined scheduling, not a detected error.
#![cfg_attr(feature = "variadic-stubs", feature(c_variadic))]

pub mod context;
pub mod origin;
pub mod resolver;

mod macros;

pub use covex_bca;

/// Environment variable a test toggles (via [`set_enabled`]) to turn fault
/// injection on or off for a window of code.
pub const STUB_ENABLE_ENV_VAR: &str = "COVEX_STUB";

/// Enable or disable fault injection from within the test process itself,
/// wrapping the environment-variable protocol so user code never has to
/// know the variable's name or accepted values.
pub fn set_enabled(on: bool) {
    std::env::set_var(STUB_ENABLE_ENV_VAR, if on { "1" } else { "0" });
}

/// Capture and log a backtrace at the point a fault was injected. Not
/// transported to the driver over a dedicated channel; see `DESIGN.md`.
pub fn capture_fault_backtrace(symbol: &str) {
    tracing::debug!(symbol, "injecting fault");
    tracing::debug!(backtrace = ?backtrace::Backtrace::new(), "fault site");
}

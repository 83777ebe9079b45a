//! Sandbox error taxonomy.

use thiserror::Error;

use super::lifecycle::LifecycleError;

/// Failures raised inside a sandbox. None of these ever escape to the host as
/// a host-level failure: each is converted into an `error` message.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Strategy source failed to compile or instantiate. Always fatal.
    #[error("compile error: {0}")]
    Compile(String),

    /// A single `onTick` invocation trapped.
    #[error("tick {tick} failed: {message}")]
    Tick { tick: u64, message: String },

    /// The strategy's `stop` hook trapped. Logged, never blocks `stopped`.
    #[error("teardown hook failed: {0}")]
    Teardown(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("failed to spawn sandbox thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Render a wasmtime error (trap, link failure, parse failure) with its full
/// cause chain on one line.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

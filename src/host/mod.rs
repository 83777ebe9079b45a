//! Host side of the sandbox boundary: session routing and UI state.

mod registry;
mod session;

pub use registry::{Observed, RegistryError, SessionRegistry};
pub use session::SessionView;

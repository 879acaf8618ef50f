//! Process wiring: supervisors, the resilience monitor and the local API.

pub mod runtime;
pub mod shutdown;

pub use runtime::{build_resilience, run, run_once};
pub use shutdown::ShutdownCoordinator;

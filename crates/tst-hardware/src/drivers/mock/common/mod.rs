//! Shared plumbing for mock devices: error injection, seeded randomness and
//! timing modes.

pub mod errors;
pub mod mode;
pub mod rng;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;

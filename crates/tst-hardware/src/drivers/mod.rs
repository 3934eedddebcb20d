//! Device drivers.
//!
//! Only simulated devices live here; real hardware is reached through the
//! control system and is registered by deployment-specific factories.

pub mod mock;

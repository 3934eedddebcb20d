//! Flyer coordination, run engine and acquisition plans for the TST instrument.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Plan (tomography, xas, sim)  │
//! └──────────────┬───────────────┘
//!                │ RunContext
//!                ▼
//! ┌──────────────────────────────┐      ┌────────────────────────┐
//! │ RunEngine                    │─────▶│ broadcast<Document>    │
//! │ queue, pause/abort, cleanup  │      └────────────────────────┘
//! └──────────────┬───────────────┘
//!                │
//!    ┌───────────┴────────────┐
//!    ▼                        ▼
//! ┌──────────────────┐   ┌──────────────────────┐
//! │ FlyerCoordinator │──▶│ DeviceRegistry       │
//! │ DeviceFlyer xN   │   │ (tst-hardware)       │
//! └──────────────────┘   └──────────────────────┘
//! ```

pub mod flyers;
pub mod plans;
pub mod run_engine;

pub use flyers::{
    create_advanced_flyer_coordinator, create_flyers, AbortReport, DeviceFlyer, Flyer,
    FlyerCoordinator, FlyerKind, StandardFlyers, TimingValidator, TriggerLogic, TriggerSettings,
    ValidationReport,
};
pub use plans::Plan;
pub use run_engine::{EngineError, EngineState, ExitStatus, PlanOutcome, RunContext, RunEngine};

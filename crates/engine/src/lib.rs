//! Irrigation decision and scheduling engine.
//!
//! Decides whether, when and for how long each zone is watered from soil
//! moisture, weather, a learned absorption rate and a weekly time window.
//!
//! # Pipeline
//!
//! ```text
//!   weather + rain ──▶ MoistureDeficitTracker ──▶ deficit
//!   moisture + deficit ──▶ DurationCalculator (AbsorptionLearner) ──▶ request
//!   requests + window budget ──▶ FairAllocator ──▶ AllocationPlan
//!   AllocationPlan ──▶ Coordinator ──▶ ZoneCycle per zone ──▶ Actuator
//!                                         │
//!                       delayed readings ─┴──▶ AbsorptionLearner
//! ```
//!
//! The engine is synchronous and owns no threads or clocks. The host builds a
//! [`Coordinator`] from [`Capabilities`] and calls [`Coordinator::tick`] on a
//! fixed interval.

pub mod absorption;
pub mod allocator;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod cycle;
pub mod deficit;
pub mod duration;
pub mod error;
pub mod persist;
pub mod schedule;
pub mod status;
pub mod weather;

pub use absorption::{AbsorptionLearner, AbsorptionModel};
pub use allocator::{Allocation, AllocationPlan, AllocationRequest, FairAllocator};
pub use capability::{
    Actuator, AlwaysOpen, Capabilities, CurrentConditions, ForecastSummary, RainSensor, ScheduleProvider,
    WeatherProvider, ZoneSensors,
};
pub use config::{EngineConfig, ZoneConfig};
pub use coordinator::Coordinator;
pub use cycle::{AbortReason, DoneReason, Outcome, Phase};
pub use deficit::MoistureDeficitTracker;
pub use duration::{DurationCalculator, DurationRequest};
pub use error::{CapabilityError, EngineError};
pub use persist::{EngineState, ZoneState};
pub use schedule::WeeklyWindow;
pub use status::{EngineEvent, TickReport, ZoneStatus};
pub use weather::{GateBlock, GateDecision, WeatherSnapshot};

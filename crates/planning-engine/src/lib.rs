//! Façade over the optimiser, simulator and tax engine.
//!
//! Engine-wide defaults come from the environment (see [`EngineConfig`]);
//! each request may override them for a single call.

pub mod config;
pub mod engine;
pub mod requests;

pub use config::EngineConfig;
pub use engine::PlanningEngine;
pub use requests::{
    FrontierRequest, OptimizeRequest, ScenarioRequest, SimulationRequest, TaxProjectionRequest,
    TaxStrategyRequest,
};

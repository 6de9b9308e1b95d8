pub mod engine;
pub mod error;
pub mod floor;
pub mod registry;
pub mod strategy;

pub use engine::{PersistedState, StrategyEngine, TypedEngine};
pub use error::StrategyError;
pub use floor::{FloorConfig, FloorState, FloorStrategy, HedgeNeutralizer};
pub use registry::{StrategyFactory, StrategyRegistry};
pub use strategy::{Strategy, StrategyContext, Transition};

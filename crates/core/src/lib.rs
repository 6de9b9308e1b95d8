pub mod clock;
pub mod config;
pub mod config_loader;
pub mod events;
pub mod market;
pub mod position;
pub mod tick;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, DatabaseConfig, ExecutorConfig, LifecycleConfig, RedisConfig, TickPipelineConfig,
};
pub use config_loader::ConfigLoader;
pub use events::{HedgeInstruction, LayerClosure, RemovalReason, StrategyEvent};
pub use market::{pip_size, AccountSnapshot, InstrumentMetadata};
pub use position::{Direction, PositionKind, PositionSummary};
pub use tick::{RawTick, Tick, TickParseError};
pub use traits::{MarketGateway, PubSub};

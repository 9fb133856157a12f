/// Position tracking, exit policy and trade execution

pub mod monitor;
pub mod position;
pub mod strategy;
pub mod supervisor;
pub mod trading;

pub use monitor::{PositionOutcome, PositionTask};
pub use position::{Phase, PositionState};
pub use strategy::{evaluate, Decision, ExitReason};
pub use supervisor::{Closed, Ledger, PositionSupervisor, TaskContext};
pub use trading::{ExecutionGateway, TradeApiGateway, TradeError, TradeOutcome};

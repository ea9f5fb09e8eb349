pub mod engine;
pub mod models;
pub mod reconciler;

pub use engine::{EngineConfig, SettlementEngine, SwapCommand, WithdrawalCommand};
pub use models::{OperationKind, OperationSnapshot, SettlementOperation, SettlementState};

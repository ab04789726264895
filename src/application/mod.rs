// Application layer: the ledger, the matcher and the engine that drives
// requests through their lifecycle.

pub mod engine;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod retry;
pub mod sweeper;

pub use engine::*;
pub use error::*;
pub use ledger::*;
pub use matcher::*;
pub use retry::*;
pub use sweeper::*;

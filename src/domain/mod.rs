mod balance;
mod credits;
mod ledger;
mod matching;
mod request;
pub mod state_machine;
mod transaction;

pub use balance::*;
pub use credits::*;
pub use ledger::*;
pub use matching::*;
pub use request::*;
pub use state_machine::*;
pub use transaction::*;

pub mod application;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod io;
pub mod storage;

pub use application::{
    Collaborators, CommandContext, EngineConfig, EngineError, RetryPolicy, TransactionEngine,
};
pub use domain::*;
pub use storage::Repository;

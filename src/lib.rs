pub mod classifier;
pub mod client;
pub mod domain;
pub mod ledger;
pub mod monitoring;
pub mod pipeline;
pub mod queue;
pub mod replay;
pub mod reply_chain;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use crate::types::*;

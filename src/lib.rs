//! Client-side transaction lifecycle management for an eventually-finalizing ledger.
//!
//! The crate turns application submissions into signed, broadcast and confirmed
//! transactions while surviving node outages, crashes, reorgs and fee spikes:
//!
//! - [`head_tracker`] turns a raw head subscription into an ordered, backfilled
//!   stream of canonical chain heads and drives registered observers
//! - [`broadcaster`] owns nonce sequencing, signing, broadcast and crash resume
//! - [`confirmer`] reconciles persisted state against chain progress and
//!   re-prices stuck transactions
//! - [`jobs`] notifies application handlers once transactions settle
//! - [`txmanager`] wires everything together behind one facade
//!
//! All components communicate through the durable [`store`], which is the
//! source of truth across restarts.

pub mod broadcaster;
pub mod chain;
pub mod config;
pub mod confirmer;
pub mod errors;
pub mod gas;
pub mod head_tracker;
pub mod jobs;
pub mod logger;
pub mod metrics;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod txmanager;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use errors::{TxmError, TxmResult};
pub use txmanager::{NewTx, TxManager};
pub use types::{Address, Head, Tx, TxAttempt, TxReceipt, TxState, Wei, H256};

//! Streamlet-style BFT consensus engine: a chain store, vote tracker and
//! epoch-driven consensus engine wrapped in a real tokio
//! transport, JSON-file persistence, and a `clap`-driven CLI.

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod mempool;
pub mod message;
pub mod node;
pub mod persistence;
pub mod transaction;
pub mod transport;
pub mod votes;

#[cfg(feature = "sim")]
pub mod sim;

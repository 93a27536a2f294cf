//! A Tessera node: validator loop, `/evaluate` worker endpoint, gossip DHT
//! replica and state averaging in one process.

pub mod client;
pub mod config;
pub mod model;
pub mod node;
pub mod server;
pub mod storage;

pub use config::{CheckpointTarget, Config};
pub use node::run;

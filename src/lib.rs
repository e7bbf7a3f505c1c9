//! Trace relay agent: streams OS trace events to configurable sinks and
//! takes its orders from a central manager over a push control channel.

pub mod api;
pub mod channel;
pub mod config;
pub mod control;
pub mod crypto;
pub mod filter;
pub mod manager;
pub mod processor;
pub mod retry;
pub mod session;
pub mod sink;
pub mod state;
pub mod store;
pub mod trace;

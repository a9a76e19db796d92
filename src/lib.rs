//! nodepool: a shared inventory of simulated network nodes, handed out to
//! concurrent consumers without double allocation.

pub mod cli;
pub mod client;
pub mod config;
pub mod pool;
pub mod server;

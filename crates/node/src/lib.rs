//! The node tool server: an axum HTTP surface over the confined tool
//! implementations in `nacc-tools`.

pub mod cli;
pub mod server;
pub mod state;

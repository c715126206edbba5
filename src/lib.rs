//! Network defense service library.
//!
//! Flow-based DDoS detection, auto-block decisions and firewall rule
//! lifecycle management, shared by the service binary and its benchmarks.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;

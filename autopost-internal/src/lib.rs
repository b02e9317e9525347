pub mod auth; // subscriber key validation
pub mod config_parser; // gateway config file and environment
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics)
pub mod quota; // per-subscriber daily quota
mod testing;

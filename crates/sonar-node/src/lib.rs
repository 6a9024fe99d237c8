//! sonar agent library
//!
//! Configuration loading and the long-running node built on `sonar-dht`.

pub mod config;
pub mod node;

//! Library crate for ioc-scan-rs: port-major reachability scanning of IOC
//! high-risk IPv4 sets.
pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod netdetect;
pub mod packet;
pub mod ports;
pub mod ratelimit;
pub mod scanner;
pub mod sender;
pub mod server;
pub mod sink;
pub mod strategy;
pub mod targets;
pub mod transport;
pub mod types;

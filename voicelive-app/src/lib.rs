pub mod config;
pub mod managed;
pub mod runtime;
pub mod search;
pub mod storage;
pub mod telemetry;

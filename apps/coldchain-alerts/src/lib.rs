pub mod alert;
pub mod bus;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod relay;
pub mod router;
pub mod stats;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;

pub mod assembler;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod provider;
pub mod providers;
pub mod relay;
pub mod server;
pub mod stream;
pub mod telemetry;

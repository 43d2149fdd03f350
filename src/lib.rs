mod ort_service;
mod routes;
#[cfg(test)]
mod test_utils;

pub mod app;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod error;
pub mod executor;
pub mod frame;
pub mod handler;
pub mod labels;
pub mod model_service;
pub mod quality;
pub mod server;
pub mod telemetry;

pub use app::start_app;

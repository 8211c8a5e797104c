mod model_loader;
mod ort_service;
mod routes;
mod telemetry;

pub mod app;
pub mod config;
pub mod inference_service;
pub mod model_service;
pub mod pages;
pub mod server;
pub mod upload_store;

pub use app::start_app;
pub use telemetry::Metrics;

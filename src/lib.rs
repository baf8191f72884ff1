pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod narrator;
pub mod ollama;
pub mod pipeline;
pub mod resolver;
pub mod server;
pub mod store;
pub mod tokenizer;
pub mod tts;

pub use config::AppConfig;
pub use error::{BardError, BardResult};
pub use server::run_server;

pub mod batch;
pub mod config;
pub mod error;
pub mod jobs;
pub mod key_codec;
pub mod model;
pub mod onlinestore;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod serving;
pub mod staging;
pub mod types;
mod util;

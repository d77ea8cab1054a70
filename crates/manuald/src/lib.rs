//! manuald library - product-manual question answering
//!
//! Exposes the pipeline pieces and in-crate fakes for integration tests.

pub mod clock;
pub mod config;
pub mod error;
pub mod feedback;
pub mod generator;
pub mod governor;
pub mod manuals;
pub mod ollama;
pub mod orchestrator;
pub mod progress;
pub mod quota;
pub mod routes;
pub mod server;
pub mod service;
pub mod sessions;
pub mod stages;
pub mod storage;
pub mod text;
pub mod verifier;

pub use config::Config;
pub use service::{Collaborators, QaService};

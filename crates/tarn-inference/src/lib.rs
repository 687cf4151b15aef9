//! # tarn-inference
//!
//! Model capability backends for the tarn lake engine.
//!
//! This crate provides:
//! - The Ollama implementation of the embedding and generation backends
//! - Goal-directed prompt assembly for summarization and response
//! - A mock backend with call logging and failure injection for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use tarn_inference::OllamaBackend;
//! use tarn_core::EmbeddingBackend;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OllamaBackend::from_env();
//!     let texts = vec!["Hello".to_string()];
//!     let embeddings = backend.embed_texts(&texts).await.unwrap();
//!     assert_eq!(embeddings.len(), 1);
//! }
//! ```

pub mod capability;
pub mod ollama;

// Mock backend for tests. Always compiled so integration tests in
// downstream crates can use it.
pub mod mock;

// Re-export core types
pub use tarn_core::*;

pub use capability::{respond, summarize, RESPONSE_SYSTEM_PROMPT, SUMMARY_SYSTEM_PROMPT};
pub use mock::MockInferenceBackend;
pub use ollama::OllamaBackend;

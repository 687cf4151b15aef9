//! Mock inference backend for deterministic testing.
//!
//! Implements [`EmbeddingBackend`] and [`GenerationBackend`] with
//! deterministic embeddings, canned responses, a call log, and failure
//! injection. Always compiled so integration tests in downstream crates can
//! drive the engine without a model server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tarn_core::{EmbeddingBackend, Error, GenerationBackend, Result};

/// Mock inference backend for testing.
#[derive(Clone)]
pub struct MockInferenceBackend {
    config: Arc<MockConfig>,
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    dimension: usize,
    fixed_responses: HashMap<String, String>,
    default_response: String,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    failures_remaining: u32,
    fail_with_timeout: bool,
}

/// One recorded backend invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub input: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            fixed_responses: HashMap::new(),
            default_response: "Mock response".to_string(),
        }
    }
}

impl MockInferenceBackend {
    /// Create a new mock backend with default configuration.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension;
        self
    }

    /// Set the default response for generation requests.
    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).default_response = response.into();
        self
    }

    /// Add a response mapping for a prompt substring.
    ///
    /// The first mapping whose key is contained in the prompt wins.
    pub fn with_response_mapping(
        mut self,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.config)
            .fixed_responses
            .insert(input.into(), output.into());
        self
    }

    /// Make the next `n` calls fail with an unrecoverable inference error.
    pub fn fail_next(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.failures_remaining = n;
        state.fail_with_timeout = false;
    }

    /// Make the next `n` calls fail with a timeout.
    pub fn fail_next_with_timeout(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        state.failures_remaining = n;
        state.fail_with_timeout = true;
    }

    /// Get all logged calls for assertion.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Get number of embed calls.
    pub fn embed_call_count(&self) -> usize {
        self.count_calls("embed")
    }

    /// Get number of generation calls.
    pub fn generate_call_count(&self) -> usize {
        self.count_calls("generate")
    }

    fn count_calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn record(&self, operation: &str, input: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall {
            operation: operation.to_string(),
            input: input.to_string(),
        });
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return if state.fail_with_timeout {
                Err(Error::Timeout("simulated timeout".to_string()))
            } else {
                Err(Error::Inference("simulated failure".to_string()))
            };
        }
        Ok(())
    }

    /// Generate a deterministic embedding from text.
    ///
    /// Character-based hashing, so the same text always produces the same
    /// unit vector.
    pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0; dimension];
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % dimension;
            vec[idx] += 0.1;
        }
        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
        vec
    }
}

impl Default for MockInferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockInferenceBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let joined = texts.join("\n");
        self.record("embed", &joined)?;
        Ok(texts
            .iter()
            .map(|t| Self::deterministic_embedding(t, self.config.dimension))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

#[async_trait]
impl GenerationBackend for MockInferenceBackend {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with_system("", prompt).await
    }

    async fn generate_with_system(&self, _system: &str, prompt: &str) -> Result<String> {
        self.record("generate", prompt)?;
        for (key, response) in &self.config.fixed_responses {
            if prompt.contains(key) {
                return Ok(response.clone());
            }
        }
        Ok(self.config.default_response.clone())
    }

    fn model_name(&self) -> &str {
        "mock-gen"
    }
}

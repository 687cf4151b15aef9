//! Goal-directed prompt assembly for the compaction and response stages.
//!
//! The engine treats model access as two narrow capabilities: merge a group
//! of entries into one goal-focused summary, and produce a final answer
//! grounded in one entry. Both build prompts here and run them through a
//! [`GenerationBackend`].

use tarn_core::{GenerationBackend, Result};

/// System prompt for the summarization capability.
pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You are an assistant that condenses data by extracting key facts and \
insights from the given content, with a specific focus on the user's stated \
goal. Extract and keep only the elements that directly serve that goal:
- Core facts and statistics
- Key insights or conclusions
- Essential data points
- Critical findings or results
Discard everything that does not directly contribute to the goal. Keep the \
summary detailed and accurate while staying concise.";

/// System prompt for the response capability.
pub const RESPONSE_SYSTEM_PROMPT: &str = "\
Based on the information provided, produce a response that addresses the \
stated goal. Follow these guidelines:
- Be clear and concise.
- Be accurate based only on the information provided.
- Stay relevant to the goal, and follow any instructions it contains.
- Include every detail that is relevant to the goal.
If the information is insufficient to answer, reply exactly with \
\"Insufficient information for response\".";

/// Merge a group of entry contents into one goal-focused summary.
pub async fn summarize(
    backend: &dyn GenerationBackend,
    goal: &str,
    contents: &[String],
) -> Result<String> {
    let mut prompt = format!("Goal: {goal}\n\n");
    for (i, content) in contents.iter().enumerate() {
        prompt.push_str(&format!("--- Entry {} ---\n{}\n\n", i + 1, content));
    }
    prompt.push_str("Summarize the entries above with respect to the goal.");

    backend
        .generate_with_system(SUMMARY_SYSTEM_PROMPT, &prompt)
        .await
}

/// Produce the final answer for a goal, grounded in one entry.
pub async fn respond(backend: &dyn GenerationBackend, goal: &str, content: &str) -> Result<String> {
    let prompt = format!("Goal: {goal}\n\n--- Content ---\n{content}\n\nAnswer the goal.");
    backend
        .generate_with_system(RESPONSE_SYSTEM_PROMPT, &prompt)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInferenceBackend;

    #[tokio::test]
    async fn test_summarize_includes_goal_and_entries() {
        let backend = MockInferenceBackend::new().with_fixed_response("merged");
        let contents = vec!["first".to_string(), "second".to_string()];

        let out = summarize(&backend, "what changed?", &contents).await.unwrap();
        assert_eq!(out, "merged");

        let calls = backend.get_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].input.contains("Goal: what changed?"));
        assert!(calls[0].input.contains("--- Entry 1 ---\nfirst"));
        assert!(calls[0].input.contains("--- Entry 2 ---\nsecond"));
    }

    #[tokio::test]
    async fn test_respond_includes_content() {
        let backend = MockInferenceBackend::new().with_fixed_response("the answer");

        let out = respond(&backend, "why?", "because of X").await.unwrap();
        assert_eq!(out, "the answer");

        let calls = backend.get_calls();
        assert!(calls[0].input.contains("because of X"));
    }
}

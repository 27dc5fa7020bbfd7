//! Answer generation over retrieved context.
//!
//! The model lives behind a one-method trait so the HTTP surface and
//! tests can swap implementations; everything about prompt assembly is
//! plain functions with no model knowledge.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::retriever::UserProfile;

/// Produces an answer from an assembled prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Completes `prompt` under `system`. A backend failure is the
    /// query's failure; there is no degraded fallback here.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, RagError>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone, Debug)]
pub struct OpenAiGenerator {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiGenerator {
    /// Builds a generator client.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, RagError> {
        if api_key.trim().is_empty() {
            return Err(RagError::Config("missing generation API key".to_string()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| RagError::Config("API key is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    /// Stock OpenAI endpoint with `gpt-4o-mini`.
    pub fn with_defaults(api_key: &str) -> Result<Self, RagError> {
        Self::new(
            api_key,
            "https://api.openai.com/v1",
            "gpt-4o-mini",
            Duration::from_secs(60),
        )
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, RagError> {
        // Low temperature keeps answers consistent and factual.
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.3,
            max_tokens: 1000,
            top_p: 0.9,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| RagError::Generation(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Generation(format!(
                "chat request failed ({status}): {body}"
            )));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| RagError::Generation(format!("unparseable response: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| RagError::Generation("response contained no choices".to_string()))
    }
}

/// Assembles the user prompt from the query, retrieved context, and the
/// optional profile and highlighted text.
pub fn build_prompt(
    query: &str,
    context: &str,
    profile: Option<&UserProfile>,
    selected_text: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(selected) = selected_text {
        parts.push(format!(
            "The user has selected/highlighted this text: '{selected}'"
        ));
        parts.push(format!(
            "The user's question about this selected text is: '{query}'"
        ));
    } else {
        parts.push(format!("The user's question is: '{query}'"));
    }

    parts.push(
        "\nBased on the following textbook content, please answer the user's question:"
            .to_string(),
    );
    parts.push(format!("\n{context}"));

    if let Some(profile) = profile {
        let mut profile_parts: Vec<String> = Vec::new();
        if !profile.software_background.level.is_empty() {
            profile_parts.push(format!(
                "User's software background: {} ({})",
                profile.software_background.level,
                profile.software_background.stack.join(", ")
            ));
        }
        if !profile.hardware_background.level.is_empty()
            || !profile.hardware_background.experience.is_empty()
        {
            profile_parts.push(format!(
                "User's hardware background: {} {}",
                profile.hardware_background.level, profile.hardware_background.experience
            ));
        }
        if !profile.preferences.is_empty() {
            let mut prefs: Vec<String> = profile
                .preferences
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            prefs.sort();
            profile_parts.push(format!("User's preferences: {}", prefs.join(", ")));
        }
        if !profile_parts.is_empty() {
            parts.push(format!(
                "\nUser profile information: {}",
                profile_parts.join("; ")
            ));
            parts.push(
                "Please tailor your response to match the user's background and preferences."
                    .to_string(),
            );
        }
    }

    parts.join("\n")
}

/// System prompt, optionally personalized to the reader's levels.
pub fn system_prompt(profile: Option<&UserProfile>) -> String {
    let mut prompt = String::from(
        "You are an expert AI assistant for the Physical AI & Humanoid Robotics textbook. \
         Your role is to provide accurate, helpful answers based on the textbook content \
         provided in the context. Always cite specific information from the context when \
         answering. If the context doesn't contain information to answer the question, \
         clearly state that the information is not available in the provided materials.",
    );
    let Some(profile) = profile else {
        return prompt;
    };

    let mut notes: Vec<&str> = Vec::new();
    match profile.software_background.level.to_lowercase().as_str() {
        "beginner" => notes.push(
            "The user is a beginner in software development. Provide detailed explanations \
             and avoid overly technical jargon.",
        ),
        "advanced" => notes.push(
            "The user is an advanced developer. You can use technical terminology and \
             provide in-depth explanations.",
        ),
        _ => {}
    }
    let hardware = profile.hardware_background.experience.to_lowercase();
    if hardware.contains("beginner") {
        notes.push("The user is new to hardware concepts. Explain hardware-related concepts clearly.");
    } else if hardware.contains("advanced") {
        notes.push("The user has advanced hardware experience. You can discuss complex hardware topics.");
    }
    for note in notes {
        prompt.push(' ');
        prompt.push_str(note);
    }
    prompt
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::SoftwareBackground;

    #[test]
    fn prompt_without_extras_is_query_plus_context() {
        let prompt = build_prompt("What is a joint?", "Joints connect links.", None, None);
        assert!(prompt.starts_with("The user's question is: 'What is a joint?'"));
        assert!(prompt.contains("Joints connect links."));
        assert!(!prompt.contains("selected/highlighted"));
        assert!(!prompt.contains("User profile information"));
    }

    #[test]
    fn selected_text_changes_the_framing() {
        let prompt = build_prompt(
            "What does this mean?",
            "ctx",
            None,
            Some("torque ripple"),
        );
        assert!(prompt.contains("selected/highlighted this text: 'torque ripple'"));
        assert!(prompt.contains("question about this selected text"));
    }

    #[test]
    fn profile_appends_tailoring_instructions() {
        let profile = UserProfile {
            software_background: SoftwareBackground {
                level: "beginner".to_string(),
                stack: vec!["python".to_string()],
            },
            ..UserProfile::default()
        };
        let prompt = build_prompt("q", "ctx", Some(&profile), None);
        assert!(prompt.contains("User's software background: beginner (python)"));
        assert!(prompt.contains("tailor your response"));
    }

    #[test]
    fn system_prompt_personalizes_by_level() {
        let mut profile = UserProfile::default();
        profile.software_background.level = "beginner".to_string();
        let prompt = system_prompt(Some(&profile));
        assert!(prompt.contains("beginner in software development"));

        profile.software_background.level = "advanced".to_string();
        profile.hardware_background.experience = "advanced robotics".to_string();
        let prompt = system_prompt(Some(&profile));
        assert!(prompt.contains("advanced developer"));
        assert!(prompt.contains("complex hardware topics"));
    }

    #[test]
    fn rejects_blank_credentials() {
        assert!(matches!(
            OpenAiGenerator::with_defaults("").unwrap_err(),
            RagError::Config(_)
        ));
    }
}

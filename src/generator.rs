use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::Settings;

pub const SYSTEM_PROMPT: &str = "You are an assistant for answering questions about retail banking products: \
credit cards, deposit accounts, and mortgage loans. \
Use ONLY the provided context from the bank's official PDF documents. \
If the answer is not clearly contained in the context, say that you cannot answer \
based on the available information.";

/// User turn wrapping the assembled context around the question.
pub fn user_message(context: &str, question: &str) -> String {
    format!(
        "Context from the bank's product documents:\n\n{context}\n\n\
         User question: {question}\n\n\
         Answer in Greek, clearly and concisely. If useful, mention whether the answer \
         comes from credit cards, deposits or mortgage loans."
    )
}

/// Text-completion service the pipeline hands its prompt to.
pub trait AnswerGenerator: Send + Sync {
    fn generate(&self, system_instructions: &str, user_message: &str) -> Result<String>;
}

pub struct OpenAiGenerator {
    api_key: String,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    client: Client,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: String,
        base_url: &str,
        model: String,
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            api_key,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
            temperature,
            client,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY must be set for the answer generator")?;
        Self::new(
            api_key,
            &settings.openai_base_url,
            settings.chat_model.clone(),
            settings.chat_temperature,
            Duration::from_secs(settings.request_timeout_secs.max(1)),
        )
    }
}

impl AnswerGenerator for OpenAiGenerator {
    fn generate(&self, system_instructions: &str, user_message: &str) -> Result<String> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_instructions,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .context("failed to call OpenAI chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("OpenAI returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp.json().context("failed to parse OpenAI response")?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|answer| !answer.trim().is_empty())
            .context("OpenAI response contained no answer text")
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ChatMessage<'a>>,
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
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_embeds_context_and_question() {
        let message = user_message("[credit_cards | page 2]\nΌριο 5.000€", "Ποιο είναι το όριο;");
        assert!(message.starts_with("Context from the bank's product documents:\n\n[credit_cards | page 2]"));
        assert!(message.contains("User question: Ποιο είναι το όριο;"));
        assert!(message.contains("Answer in Greek"));
    }

    #[test]
    fn chat_response_without_content_parses() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}

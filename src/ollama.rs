use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        num_predict: usize,
        temperature: f32,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            stream: bool,
            options: ChatOptions,
        }

        #[derive(Serialize)]
        struct ChatOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: ChatMessage,
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                model,
                messages,
                stream: false,
                options: ChatOptions {
                    num_predict,
                    temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/chat returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<ChatResp>()
            .await
            .context("failed to decode ollama chat response")?;

        let answer = response.message.content.trim().to_string();
        if answer.is_empty() {
            anyhow::bail!("ollama /api/chat returned an empty message");
        }
        Ok(answer)
    }
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(detail) = json.get("detail") {
            if let Some(message) = detail.get("message").and_then(|v| v.as_str()) {
                return message.to_string();
            }
            if let Some(message) = detail.as_str() {
                return message.to_string();
            }
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_are_reduced_to_their_message() {
        assert_eq!(normalize_err_body("  "), "<empty body>");
        assert_eq!(
            normalize_err_body(r#"{"error":"model 'x' not found"}"#),
            "model 'x' not found"
        );
        assert_eq!(
            normalize_err_body(r#"{"detail":{"status":"invalid_api_key","message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(normalize_err_body("plain failure"), "plain failure");
    }

    #[test]
    fn chat_roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::system("be brief")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"be brief"}"#);

        let json = serde_json::to_string(&ChatMessage::user("why?")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"why?"}"#);
    }

    #[test]
    fn replies_decode_with_the_assistant_role() {
        let reply: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"Long ago."}"#).unwrap();
        assert_eq!(reply.role, ChatRole::Assistant);
        assert_eq!(reply.content, "Long ago.");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = OllamaClient::new("http://127.0.0.1:11434/");
        assert_eq!(client.base_url, "http://127.0.0.1:11434");
    }
}

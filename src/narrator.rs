use anyhow::Result;
use async_trait::async_trait;

use crate::config::AppConfig;
use crate::ollama::{ChatMessage, OllamaClient};

const SYSTEM_PROMPT: &str = "You are Bard, the narrator of this audiobook.

The listener has paused the audiobook to ask you a question. Answer as a knowledgeable, \
thoughtful narrator, using only the narrative context supplied with the question: the \
events, characters, places and relationships established so far. Do not draw on outside \
knowledge of the work or of what happens later in it.

CRITICAL RULES:
1. NEVER reveal or hint at events that occur AFTER the current point in the narrative.
2. NEVER mention characters who have not been introduced yet.
3. If the question would spoil future events, politely explain that you cannot reveal what happens next.
4. You may explain the significance of events already narrated.
5. Keep answers conversational, as if speaking to a curious listener.
6. Aim for 2-4 sentences for simple questions, more only for complex ones.

Respond in the measured tone of a skilled audiobook narrator.";

const AGENT_POSITION_NOTE: &str =
    "The listener's current position in the audiobook will be provided via context updates.";

pub const AGENT_SETUP_INSTRUCTIONS: &str = "Configure the conversational agent with:
1. System prompt: use the prompt above.
2. Voice: the narrator voice id (ELEVENLABS_VOICE_ID).
3. Turn eagerness: patient, for thoughtful questions and answers.
4. Interruptions: enabled.
5. Tools: add 'resume_audiobook' as a client tool.";

/// Narrator prompt for an externally hosted agent that receives the
/// listener's position as context updates instead of inline text.
pub fn agent_system_prompt() -> String {
    format!("{SYSTEM_PROMPT}\n\n{AGENT_POSITION_NOTE}")
}

/// Produces an answer from the disclosed narrative and the listener's question.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(&self, narrative_context: &str, question: &str) -> Result<String>;
}

pub fn build_messages(narrative_context: &str, question: &str) -> Vec<ChatMessage> {
    let user = format!(
        "NARRATIVE CONTEXT (everything the listener has heard so far):\n{}\n\n---\n\nLISTENER'S QUESTION: {}",
        narrative_context.trim(),
        question.trim()
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

#[derive(Clone)]
pub struct OllamaNarrator {
    client: OllamaClient,
    model: String,
    max_output_tokens: usize,
    temperature: f32,
}

impl OllamaNarrator {
    pub fn new(client: OllamaClient, config: &AppConfig) -> Self {
        Self {
            client,
            model: config.models.answer_model.clone(),
            max_output_tokens: config.tokens.max_output_tokens,
            temperature: config.models.temperature,
        }
    }
}

#[async_trait]
impl AnswerGenerator for OllamaNarrator {
    async fn generate_answer(&self, narrative_context: &str, question: &str) -> Result<String> {
        let messages = build_messages(narrative_context, question);
        self.client
            .chat(
                &self.model,
                &messages,
                self.max_output_tokens,
                self.temperature,
            )
            .await
    }
}

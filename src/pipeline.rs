use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::context::ContextAssembler;
use crate::error::{BardError, BardResult};
use crate::models::Answer;
use crate::narrator::AnswerGenerator;
use crate::resolver::PositionResolver;
use crate::tts::SpeechSynthesizer;

#[derive(Clone)]
pub struct AnswerPipeline {
    resolver: PositionResolver,
    assembler: ContextAssembler,
    generator: Arc<dyn AnswerGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    generation_limit: Arc<Semaphore>,
    token_budget: usize,
    generation_timeout: Duration,
    synthesis_timeout: Duration,
}

impl AnswerPipeline {
    pub fn new(
        config: &AppConfig,
        resolver: PositionResolver,
        assembler: ContextAssembler,
        generator: Arc<dyn AnswerGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            resolver,
            assembler,
            generator,
            synthesizer,
            generation_limit,
            token_budget: config.tokens.max_context_tokens,
            generation_timeout: config.timeouts.generation,
            synthesis_timeout: config.timeouts.synthesis,
        }
    }

    pub fn resolver(&self) -> &PositionResolver {
        &self.resolver
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Resolve, assemble, generate, then optionally synthesize.
    ///
    /// Only synthesis failures are absorbed; the answer then carries no audio.
    pub async fn answer(
        &self,
        chapter_id: i64,
        audio_time: f64,
        question: &str,
        speak: bool,
    ) -> BardResult<Answer> {
        let started = Instant::now();

        let position = self.resolver.resolve(chapter_id, audio_time).await?;
        let context = self
            .assembler
            .assemble(position.sentence_id, self.token_budget)
            .await?;
        if context.is_empty() {
            return Err(BardError::EmptyContext(position.sentence_id));
        }

        let answer_text = self.generate(&context.text, question).await?;
        let audio_url = if speak {
            self.speak(&answer_text).await
        } else {
            None
        };

        tracing::info!(
            chapter_id,
            sentence_id = position.sentence_id,
            context_sentences = context.sentence_count,
            context_tokens = context.transmitted_tokens,
            truncated = context.truncated,
            with_audio = audio_url.is_some(),
            latency_ms = started.elapsed().as_millis() as u64,
            "answered question"
        );

        Ok(Answer {
            answer_text,
            audio_url,
            stats: context.stats(),
            position,
        })
    }

    async fn generate(&self, context: &str, question: &str) -> BardResult<String> {
        let _permit = self
            .generation_limit
            .acquire()
            .await
            .map_err(|err| BardError::Generation(err.into()))?;

        let outcome = tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate_answer(context, question),
        )
        .await;

        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err(BardError::Generation(anyhow::anyhow!(
                "model returned an empty answer"
            ))),
            Ok(Err(err)) => Err(BardError::Generation(err)),
            Err(_) => Err(BardError::Generation(anyhow::anyhow!(
                "no answer within {:?}",
                self.generation_timeout
            ))),
        }
    }

    async fn speak(&self, text: &str) -> Option<String> {
        let outcome = tokio::time::timeout(self.synthesis_timeout, self.synthesizer.synthesize(text))
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "no audio within {:?}",
                    self.synthesis_timeout
                ))
            });

        match outcome {
            Ok(url) => Some(url),
            Err(err) => {
                let err = BardError::Synthesis(err);
                tracing::warn!(error = %err, "returning answer without audio");
                None
            }
        }
    }
}

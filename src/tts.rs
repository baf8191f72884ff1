use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::SpeechConfig;
use crate::ollama::normalize_err_body;

/// Turns answer text into playable audio and returns where it can be fetched.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct ElevenLabsSynthesizer {
    client: Client,
    config: SpeechConfig,
    answers_dir: PathBuf,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: SpeechConfig, answers_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            config,
            answers_dir: answers_dir.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<String> {
        #[derive(Serialize)]
        struct SpeechReq<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        if !self.config.is_configured() {
            anyhow::bail!("ELEVENLABS_API_KEY / ELEVENLABS_VOICE_ID not set");
        }

        let url = format!(
            "{}/v1/text-to-speech/{}/stream",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id
        );
        let mut response = self
            .client
            .post(url)
            .query(&[("output_format", self.config.output_format.as_str())])
            .header("xi-api-key", &self.config.api_key)
            .json(&SpeechReq {
                text,
                model_id: &self.config.model_id,
            })
            .send()
            .await
            .context("failed to call elevenlabs text-to-speech endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "elevenlabs text-to-speech returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        tokio::fs::create_dir_all(&self.answers_dir).await?;
        let answer_id = new_answer_id();
        let path = answer_file(&self.answers_dir, &answer_id);

        let written = match write_stream(&mut response, &path).await {
            Ok(0) => Err(anyhow::anyhow!("elevenlabs returned an empty audio stream")),
            other => other,
        };
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err);
            }
        };

        tracing::debug!(answer_id = %answer_id, bytes = written, "stored answer audio");
        Ok(answer_url(&answer_id))
    }
}

async fn write_stream(response: &mut reqwest::Response, path: &Path) -> Result<usize> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut written = 0usize;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("failed reading elevenlabs audio stream")?
    {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    Ok(written)
}

pub fn new_answer_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn answer_url(answer_id: &str) -> String {
    format!("/answers/{answer_id}/audio")
}

fn answer_file(answers_dir: &Path, answer_id: &str) -> PathBuf {
    answers_dir.join(format!("answer_{answer_id}.mp3"))
}

/// Location of a stored answer, or `None` for ids this module never issues.
pub fn answer_audio_path(answers_dir: &Path, answer_id: &str) -> Option<PathBuf> {
    let valid = answer_id.len() == 8 && answer_id.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| answer_file(answers_dir, answer_id))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn answer_ids_round_trip_to_paths() {
        let id = new_answer_id();
        assert_eq!(id.len(), 8);
        assert_eq!(answer_url(&id), format!("/answers/{id}/audio"));

        let path = answer_audio_path(Path::new("/data/answers"), &id).unwrap();
        assert_eq!(path, PathBuf::from(format!("/data/answers/answer_{id}.mp3")));
    }

    #[test]
    fn foreign_answer_ids_are_refused() {
        let dir = Path::new("/data/answers");
        assert!(answer_audio_path(dir, "../../etc").is_none());
        assert!(answer_audio_path(dir, "abc").is_none());
        assert!(answer_audio_path(dir, "zzzzzzzz").is_none());
    }

    fn speech_config(base_url: String) -> SpeechConfig {
        SpeechConfig {
            base_url,
            api_key: "test-key".to_string(),
            voice_id: "narrator".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            output_format: "mp3_44100_128".to_string(),
        }
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_no_partial_file() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: audio/mpeg\r\n\
                      transfer-encoding: chunked\r\n\r\n4\r\nID3\x04\r\n",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let synthesizer =
            ElevenLabsSynthesizer::new(speech_config(format!("http://{addr}")), dir.path());

        assert!(synthesizer.synthesize("Hello.").await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_synthesizer_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let synthesizer = ElevenLabsSynthesizer::new(
            SpeechConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: String::new(),
                voice_id: String::new(),
                model_id: "eleven_flash_v2_5".to_string(),
                output_format: "mp3_44100_128".to_string(),
            },
            dir.path(),
        );

        let err = synthesizer.synthesize("Hello.").await.unwrap_err();
        assert!(err.to_string().contains("not set"));
    }
}

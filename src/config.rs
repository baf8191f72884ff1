use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CORS_ORIGINS: &str =
    "http://localhost:5173,http://localhost:3000,http://127.0.0.1:5173,http://127.0.0.1:3000";

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub answer_model: String,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub max_context_tokens: usize,
    pub max_output_tokens: usize,
    /// Word window used by the agent context endpoint.
    pub max_context_words: usize,
}

#[derive(Clone, Debug)]
pub struct SpeechConfig {
    pub base_url: String,
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
}

impl SpeechConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.voice_id.is_empty()
    }
}

/// Conversational agent the frontend connects to directly.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub agent_id: String,
    pub use_agent: bool,
    pub conversation_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub generation: Duration,
    pub synthesis: Duration,
    pub max_concurrent_generations: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub ollama_base_url: String,
    pub cors_origins: Vec<String>,
    pub models: ModelConfig,
    pub tokens: TokenConfig,
    pub speech: SpeechConfig,
    pub agent: AgentConfig,
    pub timeouts: TimeoutConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("BARD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let db_path = env::var("BARD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("bard.db"));

        Self {
            bind_addr: env::var("BARD_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            data_dir,
            db_path,
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            cors_origins: parse_origins(
                &env::var("BARD_CORS_ORIGINS").unwrap_or_else(|_| DEFAULT_CORS_ORIGINS.to_string()),
            ),
            models: ModelConfig {
                answer_model: env::var("ANSWER_MODEL")
                    .unwrap_or_else(|_| "qwen2.5:7b-instruct".to_string()),
                temperature: env_parse("ANSWER_TEMPERATURE", 0.7),
            },
            tokens: TokenConfig {
                max_context_tokens: env_parse("MAX_CONTEXT_TOKENS", 100_000),
                max_output_tokens: env_parse("MAX_OUTPUT_TOKENS", 500),
                max_context_words: env_parse("MAX_CONTEXT_WORDS", 2_000),
            },
            speech: SpeechConfig {
                base_url: env::var("ELEVENLABS_BASE_URL")
                    .unwrap_or_else(|_| "https://api.elevenlabs.io".to_string()),
                api_key: env::var("ELEVENLABS_API_KEY").unwrap_or_default(),
                voice_id: env::var("ELEVENLABS_VOICE_ID").unwrap_or_default(),
                model_id: env::var("TTS_MODEL_ID")
                    .unwrap_or_else(|_| "eleven_flash_v2_5".to_string()),
                output_format: env::var("TTS_OUTPUT_FORMAT")
                    .unwrap_or_else(|_| "mp3_44100_128".to_string()),
            },
            agent: AgentConfig {
                agent_id: env::var("ELEVENLABS_AGENT_ID").unwrap_or_default(),
                use_agent: env_parse("USE_ELEVENLABS_AGENT", true),
                conversation_timeout_ms: env_parse("CONVERSATION_TIMEOUT_MS", 10_000),
            },
            timeouts: TimeoutConfig {
                generation: Duration::from_secs(env_parse("GENERATION_TIMEOUT_SECS", 60)),
                synthesis: Duration::from_secs(env_parse("SYNTHESIS_TIMEOUT_SECS", 30)),
                max_concurrent_generations: env_parse("MAX_CONCURRENT_GENERATIONS", 2usize).max(1),
            },
        }
    }

    pub fn answers_dir(&self) -> PathBuf {
        self.data_dir.join("answers")
    }

    /// Chapter audio paths are stored relative to the data directory.
    pub fn resolve_data_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(relative)
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.db_path.display())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

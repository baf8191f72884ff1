use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub chapter_id: i64,
    pub title: String,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// One narration unit. `start_time` and `end_time` are either both set or both unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sentence {
    pub sentence_id: i64,
    pub chapter_id: i64,
    pub sequence: i64,
    pub text: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
}

impl Sentence {
    pub fn interval(&self) -> Option<(f64, f64)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.interval().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterInfo {
    pub chapter_id: i64,
    pub title: String,
    pub duration_seconds: Option<f64>,
    pub sentence_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentenceAlignment {
    pub sentence_id: i64,
    pub sequence: i64,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
}

/// Alignment output for one sentence, as written by the forced-alignment step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlignmentSpan {
    pub sentence_id: i64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterAlignment {
    pub chapter_id: i64,
    pub sentences: Vec<AlignmentSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedChapter {
    pub chapter_id: i64,
    pub title: String,
    #[serde(default)]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub sentences: Vec<Sentence>,
}

impl PreparedChapter {
    pub fn chapter(&self) -> Chapter {
        Chapter {
            chapter_id: self.chapter_id,
            title: self.title.clone(),
            audio_path: self.audio_path.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

/// Output of the text preparation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedText {
    pub chapters: Vec<PreparedChapter>,
    #[serde(default)]
    pub total_sentences: i64,
}

/// Which rule of the resolver picked the sentence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    Containment,
    PrecedingStart,
    ChapterStart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPosition {
    pub sentence_id: i64,
    pub sentence: Sentence,
    pub audio_time: f64,
    pub rule: ResolutionRule,
}

/// Contiguous run of context sentences belonging to one chapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterSpan {
    pub chapter_id: i64,
    pub first_sentence_id: i64,
    pub last_sentence_id: i64,
    pub sentence_count: usize,
}

/// Narrative text that may be disclosed at a position.
///
/// `sentence_count`, `chapter_count` and `estimated_tokens` describe the full
/// window before truncation; `transmitted_tokens` counts `text` as returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NarrativeContext {
    pub up_to_sentence_id: i64,
    pub text: String,
    pub spans: Vec<ChapterSpan>,
    pub sentence_count: usize,
    pub chapter_count: usize,
    pub estimated_tokens: usize,
    pub transmitted_tokens: usize,
    pub truncated: bool,
}

impl NarrativeContext {
    pub fn empty(up_to_sentence_id: i64) -> Self {
        Self {
            up_to_sentence_id,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sentence_count == 0
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            sentence_count: self.sentence_count,
            chapter_count: self.chapter_count,
            estimated_tokens: self.estimated_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextStats {
    pub sentence_count: usize,
    pub chapter_count: usize,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub chapter_id: i64,
    pub audio_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub audio_url: Option<String>,
    pub current_sentence_id: i64,
    pub context_sentence_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextAnswerResponse {
    pub answer: String,
    pub current_sentence_id: i64,
    pub current_sentence_text: String,
    pub context_sentence_count: usize,
    pub context_chapter_count: usize,
    pub context_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPreview {
    pub current_sentence_id: i64,
    pub current_sentence_text: String,
    pub current_chapter_id: i64,
    pub context_preview: String,
    pub stats: ContextStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContextQuery {
    pub chapter_id: i64,
    pub audio_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContextResponse {
    pub chapter_id: i64,
    pub chapter_title: String,
    pub sentence_id: Option<i64>,
    pub current_sentence: Option<String>,
    pub text_heard_so_far: String,
    pub word_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigResponse {
    pub agent_id: String,
    pub voice_id: String,
    pub use_agent: bool,
    pub conversation_timeout_ms: u64,
    pub max_context_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSystemPrompt {
    pub prompt: String,
    pub instructions: String,
}

/// Pipeline result before it is shaped into a response.
#[derive(Debug, Clone)]
pub struct Answer {
    pub answer_text: String,
    pub audio_url: Option<String>,
    pub position: ResolvedPosition,
    pub stats: ContextStats,
}

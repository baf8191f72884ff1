//! Error taxonomy for position resolution, context assembly and answering.

#[derive(Debug, thiserror::Error)]
pub enum BardError {
    #[error("chapter {0} not found")]
    ChapterNotFound(i64),

    #[error("chapter {0} has no sentences")]
    EmptyChapter(i64),

    #[error("no narrative context available at sentence {0}")]
    EmptyContext(i64),

    #[error("answer generation failed: {0:#}")]
    Generation(anyhow::Error),

    #[error("speech synthesis failed: {0:#}")]
    Synthesis(anyhow::Error),

    #[error("invalid sentence row {sentence_id}: {reason}")]
    InvalidSentenceRow { sentence_id: i64, reason: String },

    #[error("invalid alignment for chapter {chapter_id}: {reason}")]
    InvalidAlignment { chapter_id: i64, reason: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl BardError {
    /// The playback position could not be mapped to a sentence.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::ChapterNotFound(_) | Self::EmptyChapter(_))
    }
}

pub type BardResult<T> = std::result::Result<T, BardError>;

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::BardError;
use crate::models::{
    AlignmentSpan, Chapter, ChapterInfo, PreparedText, Sentence, SentenceAlignment,
};
use crate::resolver;

/// Read access to chapters and their ordered sentences.
///
/// Implementations must return chapter sentences ordered by `sequence` and
/// `sentences_up_to` ordered by `(chapter_id, sequence)`.
#[async_trait]
pub trait SentenceStore: Send + Sync {
    async fn sentence(&self, sentence_id: i64) -> Result<Option<Sentence>>;

    async fn chapter(&self, chapter_id: i64) -> Result<Option<Chapter>>;

    async fn chapter_sentences(&self, chapter_id: i64) -> Result<Vec<Sentence>>;

    async fn sentences_up_to(&self, sentence_id: i64) -> Result<Vec<Sentence>>;

    async fn list_chapters(&self) -> Result<Vec<ChapterInfo>>;

    async fn chapter_alignment(&self, chapter_id: i64) -> Result<Vec<SentenceAlignment>> {
        let sentences = self.chapter_sentences(chapter_id).await?;
        Ok(sentences.iter().filter_map(to_alignment).collect())
    }

    async fn find_sentence_at_time(
        &self,
        chapter_id: i64,
        audio_time: f64,
    ) -> Result<Option<Sentence>> {
        let sentences = self.chapter_sentences(chapter_id).await?;
        Ok(resolver::locate(&sentences, audio_time).map(|(sentence, _)| sentence.clone()))
    }
}

pub fn to_alignment(sentence: &Sentence) -> Option<SentenceAlignment> {
    let (start_time, end_time) = sentence.interval()?;
    Some(SentenceAlignment {
        sentence_id: sentence.sentence_id,
        sequence: sentence.sequence,
        text: sentence.text.clone(),
        start_time,
        end_time,
    })
}

/// Field-level checks applied to every sentence crossing the storage boundary.
pub fn check_sentence(sentence: &Sentence) -> Result<(), BardError> {
    let invalid = |reason: &str| BardError::InvalidSentenceRow {
        sentence_id: sentence.sentence_id,
        reason: reason.to_string(),
    };

    if sentence.sequence < 0 {
        return Err(invalid("sequence must not be negative"));
    }

    match (sentence.start_time, sentence.end_time) {
        (None, None) => Ok(()),
        (Some(start), Some(end)) => {
            if !start.is_finite() || !end.is_finite() {
                Err(invalid("alignment bounds must be finite"))
            } else if start > end {
                Err(invalid("start_time is after end_time"))
            } else {
                Ok(())
            }
        }
        _ => Err(invalid("exactly one of start_time/end_time is set")),
    }
}

/// Validates `spans` against the chapter's current sentences and returns the
/// chapter as it would look once the spans are applied.
///
/// Aligned sentences, taken in sequence order, must not overlap.
pub fn check_alignment(
    chapter_id: i64,
    chapter_sentences: &[Sentence],
    spans: &[AlignmentSpan],
) -> Result<Vec<Sentence>, BardError> {
    let invalid = |reason: String| BardError::InvalidAlignment { chapter_id, reason };

    let mut by_id: HashMap<i64, AlignmentSpan> = HashMap::with_capacity(spans.len());
    for span in spans {
        if !span.start.is_finite() || !span.end.is_finite() || span.start > span.end {
            return Err(invalid(format!(
                "sentence {} has invalid interval [{}, {}]",
                span.sentence_id, span.start, span.end
            )));
        }
        if by_id.insert(span.sentence_id, *span).is_some() {
            return Err(invalid(format!(
                "sentence {} is aligned twice",
                span.sentence_id
            )));
        }
    }

    let known: HashSet<i64> = chapter_sentences.iter().map(|s| s.sentence_id).collect();
    if let Some(stray) = by_id.keys().find(|id| !known.contains(id)) {
        return Err(invalid(format!(
            "sentence {stray} does not belong to the chapter"
        )));
    }

    let mut updated: Vec<Sentence> = chapter_sentences.to_vec();
    updated.sort_by_key(|s| s.sequence);
    for sentence in &mut updated {
        if let Some(span) = by_id.get(&sentence.sentence_id) {
            sentence.start_time = Some(span.start);
            sentence.end_time = Some(span.end);
        }
    }

    check_monotonic(chapter_id, &updated)?;
    Ok(updated)
}

/// Aligned sentences of one chapter, taken in sequence order, must not overlap.
pub fn check_monotonic(chapter_id: i64, chapter_sentences: &[Sentence]) -> Result<(), BardError> {
    match overlaps(chapter_sentences).into_iter().next() {
        Some(reason) => Err(BardError::InvalidAlignment { chapter_id, reason }),
        None => Ok(()),
    }
}

/// Missing, inverted or overlapping timings in one chapter, one line per sentence.
pub fn alignment_issues(chapter_id: i64, chapter_sentences: &[Sentence]) -> Vec<String> {
    let mut issues: Vec<String> = Vec::new();
    for sentence in chapter_sentences {
        match sentence.interval() {
            None => issues.push(format!(
                "chapter {chapter_id}, sentence {}: missing alignment",
                sentence.sentence_id
            )),
            Some((start, end)) if start >= end => issues.push(format!(
                "chapter {chapter_id}, sentence {}: invalid times [{start}, {end}]",
                sentence.sentence_id
            )),
            Some(_) => {}
        }
    }
    issues.extend(
        overlaps(chapter_sentences)
            .into_iter()
            .map(|reason| format!("chapter {chapter_id}, {reason}")),
    );
    issues
}

fn overlaps(chapter_sentences: &[Sentence]) -> Vec<String> {
    let mut aligned: Vec<&Sentence> = chapter_sentences.iter().filter(|s| s.is_aligned()).collect();
    aligned.sort_by_key(|s| s.sequence);

    aligned
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            let prev_end = prev.end_time?;
            let start = next.start_time?;
            (prev_end > start).then(|| {
                format!(
                    "sentence {}: starts at {start} before sentence {} ends at {prev_end}",
                    next.sentence_id, prev.sentence_id
                )
            })
        })
        .collect()
}

/// Immutable in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    chapters: BTreeMap<i64, Chapter>,
    sentences: Vec<Sentence>,
}

impl MemoryStore {
    pub fn new(chapters: Vec<Chapter>, mut sentences: Vec<Sentence>) -> Result<Self, BardError> {
        let mut seen = HashSet::with_capacity(sentences.len());
        for sentence in &sentences {
            check_sentence(sentence)?;
            if !seen.insert(sentence.sentence_id) {
                return Err(BardError::InvalidSentenceRow {
                    sentence_id: sentence.sentence_id,
                    reason: "duplicate sentence_id".to_string(),
                });
            }
        }

        sentences.sort_by_key(|s| (s.chapter_id, s.sequence));
        for chapter in sentences.chunk_by(|a, b| a.chapter_id == b.chapter_id) {
            check_monotonic(chapter[0].chapter_id, chapter)?;
        }
        let chapters = chapters.into_iter().map(|c| (c.chapter_id, c)).collect();
        Ok(Self {
            chapters,
            sentences,
        })
    }

    pub fn from_prepared(prepared: &PreparedText) -> Result<Self, BardError> {
        let chapters = prepared.chapters.iter().map(|c| c.chapter()).collect();
        let sentences = prepared
            .chapters
            .iter()
            .flat_map(|c| c.sentences.iter().cloned())
            .collect();
        Self::new(chapters, sentences)
    }
}

#[async_trait]
impl SentenceStore for MemoryStore {
    async fn sentence(&self, sentence_id: i64) -> Result<Option<Sentence>> {
        Ok(self
            .sentences
            .iter()
            .find(|s| s.sentence_id == sentence_id)
            .cloned())
    }

    async fn chapter(&self, chapter_id: i64) -> Result<Option<Chapter>> {
        Ok(self.chapters.get(&chapter_id).cloned())
    }

    async fn chapter_sentences(&self, chapter_id: i64) -> Result<Vec<Sentence>> {
        Ok(self
            .sentences
            .iter()
            .filter(|s| s.chapter_id == chapter_id)
            .cloned()
            .collect())
    }

    async fn sentences_up_to(&self, sentence_id: i64) -> Result<Vec<Sentence>> {
        Ok(self
            .sentences
            .iter()
            .filter(|s| s.sentence_id <= sentence_id)
            .cloned()
            .collect())
    }

    async fn list_chapters(&self) -> Result<Vec<ChapterInfo>> {
        Ok(self
            .chapters
            .values()
            .map(|chapter| ChapterInfo {
                chapter_id: chapter.chapter_id,
                title: chapter.title.clone(),
                duration_seconds: chapter.duration_seconds,
                sentence_count: self
                    .sentences
                    .iter()
                    .filter(|s| s.chapter_id == chapter.chapter_id)
                    .count() as i64,
            })
            .collect())
    }
}

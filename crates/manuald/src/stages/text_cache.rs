//! Stage 2: keyword search over the cached plain-text extraction.
//!
//! The text is split into passages on blank lines. Page markers left by the
//! extractor (`[Page 12]`, `--- Page 12 ---`, form feeds) are tracked so a
//! hit can point back at a page.

use async_trait::async_trait;
use manual_shared::Step;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use super::{Candidate, RetrievalStage, StageContext, StageOutcome, REGENERATE_HINT};
use crate::error::StageError;
use crate::generator::{is_no_answer, Generator, Prompt, Purpose, NO_ANSWER};
use crate::manuals::ManualStore;
use crate::text::{keyword_score, keyword_set};

const SYSTEM_PROMPT: &str = "You answer questions about a product using only the manual \
excerpts provided. Be concise and practical. If the excerpts do not contain the answer, \
reply with exactly NO_ANSWER.";

/// Passages scoring below this share of the question's keywords are ignored.
const MIN_PASSAGE_SCORE: f32 = 0.34;

fn page_marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| {
            Regex::new(r"(?i)^\s*(?:\[page\s+(\d+)\]|-{2,}\s*page\s+(\d+)\s*-{2,})\s*$").ok()
        })
        .as_ref()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub page: Option<u32>,
    pub text: String,
}

fn flush(current: &mut Vec<&str>, page: Option<u32>, out: &mut Vec<Passage>) {
    if !current.is_empty() {
        out.push(Passage {
            page,
            text: current.join("\n"),
        });
        current.clear();
    }
}

/// Split cached text into passages, carrying the current page number.
pub fn split_passages(text: &str) -> Vec<Passage> {
    let mut passages = Vec::new();
    let mut page: Option<u32> = None;
    let mut current: Vec<&str> = Vec::new();

    for raw in text.lines() {
        let mut line = raw;
        if let Some(stripped) = line.strip_prefix('\u{c}') {
            flush(&mut current, page, &mut passages);
            page = Some(page.map_or(2, |p| p + 1));
            line = stripped;
        }
        if let Some(caps) = page_marker().and_then(|re| re.captures(line)) {
            flush(&mut current, page, &mut passages);
            page = caps
                .get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse().ok());
            continue;
        }
        if line.trim().is_empty() {
            flush(&mut current, page, &mut passages);
        } else {
            current.push(line.trim_end());
        }
    }
    flush(&mut current, page, &mut passages);
    passages
}

pub struct TextCacheStage {
    store: Arc<dyn ManualStore>,
    generator: Arc<dyn Generator>,
    max_passages: usize,
    timeout: Duration,
}

impl TextCacheStage {
    pub fn new(
        store: Arc<dyn ManualStore>,
        generator: Arc<dyn Generator>,
        max_passages: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            generator,
            max_passages: max_passages.max(1),
            timeout,
        }
    }

    /// Best passages for `question`, highest score first.
    fn rank(&self, question: &str, text: &str) -> Vec<(f32, Passage)> {
        let query = keyword_set(question);
        let mut ranked: Vec<(f32, Passage)> = split_passages(text)
            .into_iter()
            .map(|p| (keyword_score(&query, &p.text), p))
            .filter(|(score, _)| *score >= MIN_PASSAGE_SCORE)
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked.truncate(self.max_passages);
        ranked
    }
}

#[async_trait]
impl RetrievalStage for TextCacheStage {
    fn step(&self) -> Step {
        Step::TextCache
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let Some(text) = self.store.cached_text(&ctx.product_id).await? else {
            debug!("No cached text for {}", ctx.product_id);
            return Ok(StageOutcome::Miss);
        };

        let ranked = self.rank(&ctx.question, &text);
        if ranked.is_empty() {
            return Ok(StageOutcome::Miss);
        }

        let evidence = ranked
            .iter()
            .enumerate()
            .map(|(i, (_, p))| match p.page {
                Some(page) => format!("[Excerpt {} - page {}]\n{}", i + 1, page, p.text),
                None => format!("[Excerpt {}]\n{}", i + 1, p.text),
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = if ctx.regenerate {
            format!("{} {}", SYSTEM_PROMPT, REGENERATE_HINT)
        } else {
            SYSTEM_PROMPT.to_string()
        };
        let prompt = Prompt::new(
            Purpose::TextCacheAnswer,
            system,
            format!("Manual excerpts:\n{}\n\nQuestion: {}", evidence, ctx.question),
        );

        let reply = self.generator.generate(&prompt).await?;
        if is_no_answer(&reply) {
            debug!("Generator returned {} for cached text", NO_ANSWER);
            return Ok(StageOutcome::Miss);
        }

        let reference = ranked[0].1.page.map(|page| format!("p. {}", page));
        Ok(StageOutcome::Hit(Candidate {
            answer: reply.trim().to_string(),
            reference,
            evidence,
        }))
    }
}

//! Content normalization applied to each file before it is staged.
//!
//! A normalizer is a pure function of the raw text. The default
//! [`MarkdownNormalizer`] is idempotent: `normalize(normalize(x)) == normalize(x)`.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Convert CRLF line endings to LF.
    pub normalize_line_endings: bool,
    pub trim_trailing_whitespace: bool,
    /// Keep a two-space Markdown hard break when trimming.
    pub preserve_hard_breaks: bool,
    /// End non-empty files with exactly one newline.
    pub ensure_trailing_newline: bool,
    /// Require a `---` front-matter block to be closed.
    pub validate_front_matter: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            normalize_line_endings: true,
            trim_trailing_whitespace: true,
            preserve_hard_breaks: true,
            ensure_trailing_newline: true,
            validate_front_matter: true,
        }
    }
}

/// Result of normalizing one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOutcome {
    pub content: String,
    /// True when `content` differs from the input.
    pub modified: bool,
    /// Problems that make the file unfit to commit.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl NormalizeOutcome {
    pub fn unchanged(raw: &str) -> Self {
        Self {
            content: raw.to_string(),
            ..Self::default()
        }
    }
}

/// Pure content transformation used by the batch processor.
pub trait ContentNormalizer: Send + Sync {
    fn normalize(&self, raw: &str, path: &Path, options: &NormalizeOptions)
        -> Result<NormalizeOutcome>;
}

const TRAILING_WS: &str = r"[ \t]+$";
const FENCE_CLOSE: &str = r"(?m)^(---|\.\.\.)[ \t]*$";

/// Default normalizer for Markdown notes.
#[derive(Debug, Clone)]
pub struct MarkdownNormalizer {
    trailing_ws: Regex,
    fence_close: Regex,
}

impl MarkdownNormalizer {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| SyncError::InvalidConfig(format!("normalizer pattern: {e}")))
        };
        Ok(Self {
            trailing_ws: compile(TRAILING_WS)?,
            fence_close: compile(FENCE_CLOSE)?,
        })
    }

    fn trim_line<'a>(&self, line: &'a str, options: &NormalizeOptions) -> std::borrow::Cow<'a, str> {
        let Some(m) = self.trailing_ws.find(line) else {
            return line.into();
        };
        let body = &line[..m.start()];
        let tail = m.as_str();
        let hard_break = options.preserve_hard_breaks
            && !body.trim().is_empty()
            && tail.len() >= 2
            && tail.bytes().all(|b| b == b' ');
        if hard_break {
            format!("{body}  ").into()
        } else {
            body.into()
        }
    }

    fn check_front_matter(&self, text: &str, errors: &mut Vec<String>) {
        let Some(rest) = text.strip_prefix("---\n") else {
            return;
        };
        if self.fence_close.find(rest).is_none() {
            errors.push("front matter opened with '---' is never closed".to_string());
        }
    }
}

impl ContentNormalizer for MarkdownNormalizer {
    fn normalize(
        &self,
        raw: &str,
        _path: &Path,
        options: &NormalizeOptions,
    ) -> Result<NormalizeOutcome> {
        let mut text = if options.normalize_line_endings {
            raw.replace("\r\n", "\n")
        } else {
            raw.to_string()
        };

        if options.trim_trailing_whitespace {
            text = text
                .split('\n')
                .map(|line| self.trim_line(line, options))
                .collect::<Vec<_>>()
                .join("\n");
        }

        if options.ensure_trailing_newline {
            let body = text.trim_end_matches(['\n', '\r']);
            text = if body.is_empty() {
                String::new()
            } else {
                format!("{body}\n")
            };
        }

        let mut outcome = NormalizeOutcome {
            modified: text != raw,
            content: text,
            ..NormalizeOutcome::default()
        };
        if options.validate_front_matter {
            self.check_front_matter(&outcome.content, &mut outcome.errors);
        }
        if outcome.content.is_empty() {
            outcome.warnings.push("file is empty".to_string());
        }
        Ok(outcome)
    }
}

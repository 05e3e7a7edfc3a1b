//! Markdown chapter splitter.
//!
//! A chapter starts at every level-1 or level-2 ATX heading. Headings inside
//! fenced code blocks are ignored. Chapters over the size limit are cut on
//! paragraph boundaries so each LLM request stays bounded.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s{0,3}#{1,2}\s+(.+?)\s*#*\s*$").expect("heading pattern is valid")
});

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph pattern is valid"));

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub body: String,
}

impl Chapter {
    fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Split a markdown document into chapters of at most `max_chars` characters.
pub fn split_chapters(markdown: &str, max_chars: usize) -> Vec<Chapter> {
    let max_chars = max_chars.max(1);
    let mut sections: Vec<(Option<String>, String)> = vec![(None, String::new())];
    let mut in_fence = false;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some(caps) = HEADING.captures(line) {
                sections.push((Some(caps[1].to_string()), String::new()));
                continue;
            }
        }
        if let Some((_, body)) = sections.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }

    let has_headings = sections.len() > 1;
    let mut chapters = Vec::new();
    for (title, body) in sections {
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        let title = match title {
            Some(title) => title,
            None if has_headings => "Introduction".to_string(),
            None => "Document".to_string(),
        };
        chapters.extend(split_oversized(&title, body, max_chars));
    }
    dedupe_titles(&mut chapters);
    chapters
}

/// Questions are stored per chapter title, so repeated headings get a suffix.
fn dedupe_titles(chapters: &mut [Chapter]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for chapter in chapters.iter_mut() {
        let count = seen.entry(chapter.title.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            chapter.title = format!("{} ({})", chapter.title, count);
        }
    }
}

fn split_oversized(title: &str, body: &str, max_chars: usize) -> Vec<Chapter> {
    if body.chars().count() <= max_chars {
        return vec![Chapter::new(title, body)];
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in PARAGRAPH_BREAK.split(body) {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        let len = paragraph.chars().count();

        if len > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            parts.extend(hard_split(paragraph, max_chars));
            continue;
        }

        // Joining adds a blank line between paragraphs.
        let joined_len = if current.is_empty() { len } else { current_len + 2 + len };
        if joined_len > max_chars {
            parts.push(std::mem::take(&mut current));
            current.push_str(paragraph);
            current_len = len;
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            current_len = joined_len;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    if parts.len() == 1 {
        return vec![Chapter::new(title, parts.remove(0))];
    }
    parts
        .into_iter()
        .enumerate()
        .map(|(i, body)| Chapter::new(format!("{title} (part {})", i + 1), body))
        .collect()
}

/// Cut a single paragraph that alone exceeds the limit.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::diff::similarity::LexicalSimilarity;

static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[ \t]*-{2,}[ \t]*page[ \t]+(\d+)[ \t]*-{2,}[ \t]*$").unwrap());

/// Shortest excerpt worth locating; anything shorter matches too loosely.
const MIN_EXCERPT_CHARS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// Page-segmented policy text.
///
/// Pages are split on form feeds, or on `--- Page N ---` marker lines;
/// unmarked text is a single page.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pages: Vec<Page>,
    source_hash: String,
    char_count: usize,
    tokens: BTreeSet<String>,
}

/// First 16 hex characters of the SHA-256 of the text.
pub fn source_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn split_pages(text: &str) -> Vec<Page> {
    if text.contains('\u{c}') {
        return text
            .split('\u{c}')
            .enumerate()
            .filter(|(_, body)| !body.trim().is_empty())
            .map(|(index, body)| Page {
                number: u32::try_from(index + 1).unwrap_or(u32::MAX),
                text: body.trim().to_string(),
            })
            .collect();
    }

    let markers: Vec<(u32, usize, usize)> = PAGE_MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps[1].parse().ok()?;
            Some((number, whole.start(), whole.end()))
        })
        .collect();

    if markers.is_empty() {
        return vec![Page {
            number: 1,
            text: text.trim().to_string(),
        }];
    }

    let preamble = text[..markers[0].1].trim();
    let mut pages = Vec::with_capacity(markers.len());
    for (index, (number, _, body_start)) in markers.iter().enumerate() {
        let body_end = markers.get(index + 1).map(|m| m.1).unwrap_or(text.len());
        let mut body = text[*body_start..body_end].trim().to_string();
        if index == 0 && !preamble.is_empty() {
            body = format!("{preamble}\n{body}");
        }
        pages.push(Page {
            number: *number,
            text: body,
        });
    }
    pages
}

impl PolicyDocument {
    pub fn parse(text: &str) -> Self {
        let pages = split_pages(text);
        let tokens = pages
            .iter()
            .flat_map(|p| LexicalSimilarity::tokens(&p.text))
            .collect();
        Self {
            pages,
            source_hash: source_hash(text),
            char_count: text.trim().chars().count(),
            tokens,
        }
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn has_page(&self, number: u32) -> bool {
        self.pages.iter().any(|p| p.number == number)
    }

    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn char_count(&self) -> usize {
        self.char_count
    }

    /// Text with explicit page markers, so providers can cite pages.
    pub fn render_for_prompt(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("--- Page {} ---\n{}", p.number, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Page containing the excerpt, compared case- and whitespace-insensitively.
    pub fn locate(&self, excerpt: &str) -> Option<u32> {
        let needle = normalize(excerpt.trim().trim_matches(|c: char| c == '"' || c == '.' || c == '…'));
        if needle.chars().count() < MIN_EXCERPT_CHARS {
            return None;
        }
        self.pages
            .iter()
            .find(|p| normalize(&p.text).contains(&needle))
            .map(|p| p.number)
    }

    /// Share of the text's tokens that occur anywhere in the document.
    pub fn grounding_ratio(&self, text: &str) -> f64 {
        let tokens = LexicalSimilarity::tokens(text);
        if tokens.is_empty() {
            return 0.0;
        }
        let found = tokens.iter().filter(|t| self.tokens.contains(*t)).count();
        found as f64 / tokens.len() as f64
    }
}

//! Instrument reference catalog
//!
//! Name/code pairs loaded once per process and shared read-only. Resolution
//! prefers exact name/code hits, then falls back to bigram similarity with a
//! fixed acceptance threshold; below it the caller proceeds without an
//! instrument context.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Minimum similarity score for a fuzzy hit.
pub const SIMILARITY_THRESHOLD: f64 = 0.60;

/// Built-in listing used when no catalog file is configured or loading it
/// fails. Codes are six-digit KRX tickers.
const FALLBACK_LISTING: &[(&str, &str)] = &[
    ("삼성전자", "005930"),
    ("SK하이닉스", "000660"),
    ("LG에너지솔루션", "373220"),
    ("삼성바이오로직스", "207940"),
    ("현대차", "005380"),
    ("기아", "000270"),
    ("셀트리온", "068270"),
    ("NAVER", "035420"),
    ("카카오", "035720"),
    ("POSCO홀딩스", "005490"),
    ("KB금융", "105560"),
    ("신한지주", "055550"),
    ("삼성SDI", "006400"),
    ("LG화학", "051910"),
    ("LG전자", "066570"),
    ("한화에어로스페이스", "012450"),
    ("두산에너빌리티", "034020"),
    ("크래프톤", "259960"),
    ("하이브", "352820"),
    ("SK이노베이션", "096770"),
];

lazy_static! {
    static ref FALLBACK_ENTRIES: Vec<InstrumentEntry> = FALLBACK_LISTING
        .iter()
        .map(|(name, code)| InstrumentEntry {
            name: name.to_string(),
            code: code.to_string(),
        })
        .collect();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentEntry {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstrument {
    pub name: String,
    pub code: String,
    pub score: f64,
}

pub struct InstrumentCatalog {
    entries: Vec<InstrumentEntry>,
    by_name: HashMap<String, usize>,
    by_code: HashMap<String, usize>,
}

impl InstrumentCatalog {
    pub fn from_entries(entries: Vec<InstrumentEntry>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_code = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_name.insert(normalize(&entry.name), idx);
            by_code.insert(entry.code.clone(), idx);
        }
        Self {
            entries,
            by_name,
            by_code,
        }
    }

    /// Load a JSON catalog file (array of `{name, code}`); on any failure
    /// fall back to the built-in listing.
    pub fn load_or_fallback(path: Option<&str>) -> Self {
        if let Some(path) = path {
            match std::fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<Vec<InstrumentEntry>>(&raw).map_err(|e| e.to_string())
                }) {
                Ok(entries) if !entries.is_empty() => {
                    info!(count = entries.len(), path = %path, "instrument catalog loaded");
                    return Self::from_entries(entries);
                }
                Ok(_) => warn!(path = %path, "catalog file is empty, using fallback listing"),
                Err(e) => warn!(path = %path, error = %e, "catalog load failed, using fallback listing"),
            }
        }
        Self::from_entries(FALLBACK_ENTRIES.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a free-text mention to a catalog entry. Exact name or code
    /// match wins with score 1.0; otherwise the best bigram-similarity
    /// candidate is accepted iff it clears `SIMILARITY_THRESHOLD`.
    pub fn resolve(&self, mention: &str) -> Option<ResolvedInstrument> {
        let trimmed = mention.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(&idx) = self.by_code.get(trimmed) {
            let entry = &self.entries[idx];
            return Some(ResolvedInstrument {
                name: entry.name.clone(),
                code: entry.code.clone(),
                score: 1.0,
            });
        }

        let needle = normalize(trimmed);
        if let Some(&idx) = self.by_name.get(&needle) {
            let entry = &self.entries[idx];
            return Some(ResolvedInstrument {
                name: entry.name.clone(),
                code: entry.code.clone(),
                score: 1.0,
            });
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let score = similarity(&needle, &normalize(&entry.name));
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        match best {
            Some((idx, score)) if score >= SIMILARITY_THRESHOLD => {
                let entry = &self.entries[idx];
                Some(ResolvedInstrument {
                    name: entry.name.clone(),
                    code: entry.code.clone(),
                    score,
                })
            }
            _ => None,
        }
    }
}

/// Six ASCII digits, the only code shape the brokerage accepts.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| c.is_ascii_digit())
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Sørensen-Dice coefficient over character bigrams. Strings too short for
/// bigrams compare by equality.
fn similarity(a: &str, b: &str) -> f64 {
    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return if a == b { 1.0 } else { 0.0 };
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for gram in &a_grams {
        *counts.entry(*gram).or_insert(0) += 1;
    }

    let mut overlap = 0usize;
    for gram in &b_grams {
        if let Some(count) = counts.get_mut(gram) {
            if *count > 0 {
                *count -= 1;
                overlap += 1;
            }
        }
    }

    (2.0 * overlap as f64) / (a_grams.len() + b_grams.len()) as f64
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> InstrumentCatalog {
        InstrumentCatalog::load_or_fallback(None)
    }

    #[test]
    fn exact_name_match_wins() {
        let resolved = catalog().resolve("삼성전자").unwrap();
        assert_eq!(resolved.code, "005930");
        assert_eq!(resolved.score, 1.0);
    }

    #[test]
    fn exact_match_ignores_case_and_whitespace() {
        let resolved = catalog().resolve(" naver ").unwrap();
        assert_eq!(resolved.code, "035420");
        assert_eq!(resolved.score, 1.0);
    }

    #[test]
    fn code_mention_resolves_directly() {
        let resolved = catalog().resolve("005930").unwrap();
        assert_eq!(resolved.name, "삼성전자");
        assert_eq!(resolved.score, 1.0);
    }

    #[test]
    fn near_miss_resolves_above_threshold() {
        // One substituted character still shares two of three bigrams.
        let resolved = catalog().resolve("샘성전자").unwrap();
        assert_eq!(resolved.code, "005930");
        assert!(resolved.score >= SIMILARITY_THRESHOLD);
        assert!(resolved.score < 1.0);
    }

    #[test]
    fn unrelated_text_stays_unresolved() {
        assert!(catalog().resolve("오늘 서울 날씨 알려줘").is_none());
        assert!(catalog().resolve("").is_none());
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = normalize("삼성전자");
        let b = normalize("샘성전자");
        let ab = similarity(&a, &b);
        let ba = similarity(&b, &a);
        assert!((ab - ba).abs() < f64::EPSILON);
        assert!(ab > 0.0 && ab < 1.0);
        assert_eq!(similarity(&a, &a), 1.0);
    }

    #[test]
    fn code_shape_validation() {
        assert!(is_valid_code("005930"));
        assert!(!is_valid_code("5930"));
        assert!(!is_valid_code("00593A"));
        assert!(!is_valid_code("0059300"));
    }

    #[test]
    fn missing_catalog_file_falls_back() {
        let catalog = InstrumentCatalog::load_or_fallback(Some("/nonexistent/listing.json"));
        assert!(!catalog.is_empty());
        assert!(catalog.resolve("카카오").is_some());
    }
}

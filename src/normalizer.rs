//! Turns a raw marketplace product title into a short grouping key such as
//! `"A25 black"` or `"12 blue"`.

/// Model used when no pattern matches.
pub const UNKNOWN_MODEL: &str = "UNKNOWN";

/// Tokens dropped before model detection: product kind, brands, memory and
/// network markers.
const NOISE_TOKENS: &[&str] = &[
    "смартфон", "телефон", "samsung", "galaxy", "redmi", "xiaomi", "poco", "iphone", "apple",
    "gb", "гб", "tb", "тб", "5g", "4g", "lte", "nfc", "dual", "sim",
];

/// Controlled color vocabulary; every synonym maps to one canonical name.
const COLOR_VOCABULARY: &[(&str, &str)] = &[
    ("black", "black"),
    ("чер", "black"),
    ("черн", "black"),
    ("черный", "black"),
    ("чёрный", "black"),
    ("черная", "black"),
    ("чёрная", "black"),
    ("blue", "blue"),
    ("син", "blue"),
    ("синий", "blue"),
    ("синяя", "blue"),
    ("white", "white"),
    ("бел", "white"),
    ("белый", "white"),
    ("белая", "white"),
    ("green", "green"),
    ("зел", "green"),
    ("зеленый", "green"),
    ("зелёный", "green"),
    ("зеленая", "green"),
    ("purple", "purple"),
    ("violet", "purple"),
    ("фиол", "purple"),
    ("фиолетовый", "purple"),
    ("фиолетовая", "purple"),
    ("grey", "grey"),
    ("gray", "grey"),
    ("сер", "grey"),
    ("серый", "grey"),
    ("серая", "grey"),
    ("yellow", "yellow"),
    ("жел", "yellow"),
    ("желтый", "yellow"),
    ("жёлтый", "yellow"),
    ("red", "red"),
    ("красный", "red"),
    ("pink", "pink"),
    ("роз", "pink"),
    ("розовый", "pink"),
    ("розовая", "pink"),
];

/// How many trailing tokens are searched for a color.
const COLOR_WINDOW: usize = 5;

/// Model patterns, most specific first. The first pattern that matches any
/// token wins.
#[derive(Debug, Clone, Copy)]
enum ModelPattern {
    /// `a15c`: series letter, two digits, trailing revision letter.
    SeriesRevision,
    /// `a25`, `c85`, `s24`, `m35`.
    SeriesCode,
    /// `note 13` or `note13`; the model is the number.
    Note,
    /// `12`, `13`: bare two-digit generation numbers.
    TwoDigits,
}

const MODEL_PATTERNS: [ModelPattern; 4] = [
    ModelPattern::SeriesRevision,
    ModelPattern::SeriesCode,
    ModelPattern::Note,
    ModelPattern::TwoDigits,
];

impl ModelPattern {
    fn matches(self, tokens: &[&str], idx: usize) -> Option<String> {
        let token = tokens[idx];
        match self {
            ModelPattern::SeriesRevision => {
                let chars: Vec<char> = token.chars().collect();
                (chars.len() == 4
                    && chars[0] == 'a'
                    && chars[1].is_ascii_digit()
                    && chars[2].is_ascii_digit()
                    && chars[3] == 'c')
                    .then(|| token.to_uppercase())
            }
            ModelPattern::SeriesCode => {
                let chars: Vec<char> = token.chars().collect();
                (chars.len() == 3
                    && matches!(chars[0], 'a' | 'c' | 's' | 'm')
                    && chars[1].is_ascii_digit()
                    && chars[2].is_ascii_digit())
                    .then(|| token.to_uppercase())
            }
            ModelPattern::Note => {
                if token == "note" {
                    tokens
                        .get(idx + 1)
                        .filter(|next| is_number(next))
                        .map(|next| next.to_string())
                } else {
                    token
                        .strip_prefix("note")
                        .filter(|rest| is_number(rest))
                        .map(str::to_string)
                }
            }
            ModelPattern::TwoDigits => {
                (token.len() == 2 && is_number(token)).then(|| token.to_string())
            }
        }
    }
}

fn is_number(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// Lowercases, turns punctuation into separators and splits on whitespace.
fn tokenize(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn extract_model(tokens: &[String]) -> Option<String> {
    let meaningful: Vec<&str> = tokens
        .iter()
        .map(String::as_str)
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect();
    MODEL_PATTERNS.iter().find_map(|pattern| {
        (0..meaningful.len()).find_map(|idx| pattern.matches(&meaningful, idx))
    })
}

fn extract_color(tokens: &[String]) -> Option<&'static str> {
    tokens
        .iter()
        .rev()
        .take(COLOR_WINDOW)
        .find_map(|token| canonical_color(token))
}

/// Canonical color name for a single word, if it belongs to the vocabulary.
pub fn canonical_color(word: &str) -> Option<&'static str> {
    let word = word.trim().trim_end_matches('.').to_lowercase();
    COLOR_VOCABULARY
        .iter()
        .find(|(synonym, _)| *synonym == word)
        .map(|(_, canonical)| *canonical)
}

/// Normalized grouping key for `raw_title`.
pub fn normalize(raw_title: &str) -> String {
    let tokens = tokenize(raw_title);
    let model = extract_model(&tokens).unwrap_or_else(|| UNKNOWN_MODEL.to_string());
    match extract_color(&tokens) {
        Some(color) => format!("{model} {color}"),
        None => model,
    }
}

/// Whether a normalized key carries a recognised model.
pub fn has_known_model(key: &str) -> bool {
    key.split_whitespace().next() != Some(UNKNOWN_MODEL)
}

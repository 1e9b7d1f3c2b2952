/// Text to score in [-1, 1]. Implementations must be pure and cheap to call concurrently.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> f64;
}

impl<F> SentimentScorer for F
where
    F: Fn(&str) -> f64 + Send + Sync,
{
    fn score(&self, text: &str) -> f64 {
        self(text)
    }
}

const BULLISH: &[(&str, i32)] = &[
    ("bull", 2),
    ("bullish", 2),
    ("calls", 1),
    ("long", 1),
    ("buy", 1),
    ("buying", 1),
    ("moon", 2),
    ("rocket", 2),
    ("undervalued", 2),
    ("beat", 1),
    ("beats", 1),
    ("upgrade", 2),
    ("rally", 1),
    ("breakout", 1),
    ("strong", 1),
    ("green", 1),
    ("gains", 1),
    ("tendies", 2),
];

const BEARISH: &[(&str, i32)] = &[
    ("bear", 2),
    ("bearish", 2),
    ("puts", 1),
    ("short", 1),
    ("sell", 1),
    ("selling", 1),
    ("dump", 2),
    ("crash", 2),
    ("overvalued", 2),
    ("miss", 1),
    ("misses", 1),
    ("downgrade", 2),
    ("bagholder", 2),
    ("bagholding", 2),
    ("weak", 1),
    ("red", 1),
    ("losses", 1),
    ("drilling", 2),
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "isnt", "wasnt", "arent", "wont", "cant", "cannot", "without", "dont",
];

// Raw lexicon totals at or beyond this magnitude map to +/-1.
const SATURATION: f64 = 4.0;

/// Deterministic lexicon scorer for retail-trading slang.
///
/// A negator within the three preceding tokens flips a word's polarity.
#[derive(Debug, Clone, Default)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }

    fn word_score(word: &str) -> i32 {
        BULLISH
            .iter()
            .find(|(w, _)| *w == word)
            .map(|(_, s)| *s)
            .or_else(|| BEARISH.iter().find(|(w, _)| *w == word).map(|(_, s)| -*s))
            .unwrap_or(0)
    }
}

impl SentimentScorer for LexiconScorer {
    fn score(&self, text: &str) -> f64 {
        let tokens: Vec<String> = tokenize(text).collect();
        let total = saturating_total(tokens.iter().enumerate().map(|(i, tok)| {
            let base = Self::word_score(tok);
            let negated = (1..=3).any(|k| i >= k && NEGATORS.contains(&tokens[i - k].as_str()));
            if negated {
                -base
            } else {
                base
            }
        }));
        (f64::from(total) / SATURATION).clamp(-1.0, 1.0)
    }
}

fn saturating_total(scores: impl IntoIterator<Item = i32>) -> i32 {
    scores.into_iter().fold(0i32, i32::saturating_add)
}

fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.replace('\'', "").to_ascii_lowercase())
        .filter(|t| !t.is_empty())
}

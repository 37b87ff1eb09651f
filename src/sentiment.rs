//! Lexicon-based sentiment scoring of generated text.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::model::{Sentiment, SentimentLabel};

const LABEL_THRESHOLD: f64 = 0.1;
const NORMALIZER: f64 = 10.0;

pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> Sentiment;
}

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z']+").expect("valid word regex"));

// Reduced subset of the AFINN-165 list (about 120 of its ~2,500 words). Words
// outside it score 0, so sums run lower than with the full list.
static VALENCE: Lazy<HashMap<&'static str, i32>> = Lazy::new(|| {
    [
        ("amazing", 4), ("awesome", 4), ("beautiful", 3), ("best", 3), ("better", 2),
        ("bright", 1), ("brilliant", 4), ("calm", 2), ("celebrate", 3), ("charming", 3),
        ("clean", 2), ("comfortable", 2), ("confident", 2), ("cool", 1), ("delight", 3),
        ("delightful", 3), ("easy", 1), ("effective", 2), ("elegant", 2), ("enjoy", 2),
        ("excellent", 3), ("exciting", 3), ("fantastic", 4), ("fascinating", 3), ("fine", 2),
        ("fresh", 1), ("fun", 4), ("glad", 3), ("good", 3), ("great", 3), ("happy", 3),
        ("helpful", 2), ("hope", 2), ("ideal", 2), ("impressive", 3), ("incredible", 4),
        ("innovative", 2), ("inspiring", 3), ("joy", 3), ("like", 2), ("love", 3),
        ("lovely", 3), ("nice", 3), ("perfect", 3), ("pleasant", 3), ("popular", 3),
        ("positive", 2), ("powerful", 2), ("reliable", 2), ("remarkable", 2), ("safe", 1),
        ("smart", 1), ("success", 2), ("successful", 3), ("superb", 5), ("support", 2),
        ("thrilled", 5), ("thrilling", 5), ("top", 2), ("trust", 1), ("unique", 2),
        ("valuable", 2), ("vibrant", 3), ("win", 4), ("wonderful", 4), ("wow", 4),
        ("abandon", -2), ("afraid", -2), ("angry", -3), ("annoying", -2), ("anxious", -2),
        ("awful", -3), ("bad", -3), ("boring", -3), ("broken", -1), ("cheap", -2),
        ("crash", -2), ("crisis", -3), ("danger", -2), ("dangerous", -2), ("dead", -3),
        ("difficult", -1), ("disappointed", -2), ("disappointing", -2), ("disaster", -2),
        ("dull", -2), ("fail", -2), ("failure", -2), ("fear", -2), ("hard", -1),
        ("hate", -3), ("horrible", -3), ("hurt", -2), ("lonely", -2), ("lose", -3),
        ("loss", -3), ("poor", -2), ("problem", -2), ("risk", -2), ("sad", -2),
        ("scary", -2), ("terrible", -3), ("threat", -2), ("tragic", -2), ("ugly", -3),
        ("unfortunately", -2), ("unhappy", -2), ("useless", -2), ("waste", -1), ("weak", -2),
        ("worry", -3), ("worse", -3), ("worst", -3), ("wrong", -2),
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconSentiment;

impl LexiconSentiment {
    fn raw_score(text: &str) -> i32 {
        let lower = text.to_lowercase();
        WORD.find_iter(&lower)
            .filter_map(|m| VALENCE.get(m.as_str().trim_matches('\'')))
            .sum()
    }
}

impl SentimentScorer for LexiconSentiment {
    fn score(&self, text: &str) -> Sentiment {
        if text.trim().is_empty() {
            return Sentiment::neutral();
        }
        let score = (f64::from(Self::raw_score(text)) / NORMALIZER).clamp(-1.0, 1.0);
        let label = if score > LABEL_THRESHOLD {
            SentimentLabel::Positive
        } else if score < -LABEL_THRESHOLD {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };
        Sentiment { score, label }
    }
}

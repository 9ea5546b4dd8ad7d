//! Keyword sentiment classification
//!
//! Counts case-insensitive, non-overlapping occurrences of "bullish" and
//! "bearish" in free text and compares them to thresholds. Bullish is checked
//! first, so it wins when both thresholds are met.

use serde::{Deserialize, Serialize};

use crate::types::Classification;

const BULLISH: &str = "bullish";
const BEARISH: &str = "bearish";

/// Minimum keyword counts for a directional classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub bullish: usize,
    pub bearish: usize,
}

impl Default for Thresholds {
    /// Alerting thresholds used by the sentiment monitor
    fn default() -> Self {
        Self {
            bullish: 7,
            bearish: 3,
        }
    }
}

impl Thresholds {
    /// A single mention is enough (decision pipelines)
    pub fn any_mention() -> Self {
        Self {
            bullish: 1,
            bearish: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Assessment {
    pub classification: Classification,
    pub bullish_mentions: usize,
    pub bearish_mentions: usize,
}

impl Assessment {
    /// Share of the dominant keyword among all mentions; 0.5 when neutral or silent
    pub fn confidence(&self) -> f64 {
        let total = self.bullish_mentions + self.bearish_mentions;
        let dominant = match self.classification {
            Classification::Bullish => self.bullish_mentions,
            Classification::Bearish => self.bearish_mentions,
            _ => return 0.5,
        };
        if total == 0 {
            return 0.5;
        }
        dominant as f64 / total as f64
    }
}

/// Replaceable text classification policy
pub trait Classifier: Send + Sync {
    fn assess(&self, text: &str) -> Assessment;

    fn classify(&self, text: &str) -> Classification {
        self.assess(text).classification
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier {
    pub thresholds: Thresholds,
}

impl KeywordClassifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }
}

impl Classifier for KeywordClassifier {
    fn assess(&self, text: &str) -> Assessment {
        let lower = text.to_lowercase();
        let bullish_mentions = lower.matches(BULLISH).count();
        let bearish_mentions = lower.matches(BEARISH).count();
        let classification = decide(bullish_mentions, bearish_mentions, &self.thresholds);
        Assessment {
            classification,
            bullish_mentions,
            bearish_mentions,
        }
    }
}

/// Classify `text` with the keyword policy
pub fn classify(text: &str, thresholds: &Thresholds) -> Classification {
    KeywordClassifier::new(*thresholds).classify(text)
}

fn decide(bullish: usize, bearish: usize, thresholds: &Thresholds) -> Classification {
    if bullish >= thresholds.bullish {
        Classification::Bullish
    } else if bearish >= thresholds.bearish {
        Classification::Bearish
    } else {
        Classification::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bullish_at_threshold() {
        let text = "bullish bullish bullish bullish bullish bullish bullish text";
        assert_eq!(classify(text, &Thresholds::default()), Classification::Bullish);
        assert_eq!(
            classify("BULLISH Bullish bullish", &Thresholds::any_mention()),
            Classification::Bullish
        );
    }

    #[test]
    fn test_bearish_at_threshold() {
        let text = "bearish bearish bearish";
        assert_eq!(classify(text, &Thresholds::default()), Classification::Bearish);
    }

    #[test]
    fn test_below_both_thresholds_is_neutral() {
        assert_eq!(classify("flat market", &Thresholds::default()), Classification::Neutral);
        let text = "bullish bullish bearish";
        assert_eq!(classify(text, &Thresholds::default()), Classification::Neutral);
    }

    #[test]
    fn test_bullish_wins_when_both_met() {
        let text = "bullish bearish";
        assert_eq!(classify(text, &Thresholds::any_mention()), Classification::Bullish);
    }

    #[test]
    fn test_counts_substrings_and_empty_text() {
        let a = KeywordClassifier::new(Thresholds::any_mention()).assess("ultra-bullishness; not bearish");
        assert_eq!(a.bullish_mentions, 1);
        assert_eq!(a.bearish_mentions, 1);
        assert_eq!(classify("", &Thresholds::any_mention()), Classification::Neutral);
    }

    #[test]
    fn test_confidence_is_dominant_share() {
        let a = KeywordClassifier::new(Thresholds::any_mention()).assess("bullish bullish bullish bearish");
        assert_eq!(a.classification, Classification::Bullish);
        assert!((a.confidence() - 0.75).abs() < 1e-9);

        let neutral = KeywordClassifier::default().assess("nothing to see");
        assert_eq!(neutral.confidence(), 0.5);
    }
}

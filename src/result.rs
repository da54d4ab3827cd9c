//! Recognition results.

use crate::dict::WordId;
use strum::Display;

/// Final status of one utterance. Every utterance yields exactly one
/// result carrying one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UtteranceStatus {
    /// Recognition succeeded.
    #[strum(serialize = "OK")]
    Ok,
    /// Search failed (empty beam, no surviving sentence).
    #[strum(serialize = "FAIL")]
    Fail,
    /// Input rejected by average power.
    #[strum(serialize = "REJECT_POWER")]
    RejectPower,
    /// Input shorter than the configured minimum.
    #[strum(serialize = "REJECT_SHORT")]
    RejectShort,
    /// Input longer than the configured maximum.
    #[strum(serialize = "REJECT_LONG")]
    RejectLong,
    /// Rejected by GMM utterance verification.
    #[strum(serialize = "REJECT_GMM")]
    RejectGmm,
    /// Nothing but silence was decoded.
    #[strum(serialize = "ONLY_SILENCE")]
    OnlySilence,
    /// Utterance aborted on request.
    #[strum(serialize = "TERMINATE")]
    Terminate,
}

/// One recognized word with its scores.
#[derive(Debug, Clone)]
pub struct WordResult {
    pub word: WordId,
    /// Output string from the dictionary.
    pub output: String,
    pub am_score: f32,
    pub lm_score: f32,
    /// Confidence measure, when pass 2 produced one.
    pub confidence: Option<f32>,
    /// Approximate last frame of the word.
    pub end_frame: Option<usize>,
}

/// One N-best sentence.
#[derive(Debug, Clone)]
pub struct SentenceResult {
    pub words: Vec<WordResult>,
    pub score: f32,
}

impl SentenceResult {
    /// Space-joined output strings, skipping empty ones.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.output.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The result of one utterance.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub status: UtteranceStatus,
    /// Ranked sentences, best first. Empty unless status is `Ok` or a
    /// pass-1 fallback was emitted.
    pub sentences: Vec<SentenceResult>,
    /// Number of feature frames processed.
    pub num_frames: usize,
}

impl RecognitionResult {
    pub fn rejected(status: UtteranceStatus, num_frames: usize) -> Self {
        Self {
            status,
            sentences: Vec::new(),
            num_frames,
        }
    }

    pub fn best_text(&self) -> Option<String> {
        self.sentences.first().map(|s| s.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_protocol() {
        assert_eq!(UtteranceStatus::Ok.to_string(), "OK");
        assert_eq!(UtteranceStatus::RejectPower.to_string(), "REJECT_POWER");
        assert_eq!(UtteranceStatus::OnlySilence.to_string(), "ONLY_SILENCE");
    }

    #[test]
    fn sentence_text_skips_silent_outputs() {
        let s = SentenceResult {
            words: vec![
                WordResult {
                    word: 0,
                    output: String::new(),
                    am_score: 0.0,
                    lm_score: 0.0,
                    confidence: None,
                    end_frame: None,
                },
                WordResult {
                    word: 1,
                    output: "hello".into(),
                    am_score: 0.0,
                    lm_score: 0.0,
                    confidence: None,
                    end_frame: None,
                },
            ],
            score: -1.0,
        };
        assert_eq!(s.text(), "hello");
    }
}

//! Decoder configuration.
//!
//! All tunable parameters of the engine live here, grouped by concern:
//! acoustic analysis (front end), search (both passes) and input rejection.
//! Every struct has conservative defaults and a `validate()` that is called
//! once when the engine is built, so the decoding hot path never re-checks.

use crate::error::{DecodeError, Result};
use strum::Display;

/// Base feature type produced by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FeatureType {
    /// Mel-frequency cepstral coefficients (DCT of log filterbank).
    Mfcc,
    /// Log mel filterbank energies, no DCT.
    Fbank,
    /// Linear mel filterbank energies (no log, no DCT).
    MelSpec,
}

/// Gaussian pruning method for mixture computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum GaussPruning {
    /// Exact top-N: prune only when the partial distance already proves the
    /// component cannot enter the current top-N.
    Safe,
    /// Like `Safe` but seeds the threshold from the previous component,
    /// trading exactness for speed.
    Heuristic,
    /// Fixed score-offset beam below the best component seen this frame.
    Beam,
    /// No pruning at all.
    None,
}

/// Scoring policy for context-dependent (pseudo) state sets at word
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IwcdPolicy {
    /// Maximum over the state set.
    Max,
    /// Average over the state set.
    Avg,
    /// Average of the best N states in the set.
    BestN(usize),
}

/// Semantics of trellis binary search when several entries share a word id
/// (word-pair approximation keeps one entry per predecessor context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TrellisLookup {
    /// Return the first entry matching the word id.
    FirstMatch,
    /// Scan the whole id group and return the entry with the best back
    /// score.
    WordPairBest,
}

/// Acoustic analysis parameters, fixed for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Sampling frequency in Hz.
    pub sample_freq: u32,
    /// Window size in samples.
    pub frame_size: usize,
    /// Frame shift in samples.
    pub frame_shift: usize,
    /// Pre-emphasis coefficient.
    pub pre_emph: f32,
    /// Number of mel filterbank channels.
    pub fbank_num: usize,
    /// Number of cepstral coefficients (without c0/energy).
    pub mfcc_dim: usize,
    /// Cepstral liftering coefficient, 0 disables.
    pub lifter: usize,
    /// Delta window width (frames on each side).
    pub delta_win: usize,
    /// Acceleration window width.
    pub accel_win: usize,
    /// Base feature type.
    pub base_type: FeatureType,
    /// Append 0'th cepstral coefficient.
    pub c0: bool,
    /// Append log energy.
    pub energy: bool,
    /// Use raw energy (before pre-emphasis/windowing).
    pub raw_e: bool,
    /// Suppress absolute energy (only delta/accel energy kept).
    pub abs_energy_suppressed: bool,
    /// Compute delta coefficients.
    pub delta: bool,
    /// Compute acceleration coefficients.
    pub accel: bool,
    /// Cepstral mean normalization.
    pub cmn: bool,
    /// Cepstral variance normalization.
    pub cvn: bool,
    /// MAP-CMN weight for the prior mean.
    pub cmn_map_weight: f32,
    /// Energy normalization on live input.
    pub energy_normalize: bool,
    /// Energy scaling factor for normalization.
    pub escale: f32,
    /// Energy silence floor in dB.
    pub sil_floor: f32,
    /// High-frequency cutoff in Hz, negative disables.
    pub hipass: i32,
    /// Low-frequency cutoff in Hz, negative disables.
    pub lopass: i32,
    /// Subtract window mean before analysis.
    pub zmean_frame: bool,
    /// Use power spectrum instead of magnitude in the filterbank.
    pub use_power: bool,
    /// VTLN warping factor, 1.0 disables.
    pub vtln_alpha: f32,
    /// VTLN upper cutoff frequency in Hz.
    pub vtln_upper: f32,
    /// VTLN lower cutoff frequency in Hz.
    pub vtln_lower: f32,
    /// Spectral subtraction over-subtraction factor.
    pub ss_alpha: f32,
    /// Spectral subtraction flooring coefficient.
    pub ss_floor: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_freq: 16000,
            frame_size: 400,  // 25ms at 16kHz
            frame_shift: 160, // 10ms at 16kHz
            pre_emph: 0.97,
            fbank_num: 24,
            mfcc_dim: 12,
            lifter: 22,
            delta_win: 2,
            accel_win: 2,
            base_type: FeatureType::Mfcc,
            c0: false,
            energy: true,
            raw_e: false,
            abs_energy_suppressed: false,
            delta: true,
            accel: false,
            cmn: true,
            cvn: false,
            cmn_map_weight: 100.0,
            energy_normalize: false,
            escale: 1.0,
            sil_floor: 50.0,
            hipass: -1,
            lopass: -1,
            zmean_frame: false,
            use_power: false,
            vtln_alpha: 1.0,
            vtln_upper: -1.0,
            vtln_lower: -1.0,
            ss_alpha: 2.0,
            ss_floor: 0.5,
        }
    }
}

impl AnalysisConfig {
    /// Sampling period in 100ns units, the unit used by HTK headers.
    pub fn sample_period(&self) -> u32 {
        10_000_000 / self.sample_freq
    }

    /// Length of the static feature part (cepstra + c0 + energy).
    pub fn base_len(&self) -> usize {
        self.mfcc_dim + usize::from(self.c0) + usize::from(self.energy)
    }

    /// Full output vector length including delta/accel and energy
    /// suppression.
    pub fn vec_len(&self) -> usize {
        let mut n = self.base_len();
        if self.delta {
            n += self.base_len();
        }
        if self.accel {
            n += self.base_len();
        }
        if self.abs_energy_suppressed {
            n -= 1;
        }
        n
    }

    /// Frame shift in milliseconds.
    pub fn shift_ms(&self) -> f32 {
        self.frame_shift as f32 * 1000.0 / self.sample_freq as f32
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 || self.frame_shift == 0 {
            return Err(DecodeError::ConfigInvalid(
                "frame size and shift must be non-zero".into(),
            ));
        }
        if self.frame_shift > self.frame_size {
            return Err(DecodeError::ConfigInvalid(format!(
                "frame shift {} larger than frame size {}",
                self.frame_shift, self.frame_size
            )));
        }
        if self.fbank_num == 0 {
            return Err(DecodeError::ConfigInvalid("fbank_num must be > 0".into()));
        }
        if self.base_type == FeatureType::Mfcc && self.mfcc_dim > self.fbank_num {
            return Err(DecodeError::ConfigInvalid(format!(
                "mfcc_dim {} exceeds fbank_num {}",
                self.mfcc_dim, self.fbank_num
            )));
        }
        if self.accel && !self.delta {
            return Err(DecodeError::ConfigInvalid(
                "acceleration requires delta coefficients".into(),
            ));
        }
        if self.abs_energy_suppressed && !(self.energy && self.delta) {
            return Err(DecodeError::ConfigInvalid(
                "absolute energy suppression requires energy and delta".into(),
            ));
        }
        if self.c0 && self.base_type != FeatureType::Mfcc {
            return Err(DecodeError::ConfigInvalid(
                "c0 is only meaningful for MFCC output".into(),
            ));
        }
        Ok(())
    }
}

/// Search parameters for both passes.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Pass-1 rank beam width in nodes. 0 selects an automatic width from
    /// the vocabulary size; `usize::MAX` disables rank pruning.
    pub beam_width: usize,
    /// Pass-1 score-offset beam below the frame best. 0.0 disables.
    pub score_beam: f32,
    /// Keep tokens separated by predecessor word (word-pair approximation).
    pub word_pair: bool,
    /// Maximum tokens kept per node in word-pair mode.
    pub word_pair_keep: usize,
    /// Number of sentences to produce in pass 2.
    pub nbest: usize,
    /// Maximum number of hypotheses held in the pass-2 stack.
    pub stack_size: usize,
    /// Abort pass 2 after this many popped hypotheses.
    pub hypo_overflow: usize,
    /// Trellis lookup window around the estimated connection frame.
    pub lookup_range: usize,
    /// Score envelope width for the pass-2 word re-scan. 0.0 disables.
    pub scan_beam_thres: f32,
    /// Pass-1 LM weight.
    pub lm_weight: f32,
    /// Pass-1 word insertion penalty.
    pub lm_penalty: f32,
    /// Pass-2 LM weight.
    pub lm_weight2: f32,
    /// Pass-2 word insertion penalty.
    pub lm_penalty2: f32,
    /// Additional insertion penalty for transparent words.
    pub transparent_penalty: f32,
    /// Word-boundary context-dependent scoring policy.
    pub iwcd: IwcdPolicy,
    /// Gaussian pruning method.
    pub gprune: GaussPruning,
    /// Number of Gaussians computed per mixture under pruning.
    pub tmix_gaussnum: usize,
    /// Trellis lookup semantics (see [`TrellisLookup`]).
    pub trellis_lookup: TrellisLookup,
    /// Emit the pass-1 best sentence with status FAIL when pass 2 yields
    /// nothing.
    pub fallback_1pass: bool,
    /// Confidence measure smoothing factor.
    pub cm_alpha: f32,
    /// Name of the short-pause word for decoder-based segmentation.
    pub sp_model: Option<String>,
    /// Consecutive pause-best frames that trigger a segment boundary.
    pub sp_frame_duration: usize,
    /// Frames to back-step when resuming pass 1 after a segment boundary.
    pub sp_backstep_margin: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 0,
            score_beam: 0.0,
            word_pair: false,
            word_pair_keep: 3,
            nbest: 1,
            stack_size: 500,
            hypo_overflow: 2000,
            lookup_range: 5,
            scan_beam_thres: 80.0,
            lm_weight: 8.0,
            lm_penalty: -2.0,
            lm_weight2: 8.0,
            lm_penalty2: -2.0,
            transparent_penalty: 0.0,
            iwcd: IwcdPolicy::Avg,
            gprune: GaussPruning::Safe,
            tmix_gaussnum: 2,
            trellis_lookup: TrellisLookup::FirstMatch,
            fallback_1pass: false,
            cm_alpha: 0.05,
            sp_model: None,
            sp_frame_duration: 10,
            sp_backstep_margin: 10,
        }
    }
}

impl SearchConfig {
    /// Resolve the effective rank beam for a vocabulary of `vocab` words.
    pub fn effective_beam_width(&self, vocab: usize) -> usize {
        if self.beam_width == 0 {
            let auto = ((vocab as f32).sqrt() * 15.0) as usize;
            auto.clamp(40, 800)
        } else {
            self.beam_width
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nbest == 0 {
            return Err(DecodeError::ConfigInvalid("nbest must be >= 1".into()));
        }
        if self.stack_size == 0 {
            return Err(DecodeError::ConfigInvalid("stack_size must be >= 1".into()));
        }
        if self.lookup_range == 0 {
            return Err(DecodeError::ConfigInvalid(
                "lookup_range must be >= 1".into(),
            ));
        }
        if self.word_pair && self.word_pair_keep == 0 {
            return Err(DecodeError::ConfigInvalid(
                "word_pair_keep must be >= 1 in word-pair mode".into(),
            ));
        }
        if let IwcdPolicy::BestN(n) = self.iwcd {
            if n == 0 {
                return Err(DecodeError::ConfigInvalid(
                    "iwcd best-N requires N >= 1".into(),
                ));
            }
        }
        if self.tmix_gaussnum == 0 {
            return Err(DecodeError::ConfigInvalid(
                "tmix_gaussnum must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Input rejection thresholds.
#[derive(Debug, Clone, Default)]
pub struct RejectConfig {
    /// Reject inputs shorter than this many milliseconds. 0 disables.
    pub reject_short_ms: u32,
    /// Reject inputs longer than this many milliseconds. 0 disables.
    pub reject_long_ms: u32,
    /// Reject inputs whose average log frame energy is below this value.
    pub power_reject_thres: Option<f32>,
}

/// Complete decoder configuration.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    pub analysis: AnalysisConfig,
    pub search: SearchConfig,
    pub reject: RejectConfig,
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.search.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn vector_geometry() {
        let mut a = AnalysisConfig::default();
        // 12 cepstra + energy, with delta
        assert_eq!(a.base_len(), 13);
        assert_eq!(a.vec_len(), 26);

        a.accel = true;
        assert_eq!(a.vec_len(), 39);

        a.abs_energy_suppressed = true;
        assert_eq!(a.vec_len(), 38);

        a.c0 = true;
        assert_eq!(a.base_len(), 14);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut a = AnalysisConfig::default();
        a.frame_shift = 500;
        assert!(a.validate().is_err());

        let mut a = AnalysisConfig::default();
        a.mfcc_dim = 30;
        assert!(a.validate().is_err());

        let mut a = AnalysisConfig::default();
        a.accel = true;
        a.delta = false;
        assert!(a.validate().is_err());
    }

    #[test]
    fn auto_beam_width_scales_with_vocab() {
        let s = SearchConfig::default();
        assert_eq!(s.effective_beam_width(4), 40);
        let w = s.effective_beam_width(10_000);
        assert!(w > 800 - 1 || w == 800);
        let mid = s.effective_beam_width(400);
        assert_eq!(mid, 300);
    }
}

//! Gaussian-mixture output probability computation.
//!
//! The scorer owns the per-utterance cache side table: every HMM state has
//! a `(frame, score)` slot so repeated requests within a frame are free.
//! Mixture evaluation prunes Gaussians by partial Mahalanobis distance
//! against the running N-th best component; the `safe` method never changes
//! the surviving top-N set, so with N at least the mixture size it equals
//! the exact computation.

use crate::config::{GaussPruning, IwcdPolicy, SearchConfig};
use crate::hmm::{add_log_probs, HmmSet, MixturePdf, StateId, LOG_ZERO};

/// Fixed score offset below the frame-best component for the `beam`
/// pruning method.
const BEAM_PRUNE_WIDTH: f32 = 10.0;

#[derive(Clone, Copy)]
struct CacheSlot {
    frame: i32,
    score: f32,
}

pub struct AcousticScorer<'m> {
    hmm: &'m HmmSet,
    gprune: GaussPruning,
    tmix: usize,
    iwcd: IwcdPolicy,
    cache: Vec<CacheSlot>,
    /// Stream dimension offsets, precomputed from the model.
    stream_offsets: Vec<usize>,
}

impl<'m> AcousticScorer<'m> {
    pub fn new(hmm: &'m HmmSet, config: &SearchConfig) -> Self {
        let mut stream_offsets = Vec::with_capacity(hmm.num_streams());
        let mut off = 0;
        for &sz in &hmm.stream_sizes {
            stream_offsets.push(off);
            off += sz;
        }
        Self {
            hmm,
            gprune: config.gprune,
            tmix: config.tmix_gaussnum,
            iwcd: config.iwcd,
            cache: vec![
                CacheSlot {
                    frame: -1,
                    score: 0.0,
                };
                hmm.states.len()
            ],
            stream_offsets,
        }
    }

    /// Reset the cache for a new utterance.
    pub fn prepare(&mut self) {
        for slot in self.cache.iter_mut() {
            slot.frame = -1;
        }
    }

    /// Log output probability of one state at frame `t`, cached.
    pub fn score_state(&mut self, t: i32, frame: &[f32], sid: StateId) -> f32 {
        let slot = self.cache[sid as usize];
        if slot.frame == t {
            return slot.score;
        }
        let score = self.compute_state(frame, sid);
        self.cache[sid as usize] = CacheSlot { frame: t, score };
        score
    }

    /// Combined score of a context-dependent state set under the IWCD
    /// policy.
    pub fn score_set(&mut self, t: i32, frame: &[f32], set: &[StateId]) -> f32 {
        match set.len() {
            0 => LOG_ZERO,
            1 => self.score_state(t, frame, set[0]),
            _ => {
                let mut scores: Vec<f32> = set
                    .iter()
                    .map(|&sid| self.score_state(t, frame, sid))
                    .collect();
                match self.iwcd {
                    IwcdPolicy::Max => scores.iter().copied().fold(LOG_ZERO, f32::max),
                    IwcdPolicy::Avg => scores.iter().sum::<f32>() / scores.len() as f32,
                    IwcdPolicy::BestN(n) => {
                        let n = n.min(scores.len());
                        scores.sort_unstable_by(|a, b| b.total_cmp(a));
                        scores[..n].iter().sum::<f32>() / n as f32
                    }
                }
            }
        }
    }

    fn compute_state(&self, frame: &[f32], sid: StateId) -> f32 {
        let state = self.hmm.state(sid);
        if state.streams.len() == 1 {
            let w = state.stream_weights.first().copied().unwrap_or(1.0);
            return w * self.compute_mixture(frame, &state.streams[0]);
        }
        let mut total = 0.0;
        for (s, pdf) in state.streams.iter().enumerate() {
            let off = self.stream_offsets.get(s).copied().unwrap_or(0);
            let len = self.hmm.stream_sizes.get(s).copied().unwrap_or(frame.len());
            let sub = &frame[off..(off + len).min(frame.len())];
            let w = state.stream_weights.get(s).copied().unwrap_or(1.0);
            total += w * self.compute_mixture(sub, pdf);
        }
        total
    }

    /// `log Σ_k w_k·N(x; μ_k, σ_k)` with Gaussian pruning.
    fn compute_mixture(&self, x: &[f32], pdf: &MixturePdf) -> f32 {
        let mut total = LOG_ZERO;
        // running N-th best component score, the pruning threshold
        let mut best: Vec<f32> = Vec::with_capacity(self.tmix);
        let mut last_score = LOG_ZERO;

        for (k, &did) in pdf.dens.iter().enumerate() {
            let g = &self.hmm.dens[did as usize];
            let thresh = match self.gprune {
                GaussPruning::None => LOG_ZERO,
                GaussPruning::Safe => {
                    if best.len() < self.tmix {
                        LOG_ZERO
                    } else {
                        best[self.tmix - 1]
                    }
                }
                GaussPruning::Heuristic => {
                    if k == 0 {
                        LOG_ZERO
                    } else {
                        last_score
                    }
                }
                GaussPruning::Beam => {
                    let b = best.first().copied().unwrap_or(LOG_ZERO);
                    if b <= LOG_ZERO / 2.0 {
                        LOG_ZERO
                    } else {
                        b - BEAM_PRUNE_WIDTH
                    }
                }
            };
            // component survives while dist/2 < −thresh − gconst/2
            let dist_limit = if thresh <= LOG_ZERO / 2.0 {
                f32::INFINITY
            } else {
                2.0 * (-thresh - g.gconst / 2.0)
            };

            let mut dist = 0.0f32;
            let mut pruned = false;
            for ((&xv, &m), &iv) in x.iter().zip(&g.mean).zip(&g.inv_var) {
                let d = xv - m;
                dist += d * d * iv;
                if dist > dist_limit {
                    pruned = true;
                    break;
                }
            }
            if pruned {
                last_score = LOG_ZERO;
                continue;
            }
            let score = -0.5 * (g.gconst + dist);
            last_score = score;
            let pos = best
                .binary_search_by(|s: &f32| score.total_cmp(s))
                .unwrap_or_else(|e| e);
            if pos < self.tmix {
                best.insert(pos, score);
                best.truncate(self.tmix);
            }
            total = add_log_probs(total, pdf.weights[k] + score);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::{Gaussian, HmmState};

    fn model_with_mixture(means: &[f32]) -> (HmmSet, StateId) {
        let mut set = HmmSet::new(1);
        let n = means.len();
        let mut dens = Vec::new();
        for &m in means {
            dens.push(set.add_density(Gaussian::from_variance(vec![m], vec![1.0])));
        }
        let w = (1.0 / n as f32).ln();
        let sid = set.add_state(HmmState {
            streams: vec![MixturePdf {
                weights: vec![w; n],
                dens,
            }],
            stream_weights: vec![1.0],
        });
        (set, sid)
    }

    fn config(gprune: GaussPruning, tmix: usize) -> SearchConfig {
        SearchConfig {
            gprune,
            tmix_gaussnum: tmix,
            ..Default::default()
        }
    }

    #[test]
    fn single_gaussian_matches_closed_form() {
        let (set, sid) = model_with_mixture(&[0.0]);
        let mut scorer = AcousticScorer::new(&set, &config(GaussPruning::None, 2));
        let got = scorer.score_state(0, &[0.0], sid);
        // log N(0; 0, 1) with weight ln(1): -0.5·ln(2π)
        let expect = -0.5 * (2.0 * std::f32::consts::PI).ln();
        assert!((got - expect).abs() < 1e-5);
    }

    #[test]
    fn pruning_never_inflates_and_safe_is_exact_with_large_n() {
        let (set, sid) = model_with_mixture(&[0.0, 2.0, 4.0, 6.0]);
        let x = vec![0.5f32];

        let exact = AcousticScorer::new(&set, &config(GaussPruning::None, 4))
            .score_state(0, &x, sid);

        for gp in [
            GaussPruning::Safe,
            GaussPruning::Heuristic,
            GaussPruning::Beam,
        ] {
            let got = AcousticScorer::new(&set, &config(gp, 2)).score_state(0, &x, sid);
            assert!(
                got <= exact + 1e-6,
                "{} inflated: {} > {}",
                gp,
                got,
                exact
            );
        }

        // safe with N >= mixture size computes every component
        let safe_full =
            AcousticScorer::new(&set, &config(GaussPruning::Safe, 4)).score_state(0, &x, sid);
        assert!((safe_full - exact).abs() < 1e-6);
    }

    #[test]
    fn cache_hits_within_frame() {
        let (set, sid) = model_with_mixture(&[1.0]);
        let mut scorer = AcousticScorer::new(&set, &config(GaussPruning::Safe, 2));
        let a = scorer.score_state(3, &[1.0], sid);
        // same frame: cached value returned even for different input
        let b = scorer.score_state(3, &[100.0], sid);
        assert_eq!(a, b);
        // new frame recomputes
        let c = scorer.score_state(4, &[100.0], sid);
        assert!(c < a);
        scorer.prepare();
        let d = scorer.score_state(3, &[1.0], sid);
        assert_eq!(a, d);
    }

    #[test]
    fn iwcd_policies_order_sensibly() {
        let (mut set, s0) = {
            let (s, sid) = model_with_mixture(&[0.0]);
            (s, sid)
        };
        let d1 = set.add_density(Gaussian::from_variance(vec![5.0], vec![1.0]));
        let s1 = set.add_state(HmmState {
            streams: vec![MixturePdf {
                weights: vec![0.0],
                dens: vec![d1],
            }],
            stream_weights: vec![1.0],
        });
        let x = vec![0.0f32];
        let states = [s0, s1];

        let max = {
            let mut sc = AcousticScorer::new(
                &set,
                &SearchConfig {
                    iwcd: IwcdPolicy::Max,
                    ..Default::default()
                },
            );
            sc.score_set(0, &x, &states)
        };
        let avg = {
            let mut sc = AcousticScorer::new(
                &set,
                &SearchConfig {
                    iwcd: IwcdPolicy::Avg,
                    ..Default::default()
                },
            );
            sc.score_set(0, &x, &states)
        };
        let best1 = {
            let mut sc = AcousticScorer::new(
                &set,
                &SearchConfig {
                    iwcd: IwcdPolicy::BestN(1),
                    ..Default::default()
                },
            );
            sc.score_set(0, &x, &states)
        };
        assert!(max > avg);
        assert_eq!(max, best1);
    }
}

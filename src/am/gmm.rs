//! GMM-based utterance verification.
//!
//! A small bank of whole-utterance Gaussian mixture models is scored
//! frame-synchronously alongside pass 1; at utterance end the best-scoring
//! model decides acceptance. Models listed in the reject set (typically
//! noise and non-speech models) reject the input with status `REJECT_GMM`.

use crate::hmm::{add_log_probs, Gaussian, LOG_ZERO};
use std::collections::HashSet;

pub struct GmmDef {
    pub name: String,
    /// Component log weights.
    pub weights: Vec<f32>,
    pub gaussians: Vec<Gaussian>,
}

pub struct GmmVerifier {
    defs: Vec<GmmDef>,
    reject: HashSet<String>,
    scores: Vec<f64>,
    frames: usize,
}

impl GmmVerifier {
    pub fn new(defs: Vec<GmmDef>, reject_names: &[&str]) -> Self {
        let reject = reject_names.iter().map(|s| s.to_string()).collect();
        let n = defs.len();
        Self {
            defs,
            reject,
            scores: vec![0.0; n],
            frames: 0,
        }
    }

    pub fn prepare(&mut self) {
        self.scores.iter_mut().for_each(|s| *s = 0.0);
        self.frames = 0;
    }

    /// Accumulate one frame into every model.
    pub fn proceed(&mut self, frame: &[f32]) {
        for (def, acc) in self.defs.iter().zip(self.scores.iter_mut()) {
            let mut p = LOG_ZERO;
            for (g, &w) in def.gaussians.iter().zip(&def.weights) {
                let mut dist = 0.0f32;
                for ((&x, &m), &iv) in frame.iter().zip(&g.mean).zip(&g.inv_var) {
                    let d = x - m;
                    dist += d * d * iv;
                }
                p = add_log_probs(p, w - 0.5 * (g.gconst + dist));
            }
            *acc += p as f64;
        }
        self.frames += 1;
    }

    /// Best model name and whether the utterance should be rejected.
    pub fn result(&self) -> Option<(&str, bool)> {
        if self.frames == 0 || self.defs.is_empty() {
            return None;
        }
        let best = self
            .scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)?;
        let name = self.defs[best].name.as_str();
        let rejected = self.reject.contains(name);
        log::debug!(
            "gmm: best model {} over {} frames (reject: {})",
            name,
            self.frames,
            rejected
        );
        Some((name, rejected))
    }
}

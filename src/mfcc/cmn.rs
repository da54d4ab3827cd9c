//! Real-time MAP cepstral mean / variance normalization.
//!
//! During an utterance the running sum of input vectors is blended with a
//! prior mean (from earlier utterances or a loaded file) weighted by
//! `cmn_map_weight`. At utterance end the sum is pushed into a bounded
//! history (at most [`HISTORY_MAX_FRAMES`] frames are consulted) and the
//! prior for the next utterance is recomputed. Variance normalization uses
//! prior statistics only, never the still-accumulating utterance.
//!
//! Persisted as HTK-ish ASCII (`<CEPSNORM> <MEAN> … <VARIANCE> …`); the
//! legacy big-endian binary layout is accepted on load.

use byteorder::{BigEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::io::Read;

/// Cap on the total number of frames summed into the prior mean.
pub const HISTORY_MAX_FRAMES: usize = 500;

struct CepsSum {
    sum: Vec<f32>,
    frames: usize,
}

pub struct MapCmn {
    veclen: usize,
    /// Number of leading dimensions that receive mean subtraction
    /// (cepstra + c0; energy and deltas are left alone).
    norm_dims: usize,
    mean: bool,
    var: bool,
    weight: f32,

    now_sum: Vec<f32>,
    now_var: Vec<f32>,
    now_frames: usize,

    cmean_init: Vec<f32>,
    cvar_init: Vec<f32>,
    cmean_set: bool,
    cvar_set: bool,
    loaded_from_file: bool,

    history: VecDeque<CepsSum>,
    all_var: Vec<f32>,
    all_frames: usize,
}

impl MapCmn {
    pub fn new(veclen: usize, norm_dims: usize, mean: bool, var: bool, weight: f32) -> Self {
        Self {
            veclen,
            norm_dims,
            mean,
            var,
            weight,
            now_sum: vec![0.0; veclen],
            now_var: vec![0.0; veclen],
            now_frames: 0,
            cmean_init: vec![0.0; veclen],
            cvar_init: vec![0.0; veclen],
            cmean_set: false,
            cvar_set: false,
            loaded_from_file: false,
            history: VecDeque::new(),
            all_var: vec![0.0; veclen],
            all_frames: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.mean || self.var
    }

    /// Reset per-utterance accumulators.
    pub fn prepare(&mut self) {
        self.now_sum.iter_mut().for_each(|v| *v = 0.0);
        self.now_var.iter_mut().for_each(|v| *v = 0.0);
        self.now_frames = 0;
    }

    /// Normalize one vector in place, accumulating its statistics.
    pub fn apply(&mut self, vec: &mut [f32]) {
        debug_assert_eq!(vec.len(), self.veclen);
        self.now_frames += 1;
        if self.cmean_set {
            for d in 0..self.veclen {
                self.now_sum[d] += vec[d];
                let x =
                    (self.now_sum[d] + self.weight * self.cmean_init[d]) / (self.now_frames as f32 + self.weight);
                self.now_var[d] += (vec[d] - x) * (vec[d] - x);
                if self.mean && d < self.norm_dims {
                    vec[d] -= x;
                }
                if self.var && self.cvar_set {
                    vec[d] /= self.cvar_init[d].sqrt();
                }
            }
        } else {
            for d in 0..self.veclen {
                self.now_sum[d] += vec[d];
                let x = self.now_sum[d] / self.now_frames as f32;
                self.now_var[d] += (vec[d] - x) * (vec[d] - x);
                if self.mean && d < self.norm_dims {
                    vec[d] -= x;
                }
            }
        }
    }

    /// Fold the finished utterance into the history and refresh the prior
    /// for the next one. A no-op when no frame was seen.
    pub fn update(&mut self) {
        if self.now_frames == 0 {
            return;
        }

        // prior mean over current + historic sums, newest first, capped
        self.cmean_init.copy_from_slice(&self.now_sum);
        let mut frames = self.now_frames;
        for past in &self.history {
            for d in 0..self.veclen {
                self.cmean_init[d] += past.sum[d];
            }
            frames += past.frames;
            if frames >= HISTORY_MAX_FRAMES {
                break;
            }
        }
        for d in 0..self.veclen {
            self.cmean_init[d] /= frames as f32;
        }
        self.cmean_set = true;

        if self.var && !self.loaded_from_file {
            for d in 0..self.veclen {
                self.all_var[d] = (self.all_var[d] * self.all_frames as f32 + self.now_var[d])
                    / (self.all_frames + self.now_frames) as f32;
            }
            self.all_frames += self.now_frames;
            self.cvar_init.copy_from_slice(&self.all_var);
            self.cvar_set = true;
        }

        self.history.push_front(CepsSum {
            sum: self.now_sum.clone(),
            frames: self.now_frames,
        });
        // drop history beyond what the cap can ever consult
        let mut total = 0usize;
        let mut keep = 0usize;
        for past in &self.history {
            keep += 1;
            total += past.frames;
            if total >= HISTORY_MAX_FRAMES {
                break;
            }
        }
        self.history.truncate(keep);
    }

    /// Serialize the prior statistics as HTK-ish ASCII.
    pub fn save(&self) -> String {
        let mut out = String::from("<CEPSNORM> <>\n");
        out.push_str(&format!("<MEAN> {}\n", self.veclen));
        for d in 0..self.veclen {
            out.push_str(&format!(" {:e}\n", self.cmean_init[d]));
        }
        if self.var && self.cvar_set {
            out.push_str(&format!("<VARIANCE> {}\n", self.veclen));
            for d in 0..self.veclen {
                out.push_str(&format!(" {:e}\n", self.cvar_init[d]));
            }
        }
        out
    }

    /// Load prior statistics from the ASCII format.
    pub fn load(&mut self, content: &str) -> Result<(), String> {
        if !content.trim_start().starts_with("<CEPS") && !content.trim_start().starts_with("<ceps")
        {
            return Err("not a CEPSNORM file".to_string());
        }
        let mut mean: Vec<f32> = Vec::new();
        let mut var: Vec<f32> = Vec::new();
        let mut mode = 0; // 0 none, 1 mean len, 2 mean vals, 3 var len, 4 var vals
        let mut expect = 0usize;
        for tok in content.split(|c: char| c.is_whitespace() || c == '<' || c == '>') {
            if tok.is_empty() {
                continue;
            }
            match tok {
                "CEPSNORM" => {}
                "MEAN" => mode = 1,
                "VARIANCE" => mode = 3,
                _ => match mode {
                    1 => {
                        expect = tok.parse().map_err(|_| "bad mean length")?;
                        if expect != self.veclen && expect != self.norm_dims {
                            return Err(format!(
                                "cepstral dimension mismatch: process = {} ({}), file = {}",
                                self.veclen, self.norm_dims, expect
                            ));
                        }
                        mode = 2;
                    }
                    2 => {
                        if mean.len() >= expect {
                            return Err("corrupted mean data".to_string());
                        }
                        mean.push(tok.parse().map_err(|_| "bad mean value")?);
                    }
                    3 => {
                        let n: usize = tok.parse().map_err(|_| "bad variance length")?;
                        if n != self.veclen {
                            return Err(format!(
                                "cepstral dimension mismatch: process = {}, file = {}",
                                self.veclen, n
                            ));
                        }
                        mode = 4;
                    }
                    4 => {
                        if var.len() >= self.veclen {
                            return Err("corrupted variance data".to_string());
                        }
                        var.push(tok.parse().map_err(|_| "bad variance value")?);
                    }
                    _ => return Err(format!("unexpected token {}", tok)),
                },
            }
        }
        if mean.len() != expect || (mode >= 3 && var.len() != self.veclen) {
            return Err("corrupted data".to_string());
        }
        self.cmean_init.iter_mut().for_each(|v| *v = 0.0);
        self.cmean_init[..mean.len()].copy_from_slice(&mean);
        if !var.is_empty() {
            self.cvar_init.copy_from_slice(&var);
            self.cvar_set = true;
        }
        self.cmean_set = true;
        self.loaded_from_file = true;
        Ok(())
    }

    /// Load the legacy binary layout (big-endian veclen, mean, optional
    /// variance).
    pub fn load_binary(&mut self, mut r: impl Read) -> Result<(), String> {
        let veclen = r
            .read_i32::<BigEndian>()
            .map_err(|e| format!("failed to read header: {}", e))? as usize;
        if veclen != self.veclen {
            return Err(format!(
                "cepstral dimension mismatch: process = {}, file = {}",
                self.veclen, veclen
            ));
        }
        for d in 0..self.veclen {
            self.cmean_init[d] = r
                .read_f32::<BigEndian>()
                .map_err(|e| format!("failed to read mean: {}", e))?;
        }
        if self.var {
            for d in 0..self.veclen {
                self.cvar_init[d] = r
                    .read_f32::<BigEndian>()
                    .map_err(|e| format!("failed to read variance: {}", e))?;
            }
            self.cvar_set = true;
        }
        self.cmean_set = true;
        self.loaded_from_file = true;
        Ok(())
    }

    pub fn prior_mean(&self) -> Option<&[f32]> {
        if self.cmean_set {
            Some(&self.cmean_init)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(cmn: &mut MapCmn, frames: &[Vec<f32>]) -> Vec<Vec<f32>> {
        frames
            .iter()
            .map(|f| {
                let mut v = f.clone();
                cmn.apply(&mut v);
                v
            })
            .collect()
    }

    #[test]
    fn running_mean_without_prior() {
        let mut cmn = MapCmn::new(2, 2, true, false, 100.0);
        cmn.prepare();
        let out = feed(
            &mut cmn,
            &[vec![2.0, 4.0], vec![2.0, 4.0], vec![2.0, 4.0]],
        );
        // constant input minus its running mean is zero
        for v in out {
            assert!(v[0].abs() < 1e-6 && v[1].abs() < 1e-6);
        }
    }

    #[test]
    fn energy_dimension_untouched_by_mean() {
        // veclen 3, but only first 2 dims normalized
        let mut cmn = MapCmn::new(3, 2, true, false, 100.0);
        cmn.prepare();
        let out = feed(&mut cmn, &[vec![1.0, 1.0, 9.0]]);
        assert_eq!(out[0][2], 9.0);
        assert!(out[0][0].abs() < 1e-6);
    }

    #[test]
    fn prior_blends_with_map_weight() {
        let mut cmn = MapCmn::new(1, 1, true, false, 3.0);
        // first utterance: all 4.0
        cmn.prepare();
        feed(&mut cmn, &[vec![4.0], vec![4.0]]);
        cmn.update();
        assert_eq!(cmn.prior_mean().unwrap()[0], 4.0);

        // second utterance of 8.0: mean = (8 + 3*4)/(1+3) = 5
        cmn.prepare();
        let out = feed(&mut cmn, &[vec![8.0]]);
        assert!((out[0][0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn ascii_roundtrip_and_resume() {
        let mut cmn = MapCmn::new(2, 2, true, false, 100.0);
        cmn.prepare();
        feed(&mut cmn, &[vec![1.5, -2.5], vec![2.5, -3.5]]);
        cmn.update();
        let saved = cmn.save();

        let mut restored = MapCmn::new(2, 2, true, false, 100.0);
        restored.load(&saved).unwrap();
        assert_eq!(restored.prior_mean().unwrap(), cmn.prior_mean().unwrap());

        // both normalize the next frame identically (within float noise)
        cmn.prepare();
        restored.prepare();
        let mut a = vec![0.5, 0.5];
        let mut b = vec![0.5, 0.5];
        cmn.apply(&mut a);
        restored.apply(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn load_rejects_dimension_mismatch() {
        let mut cmn = MapCmn::new(4, 3, true, false, 100.0);
        let bad = "<CEPSNORM> <>\n<MEAN> 7\n 1\n 2\n 3\n 4\n 5\n 6\n 7\n";
        assert!(cmn.load(bad).is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut cmn = MapCmn::new(1, 1, true, false, 1.0);
        for _ in 0..10 {
            cmn.prepare();
            let frames: Vec<Vec<f32>> = (0..200).map(|_| vec![1.0]).collect();
            feed(&mut cmn, &frames);
            cmn.update();
        }
        // 500-frame cap keeps at most ceil(500/200)=3 entries
        assert!(cmn.history.len() <= 3);
    }
}

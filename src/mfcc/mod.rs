//! MFCC front end: PCM samples in, normalized feature vectors out.
//!
//! [`FrontEnd`] chains the per-frame analyzer, the delta/acceleration cycle
//! buffers, real-time MAP-CMN and live energy normalization, emitting one
//! feature vector per frame shift in strict time order. It buffers raw
//! samples internally so callers can push audio in arbitrary chunk sizes.

pub mod analyzer;
pub mod cmn;
pub mod delta;
pub mod energy;

pub use analyzer::MfccAnalyzer;
pub use cmn::MapCmn;
pub use delta::DeltaBuffer;
pub use energy::EnergyNormalizer;

use crate::config::AnalysisConfig;
use crate::error::{DecodeError, Result};
use crate::hmm::HmmSet;
use std::collections::VecDeque;

pub struct FrontEnd {
    config: AnalysisConfig,
    analyzer: MfccAnalyzer,
    delta_buf: Option<DeltaBuffer>,
    accel_buf: Option<DeltaBuffer>,
    /// static+delta vectors waiting for their acceleration part.
    pending_sd: VecDeque<Vec<f32>>,
    cmn: MapCmn,
    energy_norm: Option<EnergyNormalizer>,

    window: Vec<f32>,
    window_start: usize,
    frame_scratch: Vec<f32>,

    out_queue: VecDeque<Vec<f32>>,
    power_sum: f64,
    power_frames: usize,
}

impl FrontEnd {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let analyzer = MfccAnalyzer::new(config)?;
        let base = config.base_len();
        let delta_buf = config.delta.then(|| DeltaBuffer::new(base, config.delta_win));
        let accel_buf = config.accel.then(|| DeltaBuffer::new(base, config.accel_win));
        let cmn = MapCmn::new(
            config.vec_len(),
            config.mfcc_dim + usize::from(config.c0),
            config.cmn,
            config.cvn,
            config.cmn_map_weight,
        );
        let energy_norm = (config.energy && config.energy_normalize)
            .then(|| EnergyNormalizer::new(config.escale, config.sil_floor));
        Ok(Self {
            config: config.clone(),
            analyzer,
            delta_buf,
            accel_buf,
            pending_sd: VecDeque::new(),
            cmn,
            energy_norm,
            window: Vec::new(),
            window_start: 0,
            frame_scratch: vec![0.0; config.frame_size],
            out_queue: VecDeque::new(),
            power_sum: 0.0,
            power_frames: 0,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn cmn(&self) -> &MapCmn {
        &self.cmn
    }

    pub fn cmn_mut(&mut self) -> &mut MapCmn {
        &mut self.cmn
    }

    pub fn set_noise_spectrum(&mut self, noise: Option<Vec<f32>>) -> Result<()> {
        self.analyzer.set_noise_spectrum(noise)
    }

    /// Check feature geometry against a loaded acoustic model.
    pub fn check_model(&self, hmm: &HmmSet) -> Result<()> {
        if hmm.vec_len != 0 && hmm.vec_len != self.config.vec_len() {
            return Err(DecodeError::FormatMismatch(format!(
                "feature vector length {} does not match model {}",
                self.config.vec_len(),
                hmm.vec_len
            )));
        }
        if let Some(emb) = &hmm.embedded_analysis {
            if emb.sample_freq != self.config.sample_freq {
                return Err(DecodeError::FormatMismatch(format!(
                    "sample rate {} does not match model {}",
                    self.config.sample_freq, emb.sample_freq
                )));
            }
            if emb.base_type != self.config.base_type {
                return Err(DecodeError::FormatMismatch(format!(
                    "feature type {} does not match model {}",
                    self.config.base_type, emb.base_type
                )));
            }
        }
        Ok(())
    }

    /// Reset all per-utterance state.
    pub fn prepare(&mut self) {
        self.window.clear();
        self.window_start = 0;
        self.out_queue.clear();
        self.pending_sd.clear();
        if let Some(db) = &mut self.delta_buf {
            db.reset();
        }
        if let Some(ab) = &mut self.accel_buf {
            ab.reset();
        }
        self.cmn.prepare();
        if let Some(en) = &mut self.energy_norm {
            en.prepare();
        }
        self.power_sum = 0.0;
        self.power_frames = 0;
    }

    /// Feed raw samples; complete frames are analyzed immediately.
    pub fn push_samples(&mut self, samples: &[i16]) {
        self.window.extend(samples.iter().map(|&s| s as f32));
        while self.window.len() - self.window_start >= self.config.frame_size {
            let end = self.window_start + self.config.frame_size;
            self.frame_scratch
                .copy_from_slice(&self.window[self.window_start..end]);
            let mut frame = std::mem::take(&mut self.frame_scratch);
            let out = self.analyzer.analyze(&mut frame);
            self.frame_scratch = frame;

            self.power_sum += out.raw_energy as f64;
            self.power_frames += 1;

            let mut base = out.base;
            if let (Some(en), Some(ei)) = (&mut self.energy_norm, out.energy_index) {
                base[ei] = en.normalize(base[ei]);
            }
            self.push_base(base);

            self.window_start += self.config.frame_shift;
            if self.window_start > 8 * self.config.frame_size {
                self.window.drain(..self.window_start);
                self.window_start = 0;
            }
        }
    }

    fn push_base(&mut self, base: Vec<f32>) {
        if self.delta_buf.is_none() {
            self.finish_vector(base);
            return;
        }
        let emitted = self.delta_buf.as_mut().unwrap().proceed(&base);
        if let Some(sd) = emitted {
            self.push_static_delta(sd);
        }
    }

    fn push_static_delta(&mut self, sd: Vec<f32>) {
        if self.accel_buf.is_none() {
            self.finish_vector(sd);
            return;
        }
        let base = self.config.base_len();
        let emitted = self.accel_buf.as_mut().unwrap().proceed(&sd[base..]);
        self.pending_sd.push_back(sd);
        if let Some(da) = emitted {
            let sd0 = self
                .pending_sd
                .pop_front()
                .expect("acceleration emitted without pending frame");
            let mut full = sd0;
            full.extend_from_slice(&da[base..]);
            self.finish_vector(full);
        }
    }

    fn finish_vector(&mut self, mut full: Vec<f32>) {
        if self.config.abs_energy_suppressed {
            full.remove(self.config.base_len() - 1);
        }
        if self.cmn.enabled() {
            self.cmn.apply(&mut full);
        }
        self.out_queue.push_back(full);
    }

    /// Next completed feature vector, if any.
    pub fn pop_frame(&mut self) -> Option<Vec<f32>> {
        self.out_queue.pop_front()
    }

    pub fn has_frames(&self) -> bool {
        !self.out_queue.is_empty()
    }

    /// End of stream: drop the partial window and drain the delta buffers.
    pub fn flush(&mut self) {
        loop {
            let sd = match &mut self.delta_buf {
                Some(db) => db.flush(),
                None => None,
            };
            match sd {
                Some(sd) => self.push_static_delta(sd),
                None => break,
            }
        }
        if self.accel_buf.is_some() {
            loop {
                let da = self.accel_buf.as_mut().unwrap().flush();
                let base = self.config.base_len();
                match da {
                    Some(da) => {
                        let sd0 = match self.pending_sd.pop_front() {
                            Some(v) => v,
                            None => break,
                        };
                        let mut full = sd0;
                        full.extend_from_slice(&da[base..]);
                        self.finish_vector(full);
                    }
                    None => break,
                }
            }
            self.pending_sd.clear();
        }
    }

    /// Fold the finished utterance into the CMN history.
    pub fn finish_utterance(&mut self) {
        if self.cmn.enabled() {
            self.cmn.update();
        }
    }

    /// Average raw log frame energy of the utterance so far.
    pub fn avg_power(&self) -> f32 {
        if self.power_frames == 0 {
            0.0
        } else {
            (self.power_sum / self.power_frames as f64) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, freq: f32, amp: f32) -> Vec<i16> {
        (0..n)
            .map(|i| (amp * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin()) as i16)
            .collect()
    }

    fn drain(fe: &mut FrontEnd) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        while let Some(f) = fe.pop_frame() {
            out.push(f);
        }
        out
    }

    #[test]
    fn frame_count_matches_shift_math() {
        let cfg = AnalysisConfig {
            delta: false,
            cmn: false,
            ..Default::default()
        };
        let mut fe = FrontEnd::new(&cfg).unwrap();
        fe.prepare();
        // one second: (16000 - 400) / 160 + 1 = 98 full windows
        fe.push_samples(&tone(16000, 440.0, 5000.0));
        fe.flush();
        let frames = drain(&mut fe);
        assert_eq!(frames.len(), 98);
        assert!(frames.iter().all(|f| f.len() == cfg.vec_len()));
    }

    #[test]
    fn delta_and_accel_extend_vectors_without_losing_frames() {
        let cfg = AnalysisConfig {
            delta: true,
            accel: true,
            cmn: false,
            ..Default::default()
        };
        let mut fe = FrontEnd::new(&cfg).unwrap();
        fe.prepare();
        fe.push_samples(&tone(4000, 300.0, 3000.0));
        fe.flush();
        let frames = drain(&mut fe);
        // (4000-400)/160+1 = 23 windows, all recovered by flushing
        assert_eq!(frames.len(), 23);
        assert!(frames.iter().all(|f| f.len() == cfg.vec_len()));
    }

    #[test]
    fn chunked_input_equals_single_push() {
        let cfg = AnalysisConfig {
            delta: true,
            cmn: false,
            ..Default::default()
        };
        let audio = tone(3200, 500.0, 2000.0);

        let mut a = FrontEnd::new(&cfg).unwrap();
        a.prepare();
        a.push_samples(&audio);
        a.flush();
        let one = drain(&mut a);

        let mut b = FrontEnd::new(&cfg).unwrap();
        b.prepare();
        for chunk in audio.chunks(111) {
            b.push_samples(chunk);
        }
        b.flush();
        let many = drain(&mut b);

        assert_eq!(one.len(), many.len());
        for (x, y) in one.iter().zip(&many) {
            for (p, q) in x.iter().zip(y) {
                assert!((p - q).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn short_input_yields_no_frames() {
        let cfg = AnalysisConfig {
            delta: true,
            accel: true,
            cmn: false,
            ..Default::default()
        };
        let mut fe = FrontEnd::new(&cfg).unwrap();
        fe.prepare();
        // one window only: fewer frames than delta+accel context
        fe.push_samples(&tone(400, 440.0, 2000.0));
        fe.flush();
        assert!(drain(&mut fe).is_empty());
    }

    #[test]
    fn absesup_drops_static_energy() {
        let cfg = AnalysisConfig {
            delta: true,
            energy: true,
            abs_energy_suppressed: true,
            cmn: false,
            ..Default::default()
        };
        let mut fe = FrontEnd::new(&cfg).unwrap();
        fe.prepare();
        fe.push_samples(&tone(2400, 700.0, 2500.0));
        fe.flush();
        let frames = drain(&mut fe);
        assert!(!frames.is_empty());
        // 13*2 - 1
        assert!(frames.iter().all(|f| f.len() == 25));
    }

    #[test]
    fn silent_input_has_zero_power() {
        let cfg = AnalysisConfig {
            delta: false,
            cmn: false,
            ..Default::default()
        };
        let mut fe = FrontEnd::new(&cfg).unwrap();
        fe.prepare();
        fe.push_samples(&vec![0i16; 16000]);
        fe.flush();
        let _ = drain(&mut fe);
        assert_eq!(fe.avg_power(), 0.0);

        fe.prepare();
        fe.push_samples(&tone(16000, 440.0, 4000.0));
        assert!(fe.avg_power() > 15.0);
    }
}

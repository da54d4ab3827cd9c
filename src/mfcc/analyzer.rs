//! Core per-frame MFCC computation.
//!
//! One analyzer owns every precomputed table needed to turn a windowed
//! sample frame into a static feature vector: Hamming window, FFT plan,
//! mel filterbank (with optional VTLN warping and band cutoffs), DCT and
//! liftering tables. The per-frame path allocates nothing.

use crate::config::{AnalysisConfig, FeatureType};
use crate::error::{DecodeError, Result};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Convert a frequency in Hz to mel scale.
fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

/// Convert mel scale back to Hz.
fn mel_to_hz(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Static feature output of one frame.
pub struct FrameOutput {
    /// Base feature vector (cepstra [+ c0] [+ energy], or filterbank).
    pub base: Vec<f32>,
    /// Raw log frame energy, always computed for power-based rejection.
    pub raw_energy: f32,
    /// Index of the log-energy coefficient inside `base`, when present.
    pub energy_index: Option<usize>,
}

pub struct MfccAnalyzer {
    config: AnalysisConfig,
    fft: Arc<dyn Fft<f32>>,
    fft_n: usize,
    /// First and last usable FFT bins (1-based, following the filterbank
    /// construction).
    klo: usize,
    khi: usize,
    /// Lower channel index per FFT bin, -1 outside the band.
    lo_chan: Vec<i32>,
    /// Weight of the lower channel per FFT bin.
    lo_wt: Vec<f32>,
    hamming: Vec<f32>,
    /// DCT cos table, `mfcc_dim × fbank_num`.
    dct: Vec<f32>,
    lifter: Vec<f32>,
    sqrt2var: f32,
    log_fbank: bool,
    fbank_only: bool,
    noise: Option<Vec<f32>>,
    // scratch
    buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    fbank: Vec<f64>,
}

impl MfccAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;

        let mut fft_n = 2usize;
        while fft_n < config.frame_size {
            fft_n *= 2;
        }
        let nv2 = fft_n / 2;
        // mel frequency of bin k (1-based): 1127·ln(1 + (k-1)·fres·700/700)
        let fres = config.sample_freq as f32 / (fft_n as f32 * 700.0);
        let mel_of_bin = |k: usize| 1127.0 * (1.0 + (k as f32 - 1.0) * fres).ln();

        let max_chan = config.fbank_num + 1;
        let mut klo = 2usize;
        let mut khi = nv2;
        let mut mlo = 0.0f32;
        let mut mhi = mel_of_bin(nv2 + 1);
        if config.lopass >= 0 {
            mlo = hz_to_mel(config.lopass as f32);
            let k = (config.lopass as f32 / config.sample_freq as f32 * fft_n as f32 + 2.5) as usize;
            klo = k.max(2);
        }
        if config.hipass >= 0 {
            mhi = hz_to_mel(config.hipass as f32);
            let k = (config.hipass as f32 / config.sample_freq as f32 * fft_n as f32 + 0.5) as usize;
            khi = k.min(nv2);
        }

        // channel center frequencies, equally spaced on the mel axis
        let ms = mhi - mlo;
        let mut cf = vec![0.0f32; max_chan + 1];
        for (chan, c) in cf.iter_mut().enumerate().skip(1) {
            *c = (chan as f32 / max_chan as f32) * ms + mlo;
        }

        if (config.vtln_alpha - 1.0).abs() > f32::EPSILON {
            vtln_warp_centers(&mut cf, config, mlo, mhi, max_chan)?;
        }

        // map each FFT bin onto its lower channel and weight
        let mut lo_chan = vec![-1i32; nv2 + 1];
        let mut lo_wt = vec![0.0f32; nv2 + 1];
        let mut chan = 1usize;
        for k in 1..=nv2 {
            if k < klo || k > khi {
                lo_chan[k] = -1;
            } else {
                let melk = mel_of_bin(k);
                while chan <= max_chan && cf[chan] < melk {
                    chan += 1;
                }
                lo_chan[k] = chan as i32 - 1;
            }
        }
        for k in 1..=nv2 {
            if k < klo || k > khi {
                lo_wt[k] = 0.0;
            } else {
                let chan = lo_chan[k];
                if chan > 0 {
                    let c = chan as usize;
                    lo_wt[k] = (cf[c + 1] - mel_of_bin(k)) / (cf[c + 1] - cf[c]);
                } else {
                    lo_wt[k] = (cf[1] - mel_of_bin(k)) / (cf[1] - mlo);
                }
            }
        }

        let hamming: Vec<f32> = {
            let a = 2.0 * std::f32::consts::PI / (config.frame_size as f32 - 1.0);
            (0..config.frame_size)
                .map(|i| 0.54 - 0.46 * (a * i as f32).cos())
                .collect()
        };

        let sqrt2var = (2.0 / config.fbank_num as f32).sqrt();

        let mut dct = Vec::with_capacity(config.mfcc_dim * config.fbank_num);
        let b = std::f32::consts::PI / config.fbank_num as f32;
        for i in 1..=config.mfcc_dim {
            let c = i as f32 * b;
            for j in 1..=config.fbank_num {
                dct.push((c * (j as f32 - 0.5)).cos());
            }
        }

        let lifter: Vec<f32> = if config.lifter > 0 {
            let a = std::f32::consts::PI / config.lifter as f32;
            let b = config.lifter as f32 / 2.0;
            (0..config.mfcc_dim)
                .map(|i| 1.0 + b * ((i as f32 + 1.0) * a).sin())
                .collect()
        } else {
            vec![1.0; config.mfcc_dim]
        };

        let (fbank_only, log_fbank) = match config.base_type {
            FeatureType::Mfcc => (false, true),
            FeatureType::Fbank => (true, true),
            FeatureType::MelSpec => (true, false),
        };

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_n);
        let scratch_len = fft.get_inplace_scratch_len();

        log::debug!(
            "mfcc analyzer: fft {} points, bins {}..{}, {} channels",
            fft_n,
            klo,
            khi,
            config.fbank_num
        );

        Ok(Self {
            config: config.clone(),
            fft,
            fft_n,
            klo,
            khi,
            lo_chan,
            lo_wt,
            hamming,
            dct,
            lifter,
            sqrt2var,
            log_fbank,
            fbank_only,
            noise: None,
            buf: vec![Complex::new(0.0, 0.0); fft_n],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            fbank: vec![0.0; config.fbank_num + 1],
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_n
    }

    /// Install a noise magnitude spectrum (`fft_size` bins) for spectral
    /// subtraction; `None` disables it.
    pub fn set_noise_spectrum(&mut self, noise: Option<Vec<f32>>) -> Result<()> {
        if let Some(n) = &noise {
            if n.len() != self.fft_n {
                return Err(DecodeError::ConfigInvalid(format!(
                    "noise spectrum has {} bins, fft uses {}",
                    n.len(),
                    self.fft_n
                )));
            }
        }
        self.noise = noise;
        Ok(())
    }

    /// Compute the static features of one frame. `frame` holds exactly
    /// `frame_size` samples and is consumed as scratch.
    pub fn analyze(&mut self, frame: &mut [f32]) -> FrameOutput {
        let cfg = &self.config;
        debug_assert_eq!(frame.len(), cfg.frame_size);

        if cfg.zmean_frame {
            let mean = frame.iter().sum::<f32>() / frame.len() as f32;
            for x in frame.iter_mut() {
                *x -= mean;
            }
        }

        let raw_energy = log_raw_energy(frame);
        let mut energy = raw_energy;

        // pre-emphasis
        for i in (1..frame.len()).rev() {
            frame[i] -= frame[i - 1] * cfg.pre_emph;
        }
        frame[0] *= 1.0 - cfg.pre_emph;

        for (x, w) in frame.iter_mut().zip(&self.hamming) {
            *x *= w;
        }

        if cfg.energy && !cfg.raw_e {
            energy = log_raw_energy(frame);
        }

        self.fill_fbank(frame);
        let cfg = &self.config;

        let mut base;
        let mut energy_index = None;
        if self.fbank_only {
            base = (1..=cfg.fbank_num).map(|j| self.fbank[j] as f32).collect();
        } else {
            base = Vec::with_capacity(cfg.base_len());
            // DCT
            let mut k = 0;
            for i in 0..cfg.mfcc_dim {
                let mut acc = 0.0f64;
                for j in 1..=cfg.fbank_num {
                    acc += self.fbank[j] * self.dct[k] as f64;
                    k += 1;
                }
                base.push(acc as f32 * self.sqrt2var * self.lifter[i]);
            }
            if cfg.c0 {
                let s: f64 = self.fbank[1..=cfg.fbank_num].iter().sum();
                base.push(s as f32 * self.sqrt2var);
            }
            if cfg.energy {
                energy_index = Some(base.len());
                base.push(energy);
            }
        }

        FrameOutput {
            base,
            raw_energy,
            energy_index,
        }
    }

    fn fill_fbank(&mut self, frame: &[f32]) {
        let cfg = &self.config;
        for (i, b) in self.buf.iter_mut().enumerate() {
            *b = if i < frame.len() {
                Complex::new(frame[i], 0.0)
            } else {
                Complex::new(0.0, 0.0)
            };
        }
        self.fft
            .process_with_scratch(&mut self.buf, &mut self.scratch);

        if let Some(noise) = &self.noise {
            for (b, &np) in self.buf.iter_mut().zip(noise.iter()) {
                let p = b.norm();
                if p <= 0.0 {
                    continue;
                }
                let sub = p * p - cfg.ss_alpha * np * np;
                let h = if sub < 0.0 {
                    cfg.ss_floor
                } else {
                    sub.sqrt() / p
                };
                *b = *b * h;
            }
        }

        for v in self.fbank.iter_mut() {
            *v = 0.0;
        }
        for k in self.klo..=self.khi {
            let c = self.buf[k - 1];
            let a = if cfg.use_power {
                (c.re * c.re + c.im * c.im) as f64
            } else {
                ((c.re * c.re + c.im * c.im) as f64).sqrt()
            };
            let bin = self.lo_chan[k];
            let lo = self.lo_wt[k] as f64 * a;
            if bin > 0 {
                self.fbank[bin as usize] += lo;
            }
            if (bin as usize) < cfg.fbank_num {
                self.fbank[(bin + 1) as usize] += a - lo;
            }
        }

        if self.log_fbank {
            for v in self.fbank[1..=cfg.fbank_num].iter_mut() {
                *v = v.max(1.0).ln();
            }
        }
    }
}

/// Log of the frame's sum of squares, floored to keep silence finite.
fn log_raw_energy(frame: &[f32]) -> f32 {
    let e: f64 = frame.iter().map(|&x| (x as f64) * (x as f64)).sum();
    (e.max(1.0)).ln() as f32
}

/// Warp filterbank center frequencies by the VTLN piecewise-linear mapping.
fn vtln_warp_centers(
    cf: &mut [f32],
    cfg: &AnalysisConfig,
    mlo: f32,
    mhi: f32,
    max_chan: usize,
) -> Result<()> {
    let minf = mel_to_hz(mlo);
    let maxf = mel_to_hz(mhi);
    if cfg.vtln_upper > maxf {
        return Err(DecodeError::ConfigInvalid(format!(
            "VTLN upper cut-off greater than upper frequency bound: {:.1} > {:.1}",
            cfg.vtln_upper, maxf
        )));
    }
    if cfg.vtln_lower < minf {
        return Err(DecodeError::ConfigInvalid(format!(
            "VTLN lower cut-off smaller than lower frequency bound: {:.1} < {:.1}",
            cfg.vtln_lower, minf
        )));
    }

    let scale = 1.0 / cfg.vtln_alpha;
    let cu = cfg.vtln_upper * 2.0 / (1.0 + scale);
    let cl = cfg.vtln_lower * 2.0 / (1.0 + scale);
    let au = (maxf - cu * scale) / (maxf - cu);
    let al = (cl * scale - minf) / (cl - minf);

    for c in cf.iter_mut().take(max_chan + 1).skip(1) {
        let orig = mel_to_hz(*c);
        let warped = if orig > cu {
            au * (orig - cu) + scale * cu
        } else if orig < cl {
            al * (orig - minf) + minf
        } else {
            scale * orig
        };
        *c = hz_to_mel(warped);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    fn basic_config() -> AnalysisConfig {
        AnalysisConfig {
            delta: false,
            energy: true,
            cmn: false,
            ..Default::default()
        }
    }

    #[test]
    fn output_geometry() {
        let cfg = basic_config();
        let mut an = MfccAnalyzer::new(&cfg).unwrap();
        assert_eq!(an.fft_size(), 512);
        let mut frame = sine(440.0, 16000.0, cfg.frame_size, 1000.0);
        let out = an.analyze(&mut frame);
        assert_eq!(out.base.len(), 13);
        assert_eq!(out.energy_index, Some(12));
        assert!(out.base.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn tone_beats_silence_in_energy() {
        let cfg = basic_config();
        let mut an = MfccAnalyzer::new(&cfg).unwrap();
        let mut loud = sine(300.0, 16000.0, cfg.frame_size, 2000.0);
        let mut quiet = vec![0.0f32; cfg.frame_size];
        let e_loud = an.analyze(&mut loud).raw_energy;
        let e_quiet = an.analyze(&mut quiet).raw_energy;
        assert!(e_loud > 15.0);
        assert_eq!(e_quiet, 0.0);
    }

    #[test]
    fn distinct_tones_give_distinct_cepstra() {
        let cfg = basic_config();
        let mut an = MfccAnalyzer::new(&cfg).unwrap();
        let mut a = sine(300.0, 16000.0, cfg.frame_size, 1000.0);
        let mut b = sine(3000.0, 16000.0, cfg.frame_size, 1000.0);
        let va = an.analyze(&mut a).base;
        let vb = an.analyze(&mut b).base;
        let dist: f32 = va
            .iter()
            .zip(&vb)
            .take(cfg.mfcc_dim)
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        assert!(dist > 1.0, "cepstral distance {} too small", dist);
    }

    #[test]
    fn melspec_skips_log_and_dct() {
        let mut cfg = basic_config();
        cfg.base_type = FeatureType::MelSpec;
        cfg.energy = false;
        cfg.mfcc_dim = cfg.fbank_num;
        let mut an = MfccAnalyzer::new(&cfg).unwrap();
        let mut frame = sine(500.0, 16000.0, cfg.frame_size, 1000.0);
        let out = an.analyze(&mut frame);
        assert_eq!(out.base.len(), cfg.fbank_num);
        // linear spectrum values are non-negative
        assert!(out.base.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn vtln_cutoffs_validated() {
        let mut cfg = basic_config();
        cfg.vtln_alpha = 1.1;
        cfg.vtln_lower = 100.0;
        cfg.vtln_upper = 100_000.0;
        assert!(MfccAnalyzer::new(&cfg).is_err());

        cfg.vtln_upper = 7000.0;
        cfg.vtln_lower = -5.0;
        assert!(MfccAnalyzer::new(&cfg).is_err());

        cfg.vtln_lower = 300.0;
        assert!(MfccAnalyzer::new(&cfg).is_ok());
    }

    #[test]
    fn spectral_subtraction_changes_spectrum() {
        let cfg = basic_config();
        let mut an = MfccAnalyzer::new(&cfg).unwrap();

        let mut frame = sine(1000.0, 16000.0, cfg.frame_size, 800.0);
        let plain = an.analyze(&mut frame.clone()).base;

        // overwhelming noise estimate floors every bin
        let n = an.fft_size();
        an.set_noise_spectrum(Some(vec![1.0e6; n])).unwrap();
        let sub = an.analyze(&mut frame).base;
        assert_ne!(plain, sub);

        assert!(an.set_noise_spectrum(Some(vec![0.0; 3])).is_err());
    }
}

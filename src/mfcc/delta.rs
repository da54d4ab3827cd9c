//! Delta coefficient cycle buffer.
//!
//! Holds `2·win + 1` feature vectors with per-slot valid flags. Each
//! `proceed` stores a new vector and, once the center slot is populated,
//! emits the center vector with its delta appended:
//!
//! `Δ[i] = Σ_θ θ·(x[+θ] − x[−θ]) / (2·Σθ²)`
//!
//! Missing neighbors at the stream edges are replicated from the last valid
//! slot. `flush` drains the remaining centered frames at end of stream.
//! Acceleration uses a second buffer fed with the delta part.

pub struct DeltaBuffer {
    veclen: usize,
    win: usize,
    len: usize,
    store: usize,
    norm: f32,
    /// Each slot holds the input vector plus its computed delta.
    slots: Vec<Vec<f32>>,
    valid: Vec<bool>,
}

impl DeltaBuffer {
    pub fn new(veclen: usize, win: usize) -> Self {
        let len = win * 2 + 1;
        let norm: f32 = 2.0 * (1..=win).map(|t| (t * t) as f32).sum::<f32>();
        Self {
            veclen,
            win,
            len,
            store: 0,
            norm,
            slots: vec![vec![0.0; veclen * 2]; len],
            valid: vec![false; len],
        }
    }

    /// Clear all slots for a new utterance.
    pub fn reset(&mut self) {
        self.store = 0;
        for v in self.valid.iter_mut() {
            *v = false;
        }
    }

    fn calc(&mut self, cur: usize) {
        for n in 0..self.veclen {
            let mut sum = 0.0f32;
            let mut last_left = cur;
            let mut last_right = cur;
            for theta in 1..=self.win {
                let p = (cur + self.len - theta) % self.len;
                let a1 = if self.valid[p] {
                    last_left = p;
                    self.slots[p][n]
                } else {
                    self.slots[last_left][n]
                };
                let p = (cur + theta) % self.len;
                let a2 = if self.valid[p] {
                    last_right = p;
                    self.slots[p][n]
                } else {
                    self.slots[last_right][n]
                };
                sum += theta as f32 * (a2 - a1);
            }
            self.slots[cur][self.veclen + n] = sum / self.norm;
        }
    }

    fn emit(&mut self, cur: usize) -> Vec<f32> {
        self.calc(cur);
        self.slots[cur].clone()
    }

    /// Store a vector; returns the centered vector with delta appended once
    /// enough context has accumulated.
    pub fn proceed(&mut self, vec: &[f32]) -> Option<Vec<f32>> {
        debug_assert_eq!(vec.len(), self.veclen);
        self.slots[self.store][..self.veclen].copy_from_slice(vec);
        self.valid[self.store] = true;

        let cur = (self.store + self.len - self.win) % self.len;
        let out = if self.valid[cur] {
            Some(self.emit(cur))
        } else {
            None
        };

        self.store = (self.store + 1) % self.len;
        out
    }

    /// Emit one remaining centered frame at end of stream; call repeatedly
    /// until `None`.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        self.valid[self.store] = false;

        let cur = (self.store + self.len - self.win) % self.len;
        let out = if self.valid[cur] {
            Some(self.emit(cur))
        } else {
            None
        };

        self.store = (self.store + 1) % self.len;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(db: &mut DeltaBuffer, frames: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for f in frames {
            if let Some(v) = db.proceed(f) {
                out.push(v);
            }
        }
        while let Some(v) = db.flush() {
            out.push(v);
        }
        out
    }

    #[test]
    fn emits_one_output_per_input() {
        let mut db = DeltaBuffer::new(1, 2);
        let frames: Vec<Vec<f32>> = (0..7).map(|i| vec![i as f32]).collect();
        let out = drain(&mut db, &frames);
        assert_eq!(out.len(), 7);
        // statics come back in order
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v[0], i as f32);
        }
    }

    #[test]
    fn linear_ramp_gives_unit_slope_in_the_middle() {
        let mut db = DeltaBuffer::new(1, 2);
        let frames: Vec<Vec<f32>> = (0..9).map(|i| vec![i as f32]).collect();
        let out = drain(&mut db, &frames);
        // interior frames have full context: delta of x[t]=t is exactly 1
        for v in &out[2..7] {
            assert!((v[1] - 1.0).abs() < 1e-6, "delta {} != 1", v[1]);
        }
        // edge frames replicate neighbors, damping the slope
        assert!(out[0][1] < 1.0);
        assert!(out[8][1] < 1.0);
    }

    #[test]
    fn too_short_input_yields_nothing() {
        let mut db = DeltaBuffer::new(2, 2);
        assert!(db.proceed(&[1.0, 2.0]).is_none());
        assert!(db.flush().is_none());
    }

    #[test]
    fn reset_clears_history() {
        let mut db = DeltaBuffer::new(1, 1);
        let _ = db.proceed(&[5.0]);
        let _ = db.proceed(&[6.0]);
        db.reset();
        assert!(db.proceed(&[0.0]).is_none());
    }
}

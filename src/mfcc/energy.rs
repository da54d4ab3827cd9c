//! Live energy normalization.
//!
//! On live input the true utterance maximum is unknown until the end, so
//! each utterance is normalized against the maximum of the previous one:
//! `E ← 1 − (max_last − E)·escale`, floored at `max_last − silFloor·ln10/10`.

const LN10: f32 = std::f32::consts::LN_10;

pub struct EnergyNormalizer {
    escale: f32,
    sil_floor: f32,
    max: f32,
    max_last: f32,
    min_last: f32,
}

impl EnergyNormalizer {
    pub fn new(escale: f32, sil_floor: f32) -> Self {
        Self {
            escale,
            sil_floor,
            max: 5.0,
            max_last: 5.0,
            min_last: 0.0,
        }
    }

    /// Carry the previous utterance's maximum over and reset the tracker.
    pub fn prepare(&mut self) {
        self.max_last = self.max;
        self.min_last = self.max - (self.sil_floor * LN10) / 10.0;
        self.max = 0.0;
    }

    /// Normalize one raw log energy value.
    pub fn normalize(&mut self, e: f32) -> f32 {
        if self.max < e {
            self.max = e;
        }
        let e = e.max(self.min_last);
        1.0 - (self.max_last - e) * self.escale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_of_previous_utterance_maps_to_one() {
        let mut en = EnergyNormalizer::new(1.0, 50.0);
        en.prepare();
        // first utterance peaks at 20
        en.normalize(18.0);
        en.normalize(20.0);
        en.prepare();
        // a frame at the previous peak normalizes to 1.0
        assert!((en.normalize(20.0) - 1.0).abs() < 1e-6);
        // quieter frames fall below 1.0
        assert!(en.normalize(15.0) < 1.0);
    }

    #[test]
    fn silence_is_floored() {
        let mut en = EnergyNormalizer::new(0.1, 10.0);
        en.prepare();
        en.normalize(30.0);
        en.prepare();
        let floor = en.normalize(-100.0);
        let also_floor = en.normalize(-5.0);
        assert!((floor - also_floor).abs() < 1e-6);
    }
}

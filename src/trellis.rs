//! Word trellis: pass-1 survivors indexed for pass-2 lookup.
//!
//! During pass 1 every surviving word end is appended as an immutable
//! [`TrellisWord`]. At end of pass 1 the store is finalized in a fixed
//! sequence — `relocate`, `discount_pescore`, `discount_lm`, `sort` —
//! after which only frame iteration and binary search remain available.
//! Back references between trellis words use arena ids, so the trellis can
//! be dropped wholesale at end of utterance.

use crate::config::TrellisLookup;
use crate::dict::WordId;
use crate::hmm::LOG_ZERO;

pub type TrellisWordId = u32;

/// One surviving word end from pass 1. Never mutated after creation except
/// by the score-discount passes.
#[derive(Debug, Clone)]
pub struct TrellisWord {
    pub word: WordId,
    pub end_frame: u32,
    /// Accumulated score from utterance start through this word end.
    pub back_score: f32,
    pub last_word: Option<WordId>,
    pub last_tre: Option<TrellisWordId>,
    /// LM score applied to this word on pass 1.
    pub lm_score: f32,
}

#[derive(Default)]
pub struct Trellis {
    atoms: Vec<TrellisWord>,
    /// Per-frame atom ids, built by `relocate`.
    frames: Vec<Vec<TrellisWordId>>,
    num_frames: usize,
    sorted: bool,
}

impl Trellis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything for a new utterance.
    pub fn prepare(&mut self) {
        self.atoms.clear();
        self.frames.clear();
        self.num_frames = 0;
        self.sorted = false;
    }

    pub fn store(&mut self, atom: TrellisWord) -> TrellisWordId {
        debug_assert!(!self.sorted, "trellis is frozen after sort()");
        self.atoms.push(atom);
        (self.atoms.len() - 1) as TrellisWordId
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn at(&self, id: TrellisWordId) -> &TrellisWord {
        &self.atoms[id as usize]
    }

    /// Build the per-frame index over `[0, num_frames)`. Word ends at or
    /// beyond `num_frames` (segmentation trigger overrun) are dropped.
    pub fn relocate(&mut self, num_frames: usize) {
        self.num_frames = num_frames;
        self.frames = vec![Vec::new(); num_frames];
        for (i, atom) in self.atoms.iter().enumerate() {
            if (atom.end_frame as usize) < num_frames {
                self.frames[atom.end_frame as usize].push(i as TrellisWordId);
            }
        }
    }

    /// Subtract each word's end-frame acoustic score, to be recomputed
    /// with the true cross-word context on pass 2.
    pub fn discount_pescore(&mut self, mut outprob: impl FnMut(&TrellisWord) -> f32) {
        for frame in &self.frames {
            for &id in frame {
                let p = outprob(&self.atoms[id as usize]);
                self.atoms[id as usize].back_score -= p;
            }
        }
    }

    /// Subtract the pass-1 LM score; pass 2 re-applies its own.
    pub fn discount_lm(&mut self) {
        for frame in &self.frames {
            for &id in frame {
                let atom = &mut self.atoms[id as usize];
                atom.back_score -= atom.lm_score;
            }
        }
    }

    /// Sort each frame by word id to enable binary search.
    pub fn sort(&mut self) {
        let atoms = &self.atoms;
        for frame in &mut self.frames {
            frame.sort_by_key(|&id| atoms[id as usize].word);
        }
        self.sorted = true;
    }

    /// Atom ids ending at frame `t`, in word-id order after `sort`.
    pub fn frame(&self, t: usize) -> &[TrellisWordId] {
        static EMPTY: [TrellisWordId; 0] = [];
        self.frames.get(t).map(|v| v.as_slice()).unwrap_or(&EMPTY)
    }

    /// Binary search for a word ending at frame `t`. Under
    /// [`TrellisLookup::WordPairBest`] the whole id group is scanned and
    /// the best back score wins; otherwise the first match is returned.
    pub fn lookup(&self, t: usize, word: WordId, mode: TrellisLookup) -> Option<TrellisWordId> {
        debug_assert!(self.sorted, "lookup before sort()");
        let frame = self.frames.get(t)?;
        if frame.is_empty() {
            return None;
        }
        let idx = frame
            .binary_search_by_key(&word, |&id| self.atoms[id as usize].word)
            .ok()?;
        match mode {
            TrellisLookup::FirstMatch => {
                // binary search lands anywhere in the group: step to front
                let mut i = idx;
                while i > 0 && self.atoms[frame[i - 1] as usize].word == word {
                    i -= 1;
                }
                Some(frame[i])
            }
            TrellisLookup::WordPairBest => {
                let mut best = frame[idx];
                let mut best_score = self.atoms[best as usize].back_score;
                let mut i = idx;
                while i > 0 && self.atoms[frame[i - 1] as usize].word == word {
                    i -= 1;
                    let s = self.atoms[frame[i] as usize].back_score;
                    if s > best_score {
                        best_score = s;
                        best = frame[i];
                    }
                }
                let mut i = idx + 1;
                while i < frame.len() && self.atoms[frame[i] as usize].word == word {
                    let s = self.atoms[frame[i] as usize].back_score;
                    if s > best_score {
                        best_score = s;
                        best = frame[i];
                    }
                    i += 1;
                }
                Some(best)
            }
        }
    }

    /// Best-scoring atom at frame `t`.
    pub fn best_at_frame(&self, t: usize) -> Option<TrellisWordId> {
        let frame = self.frames.get(t)?;
        let mut best: Option<TrellisWordId> = None;
        let mut best_score = LOG_ZERO;
        for &id in frame {
            let s = self.atoms[id as usize].back_score;
            if best.is_none() || s > best_score {
                best = Some(id);
                best_score = s;
            }
        }
        best
    }

    /// Last frame holding any word end.
    pub fn last_frame_with_words(&self) -> Option<usize> {
        (0..self.num_frames).rev().find(|&t| !self.frames[t].is_empty())
    }

    /// First frame holding any word end.
    pub fn first_frame_with_words(&self) -> Option<usize> {
        (0..self.num_frames).find(|&t| !self.frames[t].is_empty())
    }

    /// Walk the predecessor chain from an atom, returning word ids in time
    /// order.
    pub fn backtrack(&self, from: TrellisWordId) -> Vec<WordId> {
        let mut out = Vec::new();
        let mut cur = Some(from);
        while let Some(id) = cur {
            let atom = &self.atoms[id as usize];
            out.push(atom.word);
            cur = atom.last_tre;
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(word: WordId, t: u32, score: f32) -> TrellisWord {
        TrellisWord {
            word,
            end_frame: t,
            back_score: score,
            last_word: None,
            last_tre: None,
            lm_score: -1.0,
        }
    }

    #[test]
    fn relocate_counts_and_bounds() {
        let mut tr = Trellis::new();
        tr.store(atom(0, 0, -10.0));
        tr.store(atom(1, 2, -20.0));
        tr.store(atom(2, 9, -5.0)); // beyond the final length, dropped
        tr.relocate(5);
        assert_eq!(tr.frame(0).len(), 1);
        assert_eq!(tr.frame(2).len(), 1);
        assert_eq!(tr.frame(4).len(), 0);
        assert_eq!(tr.last_frame_with_words(), Some(2));
        assert_eq!(tr.first_frame_with_words(), Some(0));
    }

    #[test]
    fn frames_sorted_by_word_id_after_sort() {
        let mut tr = Trellis::new();
        for (w, s) in [(3u32, -1.0f32), (1, -2.0), (2, -3.0), (1, -0.5)] {
            tr.store(atom(w, 0, s));
        }
        tr.relocate(1);
        tr.sort();
        let words: Vec<WordId> = tr.frame(0).iter().map(|&id| tr.at(id).word).collect();
        assert_eq!(words, vec![1, 1, 2, 3]);
        // every present id is found
        for w in [1, 2, 3] {
            assert!(tr.lookup(0, w, TrellisLookup::FirstMatch).is_some());
        }
        assert!(tr.lookup(0, 7, TrellisLookup::FirstMatch).is_none());
    }

    #[test]
    fn word_pair_lookup_returns_group_best() {
        let mut tr = Trellis::new();
        tr.store(atom(1, 0, -2.0));
        tr.store(atom(1, 0, -0.5));
        tr.store(atom(1, 0, -9.0));
        tr.relocate(1);
        tr.sort();
        let best = tr.lookup(0, 1, TrellisLookup::WordPairBest).unwrap();
        assert_eq!(tr.at(best).back_score, -0.5);
    }

    #[test]
    fn discounts_subtract_in_order() {
        let mut tr = Trellis::new();
        tr.store(atom(0, 0, -10.0));
        tr.relocate(1);
        tr.discount_pescore(|_| -3.0);
        tr.discount_lm();
        tr.sort();
        let id = tr.lookup(0, 0, TrellisLookup::FirstMatch).unwrap();
        // -10 - (-3) - (-1) = -6
        assert_eq!(tr.at(id).back_score, -6.0);
    }

    #[test]
    fn backtrack_returns_time_order() {
        let mut tr = Trellis::new();
        let a = tr.store(atom(5, 0, -1.0));
        let mut b = atom(6, 1, -2.0);
        b.last_tre = Some(a);
        let b = tr.store(b);
        assert_eq!(tr.backtrack(b), vec![5, 6]);
    }
}

//! N-gram model storage and probability lookup.
//!
//! Probabilities are kept exactly as the base-10 logs read from the ARPA
//! file and converted to natural logs at lookup, so a read → write → read
//! cycle reproduces bit-identical values. Lookup follows standard Katz
//! back-off: longest matching context wins, shorter contexts are weighted by
//! the back-off factors along the way.

use super::LmError;
use std::collections::HashMap;

const LN10: f32 = std::f32::consts::LN_10;

/// One N-gram trie entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NgramEntry {
    /// log10 probability as read from file.
    pub prob10: f32,
    /// log10 back-off weight, 0.0 when absent.
    pub bow10: f32,
    /// Child entries of the next order, sorted by word id.
    pub children: Vec<(u32, NgramEntry)>,
}

impl NgramEntry {
    pub fn new(prob10: f32) -> Self {
        Self {
            prob10,
            bow10: 0.0,
            children: Vec::new(),
        }
    }

    fn child(&self, w: u32) -> Option<&NgramEntry> {
        self.children
            .binary_search_by_key(&w, |(id, _)| *id)
            .ok()
            .map(|i| &self.children[i].1)
    }

    /// Fetch or create the child entry for `w`, updating its probability.
    /// Used by the ARPA reader and by programmatic model construction.
    pub fn child_mut_or_insert(&mut self, w: u32, prob10: f32) -> &mut NgramEntry {
        match self.children.binary_search_by_key(&w, |(id, _)| *id) {
            Ok(i) => {
                let e = &mut self.children[i].1;
                e.prob10 = prob10;
                e
            }
            Err(i) => {
                self.children.insert(i, (w, NgramEntry::new(prob10)));
                &mut self.children[i].1
            }
        }
    }
}

/// One direction of N-gram probabilities over a shared vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct NgramSet {
    /// Maximum order.
    pub order: usize,
    /// Unigram entries, indexed by word id.
    pub unigrams: Vec<NgramEntry>,
    /// Number of entries per order, kept for ARPA round-trips.
    pub counts: Vec<usize>,
}

impl NgramSet {
    /// Trie node for a full context path, if present.
    fn node(&self, context: &[u32]) -> Option<&NgramEntry> {
        let mut cur = self.unigrams.get(context.first().copied()? as usize)?;
        for &w in &context[1..] {
            cur = cur.child(w)?;
        }
        Some(cur)
    }

    /// Natural-log unigram probability.
    pub fn uni(&self, w: u32) -> f32 {
        match self.unigrams.get(w as usize) {
            Some(e) => e.prob10 * LN10,
            None => crate::hmm::LOG_ZERO,
        }
    }

    /// Largest unigram log probability, used for LM look-ahead factoring.
    pub fn max_unigram(&self) -> f32 {
        self.unigrams
            .iter()
            .map(|e| e.prob10 * LN10)
            .fold(crate::hmm::LOG_ZERO, f32::max)
    }

    /// Natural-log probability of `w` given `context` (oldest first in
    /// model direction), with back-off. Context longer than order−1 is
    /// truncated from the old end.
    pub fn prob(&self, context: &[u32], w: u32) -> f32 {
        let keep = self.order.saturating_sub(1).min(context.len());
        self.prob_backoff(&context[context.len() - keep..], w)
    }

    fn prob_backoff(&self, ctx: &[u32], w: u32) -> f32 {
        if ctx.is_empty() {
            return self.uni(w);
        }
        match self.node(ctx) {
            Some(node) => match node.child(w) {
                Some(hit) => hit.prob10 * LN10,
                None => node.bow10 * LN10 + self.prob_backoff(&ctx[1..], w),
            },
            None => self.prob_backoff(&ctx[1..], w),
        }
    }
}

/// A loaded N-gram language model: shared vocabulary plus forward and/or
/// backward probability sets.
pub struct NgramModel {
    names: Vec<String>,
    by_name: HashMap<String, u32>,
    /// Left-to-right probabilities (pass 1).
    pub forward: Option<NgramSet>,
    /// Right-to-left probabilities (pass 2 rescoring, preferred).
    pub backward: Option<NgramSet>,
    unk_id: Option<u32>,
}

impl NgramModel {
    pub fn new(
        names: Vec<String>,
        forward: Option<NgramSet>,
        backward: Option<NgramSet>,
    ) -> Result<Self, LmError> {
        if forward.is_none() && backward.is_none() {
            return Err(LmError::Mismatch(
                "at least one of forward/backward n-gram required".into(),
            ));
        }
        let by_name: HashMap<String, u32> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        let unk_id = by_name
            .get("<unk>")
            .or_else(|| by_name.get("<UNK>"))
            .copied();
        Ok(Self {
            names,
            by_name,
            forward,
            backward,
            unk_id,
        })
    }

    pub fn num_words(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, id: u32) -> &str {
        &self.names[id as usize]
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Id for a dictionary word name, falling back to the unknown-word
    /// class when present.
    pub fn id_or_unk(&self, name: &str) -> Option<u32> {
        self.id(name).or(self.unk_id)
    }

    /// Pass-1 probability of `w` after `prev` (natural log). With only a
    /// backward model loaded this degrades to the unigram, which pass 2
    /// replaces with exact scores.
    pub fn pass1_prob(&self, prev: Option<u32>, w: u32) -> f32 {
        match (&self.forward, prev) {
            (Some(fw), Some(p)) => fw.prob(&[p], w),
            (Some(fw), None) => fw.uni(w),
            (None, _) => self.backward.as_ref().unwrap().uni(w),
        }
    }

    /// Unigram probability used for tree factoring (natural log).
    pub fn factoring_uni(&self, w: u32) -> f32 {
        match &self.forward {
            Some(fw) => fw.uni(w),
            None => self.backward.as_ref().unwrap().uni(w),
        }
    }

    /// Backward probability of `w` given the words following it in time
    /// (`future`, earliest first). Uses the backward set when loaded,
    /// otherwise converts from the forward set.
    pub fn backward_prob(&self, w: u32, future: &[u32]) -> f32 {
        if let Some(bw) = &self.backward {
            // reverse-model context reads the future right-to-left
            let ctx: Vec<u32> = future.iter().rev().copied().collect();
            return bw.prob(&ctx, w);
        }
        let fw = self.forward.as_ref().unwrap();
        // P(w | future) = P(w, future) - P(future), chained on the forward
        // model up to its order
        let mut seq = Vec::with_capacity(future.len() + 1);
        seq.push(w);
        seq.extend_from_slice(future);
        let mut p1 = 0.0;
        for i in 1..fw.order {
            if i >= seq.len() {
                break;
            }
            p1 += fw.prob(&seq[1..i], seq[i]);
        }
        let mut p2 = 0.0;
        for i in 0..fw.order {
            if i >= seq.len() {
                break;
            }
            p2 += fw.prob(&seq[..i], seq[i]);
        }
        p2 - p1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_set() -> NgramSet {
        // vocab: 0=<s> 1=a 2=b 3=</s>
        let mut unigrams = vec![
            NgramEntry::new(-99.0),
            NgramEntry::new(-0.5),
            NgramEntry::new(-0.7),
            NgramEntry::new(-0.9),
        ];
        unigrams[0].bow10 = -0.3;
        unigrams[1].bow10 = -0.2;
        unigrams[0].child_mut_or_insert(1, -0.1); // <s> a
        unigrams[1].child_mut_or_insert(2, -0.15); // a b
        unigrams[2].child_mut_or_insert(3, -0.05); // b </s>
        NgramSet {
            order: 2,
            counts: vec![4, 3],
            unigrams,
        }
    }

    #[test]
    fn backoff_lookup() {
        let set = tiny_set();
        // exact bigram
        assert!((set.prob(&[1], 2) - (-0.15 * LN10)).abs() < 1e-6);
        // backed-off bigram: bow(a) + uni(</s>)
        assert!((set.prob(&[1], 3) - ((-0.2 - 0.9) * LN10)).abs() < 1e-6);
        // no context node at all: plain unigram
        assert!((set.prob(&[3], 1) - (-0.5 * LN10)).abs() < 1e-6);
        // long context is truncated to order-1
        assert!((set.prob(&[0, 1], 2) - (-0.15 * LN10)).abs() < 1e-6);
    }

    #[test]
    fn forward_to_backward_conversion() {
        let names = vec![
            "<s>".to_string(),
            "a".to_string(),
            "b".to_string(),
            "</s>".to_string(),
        ];
        let model = NgramModel::new(names, Some(tiny_set()), None).unwrap();
        // P(a | future=[b]) = P(a) + P(b|a) - P(b)
        let got = model.backward_prob(1, &[2]);
        let expect = (-0.5 + -0.15 - -0.7) * LN10;
        assert!((got - expect).abs() < 1e-5);
    }

    #[test]
    fn backward_model_context_order() {
        // backward set: P_bw(a | future b) stored as bigram b -> a
        let mut unigrams = vec![
            NgramEntry::new(-1.0),
            NgramEntry::new(-1.0),
            NgramEntry::new(-1.0),
        ];
        unigrams[2].child_mut_or_insert(1, -0.2);
        let bw = NgramSet {
            order: 2,
            counts: vec![3, 1],
            unigrams,
        };
        let names = vec!["x".to_string(), "a".to_string(), "b".to_string()];
        let model = NgramModel::new(names, None, Some(bw)).unwrap();
        let got = model.backward_prob(1, &[2]);
        assert!((got - (-0.2 * LN10)).abs() < 1e-6);
    }
}

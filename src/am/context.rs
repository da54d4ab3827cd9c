//! Cross-word triphone resolution.
//!
//! At a word beginning the concrete triphone depends on the final phone of
//! the preceding word. Resolution is cached per lexicon node keyed by the
//! previous word id and survives until the next utterance (caches) or the
//! next grammar change (node numbering). The miss path synthesizes
//! `prev-base+right`; failing that it falls back to the biphone itself,
//! then to its pseudo state set, warning once per unknown context.

use crate::dict::{WordId, WordLexicon};
use crate::hmm::{add_left_context, HmmSet, LogId, LogicalBody, PhysId, PseudoId, StateId};
use crate::lexicon::NodeId;
use std::collections::HashSet;

/// Outcome of a context resolution: a concrete model or a pseudo set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRef {
    Defined(PhysId),
    Pseudo(PseudoId),
}

impl ResolvedRef {
    /// States to score at a given state position.
    pub fn states_at<'m>(&self, hmm: &'m HmmSet, loc: usize) -> ResolvedStates<'m> {
        match *self {
            ResolvedRef::Defined(p) => {
                let states = &hmm.physical(p).states;
                ResolvedStates::One(states[loc.min(states.len() - 1)])
            }
            ResolvedRef::Pseudo(ps) => {
                let sets = &hmm.pseudo_phone(ps).state_sets;
                ResolvedStates::Set(&sets[loc.min(sets.len() - 1)])
            }
        }
    }
}

pub enum ResolvedStates<'m> {
    One(StateId),
    Set(&'m [StateId]),
}

#[derive(Clone, Copy)]
struct CacheEntry {
    last_word: Option<WordId>,
    resolved: ResolvedRef,
}

pub struct ContextResolver {
    cache: Vec<Option<CacheEntry>>,
    warned: HashSet<String>,
}

impl ContextResolver {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            cache: vec![None; num_nodes],
            warned: HashSet::new(),
        }
    }

    /// Resolve the model for a word-beginning node given the previous word.
    pub fn resolve(
        &mut self,
        hmm: &HmmSet,
        dict: &WordLexicon,
        base: LogId,
        last_word: Option<WordId>,
        node: NodeId,
    ) -> ResolvedRef {
        if let Some(entry) = &self.cache[node as usize] {
            if entry.last_word == last_word {
                return entry.resolved;
            }
        }
        let resolved = self.resolve_uncached(hmm, dict, base, last_word);
        self.cache[node as usize] = Some(CacheEntry {
            last_word,
            resolved,
        });
        resolved
    }

    /// Resolve a single-phone word node: left context from the previous
    /// word, right context still open, so prefer the warped pseudo set.
    pub fn resolve_both(
        &mut self,
        hmm: &HmmSet,
        dict: &WordLexicon,
        base: LogId,
        last_word: Option<WordId>,
        node: NodeId,
    ) -> ResolvedRef {
        if let Some(entry) = &self.cache[node as usize] {
            if entry.last_word == last_word {
                return entry.resolved;
            }
        }
        let base_name = &hmm.logical(base).name;
        let resolved = match last_word {
            Some(w) => {
                let lc = dict.last_phone_base(w);
                let name = add_left_context(base_name, lc);
                match hmm.pseudo_id(&name) {
                    Some(ps) => ResolvedRef::Pseudo(ps),
                    None => self.resolve_uncached(hmm, dict, base, last_word),
                }
            }
            None => self.fallback(hmm, base),
        };
        self.cache[node as usize] = Some(CacheEntry {
            last_word,
            resolved,
        });
        resolved
    }

    fn resolve_uncached(
        &mut self,
        hmm: &HmmSet,
        dict: &WordLexicon,
        base: LogId,
        last_word: Option<WordId>,
    ) -> ResolvedRef {
        let base_name = &hmm.logical(base).name;
        if let Some(w) = last_word {
            let lc = dict.last_phone_base(w);
            let name = add_left_context(base_name, lc);
            if let Some(id) = hmm.logical_id(&name) {
                if let LogicalBody::Defined(p) = hmm.logical(id).body {
                    return ResolvedRef::Defined(p);
                }
            }
            if self.warned.insert(name.clone()) {
                log::warn!(
                    "cross-word triphone {} not found, falling back to {}",
                    name,
                    base_name
                );
            }
        }
        self.fallback(hmm, base)
    }

    fn fallback(&self, hmm: &HmmSet, base: LogId) -> ResolvedRef {
        match hmm.logical(base).body {
            LogicalBody::Defined(p) => ResolvedRef::Defined(p),
            LogicalBody::Pseudo(ps) => ResolvedRef::Pseudo(ps),
        }
    }

    /// Drop every cached resolution (grammar change or new numbering).
    pub fn clear(&mut self, num_nodes: usize) {
        self.cache.clear();
        self.cache.resize_with(num_nodes, || None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::binio::left_to_right_trans;
    use crate::hmm::{Gaussian, HmmState, MixturePdf};

    fn cd_model() -> HmmSet {
        let mut set = HmmSet::new(1);
        for name in ["s-k+i", "k+i", "sil", "s"] {
            let d = set.add_density(Gaussian::from_variance(vec![0.0], vec![1.0]));
            let s = set.add_state(HmmState {
                streams: vec![MixturePdf {
                    weights: vec![0.0],
                    dens: vec![d],
                }],
                stream_weights: vec![1.0],
            });
            let t = set.add_transition(left_to_right_trans(1, 0.5));
            set.add_physical(name, vec![s], t).unwrap();
        }
        set.define_logical_from_physical();
        set
    }

    #[test]
    fn exact_triphone_preferred_then_biphone() {
        let mut hmm = cd_model();
        let mut dict = WordLexicon::default();
        // previous words: one ending in "s", one ending in "x" (unknown ctx)
        dict.add_word("S", "S", &["s"], &mut hmm, false).unwrap();
        let base = hmm.logical_id("k+i").unwrap();
        let mut res = ContextResolver::new(4);

        // last word ends in "s": s-k+i is defined
        let r = res.resolve(&hmm, &dict, base, Some(0), 0);
        let expect = hmm.physical_id("s-k+i").unwrap();
        assert_eq!(r, ResolvedRef::Defined(expect));

        // no previous word: biphone itself
        let r = res.resolve(&hmm, &dict, base, None, 1);
        assert_eq!(r, ResolvedRef::Defined(hmm.physical_id("k+i").unwrap()));
    }

    #[test]
    fn miss_falls_back_and_caches_per_word() {
        let mut hmm = cd_model();
        let mut dict = WordLexicon::default();
        dict.add_word("SIL", "SIL", &["sil"], &mut hmm, false)
            .unwrap();
        let base = hmm.logical_id("k+i").unwrap();
        let mut res = ContextResolver::new(2);

        // sil-k+i is undefined: fall back to the biphone
        let r1 = res.resolve(&hmm, &dict, base, Some(0), 0);
        assert_eq!(r1, ResolvedRef::Defined(hmm.physical_id("k+i").unwrap()));

        // cached: same answer, no re-resolution
        let r2 = res.resolve(&hmm, &dict, base, Some(0), 0);
        assert_eq!(r1, r2);

        res.clear(2);
        let r3 = res.resolve(&hmm, &dict, base, Some(0), 0);
        assert_eq!(r1, r3);
    }
}

//! Finite-state grammar support.
//!
//! A grammar is a DFA over word categories (one transition per line,
//! `from category to accept_flag`) plus the dictionary that assigns each
//! word a category. Pass 1 uses the category-pair constraint derived from
//! the automaton; pass 2 walks the automaton backward from the accepting
//! states and accepts a hypothesis when it reaches the initial state.
//!
//! Several grammars can coexist; the active subset forms the "global"
//! grammar the decoder actually searches.

use super::LmError;
use crate::dict::WordId;
use std::collections::HashSet;

/// One DFA transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfaArc {
    pub from: u32,
    pub category: u32,
    pub to: u32,
}

/// A deterministic finite automaton over word categories. State 0 is the
/// initial state.
#[derive(Debug, Clone)]
pub struct DfaGrammar {
    pub num_states: usize,
    pub num_categories: usize,
    arcs: Vec<DfaArc>,
    from_index: Vec<Vec<usize>>,
    to_index: Vec<Vec<usize>>,
    accept: Vec<bool>,
    pairs: HashSet<(u32, u32)>,
    initial_cats: HashSet<u32>,
    final_cats: HashSet<u32>,
}

impl DfaGrammar {
    /// Parse the `from category to accept_flag` line format.
    pub fn parse(content: &str) -> Result<Self, LmError> {
        let mut arcs = Vec::new();
        let mut accept_states: HashSet<u32> = HashSet::new();
        let mut max_state = 0u32;
        let mut max_cat = 0u32;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(LmError::Grammar {
                    line: lineno + 1,
                    msg: format!("expected 4 fields, got {}", fields.len()),
                });
            }
            let parse_u32 = |s: &str| -> Result<u32, LmError> {
                // "-1" marks an absent category/state on accept-only lines
                if s == "-1" {
                    return Ok(u32::MAX);
                }
                s.parse().map_err(|_| LmError::Grammar {
                    line: lineno + 1,
                    msg: format!("bad number: {}", s),
                })
            };
            let from = parse_u32(fields[0])?;
            let category = parse_u32(fields[1])?;
            let to = parse_u32(fields[2])?;
            let flag = parse_u32(fields[3])?;
            max_state = max_state.max(from);
            if flag & 1 != 0 {
                accept_states.insert(from);
            }
            if category != u32::MAX && to != u32::MAX {
                max_state = max_state.max(to);
                max_cat = max_cat.max(category);
                arcs.push(DfaArc { from, category, to });
            }
        }

        if arcs.is_empty() {
            return Err(LmError::Grammar {
                line: 0,
                msg: "grammar has no transitions".into(),
            });
        }
        if accept_states.is_empty() {
            // without the accept table the end-of-sentence behavior is
            // undefined; refuse rather than guess
            return Err(LmError::Grammar {
                line: 0,
                msg: "grammar has no accepting states".into(),
            });
        }

        let num_states = (max_state + 1) as usize;
        let num_categories = (max_cat + 1) as usize;
        let mut from_index = vec![Vec::new(); num_states];
        let mut to_index = vec![Vec::new(); num_states];
        for (i, arc) in arcs.iter().enumerate() {
            from_index[arc.from as usize].push(i);
            to_index[arc.to as usize].push(i);
        }
        let accept: Vec<bool> = (0..num_states)
            .map(|s| accept_states.contains(&(s as u32)))
            .collect();

        let mut pairs = HashSet::new();
        for mid in 0..num_states {
            for &ai in &to_index[mid] {
                for &bi in &from_index[mid] {
                    pairs.insert((arcs[ai].category, arcs[bi].category));
                }
            }
        }
        let initial_cats: HashSet<u32> = from_index[0].iter().map(|&i| arcs[i].category).collect();
        let final_cats: HashSet<u32> = arcs
            .iter()
            .filter(|a| accept[a.to as usize])
            .map(|a| a.category)
            .collect();

        log::info!(
            "dfa: {} states, {} categories, {} arcs, {} accepting",
            num_states,
            num_categories,
            arcs.len(),
            accept.iter().filter(|&&a| a).count()
        );
        Ok(Self {
            num_states,
            num_categories,
            arcs,
            from_index,
            to_index,
            accept,
            pairs,
            initial_cats,
            final_cats,
        })
    }

    /// True when a word of category `next` may directly follow one of
    /// category `prev`.
    pub fn pair_allowed(&self, prev: u32, next: u32) -> bool {
        self.pairs.contains(&(prev, next))
    }

    /// Categories allowed at utterance start.
    pub fn initial_category(&self, cat: u32) -> bool {
        self.initial_cats.contains(&cat)
    }

    /// Categories that may end a sentence.
    pub fn final_category(&self, cat: u32) -> bool {
        self.final_cats.contains(&cat)
    }

    pub fn is_accepting(&self, state: u32) -> bool {
        self.accept[state as usize]
    }

    pub fn accepting_states(&self) -> impl Iterator<Item = u32> + '_ {
        self.accept
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(s, _)| s as u32)
    }

    /// Arcs entering `state`, for the backward pass-2 walk.
    pub fn arcs_into(&self, state: u32) -> impl Iterator<Item = &DfaArc> {
        self.to_index[state as usize].iter().map(|&i| &self.arcs[i])
    }

    /// Arcs leaving `state`.
    pub fn arcs_from(&self, state: u32) -> impl Iterator<Item = &DfaArc> {
        self.from_index[state as usize]
            .iter()
            .map(|&i| &self.arcs[i])
    }
}

struct GrammarEntry {
    dfa: DfaGrammar,
    active: bool,
    /// Word id range of this grammar's dictionary in the global lexicon.
    word_begin: WordId,
    word_end: WordId,
}

/// The collection of loaded grammars; the active subset is the global
/// grammar searched by the decoder.
#[derive(Default)]
pub struct GrammarSet {
    entries: Vec<GrammarEntry>,
}

impl GrammarSet {
    /// Register a grammar covering words `[word_begin, word_end)` of the
    /// global lexicon. Newly added grammars start active.
    pub fn add_grammar(&mut self, dfa: DfaGrammar, word_begin: WordId, word_end: WordId) -> usize {
        self.entries.push(GrammarEntry {
            dfa,
            active: true,
            word_begin,
            word_end,
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_active(&mut self, idx: usize, active: bool) {
        self.entries[idx].active = active;
    }

    pub fn is_active(&self, idx: usize) -> bool {
        self.entries[idx].active
    }

    pub fn grammar(&self, idx: usize) -> &DfaGrammar {
        &self.entries[idx].dfa
    }

    /// Grammar owning a word, if that grammar is active.
    pub fn grammar_of_word(&self, w: WordId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.active && w >= e.word_begin && w < e.word_end)
    }

    /// Indices of active grammars.
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active)
            .map(|(i, _)| i)
    }

    /// Category-pair constraint across the global grammar: both words must
    /// belong to the same active grammar and the pair must be allowed
    /// there.
    pub fn pair_allowed(&self, prev: WordId, prev_cat: u32, next: WordId, next_cat: u32) -> bool {
        match (self.grammar_of_word(prev), self.grammar_of_word(next)) {
            (Some(a), Some(b)) if a == b => self.entries[a].dfa.pair_allowed(prev_cat, next_cat),
            _ => false,
        }
    }

    /// First-word constraint at utterance start.
    pub fn initial_allowed(&self, w: WordId, cat: u32) -> bool {
        match self.grammar_of_word(w) {
            Some(g) => self.entries[g].dfa.initial_category(cat),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // accepts "a a" only: categories 0=a
    const AA: &str = "\
0 0 1 0
1 0 2 0
2 -1 -1 1
";

    #[test]
    fn rejects_grammar_without_accept_states() {
        let bad = "0 0 1 0\n1 0 2 0\n";
        assert!(matches!(
            DfaGrammar::parse(bad),
            Err(LmError::Grammar { .. })
        ));
    }

    #[test]
    fn parses_accept_only_lines() {
        let dfa = DfaGrammar::parse(AA).unwrap();
        assert!(dfa.is_accepting(2));
        assert!(!dfa.is_accepting(0));
    }

    fn aa_grammar() -> DfaGrammar {
        DfaGrammar::parse(AA).unwrap()
    }

    #[test]
    fn category_pairs_and_boundaries() {
        let dfa = aa_grammar();
        assert!(dfa.pair_allowed(0, 0)); // a then a through state 1
        assert!(dfa.initial_category(0));
        assert!(dfa.final_category(0));
    }

    #[test]
    fn backward_walk_reaches_initial() {
        let dfa = aa_grammar();
        let mut states: Vec<u32> = dfa.accepting_states().collect();
        assert_eq!(states, vec![2]);
        // consume last "a"
        let prev: Vec<u32> = dfa.arcs_into(states[0]).map(|a| a.from).collect();
        assert_eq!(prev, vec![1]);
        states = prev;
        // consume first "a"
        let prev: Vec<u32> = dfa.arcs_into(states[0]).map(|a| a.from).collect();
        assert_eq!(prev, vec![0]);
    }

    #[test]
    fn grammar_set_word_ranges() {
        let mut set = GrammarSet::default();
        let g = set.add_grammar(aa_grammar(), 0, 2);
        assert_eq!(set.grammar_of_word(1), Some(g));
        assert_eq!(set.grammar_of_word(2), None);
        set.set_active(g, false);
        assert_eq!(set.grammar_of_word(1), None);
    }
}

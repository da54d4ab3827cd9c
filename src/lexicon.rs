//! Tree-structured pronunciation lexicon.
//!
//! Words sharing pronunciation prefixes share the corresponding HMM state
//! nodes; each word keeps a private chain for its final phone so terminal
//! markers stay unambiguous. Every node carries one of four output handles:
//! a plain state, a context-dependent state set (word ends and undefined
//! word-internal triphones), a right-context handle resolved at runtime
//! from the previous word (word beginnings), or a both-context handle
//! (single-phone words).
//!
//! The arena is built once — and rebuilt only at the grammar-update
//! barrier — and is strictly read-only during decoding. Runtime caches
//! (per-frame scores, context resolutions) live in per-utterance side
//! tables indexed by node id, never here.

use crate::dict::{WordId, WordLexicon};
use crate::error::{DecodeError, Result};
use crate::hmm::{HmmSet, LogId, LogicalBody, PhysId, PseudoId, StateId};
use std::collections::HashMap;

pub type NodeId = u32;

/// How the output probability of a node is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHandle {
    /// A concrete HMM state.
    Plain(StateId),
    /// A fixed context-dependent state set (word-final phones, undefined
    /// word-internal triphones).
    CdSet { pseudo: PseudoId, loc: usize },
    /// Word-initial phone: the concrete triphone depends on the preceding
    /// word and is resolved per token at runtime.
    RightCtx { base: LogId, loc: usize },
    /// Single-phone word: both contexts unknown at build time.
    BothCtx { base: LogId, loc: usize },
}

/// One node of the lexicon tree.
#[derive(Debug, Clone)]
pub struct LexNode {
    pub out: OutputHandle,
    /// Self-loop log probability.
    pub self_loop: f32,
    /// Forward arcs `(target, log prob)`, within and across phones.
    pub arcs: Vec<(NodeId, f32)>,
    /// Set when a word ends here: `(word, exit log prob)`.
    pub word_end: Option<(WordId, f32)>,
    /// LM look-ahead factoring value (max reachable unigram log prob).
    pub factor: f32,
    /// Node belongs to the short-pause word.
    pub sp: bool,
}

/// The built tree lexicon.
pub struct TreeLexicon {
    pub nodes: Vec<LexNode>,
    /// Entry arcs from the (virtual) root: `(node, entry log prob)`.
    pub root_arcs: Vec<(NodeId, f32)>,
    /// Output handle of each word's final emitting state, for trellis
    /// score discounting and pass-2 connection.
    pub wordend_handle: Vec<OutputHandle>,
    /// Node id of each word's final emitting state (context cache key).
    pub wordend_node: Vec<NodeId>,
    pub num_words: usize,
    /// Word marked as the decoder-based segmentation pause word.
    pub sp_word: Option<WordId>,
}

struct PhoneInstance {
    /// Exit arcs `(node, exit log prob)` to connect to the next phone.
    exit: Vec<(NodeId, f32)>,
    node_begin: usize,
    node_end: usize,
}

impl TreeLexicon {
    /// Build the tree over the whole dictionary. `lm_uni` supplies unigram
    /// log probabilities for factoring (None in grammar mode).
    pub fn build(
        dict: &WordLexicon,
        hmm: &mut HmmSet,
        lm_uni: Option<&dyn Fn(WordId) -> f32>,
        sp_model: Option<&str>,
    ) -> Result<Self> {
        let cd_model = hmm
            .physical
            .iter()
            .any(|p| p.name.contains('+') || p.name.contains('-'));

        // pre-register the pseudo sets that runtime both-context resolution
        // may need: (final phone of any word) - (single-phone word base)
        if cd_model {
            let finals: Vec<String> = {
                let mut v: Vec<String> = dict
                    .words()
                    .map(|(w, _)| dict.last_phone_base(w).to_string())
                    .collect();
                v.sort();
                v.dedup();
                v
            };
            let singles: Vec<String> = dict
                .words()
                .filter(|(_, word)| word.base_phones.len() == 1)
                .map(|(_, word)| word.base_phones[0].clone())
                .collect();
            for base in &singles {
                for f in &finals {
                    let name = format!("{}-{}", f, base);
                    let _ = hmm.make_pseudo(&name);
                }
            }
        }

        let mut lex = TreeLexicon {
            nodes: Vec::new(),
            root_arcs: Vec::new(),
            wordend_handle: Vec::with_capacity(dict.num_words()),
            wordend_node: Vec::with_capacity(dict.num_words()),
            num_words: dict.num_words(),
            sp_word: None,
        };
        let mut instances: Vec<PhoneInstance> = Vec::new();
        // (parent instance or MAX for root, phone) -> shared instance
        let mut trie: HashMap<(usize, LogId), usize> = HashMap::new();

        for (wid, word) in dict.words() {
            let n = word.phones.len();
            let is_sp = sp_model.is_some_and(|sp| word.name == sp);
            if is_sp {
                lex.sp_word = Some(wid);
            }
            let uni = lm_uni.map(|f| f(wid)).unwrap_or(0.0);

            let mut parent: Option<usize> = None;
            for (i, &phone) in word.phones.iter().enumerate() {
                let is_last = i == n - 1;
                let shareable = !is_last && !is_sp;
                let parent_key = parent.map_or(usize::MAX, |p| p);

                if shareable {
                    if let Some(&inst) = trie.get(&(parent_key, phone)) {
                        // shared prefix: only lift the factoring value
                        let (b, e) = (instances[inst].node_begin, instances[inst].node_end);
                        for node in &mut lex.nodes[b..e] {
                            if node.factor < uni {
                                node.factor = uni;
                            }
                        }
                        parent = Some(inst);
                        continue;
                    }
                }

                let pos = if n == 1 {
                    PhonePos::Single
                } else if i == 0 {
                    PhonePos::Head
                } else if is_last {
                    PhonePos::Tail
                } else {
                    PhonePos::Internal
                };
                let inst = create_phone(
                    &mut lex, hmm, phone, pos, cd_model, wid, is_last, uni, is_sp,
                )?;
                let inst_idx = instances.len();

                match parent {
                    None => {
                        // entry arcs become root arcs
                        for &(node, p) in &inst.entry {
                            lex.root_arcs.push((node, p));
                        }
                    }
                    Some(pi) => {
                        for &(from, exitp) in &instances[pi].exit {
                            for &(to, entp) in &inst.entry {
                                lex.nodes[from as usize].arcs.push((to, exitp + entp));
                            }
                        }
                    }
                }

                instances.push(PhoneInstance {
                    exit: inst.exit,
                    node_begin: inst.node_begin,
                    node_end: inst.node_end,
                });
                if shareable {
                    trie.insert((parent_key, phone), inst_idx);
                }
                parent = Some(inst_idx);
            }

            // record the word-end handle (last emitting state of the chain)
            let last_inst = parent.expect("word with no phones");
            let last = instances[last_inst].node_end - 1;
            lex.wordend_handle.push(lex.nodes[last].out);
            lex.wordend_node.push(last as NodeId);
        }

        log::info!(
            "tree lexicon: {} nodes, {} root arcs for {} words",
            lex.nodes.len(),
            lex.root_arcs.len(),
            lex.num_words
        );
        Ok(lex)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &LexNode {
        &self.nodes[id as usize]
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PhonePos {
    Head,
    Internal,
    Tail,
    Single,
}

struct CreatedPhone {
    entry: Vec<(NodeId, f32)>,
    exit: Vec<(NodeId, f32)>,
    node_begin: usize,
    node_end: usize,
}

/// Instantiate the state chain of one phone and wire its internal arcs.
#[allow(clippy::too_many_arguments)]
fn create_phone(
    lex: &mut TreeLexicon,
    hmm: &HmmSet,
    phone: LogId,
    pos: PhonePos,
    cd_model: bool,
    wid: WordId,
    is_last: bool,
    uni: f32,
    sp: bool,
) -> Result<CreatedPhone> {
    let logical = hmm.logical(phone);
    let (phys, pseudo): (PhysId, Option<PseudoId>) = match logical.body {
        LogicalBody::Defined(p) => (p, None),
        LogicalBody::Pseudo(ps) => (hmm.pseudo_phone(ps).repr, Some(ps)),
    };
    let trans = hmm.physical(phys).trans;
    let tm = &hmm.trans[trans as usize];
    let nstate = match pseudo {
        Some(ps) => hmm.pseudo_phone(ps).state_sets.len(),
        None => hmm.physical(phys).states.len(),
    };
    if nstate == 0 {
        return Err(DecodeError::StateCorruption(format!(
            "model {} has no emitting states",
            logical.name
        )));
    }
    let exit_col = tm.nstate - 1;
    let has_rc = logical.name.contains('+') || pseudo.is_some();

    let base_id = lex.nodes.len() as NodeId;
    for loc in 0..nstate {
        let out = match pos {
            PhonePos::Head if has_rc => OutputHandle::RightCtx { base: phone, loc },
            PhonePos::Single if cd_model => OutputHandle::BothCtx { base: phone, loc },
            _ => match pseudo {
                Some(ps) => OutputHandle::CdSet { pseudo: ps, loc },
                None => OutputHandle::Plain(hmm.physical(phys).states[loc]),
            },
        };
        let row = loc + 1;
        let word_end = if is_last && tm.is_arc(row, exit_col) {
            Some((wid, tm.get(row, exit_col)))
        } else {
            None
        };
        lex.nodes.push(LexNode {
            out,
            self_loop: tm.get(row, row),
            arcs: Vec::new(),
            word_end,
            factor: uni,
            sp,
        });
    }

    // internal arcs
    for from in 0..nstate {
        for to in 0..nstate {
            if to != from && tm.is_arc(from + 1, to + 1) {
                let p = tm.get(from + 1, to + 1);
                lex.nodes[(base_id as usize) + from]
                    .arcs
                    .push((base_id + to as NodeId, p));
            }
        }
    }

    let entry: Vec<(NodeId, f32)> = (0..nstate)
        .filter(|&loc| tm.is_arc(0, loc + 1))
        .map(|loc| (base_id + loc as NodeId, tm.get(0, loc + 1)))
        .collect();
    let exit: Vec<(NodeId, f32)> = (0..nstate)
        .filter(|&loc| tm.is_arc(loc + 1, exit_col))
        .map(|loc| (base_id + loc as NodeId, tm.get(loc + 1, exit_col)))
        .collect();
    if entry.is_empty() || exit.is_empty() {
        return Err(DecodeError::StateCorruption(format!(
            "model {} has no entry or exit transition",
            logical.name
        )));
    }

    Ok(CreatedPhone {
        entry,
        exit,
        node_begin: base_id as usize,
        node_end: lex.nodes.len(),
    })
}

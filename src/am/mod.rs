//! Acoustic scoring: mixture output probabilities, cross-word context
//! resolution and GMM-based utterance verification.

pub mod context;
pub mod gmm;
pub mod score;

pub use context::{ContextResolver, ResolvedRef, ResolvedStates};
pub use gmm::GmmVerifier;
pub use score::AcousticScorer;

use crate::dict::WordLexicon;
use crate::hmm::HmmSet;
use crate::lexicon::{OutputHandle, TreeLexicon};
use crate::{dict::WordId, lexicon::NodeId};

/// Log output probability of a lexicon node at frame `t`, dispatching on
/// the node's handle. `last_word` feeds cross-word triphone resolution at
/// word beginnings.
pub fn outprob_node(
    scorer: &mut AcousticScorer,
    resolver: &mut ContextResolver,
    hmm: &HmmSet,
    dict: &WordLexicon,
    lex: &TreeLexicon,
    node: NodeId,
    t: i32,
    frame: &[f32],
    last_word: Option<WordId>,
) -> f32 {
    match lex.node(node).out {
        OutputHandle::Plain(sid) => scorer.score_state(t, frame, sid),
        OutputHandle::CdSet { pseudo, loc } => {
            let set = &hmm.pseudo_phone(pseudo).state_sets[loc];
            scorer.score_set(t, frame, set)
        }
        OutputHandle::RightCtx { base, loc } => {
            let resolved = resolver.resolve(hmm, dict, base, last_word, node);
            match resolved.states_at(hmm, loc) {
                ResolvedStates::One(sid) => scorer.score_state(t, frame, sid),
                ResolvedStates::Set(set) => scorer.score_set(t, frame, set),
            }
        }
        OutputHandle::BothCtx { base, loc } => {
            let resolved = resolver.resolve_both(hmm, dict, base, last_word, node);
            match resolved.states_at(hmm, loc) {
                ResolvedStates::One(sid) => scorer.score_state(t, frame, sid),
                ResolvedStates::Set(set) => scorer.score_set(t, frame, set),
            }
        }
    }
}

/// Score an arbitrary handle directly (used for trellis discounting and
/// pass-2 connection rescoring).
pub fn outprob_handle(
    scorer: &mut AcousticScorer,
    resolver: &mut ContextResolver,
    hmm: &HmmSet,
    dict: &WordLexicon,
    handle: OutputHandle,
    node_hint: NodeId,
    t: i32,
    frame: &[f32],
    last_word: Option<WordId>,
) -> f32 {
    match handle {
        OutputHandle::Plain(sid) => scorer.score_state(t, frame, sid),
        OutputHandle::CdSet { pseudo, loc } => {
            let set = &hmm.pseudo_phone(pseudo).state_sets[loc];
            scorer.score_set(t, frame, set)
        }
        OutputHandle::RightCtx { base, loc } => {
            let resolved = resolver.resolve(hmm, dict, base, last_word, node_hint);
            match resolved.states_at(hmm, loc) {
                ResolvedStates::One(sid) => scorer.score_state(t, frame, sid),
                ResolvedStates::Set(set) => scorer.score_set(t, frame, set),
            }
        }
        OutputHandle::BothCtx { base, loc } => {
            let resolved = resolver.resolve_both(hmm, dict, base, last_word, node_hint);
            match resolved.states_at(hmm, loc) {
                ResolvedStates::One(sid) => scorer.score_state(t, frame, sid),
                ResolvedStates::Set(set) => scorer.score_set(t, frame, set),
            }
        }
    }
}

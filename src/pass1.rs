//! Pass 1: frame-synchronous Viterbi beam search over the tree lexicon.
//!
//! Token passing with double-buffered per-node token slots. Each frame:
//! prune the active set (rank beam, optional score beam), propagate tokens
//! along self-loops and arcs (skip arcs of multipath models ride the same
//! arc list), add output probabilities, then record surviving word ends
//! into the trellis and seed the lexicon root for the next frame with the
//! ended words as new predecessor contexts.
//!
//! With an N-gram, the unigram factoring value annotated on tree nodes is
//! carried in the token score and exchanged for the true LM score when the
//! word identity becomes known at a terminal. With a DFA grammar, word
//! ends violating the category-pair constraint are killed instead.

use crate::am::{outprob_node, AcousticScorer, ContextResolver};
use crate::config::SearchConfig;
use crate::dict::{WordId, WordLexicon};
use crate::hmm::{HmmSet, LOG_ZERO};
use crate::lexicon::{NodeId, TreeLexicon};
use crate::lm::LangModel;
use crate::trellis::{Trellis, TrellisWord, TrellisWordId};

/// Everything the search passes need to consult, borrowed from the engine.
pub struct SearchContext<'a> {
    pub hmm: &'a HmmSet,
    pub dict: &'a WordLexicon,
    pub lex: &'a TreeLexicon,
    pub lm: &'a LangModel,
    pub config: &'a SearchConfig,
    /// Dictionary word id → N-gram entry id.
    pub wton: Option<&'a [Option<u32>]>,
}

impl<'a> SearchContext<'a> {
    fn ngram_id(&self, w: WordId) -> Option<u32> {
        self.wton.and_then(|m| m.get(w as usize).copied().flatten())
    }

    /// Factoring scale: LM look-ahead only applies in N-gram mode.
    fn factor_scale(&self) -> f32 {
        match self.lm {
            LangModel::Ngram(_) => self.config.lm_weight,
            LangModel::Grammar(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub score: f32,
    pub last_word: Option<WordId>,
    pub last_tre: Option<TrellisWordId>,
}

struct TokenArena {
    /// node -> slot index + 1, 0 when inactive.
    slot: Vec<u32>,
    active: Vec<NodeId>,
    toks: Vec<Vec<Token>>,
}

impl TokenArena {
    fn new(num_nodes: usize) -> Self {
        Self {
            slot: vec![0; num_nodes],
            active: Vec::new(),
            toks: Vec::new(),
        }
    }

    fn clear(&mut self) {
        for &n in &self.active {
            self.slot[n as usize] = 0;
        }
        self.active.clear();
        self.toks.clear();
    }

    fn insert(&mut self, node: NodeId, tok: Token, keep: usize, word_pair: bool) {
        let s = self.slot[node as usize];
        if s == 0 {
            self.active.push(node);
            self.toks.push(vec![tok]);
            self.slot[node as usize] = self.toks.len() as u32;
            return;
        }
        let list = &mut self.toks[(s - 1) as usize];
        if !word_pair {
            if tok.score > list[0].score {
                list[0] = tok;
            }
            return;
        }
        if let Some(existing) = list.iter_mut().find(|t| t.last_word == tok.last_word) {
            if tok.score > existing.score {
                *existing = tok;
            }
        } else {
            list.push(tok);
        }
        list.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
        list.truncate(keep);
    }

    fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Alive,
    /// Short-pause segmentation fired at this frame.
    SegmentTrigger,
    /// The beam is empty: utterance failed.
    Dead,
}

pub struct Pass1 {
    cur: TokenArena,
    next: TokenArena,
    /// Trellis words created at the previous frame, re-entering the root.
    reentry: Vec<TrellisWordId>,
    pub best_score: f32,
    pub best_node: Option<NodeId>,
    /// Consecutive frames with the pause word as 1-best.
    pub sp_count: usize,
}

impl Pass1 {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            cur: TokenArena::new(num_nodes),
            next: TokenArena::new(num_nodes),
            reentry: Vec::new(),
            best_score: LOG_ZERO,
            best_node: None,
            sp_count: 0,
        }
    }

    pub fn prepare(&mut self) {
        self.cur.clear();
        self.next.clear();
        self.reentry.clear();
        self.best_score = LOG_ZERO;
        self.best_node = None;
        self.sp_count = 0;
    }

    /// Process one frame. `t` must advance strictly by one per call.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        ctx: &SearchContext,
        scorer: &mut AcousticScorer,
        resolver: &mut ContextResolver,
        trellis: &mut Trellis,
        frame: &[f32],
        t: usize,
    ) -> StepResult {
        let cfg = ctx.config;
        let word_pair = cfg.word_pair;
        let keep = if word_pair { cfg.word_pair_keep } else { 1 };
        let fscale = ctx.factor_scale();

        self.next.clear();

        if t == 0 {
            for &(node, entry) in &ctx.lex.root_arcs {
                let tok = Token {
                    score: entry + fscale * ctx.lex.node(node).factor,
                    last_word: None,
                    last_tre: None,
                };
                self.next.insert(node, tok, keep, word_pair);
            }
        } else {
            // rank beam over the previous frame's active nodes
            let beam = cfg.effective_beam_width(ctx.dict.num_words());
            let mut order: Vec<(usize, f32)> = (0..self.cur.active.len())
                .map(|i| (i, self.cur.toks[i][0].score))
                .collect();
            if beam != usize::MAX && order.len() > beam {
                order.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
                order.truncate(beam);
            }
            let score_floor = if cfg.score_beam > 0.0 {
                self.best_score - cfg.score_beam
            } else {
                LOG_ZERO
            };

            for &(i, _) in &order {
                let node = self.cur.active[i];
                let lex_node = ctx.lex.node(node);
                let node_factor = lex_node.factor;
                for k in 0..self.cur.toks[i].len() {
                    let tok = self.cur.toks[i][k];
                    if tok.score < score_floor {
                        continue;
                    }
                    // self loop
                    self.next.insert(
                        node,
                        Token {
                            score: tok.score + lex_node.self_loop,
                            ..tok
                        },
                        keep,
                        word_pair,
                    );
                    // forward (and skip) arcs
                    for &(m, p) in &lex_node.arcs {
                        let fdelta = fscale * (ctx.lex.node(m).factor - node_factor);
                        self.next.insert(
                            m,
                            Token {
                                score: tok.score + p + fdelta,
                                ..tok
                            },
                            keep,
                            word_pair,
                        );
                    }
                }
            }

            // word re-entry: words ended at t-1 seed the root successors
            for &tre_id in &self.reentry {
                let atom = trellis.at(tre_id);
                let (word, back) = (atom.word, atom.back_score);
                for &(node, entry) in &ctx.lex.root_arcs {
                    let tok = Token {
                        score: back + entry + fscale * ctx.lex.node(node).factor,
                        last_word: Some(word),
                        last_tre: Some(tre_id),
                    };
                    self.next.insert(node, tok, keep, word_pair);
                }
            }
        }

        if self.next.is_empty() {
            log::debug!("pass1: beam got empty at frame {}", t);
            return StepResult::Dead;
        }

        // add output probabilities and track the frame best
        self.best_score = LOG_ZERO;
        self.best_node = None;
        for i in 0..self.next.active.len() {
            let node = self.next.active[i];
            for k in 0..self.next.toks[i].len() {
                let last_word = self.next.toks[i][k].last_word;
                let out = outprob_node(
                    scorer, resolver, ctx.hmm, ctx.dict, ctx.lex, node, t as i32, frame, last_word,
                );
                let tok = &mut self.next.toks[i][k];
                tok.score += out;
                if tok.score > self.best_score {
                    self.best_score = tok.score;
                    self.best_node = Some(node);
                }
            }
        }

        // record surviving word ends
        self.reentry.clear();
        for i in 0..self.next.active.len() {
            let node = self.next.active[i];
            let (word, exitp) = match ctx.lex.node(node).word_end {
                Some(we) => we,
                None => continue,
            };
            let node_factor = ctx.lex.node(node).factor;
            for k in 0..self.next.toks[i].len() {
                let tok = self.next.toks[i][k];
                let lscore = match self.pass1_lm_score(ctx, word, tok.last_word) {
                    Some(s) => s,
                    None => continue,
                };
                let atom = TrellisWord {
                    word,
                    end_frame: t as u32,
                    back_score: tok.score + exitp + lscore - fscale * node_factor,
                    last_word: tok.last_word,
                    last_tre: tok.last_tre,
                    lm_score: lscore,
                };
                self.reentry.push(trellis.store(atom));
            }
        }

        // decoder-based short-pause segmentation
        let mut trigger = false;
        if ctx.lex.sp_word.is_some() {
            let best_is_sp = self.best_node.is_some_and(|n| ctx.lex.node(n).sp);
            if best_is_sp {
                self.sp_count += 1;
                if self.sp_count >= cfg.sp_frame_duration && trellis.num_atoms() > 0 {
                    trigger = true;
                }
            } else {
                self.sp_count = 0;
            }
        }

        std::mem::swap(&mut self.cur, &mut self.next);
        if trigger {
            StepResult::SegmentTrigger
        } else {
            StepResult::Alive
        }
    }

    /// Pass-1 LM score for ending `word` after `prev`. `None` kills the
    /// word end (DFA constraint violation or unscorable word).
    fn pass1_lm_score(&self, ctx: &SearchContext, word: WordId, prev: Option<WordId>) -> Option<f32> {
        let cfg = ctx.config;
        match ctx.lm {
            LangModel::Ngram(ngram) => {
                let w_nid = ctx.ngram_id(word)?;
                let prev_nid = prev.and_then(|p| ctx.ngram_id(p));
                let entry = ctx.dict.word(word);
                let raw = ngram.pass1_prob(prev_nid, w_nid) + entry.class_prob;
                Some(cfg.lm_weight * raw + cfg.lm_penalty + entry.weight)
            }
            LangModel::Grammar(grammars) => {
                let cat = ctx.dict.word(word).category?;
                let allowed = match prev {
                    None => grammars.initial_allowed(word, cat),
                    Some(p) => {
                        let pcat = ctx.dict.word(p).category?;
                        grammars.pair_allowed(p, pcat, word, cat)
                    }
                };
                if allowed {
                    Some(0.0)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchConfig, TrellisLookup};
    use crate::hmm::binio::left_to_right_trans;
    use crate::hmm::{Gaussian, HmmSet, HmmState, MixturePdf};
    use crate::lm::ngram::{NgramEntry, NgramSet};
    use crate::lm::NgramModel;

    /// One-state monophones at well-separated means in a 1-dim space.
    fn model(phones: &[(&str, f32)]) -> HmmSet {
        let mut set = HmmSet::new(1);
        for &(name, mean) in phones {
            let d = set.add_density(Gaussian::from_variance(vec![mean], vec![0.1]));
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

    fn flat_ngram(names: &[&str]) -> NgramModel {
        let unigrams: Vec<NgramEntry> = names
            .iter()
            .map(|_| NgramEntry::new(-(names.len() as f32).log10()))
            .collect();
        let set = NgramSet {
            order: 1,
            counts: vec![names.len()],
            unigrams,
        };
        NgramModel::new(names.iter().map(|s| s.to_string()).collect(), Some(set), None).unwrap()
    }

    struct Fixture {
        hmm: HmmSet,
        dict: WordLexicon,
        lex: TreeLexicon,
        lm: LangModel,
        config: SearchConfig,
        wton: Vec<Option<u32>>,
    }

    fn fixture() -> Fixture {
        let mut hmm = model(&[("a", 0.0), ("b", 10.0)]);
        let mut dict = WordLexicon::default();
        dict.add_word("A", "A", &["a"], &mut hmm, false).unwrap();
        dict.add_word("B", "B", &["b"], &mut hmm, false).unwrap();
        let ngram = flat_ngram(&["A", "B"]);
        let wton: Vec<Option<u32>> = dict.words().map(|(_, w)| ngram.id(&w.name)).collect();
        let uni = |w: WordId| match &wton[w as usize] {
            Some(id) => ngram.factoring_uni(*id),
            None => LOG_ZERO,
        };
        let lex = TreeLexicon::build(&dict, &mut hmm, Some(&uni), None).unwrap();
        Fixture {
            hmm,
            dict,
            lex,
            lm: LangModel::Ngram(ngram),
            config: SearchConfig::default(),
            wton,
        }
    }

    fn run_frames(fx: &Fixture, frames: &[Vec<f32>]) -> (Trellis, Pass1, StepResult) {
        let ctx = SearchContext {
            hmm: &fx.hmm,
            dict: &fx.dict,
            lex: &fx.lex,
            lm: &fx.lm,
            config: &fx.config,
            wton: Some(&fx.wton),
        };
        let mut scorer = AcousticScorer::new(&fx.hmm, &fx.config);
        let mut resolver = ContextResolver::new(fx.lex.num_nodes());
        let mut trellis = Trellis::new();
        trellis.prepare();
        let mut p1 = Pass1::new(fx.lex.num_nodes());
        p1.prepare();
        let mut last = StepResult::Alive;
        for (t, f) in frames.iter().enumerate() {
            last = p1.step(&ctx, &mut scorer, &mut resolver, &mut trellis, f, t);
            if last != StepResult::Alive {
                break;
            }
        }
        (trellis, p1, last)
    }

    #[test]
    fn single_word_wins_on_matching_frames(){
        let fx = fixture();
        let frames: Vec<Vec<f32>> = (0..5).map(|_| vec![0.0]).collect();
        let (mut trellis, p1, last) = run_frames(&fx, &frames);
        assert_eq!(last, StepResult::Alive);
        assert!(p1.best_score > LOG_ZERO);

        trellis.relocate(5);
        trellis.sort();
        // word "A" survives at the last frame and beats "B"
        let best = trellis.best_at_frame(4).unwrap();
        assert_eq!(trellis.at(best).word, 0);
        assert_eq!(trellis.backtrack(best), vec![0]);
    }

    #[test]
    fn word_sequence_recovered_through_reentry() {
        let fx = fixture();
        // five frames of "a" then five of "b"
        let mut frames: Vec<Vec<f32>> = (0..5).map(|_| vec![0.0]).collect();
        frames.extend((0..5).map(|_| vec![10.0]));
        let (mut trellis, _, last) = run_frames(&fx, &frames);
        assert_eq!(last, StepResult::Alive);

        trellis.relocate(10);
        trellis.sort();
        let best = trellis.best_at_frame(9).unwrap();
        assert_eq!(trellis.backtrack(best), vec![0, 1]);
        // predecessor bookkeeping survived
        let atom = trellis.at(best);
        assert_eq!(atom.last_word, Some(0));
        assert!(atom.last_tre.is_some());
    }

    #[test]
    fn trellis_invariants_hold() {
        let fx = fixture();
        let frames: Vec<Vec<f32>> = (0..6).map(|i| vec![if i < 3 { 0.0 } else { 10.0 }]).collect();
        let (mut trellis, _, _) = run_frames(&fx, &frames);
        trellis.relocate(6);
        trellis.sort();
        for t in 0..6 {
            let ids = trellis.frame(t);
            let mut prev = None;
            for &id in ids {
                let atom = trellis.at(id);
                assert!((atom.end_frame as usize) < 6);
                assert!((atom.word as usize) < fx.dict.num_words());
                if let Some(p) = prev {
                    assert!(atom.word >= p);
                }
                prev = Some(atom.word);
                assert!(trellis
                    .lookup(t, atom.word, TrellisLookup::FirstMatch)
                    .is_some());
            }
        }
    }

    #[test]
    fn beam_of_one_still_decodes() {
        let mut fx = fixture();
        fx.config.beam_width = 1;
        let frames: Vec<Vec<f32>> = (0..4).map(|_| vec![0.0]).collect();
        let (mut trellis, _, last) = run_frames(&fx, &frames);
        assert_eq!(last, StepResult::Alive);
        trellis.relocate(4);
        trellis.sort();
        assert_eq!(trellis.at(trellis.best_at_frame(3).unwrap()).word, 0);
    }

    #[test]
    fn grammar_kills_disallowed_pairs() {
        use crate::lm::dfa::{DfaGrammar, GrammarSet};
        let mut hmm = model(&[("a", 0.0), ("b", 10.0)]);
        let mut dict = WordLexicon::default();
        dict.add_word("A", "A", &["a"], &mut hmm, false).unwrap();
        dict.add_word("B", "B", &["b"], &mut hmm, false).unwrap();
        dict.set_category(0, 0);
        dict.set_category(1, 1);
        // grammar accepts only "A A"
        let dfa = DfaGrammar::parse("0 0 1 0\n1 0 2 0\n2 -1 -1 1\n").unwrap();
        let mut grammars = GrammarSet::default();
        grammars.add_grammar(dfa, 0, 2);
        let lex = TreeLexicon::build(&dict, &mut hmm, None, None).unwrap();

        let fx = Fixture {
            hmm,
            dict,
            lex,
            lm: LangModel::Grammar(grammars),
            config: SearchConfig::default(),
            wton: vec![],
        };
        let ctx = SearchContext {
            hmm: &fx.hmm,
            dict: &fx.dict,
            lex: &fx.lex,
            lm: &fx.lm,
            config: &fx.config,
            wton: None,
        };
        let mut scorer = AcousticScorer::new(&fx.hmm, &fx.config);
        let mut resolver = ContextResolver::new(fx.lex.num_nodes());
        let mut trellis = Trellis::new();
        trellis.prepare();
        let mut p1 = Pass1::new(fx.lex.num_nodes());
        p1.prepare();
        // frames matching "a" then "b": B after A is not allowed
        let mut frames: Vec<Vec<f32>> = (0..4).map(|_| vec![0.0]).collect();
        frames.extend((0..4).map(|_| vec![10.0]));
        for (t, f) in frames.iter().enumerate() {
            p1.step(&ctx, &mut scorer, &mut resolver, &mut trellis, f, t);
        }
        trellis.relocate(8);
        trellis.sort();
        // no "B" word end anywhere in the trellis
        for t in 0..8 {
            for &id in trellis.frame(t) {
                assert_ne!(trellis.at(id).word, 1);
            }
        }
    }
}

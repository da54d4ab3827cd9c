//! Pass 2: backward best-first stack decoding over the word trellis.
//!
//! Hypotheses grow backward in time from the utterance end. Each carries
//! the exact forward Viterbi lane `g` of its word sequence (`g[t]` = score
//! of the hypothesis with its earliest word starting at frame `t` and the
//! rest of the input covered), so `f = max_t (g[t] + h*(t))` combines the
//! exact partial score with the trellis estimate `h*` of the unexplored
//! region. Expansion looks up trellis word ends around the estimated
//! connection frame, re-runs the acoustic Viterbi through the new word
//! with the true cross-word context at the junction — fixing the pass-1
//! approximation — and re-scans the previously-earliest word's first phone
//! under its now-known left context.

use crate::am::{AcousticScorer, ContextResolver, ResolvedRef, ResolvedStates};
use crate::dict::WordId;
use crate::hmm::{add_left_context, add_right_context, LogId, LogicalBody, LOG_ZERO};
use crate::lm::LangModel;
use crate::pass1::SearchContext;
use crate::trellis::{Trellis, TrellisWordId};
use std::collections::HashSet;

const LN10: f32 = std::f32::consts::LN_10;

/// A finished sentence, words in time order.
#[derive(Debug, Clone)]
pub struct SentenceHypo {
    pub words: Vec<WordId>,
    pub score: f32,
    pub lm_scores: Vec<f32>,
    pub am_scores: Vec<f32>,
    pub confidence: Vec<f32>,
    pub end_frames: Vec<usize>,
}

/// Boundary-word constraints carried across short-pause segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pass2Options {
    /// Override for the initial (latest-in-time) word.
    pub initial_word: Option<WordId>,
    /// Override for the accepted (earliest-in-time) word.
    pub accept_word: Option<WordId>,
}

struct Hypo {
    /// Words in decode order: `seq[0]` is the latest in time.
    seq: Vec<WordId>,
    lm_scores: Vec<f32>,
    am_scores: Vec<f32>,
    confidence: Vec<f32>,
    end_frames: Vec<usize>,
    f: f32,
    g: Vec<f32>,
    /// Lane before the earliest word's first phone, for the IWCD backscan.
    g_prev: Vec<f32>,
    bestt: usize,
    estimated_next_t: i32,
    last_tre: Option<TrellisWordId>,
    /// (grammar index, DFA state) in grammar mode.
    dfa_state: Option<(usize, u32)>,
}

pub struct Pass2<'a, 'm> {
    ctx: &'a SearchContext<'m>,
    scorer: &'a mut AcousticScorer<'m>,
    resolver: &'a mut ContextResolver,
    trellis: &'a Trellis,
    frames: &'a [Vec<f32>],
    num_frames: usize,
    /// Best trellis back score per connection frame: `best_before[t]` is
    /// the best word end at `t - 1`.
    best_before: Vec<f32>,
    opts: Pass2Options,
}

impl<'a, 'm> Pass2<'a, 'm> {
    pub fn new(
        ctx: &'a SearchContext<'m>,
        scorer: &'a mut AcousticScorer<'m>,
        resolver: &'a mut ContextResolver,
        trellis: &'a Trellis,
        frames: &'a [Vec<f32>],
        opts: Pass2Options,
    ) -> Self {
        let num_frames = frames.len().min(trellis.num_frames());
        let mut best_before = vec![LOG_ZERO; num_frames + 1];
        for (t, slot) in best_before.iter_mut().enumerate().skip(1) {
            if let Some(id) = trellis.best_at_frame(t - 1) {
                *slot = trellis.at(id).back_score;
            }
        }
        Self {
            ctx,
            scorer,
            resolver,
            trellis,
            frames,
            num_frames,
            best_before,
            opts,
        }
    }

    /// Run the stack search, returning up to `nbest` sentences ranked by
    /// score.
    pub fn run(&mut self) -> Vec<SentenceHypo> {
        let cfg = self.ctx.config;
        let mut stack: Vec<Hypo> = Vec::new(); // ascending by f, best last
        let mut finished: Vec<SentenceHypo> = Vec::new();

        for h in self.initial_hypotheses() {
            push_stack(&mut stack, h, cfg.stack_size);
        }

        let mut popped = 0usize;
        while let Some(h) = stack.pop() {
            popped += 1;
            if popped > cfg.hypo_overflow {
                log::warn!("pass2: hypothesis overflow at {}, stopping", popped);
                break;
            }

            if self.accepted(&h) {
                let score = h.g[0];
                if score > LOG_ZERO / 2.0 {
                    finished.push(self.to_sentence(h, score));
                    if finished.len() >= cfg.nbest {
                        break;
                    }
                }
                continue;
            }

            for nh in self.expand(&h) {
                push_stack(&mut stack, nh, cfg.stack_size);
            }
        }

        finished.sort_by(|a, b| b.score.total_cmp(&a.score));
        log::debug!(
            "pass2: {} sentences after {} pops",
            finished.len(),
            popped
        );
        finished
    }

    fn accepted(&self, h: &Hypo) -> bool {
        if let Some((_, state)) = h.dfa_state {
            return state == 0;
        }
        let first = *h.seq.last().unwrap();
        match self.opts.accept_word {
            Some(w) => first == w,
            None => Some(first) == self.ctx.dict.head_sil(),
        }
    }

    fn to_sentence(&self, h: Hypo, score: f32) -> SentenceHypo {
        let rev = |v: &[f32]| v.iter().rev().copied().collect::<Vec<f32>>();
        SentenceHypo {
            words: h.seq.iter().rev().copied().collect(),
            score,
            lm_scores: rev(&h.lm_scores),
            am_scores: rev(&h.am_scores),
            confidence: rev(&h.confidence),
            end_frames: h.end_frames.iter().rev().copied().collect(),
        }
    }

    /// Initial hypotheses: the sentence-tail silence word (or the segment
    /// boundary word) for N-grams, category-constrained last words for
    /// grammars.
    fn initial_hypotheses(&mut self) -> Vec<Hypo> {
        let t_last = self.num_frames;
        let mut end_lane = vec![LOG_ZERO; t_last + 1];
        end_lane[t_last] = 0.0;

        let mut out = Vec::new();
        match self.ctx.lm {
            LangModel::Ngram(ngram) => {
                let first = match self.opts.initial_word.or_else(|| self.ctx.dict.tail_sil()) {
                    Some(w) => w,
                    None => {
                        log::warn!("pass2: no sentence-tail word defined");
                        return out;
                    }
                };
                let lscore = match self.ctx.wton.and_then(|m| m[first as usize]) {
                    Some(nid) => {
                        self.ctx.config.lm_weight2
                            * (ngram.factoring_uni(nid) + self.ctx.dict.word(first).class_prob)
                            + self.ctx.config.lm_penalty2
                    }
                    None => 0.0,
                };
                if let Some(h) = self.start_hypo(first, &end_lane, lscore, None) {
                    out.push(h);
                }
            }
            LangModel::Grammar(grammars) => {
                for gid in grammars.active() {
                    let dfa = grammars.grammar(gid);
                    let mut seen: HashSet<(WordId, u32)> = HashSet::new();
                    for accept in dfa.accepting_states() {
                        for arc in dfa.arcs_into(accept) {
                            for (w, word) in self.ctx.dict.words() {
                                if word.category != Some(arc.category)
                                    || grammars.grammar_of_word(w) != Some(gid)
                                {
                                    continue;
                                }
                                if !seen.insert((w, arc.from)) {
                                    continue;
                                }
                                if let Some(h) =
                                    self.start_hypo(w, &end_lane, 0.0, Some((gid, arc.from)))
                                {
                                    out.push(h);
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn start_hypo(
        &mut self,
        word: WordId,
        end_lane: &[f32],
        lscore: f32,
        dfa_state: Option<(usize, u32)>,
    ) -> Option<Hypo> {
        // the initial word must have survived pass 1 near the input end
        let last_tre = self.find_end_support(word)?;
        let (g, g_prev) = self.scan_word(word, None, end_lane, lscore);
        let (f, amax) = self.estimate(&g)?;
        Some(Hypo {
            seq: vec![word],
            lm_scores: vec![lscore],
            am_scores: vec![f - lscore],
            confidence: vec![1.0],
            end_frames: vec![self.num_frames.saturating_sub(1)],
            f,
            g,
            g_prev,
            bestt: amax,
            estimated_next_t: amax as i32 - 1,
            last_tre: Some(last_tre),
            dfa_state,
        })
    }

    /// Trellis backing for an utterance-final word: an end within
    /// `lookup_range` of the last frame.
    fn find_end_support(&self, word: WordId) -> Option<TrellisWordId> {
        let last = self.num_frames.checked_sub(1)?;
        let range = self.ctx.config.lookup_range;
        for t in (last.saturating_sub(range)..=last).rev() {
            if let Some(id) = self.trellis.lookup(t, word, self.ctx.config.trellis_lookup) {
                return Some(id);
            }
        }
        log::debug!(
            "pass2: initial word {} has no trellis support near the input end",
            self.ctx.dict.word(word).name
        );
        None
    }

    /// `f` and the best connection frame for a hypothesis lane.
    fn estimate(&self, g: &[f32]) -> Option<(f32, usize)> {
        let mut best: Option<(f32, usize)> = None;
        for t in 0..self.num_frames {
            if g[t] <= LOG_ZERO / 2.0 {
                continue;
            }
            let h_star = if t == 0 { 0.0 } else { self.best_before[t] };
            if t > 0 && h_star <= LOG_ZERO / 2.0 {
                continue;
            }
            let f = g[t] + h_star;
            if best.map_or(true, |(b, _)| f > b) {
                best = Some((f, t));
            }
        }
        best
    }

    /// Expand one hypothesis into its next-word successors.
    fn expand(&mut self, h: &Hypo) -> Vec<Hypo> {
        let cfg = self.ctx.config;

        // stop expanding once the sentence head was reached
        if h.dfa_state.is_none() {
            let first = *h.seq.last().unwrap();
            let head = self.opts.accept_word.or_else(|| self.ctx.dict.head_sil());
            if Some(first) == head {
                return Vec::new();
            }
        }
        if h.estimated_next_t < 0 {
            return Vec::new();
        }

        let cands = self.collect_candidates(h);
        if cands.is_empty() {
            return Vec::new();
        }

        // scan every candidate, then attach confidence over the whole set
        let mut scanned: Vec<(Candidate, Hypo)> = Vec::new();
        for cand in cands {
            if let Some(nh) = self.apply_candidate(h, &cand) {
                scanned.push((cand, nh));
            }
        }
        if scanned.is_empty() {
            return Vec::new();
        }
        let best_f = scanned
            .iter()
            .map(|(_, nh)| nh.f)
            .fold(LOG_ZERO, f32::max);
        let denom: f32 = scanned
            .iter()
            .map(|(_, nh)| 10f32.powf(cfg.cm_alpha * (nh.f - best_f) / LN10))
            .sum();
        let mut out = Vec::with_capacity(scanned.len());
        for (_, mut nh) in scanned {
            let w = 10f32.powf(cfg.cm_alpha * (nh.f - best_f) / LN10);
            *nh.confidence.last_mut().unwrap() = w / denom;
            out.push(nh);
        }
        out
    }

    fn collect_candidates(&self, h: &Hypo) -> Vec<Candidate> {
        let cfg = self.ctx.config;
        let est = h.estimated_next_t;
        let mut cands: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<(WordId, u32)> = HashSet::new();

        let mut visit = |t: i32, cands: &mut Vec<Candidate>, seen: &mut HashSet<(WordId, u32)>| {
            if t < 0 || t as usize >= self.num_frames || t as usize >= h.bestt {
                return;
            }
            let t = t as usize;
            let mut last_wid: Option<WordId> = None;
            for &id in self.trellis.frame(t) {
                let atom = self.trellis.at(id);
                if last_wid == Some(atom.word) {
                    continue; // same word id group, handled via lookup mode
                }
                last_wid = Some(atom.word);
                let chosen = self
                    .trellis
                    .lookup(t, atom.word, cfg.trellis_lookup)
                    .unwrap_or(id);
                self.word_candidates(h, chosen, t, cands, seen);
            }
        };

        // center-out order so the nearest frame wins de-duplication
        for step in 0..cfg.lookup_range as i32 {
            visit(est - step, &mut cands, &mut seen);
            if step > 0 {
                visit(est + step, &mut cands, &mut seen);
            }
        }
        cands
    }

    fn word_candidates(
        &self,
        h: &Hypo,
        tre_id: TrellisWordId,
        t: usize,
        cands: &mut Vec<Candidate>,
        seen: &mut HashSet<(WordId, u32)>,
    ) {
        let cfg = self.ctx.config;
        let atom = self.trellis.at(tre_id);
        let w = atom.word;

        // the identical trellis word must not repeat itself
        if h.last_tre == Some(tre_id) {
            return;
        }

        match self.ctx.lm {
            LangModel::Ngram(ngram) => {
                // </s> appears only as the start of the backward search
                if Some(w) == self.ctx.dict.tail_sil() {
                    return;
                }
                if !seen.insert((w, 0)) {
                    return;
                }
                let w_nid = match self.ctx.wton.and_then(|m| m[w as usize]) {
                    Some(id) => id,
                    None => return,
                };
                // LM context: nearest following non-transparent words
                let order = ngram
                    .backward
                    .as_ref()
                    .or(ngram.forward.as_ref())
                    .map(|s| s.order)
                    .unwrap_or(2);
                let mut future: Vec<u32> = Vec::new();
                for &pw in h.seq.iter().rev() {
                    if self.ctx.dict.word(pw).transparent {
                        continue;
                    }
                    if let Some(nid) = self.ctx.wton.and_then(|m| m[pw as usize]) {
                        future.push(nid);
                    }
                    if future.len() >= order - 1 {
                        break;
                    }
                }
                let raw = ngram.backward_prob(w_nid, &future) + self.ctx.dict.word(w).class_prob;
                let mut lscore = cfg.lm_weight2 * raw + cfg.lm_penalty2;
                let adjacent = *h.seq.last().unwrap();
                if self.ctx.dict.word(w).transparent && self.ctx.dict.word(adjacent).transparent {
                    lscore += cfg.transparent_penalty;
                }
                cands.push(Candidate {
                    word: w,
                    tre: tre_id,
                    end_frame: t,
                    lscore,
                    dfa_state: None,
                });
            }
            LangModel::Grammar(grammars) => {
                let (gid, state) = match h.dfa_state {
                    Some(s) => s,
                    None => return,
                };
                if grammars.grammar_of_word(w) != Some(gid) {
                    return;
                }
                let cat = match self.ctx.dict.word(w).category {
                    Some(c) => c,
                    None => return,
                };
                let dfa = grammars.grammar(gid);
                for arc in dfa.arcs_into(state) {
                    if arc.category != cat {
                        continue;
                    }
                    if !seen.insert((w, arc.from)) {
                        continue;
                    }
                    cands.push(Candidate {
                        word: w,
                        tre: tre_id,
                        end_frame: t,
                        lscore: 0.0,
                        dfa_state: Some((gid, arc.from)),
                    });
                }
            }
        }
    }

    fn apply_candidate(&mut self, h: &Hypo, cand: &Candidate) -> Option<Hypo> {
        let prev_first = *h.seq.last().unwrap();

        // IWCD backscan: the earliest word's first phone now has a known
        // left context (the candidate's final phone)
        let lc_base = self.ctx.dict.last_phone_base(cand.word).to_string();
        let first_phone = self.ctx.dict.word(prev_first).phones[0];
        let corrected = self.rescan_first_phone(first_phone, &lc_base, &h.g_prev, &h.g);

        // scan the new word; its last phone takes the next word's first
        // base phone as right context
        let rc_base = self.ctx.dict.first_phone_base(prev_first).to_string();
        let (g, g_prev) = self.scan_word(cand.word, Some(&rc_base), &corrected, cand.lscore);

        let (f, amax) = self.estimate(&g)?;
        let mut nh = Hypo {
            seq: h.seq.clone(),
            lm_scores: h.lm_scores.clone(),
            am_scores: h.am_scores.clone(),
            confidence: h.confidence.clone(),
            end_frames: h.end_frames.clone(),
            f,
            g,
            g_prev,
            bestt: amax,
            estimated_next_t: amax as i32 - 1,
            last_tre: Some(cand.tre),
            dfa_state: cand.dfa_state,
        };
        nh.seq.push(cand.word);
        nh.lm_scores.push(cand.lscore);
        nh.am_scores.push(f - h.f - cand.lscore);
        nh.confidence.push(1.0);
        nh.end_frames.push(cand.end_frame);
        Some(nh)
    }

    /// Re-run the Viterbi of a single phone with a corrected left context,
    /// on top of the lane saved before that phone was first scanned.
    fn rescan_first_phone(
        &mut self,
        phone: LogId,
        left_base: &str,
        lane_before: &[f32],
        lane_fallback: &[f32],
    ) -> Vec<f32> {
        let name = self.ctx.hmm.logical(phone).name.clone();
        let fixed = add_left_context(&name, left_base);
        let resolved = match self.ctx.hmm.logical_id(&fixed) {
            Some(id) => match self.ctx.hmm.logical(id).body {
                LogicalBody::Defined(p) => ResolvedRef::Defined(p),
                LogicalBody::Pseudo(ps) => ResolvedRef::Pseudo(ps),
            },
            None => return lane_fallback.to_vec(),
        };
        self.scan_phone(resolved, lane_before)
    }

    /// Backward Viterbi of one word over all frames. Returns the new lane
    /// and the lane before the word's first phone.
    fn scan_word(
        &mut self,
        word: WordId,
        next_first_base: Option<&str>,
        lane: &[f32],
        lscore: f32,
    ) -> (Vec<f32>, Vec<f32>) {
        let cfg = self.ctx.config;
        let phones: Vec<LogId> = self.ctx.dict.word(word).phones.clone();

        let mut cur: Vec<f32> = lane
            .iter()
            .map(|&v| if v > LOG_ZERO / 2.0 { v + lscore } else { v })
            .collect();
        let mut prev_lane = cur.clone();

        for (idx, &phone) in phones.iter().enumerate().rev() {
            if idx == 0 {
                prev_lane = cur.clone();
            }
            let resolved = if idx == phones.len() - 1 {
                self.resolve_scan(phone, next_first_base)
            } else {
                self.resolve_scan(phone, None)
            };
            cur = self.scan_phone(resolved, &cur);
            if cfg.scan_beam_thres > 0.0 {
                let best = cur.iter().copied().fold(LOG_ZERO, f32::max);
                if best > LOG_ZERO / 2.0 {
                    for v in cur.iter_mut() {
                        if *v < best - cfg.scan_beam_thres {
                            *v = LOG_ZERO;
                        }
                    }
                }
            }
        }
        (cur, prev_lane)
    }

    fn resolve_scan(&self, phone: LogId, right_base: Option<&str>) -> ResolvedRef {
        let logical = self.ctx.hmm.logical(phone);
        if let Some(rc) = right_base {
            let name = add_right_context(&logical.name, rc);
            if let Some(id) = self.ctx.hmm.logical_id(&name) {
                if let LogicalBody::Defined(p) = self.ctx.hmm.logical(id).body {
                    return ResolvedRef::Defined(p);
                }
            }
        }
        match logical.body {
            LogicalBody::Defined(p) => ResolvedRef::Defined(p),
            LogicalBody::Pseudo(ps) => ResolvedRef::Pseudo(ps),
        }
    }

    /// One-phone backward Viterbi step over the whole lane.
    fn scan_phone(&mut self, resolved: ResolvedRef, lane_in: &[f32]) -> Vec<f32> {
        let hmm = self.ctx.hmm;
        let frames = self.frames;
        let (trans, nstate) = match resolved {
            ResolvedRef::Defined(p) => {
                let phys = hmm.physical(p);
                (phys.trans, phys.states.len())
            }
            ResolvedRef::Pseudo(ps) => {
                let repr = hmm.pseudo_phone(ps).repr;
                let n = hmm.pseudo_phone(ps).state_sets.len();
                (hmm.physical(repr).trans, n)
            }
        };
        let tm = &hmm.trans[trans as usize];
        let exit = tm.nstate - 1;
        let t_len = self.num_frames;

        let mut lane_out = vec![LOG_ZERO; t_len + 1];
        let mut bb_next = vec![LOG_ZERO; nstate];
        let mut bb_cur = vec![LOG_ZERO; nstate];

        for t in (0..t_len).rev() {
            for j in 0..nstate {
                let row = j + 1;
                let mut best = LOG_ZERO;
                if tm.is_arc(row, exit) && lane_in[t + 1] > LOG_ZERO / 2.0 {
                    best = tm.get(row, exit) + lane_in[t + 1];
                }
                for k in 0..nstate {
                    if !tm.is_arc(row, k + 1) || bb_next[k] <= LOG_ZERO / 2.0 {
                        continue;
                    }
                    let cand = tm.get(row, k + 1) + bb_next[k];
                    if cand > best {
                        best = cand;
                    }
                }
                if best <= LOG_ZERO / 2.0 {
                    bb_cur[j] = LOG_ZERO;
                    continue;
                }
                let frame = frames[t].as_slice();
                let e = match resolved.states_at(hmm, j) {
                    ResolvedStates::One(sid) => self.scorer.score_state(t as i32, frame, sid),
                    ResolvedStates::Set(set) => self.scorer.score_set(t as i32, frame, set),
                };
                bb_cur[j] = best + e;
            }
            let mut entry_best = LOG_ZERO;
            for j in 0..nstate {
                if tm.is_arc(0, j + 1) && bb_cur[j] > LOG_ZERO / 2.0 {
                    let cand = tm.get(0, j + 1) + bb_cur[j];
                    if cand > entry_best {
                        entry_best = cand;
                    }
                }
            }
            lane_out[t] = entry_best;
            std::mem::swap(&mut bb_next, &mut bb_cur);
        }
        lane_out
    }
}

struct Candidate {
    word: WordId,
    tre: TrellisWordId,
    end_frame: usize,
    lscore: f32,
    dfa_state: Option<(usize, u32)>,
}

/// Insert keeping ascending order by `f` and the stack bounded.
fn push_stack(stack: &mut Vec<Hypo>, h: Hypo, cap: usize) {
    let pos = stack.partition_point(|x| x.f < h.f);
    stack.insert(pos, h);
    if stack.len() > cap {
        stack.remove(0);
    }
}

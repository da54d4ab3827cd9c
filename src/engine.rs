//! Top-level recognition engine.
//!
//! The [`Engine`] value owns every piece of process-wide state: the loaded
//! models, the tree lexicon, the front end and the registered callbacks.
//! Per-utterance structures (token arenas, trellis, caches) are created
//! inside the stream loop and dropped with it.
//!
//! Decoding is single-threaded and cooperative: the loop alternates
//! between pulling samples, draining ready feature frames into pass 1 and
//! checking the host's pause/terminate flags between frames. On end of
//! input (or a decoder-detected short-pause segment boundary) the trellis
//! is frozen and pass 2 produces the N-best sentences. Grammar updates
//! requested while a stream is running are queued and applied at the next
//! between-utterance safe point.

use crate::am::{outprob_handle, AcousticScorer, ContextResolver, GmmVerifier};
use crate::audio::{AudioError, AudioSource};
use crate::config::DecoderConfig;
use crate::dict::{WordId, WordLexicon};
use crate::error::{DecodeError, Result};
use crate::hmm::{HmmSet, LOG_ZERO};
use crate::lexicon::TreeLexicon;
use crate::lm::{DfaGrammar, LangModel};
use crate::mfcc::FrontEnd;
use crate::pass1::{Pass1, SearchContext, StepResult};
use crate::pass2::{Pass2, Pass2Options, SentenceHypo};
use crate::result::{RecognitionResult, SentenceResult, UtteranceStatus, WordResult};
use crate::trellis::Trellis;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host-side control handle; flags are checked between frames.
#[derive(Clone, Default)]
pub struct EngineControl {
    terminate: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl EngineControl {
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    fn take_terminate(&self) -> bool {
        self.terminate.swap(false, Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// Event hooks fired from the decoding thread at well-defined points.
/// Implementations observe; they cannot mutate engine state.
pub trait EngineCallbacks {
    fn on_stream_begin(&mut self) {}
    fn on_utterance_begin(&mut self) {}
    fn on_frame(&mut self, _t: usize) {}
    fn on_result(&mut self, _result: &RecognitionResult) {}
    fn on_utterance_end(&mut self) {}
    fn on_stream_end(&mut self) {}
}

/// A word entry accompanying a dynamically added grammar.
pub struct GrammarWord {
    pub name: String,
    pub output: String,
    pub category: u32,
    pub phones: Vec<String>,
}

/// Deferred grammar modification.
pub enum GrammarUpdate {
    SetActive { grammar: usize, active: bool },
    Add { dfa: DfaGrammar, words: Vec<GrammarWord> },
}

pub struct Engine {
    config: DecoderConfig,
    hmm: HmmSet,
    dict: WordLexicon,
    lm: LangModel,
    lex: TreeLexicon,
    frontend: FrontEnd,
    wton: Option<Vec<Option<u32>>>,
    gmm: Option<GmmVerifier>,
    callbacks: Vec<Box<dyn EngineCallbacks>>,
    control: EngineControl,
    pending_updates: Vec<GrammarUpdate>,
}

impl Engine {
    /// Build an engine from loaded models. Fails on configuration or
    /// model/feature mismatches; a started engine is ready to decode.
    pub fn new(
        mut hmm: HmmSet,
        mut dict: WordLexicon,
        lm: LangModel,
        config: DecoderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let frontend = FrontEnd::new(&config.analysis)?;
        frontend.check_model(&hmm)?;
        if dict.is_empty() {
            return Err(DecodeError::Dictionary("empty dictionary".into()));
        }

        let wton: Option<Vec<Option<u32>>> = match &lm {
            LangModel::Ngram(m) => {
                let map: Vec<Option<u32>> = dict
                    .words()
                    .map(|(_, w)| {
                        let id = m.id_or_unk(&w.name);
                        if id.is_none() {
                            log::warn!("word {} not in language model", w.name);
                        }
                        id
                    })
                    .collect();
                Some(map)
            }
            LangModel::Grammar(g) => {
                if g.is_empty() {
                    return Err(DecodeError::GrammarInvalid("no grammar loaded".into()));
                }
                None
            }
        };

        let sp_model = config.search.sp_model.clone();
        let lex = match (&lm, &wton) {
            (LangModel::Ngram(m), Some(map)) => {
                let uni = |w: WordId| {
                    map[w as usize]
                        .map(|id| m.factoring_uni(id))
                        .unwrap_or(LOG_ZERO)
                };
                TreeLexicon::build(&dict, &mut hmm, Some(&uni), sp_model.as_deref())?
            }
            _ => TreeLexicon::build(&dict, &mut hmm, None, sp_model.as_deref())?,
        };

        // mark sentence silence words when present
        if dict.head_sil().is_none() {
            let _ = dict.set_silence_words("<s>", "</s>");
        }

        log::info!(
            "engine ready: {} words, {} tree nodes, {} HMM states",
            dict.num_words(),
            lex.num_nodes(),
            hmm.states.len()
        );
        Ok(Self {
            config,
            hmm,
            dict,
            lm,
            lex,
            frontend,
            wton,
            gmm: None,
            callbacks: Vec::new(),
            control: EngineControl::default(),
            pending_updates: Vec::new(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn dict(&self) -> &WordLexicon {
        &self.dict
    }

    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn add_callback(&mut self, cb: Box<dyn EngineCallbacks>) {
        self.callbacks.push(cb);
    }

    pub fn set_gmm(&mut self, gmm: GmmVerifier) {
        self.gmm = Some(gmm);
    }

    pub fn set_noise_spectrum(&mut self, noise: Option<Vec<f32>>) -> Result<()> {
        self.frontend.set_noise_spectrum(noise)
    }

    /// Serialize the CMN/CVN prior for the next session.
    pub fn save_cmn(&self) -> String {
        self.frontend.cmn().save()
    }

    /// Restore a CMN/CVN prior saved earlier.
    pub fn load_cmn(&mut self, content: &str) -> Result<()> {
        self.frontend
            .cmn_mut()
            .load(content)
            .map_err(DecodeError::ConfigInvalid)
    }

    /// Queue a grammar update; it is applied at the next safe point
    /// between utterances, never mid-frame.
    pub fn request_grammar_update(&mut self, update: GrammarUpdate) {
        self.pending_updates.push(update);
    }

    pub fn pending_grammar_updates(&self) -> usize {
        self.pending_updates.len()
    }

    fn apply_grammar_updates(&mut self) -> Result<()> {
        if self.pending_updates.is_empty() {
            return Ok(());
        }
        let updates = std::mem::take(&mut self.pending_updates);
        let grammars = match &mut self.lm {
            LangModel::Grammar(g) => g,
            LangModel::Ngram(_) => {
                return Err(DecodeError::GrammarInvalid(
                    "grammar update requested on an n-gram engine".into(),
                ))
            }
        };
        let mut rebuild = false;
        for update in updates {
            match update {
                GrammarUpdate::SetActive { grammar, active } => {
                    if grammar >= grammars.len() {
                        return Err(DecodeError::GrammarInvalid(format!(
                            "no grammar {}",
                            grammar
                        )));
                    }
                    grammars.set_active(grammar, active);
                    log::info!("grammar {} set {}", grammar, if active { "active" } else { "inactive" });
                }
                GrammarUpdate::Add { dfa, words } => {
                    let begin = self.dict.num_words() as WordId;
                    for w in &words {
                        let phones: Vec<&str> = w.phones.iter().map(|p| p.as_str()).collect();
                        let id = self
                            .dict
                            .add_word(&w.name, &w.output, &phones, &mut self.hmm, true)
                            .map_err(DecodeError::Dictionary)?;
                        self.dict.set_category(id, w.category);
                    }
                    let end = self.dict.num_words() as WordId;
                    grammars.add_grammar(dfa, begin, end);
                    rebuild = true;
                }
            }
        }
        if rebuild {
            self.lex = TreeLexicon::build(
                &self.dict,
                &mut self.hmm,
                None,
                self.config.search.sp_model.as_deref(),
            )?;
            log::info!("tree lexicon rebuilt: {} nodes", self.lex.num_nodes());
        }
        Ok(())
    }

    /// Decode a stream of audio. Returns one result per utterance (several
    /// when segmentation splits the stream).
    pub fn run_stream(&mut self, audio: &mut dyn AudioSource) -> Result<Vec<RecognitionResult>> {
        if audio.sample_rate() != self.config.analysis.sample_freq {
            return Err(DecodeError::FormatMismatch(format!(
                "audio source at {} Hz, engine configured for {} Hz",
                audio.sample_rate(),
                self.config.analysis.sample_freq
            )));
        }
        self.apply_grammar_updates()?;

        let Engine {
            config,
            hmm,
            dict,
            lm,
            lex,
            frontend,
            wton,
            gmm,
            callbacks,
            control,
            ..
        } = self;
        let hmm: &HmmSet = hmm;
        let dict: &WordLexicon = dict;
        let lex: &TreeLexicon = lex;
        let lm: &LangModel = lm;
        let ctx = SearchContext {
            hmm,
            dict,
            lex,
            lm,
            config: &config.search,
            wton: wton.as_deref(),
        };

        let mut scorer = AcousticScorer::new(hmm, &config.search);
        let mut resolver = ContextResolver::new(lex.num_nodes());
        let mut pass1 = Pass1::new(lex.num_nodes());
        let mut trellis = Trellis::new();
        let mut frames: Vec<Vec<f32>> = Vec::new();
        let mut results = Vec::new();

        frontend.prepare();
        scorer.prepare();
        pass1.prepare();
        trellis.prepare();
        if let Some(g) = gmm.as_mut() {
            g.prepare();
        }

        for cb in callbacks.iter_mut() {
            cb.on_stream_begin();
            cb.on_utterance_begin();
        }

        let mut dead = false;
        let mut eof = false;
        let mut boundary = false;
        let mut continuation = false;
        let mut buf = [0i16; 1024];

        loop {
            // host control, between frames only
            while control.is_paused() && !control.terminate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            if control.take_terminate() {
                log::info!("terminate requested, aborting utterance");
                let res = RecognitionResult::rejected(UtteranceStatus::Terminate, frames.len());
                for cb in callbacks.iter_mut() {
                    cb.on_result(&res);
                    cb.on_utterance_end();
                    cb.on_stream_end();
                }
                results.push(res);
                return Ok(results);
            }

            if let Some(frame) = frontend.pop_frame() {
                let t = frames.len();
                if let Some(g) = gmm.as_mut() {
                    g.proceed(&frame);
                }
                frames.push(frame);
                if !dead {
                    match pass1.step(
                        &ctx,
                        &mut scorer,
                        &mut resolver,
                        &mut trellis,
                        &frames[t],
                        t,
                    ) {
                        StepResult::Alive => {}
                        StepResult::Dead => dead = true,
                        StepResult::SegmentTrigger => {
                            let sp_run = pass1.sp_count;
                            let boundary_len = (t + 1).saturating_sub(sp_run);
                            let res = finalize_utterance(
                                &ctx,
                                &mut scorer,
                                &mut resolver,
                                &mut trellis,
                                &frames[..boundary_len],
                                config,
                                frontend.avg_power(),
                                gmm.as_ref().and_then(|g| g.result()).map(|r| r.1),
                                dead,
                                true,
                                continuation,
                            );
                            frontend.finish_utterance();
                            frontend.cmn_mut().prepare();
                            for cb in callbacks.iter_mut() {
                                cb.on_result(&res);
                                cb.on_utterance_end();
                                cb.on_utterance_begin();
                            }
                            results.push(res);

                            // resume pass 1 from the backstep margin
                            let restart =
                                (t + 1).saturating_sub(config.search.sp_backstep_margin);
                            let carried: Vec<Vec<f32>> = frames.split_off(restart);
                            frames.clear();
                            trellis.prepare();
                            pass1.prepare();
                            scorer.prepare();
                            resolver.clear(lex.num_nodes());
                            if let Some(g) = gmm.as_mut() {
                                g.prepare();
                            }
                            for f in carried {
                                let t2 = frames.len();
                                if let Some(g) = gmm.as_mut() {
                                    g.proceed(&f);
                                }
                                frames.push(f);
                                let r = pass1.step(
                                    &ctx,
                                    &mut scorer,
                                    &mut resolver,
                                    &mut trellis,
                                    &frames[t2],
                                    t2,
                                );
                                if r == StepResult::Dead {
                                    dead = true;
                                    break;
                                }
                            }
                            continuation = true;
                        }
                    }
                }
                for cb in callbacks.iter_mut() {
                    cb.on_frame(t);
                }
                continue;
            }

            if eof {
                break;
            }

            if boundary {
                // utterance finished mid-stream: emit and reset
                let res = finalize_utterance(
                    &ctx,
                    &mut scorer,
                    &mut resolver,
                    &mut trellis,
                    &frames,
                    config,
                    frontend.avg_power(),
                    gmm.as_ref().and_then(|g| g.result()).map(|r| r.1),
                    dead,
                    false,
                    continuation,
                );
                frontend.finish_utterance();
                for cb in callbacks.iter_mut() {
                    cb.on_result(&res);
                    cb.on_utterance_end();
                    cb.on_utterance_begin();
                }
                results.push(res);

                frames.clear();
                trellis.prepare();
                pass1.prepare();
                scorer.prepare();
                resolver.clear(lex.num_nodes());
                frontend.prepare();
                if let Some(g) = gmm.as_mut() {
                    g.prepare();
                }
                dead = false;
                boundary = false;
                continuation = false;
                continue;
            }

            match audio.pull(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => frontend.push_samples(&buf[..n]),
                Err(AudioError::Eof) => {
                    frontend.flush();
                    eof = true;
                }
                Err(AudioError::SegmentBoundary) => {
                    frontend.flush();
                    boundary = true;
                }
                Err(e) => return Err(DecodeError::AudioRuntime(e)),
            }
        }

        let res = finalize_utterance(
            &ctx,
            &mut scorer,
            &mut resolver,
            &mut trellis,
            &frames,
            config,
            frontend.avg_power(),
            gmm.as_ref().and_then(|g| g.result()).map(|r| r.1),
            dead,
            false,
            continuation,
        );
        frontend.finish_utterance();
        for cb in callbacks.iter_mut() {
            cb.on_result(&res);
            cb.on_utterance_end();
            cb.on_stream_end();
        }
        results.push(res);
        Ok(results)
    }

    /// Decode precomputed feature vectors (MFCC file input path).
    pub fn run_on_frames(&mut self, frames: &[Vec<f32>]) -> Result<RecognitionResult> {
        if let Some(f) = frames.first() {
            if self.hmm.vec_len != 0 && f.len() != self.hmm.vec_len {
                return Err(DecodeError::FormatMismatch(format!(
                    "feature input dimension {} does not match model {}",
                    f.len(),
                    self.hmm.vec_len
                )));
            }
        }
        self.apply_grammar_updates()?;

        let Engine {
            config,
            hmm,
            dict,
            lm,
            lex,
            wton,
            callbacks,
            ..
        } = self;
        let hmm: &HmmSet = hmm;
        let dict: &WordLexicon = dict;
        let lex: &TreeLexicon = lex;
        let lm: &LangModel = lm;
        let ctx = SearchContext {
            hmm,
            dict,
            lex,
            lm,
            config: &config.search,
            wton: wton.as_deref(),
        };
        let mut scorer = AcousticScorer::new(hmm, &config.search);
        let mut resolver = ContextResolver::new(lex.num_nodes());
        let mut pass1 = Pass1::new(lex.num_nodes());
        let mut trellis = Trellis::new();
        scorer.prepare();
        pass1.prepare();
        trellis.prepare();

        for cb in callbacks.iter_mut() {
            cb.on_utterance_begin();
        }
        let mut dead = false;
        for (t, f) in frames.iter().enumerate() {
            if pass1.step(&ctx, &mut scorer, &mut resolver, &mut trellis, f, t)
                == StepResult::Dead
            {
                dead = true;
                break;
            }
            for cb in callbacks.iter_mut() {
                cb.on_frame(t);
            }
        }
        let res = finalize_utterance(
            &ctx,
            &mut scorer,
            &mut resolver,
            &mut trellis,
            frames,
            config,
            f32::MAX, // no raw power on feature input
            None,
            dead,
            false,
            false,
        );
        for cb in callbacks.iter_mut() {
            cb.on_result(&res);
            cb.on_utterance_end();
        }
        Ok(res)
    }
}

/// End-of-utterance processing shared by every input path: rejection
/// checks, trellis freeze, pass 2, fallback.
#[allow(clippy::too_many_arguments)]
fn finalize_utterance<'m>(
    ctx: &SearchContext<'m>,
    scorer: &mut AcousticScorer<'m>,
    resolver: &mut ContextResolver,
    trellis: &mut Trellis,
    frames: &[Vec<f32>],
    config: &DecoderConfig,
    avg_power: f32,
    gmm_rejected: Option<bool>,
    dead: bool,
    segmented: bool,
    continuation: bool,
) -> RecognitionResult {
    let num_frames = frames.len();
    if num_frames == 0 {
        log::info!("no input frame");
        return RecognitionResult::rejected(UtteranceStatus::Fail, 0);
    }

    let msec = num_frames as f32 * config.analysis.shift_ms();
    if config.reject.reject_short_ms > 0 && msec < config.reject.reject_short_ms as f32 {
        log::info!("input rejected: {:.0}ms is too short", msec);
        return RecognitionResult::rejected(UtteranceStatus::RejectShort, num_frames);
    }
    if config.reject.reject_long_ms > 0 && msec >= config.reject.reject_long_ms as f32 {
        log::info!("input rejected: {:.0}ms is too long", msec);
        return RecognitionResult::rejected(UtteranceStatus::RejectLong, num_frames);
    }
    if let Some(thres) = config.reject.power_reject_thres {
        if avg_power < thres {
            log::info!("input rejected: average power {:.2} below {:.2}", avg_power, thres);
            return RecognitionResult::rejected(UtteranceStatus::RejectPower, num_frames);
        }
    }
    if gmm_rejected == Some(true) {
        return RecognitionResult::rejected(UtteranceStatus::RejectGmm, num_frames);
    }
    if dead {
        return RecognitionResult::rejected(UtteranceStatus::Fail, num_frames);
    }

    // freeze the trellis for backward access
    trellis.relocate(num_frames);
    trellis.discount_pescore(|atom| {
        outprob_handle(
            scorer,
            resolver,
            ctx.hmm,
            ctx.dict,
            ctx.lex.wordend_handle[atom.word as usize],
            ctx.lex.wordend_node[atom.word as usize],
            atom.end_frame as i32,
            &frames[atom.end_frame as usize],
            atom.last_word,
        )
    });
    trellis.discount_lm();
    trellis.sort();

    if trellis.last_frame_with_words().is_none() {
        log::info!("no word survived pass 1");
        return RecognitionResult::rejected(UtteranceStatus::OnlySilence, num_frames);
    }

    let opts = Pass2Options {
        initial_word: if segmented {
            trellis
                .last_frame_with_words()
                .and_then(|t| trellis.best_at_frame(t))
                .map(|id| trellis.at(id).word)
        } else {
            None
        },
        accept_word: if continuation {
            trellis
                .first_frame_with_words()
                .and_then(|t| trellis.best_at_frame(t))
                .map(|id| trellis.at(id).word)
        } else {
            None
        },
    };

    let sentences = Pass2::new(ctx, scorer, resolver, trellis, frames, opts).run();
    if sentences.is_empty() {
        if config.search.fallback_1pass {
            if let Some(best) = trellis
                .last_frame_with_words()
                .and_then(|t| trellis.best_at_frame(t))
            {
                let words = trellis.backtrack(best);
                let score = trellis.at(best).back_score;
                let sentence = SentenceResult {
                    words: words
                        .into_iter()
                        .map(|w| WordResult {
                            word: w,
                            output: ctx.dict.word(w).output.clone(),
                            am_score: 0.0,
                            lm_score: 0.0,
                            confidence: None,
                            end_frame: None,
                        })
                        .collect(),
                    score,
                };
                log::info!("pass 2 failed, falling back to the pass-1 best");
                return RecognitionResult {
                    status: UtteranceStatus::Fail,
                    sentences: vec![sentence],
                    num_frames,
                };
            }
        }
        return RecognitionResult::rejected(UtteranceStatus::Fail, num_frames);
    }

    let sentences: Vec<SentenceResult> = sentences
        .into_iter()
        .map(|s| to_sentence_result(ctx.dict, s))
        .collect();
    RecognitionResult {
        status: UtteranceStatus::Ok,
        sentences,
        num_frames,
    }
}

fn to_sentence_result(dict: &WordLexicon, hypo: SentenceHypo) -> SentenceResult {
    let words = hypo
        .words
        .iter()
        .enumerate()
        .map(|(i, &w)| WordResult {
            word: w,
            output: dict.word(w).output.clone(),
            am_score: hypo.am_scores[i],
            lm_score: hypo.lm_scores[i],
            confidence: Some(hypo.confidence[i]),
            end_frame: Some(hypo.end_frames[i]),
        })
        .collect();
    SentenceResult {
        words,
        score: hypo.score,
    }
}

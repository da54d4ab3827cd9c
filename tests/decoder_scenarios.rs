//! End-to-end decoding scenarios with synthetic models.

mod common;

use asr_decoder_rs::audio::BufferSource;
use asr_decoder_rs::config::DecoderConfig;
use asr_decoder_rs::dict::WordLexicon;
use asr_decoder_rs::engine::Engine;
use asr_decoder_rs::error::DecodeError;
use asr_decoder_rs::lm::dfa::{DfaGrammar, GrammarSet};
use asr_decoder_rs::lm::ngram::{NgramEntry, NgramSet};
use asr_decoder_rs::lm::{LangModel, NgramModel};
use asr_decoder_rs::result::UtteranceStatus;
use common::*;

#[test]
fn silent_wave_is_power_rejected() {
    let mut config = DecoderConfig::default();
    config.reject.power_reject_thres = Some(15.0);
    let mut engine = audio_engine(config);

    // one second of digital silence at 16kHz
    let mut source = BufferSource::new(vec![0i16; 16000], 16000);
    let results = engine.run_stream(&mut source).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, UtteranceStatus::RejectPower);
    assert!(results[0].sentences.is_empty());
}

#[test]
fn too_short_input_is_rejected() {
    let mut config = DecoderConfig::default();
    config.reject.reject_short_ms = 300;
    let mut engine = audio_engine(config);

    // 0.05s of loud tone
    let samples: Vec<i16> = (0..800)
        .map(|i| (8000.0 * (0.2 * i as f32).sin()) as i16)
        .collect();
    let mut source = BufferSource::new(samples, 16000);
    let results = engine.run_stream(&mut source).unwrap();
    assert_eq!(results[0].status, UtteranceStatus::RejectShort);
}

#[test]
fn input_shorter_than_delta_context_fails_cleanly() {
    let config = DecoderConfig::default();
    let mut engine = audio_engine(config);

    // a single window: nothing survives the delta buffers
    let mut source = BufferSource::new(vec![100i16; 400], 16000);
    let results = engine.run_stream(&mut source).unwrap();
    assert_eq!(results[0].status, UtteranceStatus::Fail);
    assert_eq!(results[0].num_frames, 0);
}

#[test]
fn mismatched_sample_rate_is_fatal() {
    let config = DecoderConfig::default();
    let mut engine = audio_engine(config);
    let mut source = BufferSource::new(vec![0i16; 8000], 8000);
    assert!(matches!(
        engine.run_stream(&mut source),
        Err(DecodeError::FormatMismatch(_))
    ));
}

#[test]
fn isolated_word_yes_is_recognized() {
    let mut engine = yesno_engine();
    let result = engine.run_on_frames(&yes_frames()).unwrap();
    assert_eq!(result.status, UtteranceStatus::Ok);
    assert_eq!(result.best_text().unwrap(), "yes");

    // the full word sequence is wrapped in silence words
    let words: Vec<&str> = result.sentences[0]
        .words
        .iter()
        .map(|w| engine_word_name(&engine, w.word))
        .collect();
    assert_eq!(words, vec!["<s>", "yes", "</s>"]);
}

#[test]
fn isolated_word_no_is_recognized() {
    let mut engine = yesno_engine();
    let frames = frames_for(&[(-8.0, 5), (-2.0, 5), (-4.0, 5), (-8.0, 5)]);
    let result = engine.run_on_frames(&frames).unwrap();
    assert_eq!(result.status, UtteranceStatus::Ok);
    assert_eq!(result.best_text().unwrap(), "no");
}

fn engine_word_name(engine: &Engine, w: asr_decoder_rs::dict::WordId) -> &str {
    engine.dict().word(w).name.as_str()
}

/// Reverse bigram strongly preferring the sentence `<s> a b </s>`.
fn ab_engine(nbest: usize) -> Engine {
    let mut hmm = tone_model(&[("sil", -10.0), ("pa", 0.0), ("pb", 10.0)], 1);
    let mut dict = WordLexicon::default();
    dict.add_word("<s>", "", &["sil"], &mut hmm, false).unwrap();
    dict.add_word("a", "a", &["pa"], &mut hmm, false).unwrap();
    dict.add_word("b", "b", &["pb"], &mut hmm, false).unwrap();
    dict.add_word("</s>", "", &["sil"], &mut hmm, false)
        .unwrap();
    dict.set_silence_words("<s>", "</s>").unwrap();

    let names: Vec<String> = ["<s>", "a", "b", "</s>"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let forward = NgramSet {
        order: 1,
        counts: vec![4],
        unigrams: vec![NgramEntry::new(-0.6); 4],
    };
    let mut bw: Vec<NgramEntry> = vec![NgramEntry::new(-1.0); 4];
    bw[3].child_mut_or_insert(2, -0.05); // P(b | </s> follows)
    bw[2].child_mut_or_insert(1, -0.05); // P(a | b follows)
    bw[1].child_mut_or_insert(0, -0.05); // P(<s> | a follows)
    let backward = NgramSet {
        order: 2,
        counts: vec![4, 3],
        unigrams: bw,
    };
    let lm = LangModel::Ngram(NgramModel::new(names, Some(forward), Some(backward)).unwrap());

    let mut config = feature_config();
    config.search.nbest = nbest;
    Engine::new(hmm, dict, lm, config).unwrap()
}

#[test]
fn reverse_bigram_prefers_a_b() {
    let mut engine = ab_engine(2);
    let frames = frames_for(&[(-10.0, 4), (0.0, 4), (10.0, 4), (-10.0, 4)]);
    let result = engine.run_on_frames(&frames).unwrap();
    assert_eq!(result.status, UtteranceStatus::Ok);

    let words: Vec<&str> = result.sentences[0]
        .words
        .iter()
        .map(|w| engine_word_name(&engine, w.word))
        .collect();
    assert_eq!(words, vec!["<s>", "a", "b", "</s>"]);

    // scores monotone non-increasing across ranks
    for pair in result.sentences.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

fn grammar_engine(fallback: bool) -> Engine {
    let mut hmm = tone_model(&[("pa", 0.0), ("pb", 10.0)], 1);
    let mut dict = WordLexicon::default();
    dict.add_word("a", "a", &["pa"], &mut hmm, false).unwrap();
    dict.add_word("b", "b", &["pb"], &mut hmm, false).unwrap();
    dict.set_category(0, 0);
    dict.set_category(1, 1);
    // accepts exactly "a a"
    let dfa = DfaGrammar::parse("0 0 1 0\n1 0 2 0\n2 -1 -1 1\n").unwrap();
    let mut grammars = GrammarSet::default();
    grammars.add_grammar(dfa, 0, 2);

    let mut config = feature_config();
    config.search.fallback_1pass = fallback;
    Engine::new(hmm, dict, LangModel::Grammar(grammars), config).unwrap()
}

#[test]
fn grammar_rejects_unparseable_input() {
    let mut engine = grammar_engine(false);
    // input pronounces "a b", grammar only accepts "a a"
    let frames = frames_for(&[(0.0, 5), (10.0, 5)]);
    let result = engine.run_on_frames(&frames).unwrap();
    assert_eq!(result.status, UtteranceStatus::Fail);
    assert!(result.sentences.is_empty());
}

#[test]
fn grammar_failure_falls_back_to_pass1_when_asked() {
    let mut engine = grammar_engine(true);
    let frames = frames_for(&[(0.0, 5), (10.0, 5)]);
    let result = engine.run_on_frames(&frames).unwrap();
    assert_eq!(result.status, UtteranceStatus::Fail);
    // the pass-1 best is reported; only grammar-legal words appear
    assert!(!result.sentences.is_empty());
    for w in &result.sentences[0].words {
        assert_eq!(engine_word_name(&engine, w.word), "a");
    }
}

#[test]
fn grammar_accepts_matching_input() {
    let mut engine = grammar_engine(false);
    let frames = frames_for(&[(0.0, 5), (0.0, 5)]);
    let result = engine.run_on_frames(&frames).unwrap();
    assert_eq!(result.status, UtteranceStatus::Ok);
    let words: Vec<&str> = result.sentences[0]
        .words
        .iter()
        .map(|w| engine_word_name(&engine, w.word))
        .collect();
    assert_eq!(words, vec!["a", "a"]);
}

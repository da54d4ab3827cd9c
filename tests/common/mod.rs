//! Shared fixtures: tiny synthetic models with well-separated Gaussians so
//! decoding outcomes are deterministic.
#![allow(dead_code)]

use asr_decoder_rs::config::DecoderConfig;
use asr_decoder_rs::dict::WordLexicon;
use asr_decoder_rs::engine::Engine;
use asr_decoder_rs::hmm::binio::left_to_right_trans;
use asr_decoder_rs::hmm::{Gaussian, HmmSet, HmmState, MixturePdf};
use asr_decoder_rs::lm::ngram::{NgramEntry, NgramSet};
use asr_decoder_rs::lm::{LangModel, NgramModel};

/// One-emitting-state monophones over a `dim`-dimensional space, mean of
/// every dimension set to the given value.
pub fn tone_model(phones: &[(&str, f32)], dim: usize) -> HmmSet {
    let mut set = HmmSet::new(dim);
    for &(name, mean) in phones {
        let d = set.add_density(Gaussian::from_variance(vec![mean; dim], vec![0.1; dim]));
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

/// Flat unigram model over the given vocabulary.
pub fn flat_unigram(names: &[&str]) -> NgramModel {
    let p = -(names.len() as f32).log10();
    let unigrams: Vec<NgramEntry> = names.iter().map(|_| NgramEntry::new(p)).collect();
    let set = NgramSet {
        order: 1,
        counts: vec![names.len()],
        unigrams,
    };
    NgramModel::new(
        names.iter().map(|s| s.to_string()).collect(),
        Some(set),
        None,
    )
    .unwrap()
}

/// Analysis settings producing one-dimensional feature vectors, for the
/// direct feature-input path.
pub fn feature_config() -> DecoderConfig {
    let mut config = DecoderConfig::default();
    config.analysis.mfcc_dim = 1;
    config.analysis.energy = false;
    config.analysis.delta = false;
    config.analysis.cmn = false;
    config
}

/// Constant frames at the given means, `len` frames each.
pub fn frames_for(segments: &[(f32, usize)]) -> Vec<Vec<f32>> {
    let mut out = Vec::new();
    for &(mean, len) in segments {
        out.extend((0..len).map(|_| vec![mean]));
    }
    out
}

/// Engine accepting real 16kHz audio at the default analysis settings.
pub fn audio_engine(config: DecoderConfig) -> Engine {
    let dim = config.analysis.vec_len();
    let mut hmm = tone_model(&[("sil", 0.0), ("a", 5.0)], dim);
    let mut dict = WordLexicon::default();
    dict.add_word("<s>", "", &["sil"], &mut hmm, false).unwrap();
    dict.add_word("</s>", "", &["sil"], &mut hmm, false)
        .unwrap();
    dict.add_word("word", "word", &["a"], &mut hmm, false)
        .unwrap();
    dict.set_silence_words("<s>", "</s>").unwrap();
    let lm = LangModel::Ngram(flat_unigram(&["<s>", "</s>", "word"]));
    Engine::new(hmm, dict, lm, config).unwrap()
}

/// Engine over {"yes" = y eh s, "no" = n ow} with silence words, driven by
/// one-dimensional feature input.
pub fn yesno_engine() -> Engine {
    let mut hmm = tone_model(
        &[
            ("sil", -8.0),
            ("y", 0.0),
            ("eh", 2.0),
            ("s", 4.0),
            ("n", -2.0),
            ("ow", -4.0),
        ],
        1,
    );
    let mut dict = WordLexicon::default();
    dict.add_word("<s>", "", &["sil"], &mut hmm, false).unwrap();
    dict.add_word("</s>", "", &["sil"], &mut hmm, false)
        .unwrap();
    dict.add_word("yes", "yes", &["y", "eh", "s"], &mut hmm, false)
        .unwrap();
    dict.add_word("no", "no", &["n", "ow"], &mut hmm, false)
        .unwrap();
    dict.set_silence_words("<s>", "</s>").unwrap();
    let lm = LangModel::Ngram(flat_unigram(&["<s>", "</s>", "yes", "no"]));
    Engine::new(hmm, dict, lm, feature_config()).unwrap()
}

/// Feature frames pronouncing "yes" between silences.
pub fn yes_frames() -> Vec<Vec<f32>> {
    frames_for(&[
        (-8.0, 5),
        (0.0, 5),
        (2.0, 5),
        (4.0, 5),
        (-8.0, 5),
    ])
}

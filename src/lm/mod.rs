//! Language models: statistical N-gram and finite-state grammar.

pub mod arpa;
pub mod dfa;
pub mod ngram;

pub use dfa::{DfaGrammar, GrammarSet};
pub use ngram::{NgramModel, NgramSet};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmError {
    #[error("ARPA parse error at line {line}: {msg}")]
    Arpa { line: usize, msg: String },

    #[error("grammar parse error at line {line}: {msg}")]
    Grammar { line: usize, msg: String },

    #[error("language model mismatch: {0}")]
    Mismatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The language model driving the search, one of the two supported kinds.
pub enum LangModel {
    Ngram(NgramModel),
    Grammar(GrammarSet),
}

impl LangModel {
    pub fn as_ngram(&self) -> Option<&NgramModel> {
        match self {
            LangModel::Ngram(m) => Some(m),
            LangModel::Grammar(_) => None,
        }
    }

    pub fn as_grammar(&self) -> Option<&GrammarSet> {
        match self {
            LangModel::Grammar(g) => Some(g),
            LangModel::Ngram(_) => None,
        }
    }
}

use crate::audio::AudioError;
use crate::hmm::ModelError;
use crate::lm::LmError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Model load error: {0}")]
    ModelLoad(ModelError),

    #[error("Language model error: {0}")]
    Lm(LmError),

    #[error("Grammar error: {0}")]
    GrammarInvalid(String),

    #[error("Feature/model format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Audio open error: {0}")]
    AudioOpen(String),

    #[error("Audio runtime error: {0}")]
    AudioRuntime(AudioError),

    #[error("Dictionary error: {0}")]
    Dictionary(String),

    #[error("Internal state corruption: {0}")]
    StateCorruption(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ModelError> for DecodeError {
    fn from(err: ModelError) -> Self {
        DecodeError::ModelLoad(err)
    }
}

impl From<LmError> for DecodeError {
    fn from(err: LmError) -> Self {
        DecodeError::Lm(err)
    }
}

impl From<AudioError> for DecodeError {
    fn from(err: AudioError) -> Self {
        DecodeError::AudioRuntime(err)
    }
}

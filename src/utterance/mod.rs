pub mod types;
pub mod words;

pub use types::{
    Gender, SpeechError, Utterance, UtteranceEvent, UtteranceId, UtteranceStatus, VoiceDescriptor,
};
pub use words::{word_boundaries, WordBoundary};

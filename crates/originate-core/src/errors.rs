//! Error types for the originate engine
//!
//! Only dial-string structure errors ever escape [`crate::OriginateEngine::originate`].
//! Every other failure is scoped to a leg or an AND-group and is folded into the
//! returned cause code and status by the outcome resolver.

use thiserror::Error;

use crate::types::CauseCode;

#[derive(Error, Debug)]
pub enum OriginateError {
    /// Malformed dial string (unbalanced brace or bracket).
    #[error("Dial string parse error at byte {position}: {reason}")]
    Parse { reason: String, position: usize },

    #[error("No origination URL specified")]
    EmptyDialString,

    /// Channel factory refused to create a leg.
    #[error("Cannot create outgoing channel of type [{endpoint}] cause: [{cause}]")]
    Launch { endpoint: String, cause: CauseCode },

    #[error("Race timed out")]
    RaceTimeout,

    #[error("Race cancelled: {0}")]
    RaceCancelled(CauseCode),

    #[error("Every leg was rejected")]
    RaceAllRejected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("CDR generation failed: {0}")]
    Cdr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OriginateError {
    pub fn parse(reason: impl Into<String>, position: usize) -> Self {
        OriginateError::Parse {
            reason: reason.into(),
            position,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        OriginateError::Config(message.into())
    }

    pub fn channel(message: impl Into<String>) -> Self {
        OriginateError::Channel(message.into())
    }

    pub fn media(message: impl Into<String>) -> Self {
        OriginateError::Media(message.into())
    }

    /// True for errors that abort the whole originate call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OriginateError::Parse { .. } | OriginateError::EmptyDialString
        )
    }
}

pub type Result<T> = std::result::Result<T, OriginateError>;

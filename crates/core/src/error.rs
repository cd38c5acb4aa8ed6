/// Result alias that carries the custom [`SonifierError`] type.
pub type Result<T> = std::result::Result<T, SonifierError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SonifierError {
    /// Free-form message, used for lock poisoning and other conditions that
    /// do not warrant a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed pipeline preset.
    #[error("invalid preset: {0}")]
    Json(#[from] serde_json::Error),
    /// A note definition string could not be parsed.
    #[error("invalid note `{0}`")]
    InvalidNote(String),
    /// A MIDI value (pitch, bend, velocity, controller, program) outside 0..=127.
    #[error("{what} {value} out of midi range")]
    OutOfMidiRange { what: &'static str, value: i64 },
    /// A color axis assignment that is not a permutation of the three components.
    #[error("invalid color axis: {0}")]
    InvalidAxis(String),
    /// Any other rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The column sampler could not produce colors for a tick.
    #[error("sampling failed: {0}")]
    Sampling(String),
    /// MIDI backend failures (init, port lookup, connect, send).
    #[error("midi error: {0}")]
    Midi(String),
    /// A worker thread could not be spawned or joined.
    #[error("thread error: {0}")]
    Thread(String),
}

impl SonifierError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<&str> for SonifierError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SonifierError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Checks that `value` fits the 7-bit MIDI data range.
pub(crate) fn midi_value(what: &'static str, value: i64) -> Result<u8> {
    if (0..=127).contains(&value) {
        Ok(value as u8)
    } else {
        Err(SonifierError::OutOfMidiRange { what, value })
    }
}

//! Encoder error types

/// Error type for encoder process management
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// The subprocess could not be created at all
    #[error("failed to spawn encoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess started without a readable stdout
    #[error("encoder stdout was not captured")]
    MissingStdout,
}

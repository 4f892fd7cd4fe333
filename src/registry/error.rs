//! Registry error types

use super::sink::SinkId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A sink with this id is already attached (caller bug)
    #[error("sink already attached: {0}")]
    DuplicateSink(SinkId),
}

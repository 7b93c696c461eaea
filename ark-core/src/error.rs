/// Errors produced by the `ark-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM name failed validation.
    #[error("invalid VM name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// A memory or disk size string could not be parsed.
    #[error("invalid size '{value}': {reason}")]
    InvalidSize { value: String, reason: String },

    /// A request field failed validation.
    #[error("validation failed for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

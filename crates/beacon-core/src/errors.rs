/// Failures decoding or encoding a wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope encode failed: {0}")]
    Encode(String),

    #[error("{kind} envelope missing field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

impl ProtocolError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Encode(_) => "encode",
            Self::MissingField { .. } => "missing_field",
        }
    }
}

use weft_base::{Hash, ValueError};

/// Errors produced while literalizing, deliteralizing or validating objects.
#[derive(Debug, thiserror::Error)]
pub enum LiteralError {
    /// The hash recomputed from a reconstructed object disagrees with the
    /// hash it was requested under.
    #[error("computed hash {computed} does not match declared hash {declared}")]
    WrongHash {
        /// The hash the literal was stored or requested under.
        declared: Hash,
        /// The hash recomputed from the reconstructed object.
        computed: Hash,
    },
    /// An authored object's signature did not verify against its author.
    #[error("signature verification failed for {hash}")]
    BadSignature {
        /// Hash of the offending object.
        hash: Hash,
    },
    /// An authored object carries no signature.
    #[error("object {hash} is authored but carries no signature")]
    MissingSignature {
        /// Hash of the offending object.
        hash: Hash,
    },
    /// The class named in a literal is not registered.
    #[error("unknown class {name:?}")]
    UnknownClass {
        /// The unregistered class name.
        name: String,
    },
    /// The literal value does not have the expected shape.
    #[error("invalid literal: {reason}")]
    InvalidLiteral {
        /// What was wrong with it.
        reason: String,
    },
    /// The class-specific `validate` hook rejected the object.
    #[error("validation failed for class {class_name:?}")]
    ValidationFailed {
        /// Class of the rejected object.
        class_name: String,
    },
    /// A dependency required for reconstruction is not available.
    #[error("missing dependency {hash}")]
    MissingDependency {
        /// Hash of the absent dependency.
        hash: Hash,
    },
    /// The canonical value domain rejected a value.
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl LiteralError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        LiteralError::InvalidLiteral {
            reason: reason.into(),
        }
    }
}

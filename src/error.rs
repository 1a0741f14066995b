use thiserror::Error;

/// Failures raised inside the analysis engine.
///
/// None of these abort a run: malformed bytecode skips one method, a missing
/// class skips one check, and a detector failure silences one detector for
/// the rest of the current method.
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error("malformed bytecode at offset {offset}: {reason}")]
    MalformedBytecode { offset: u32, reason: String },

    #[error("offset {offset} is outside method bounds (code length {code_length})")]
    OutOfRange { offset: i64, code_length: usize },

    #[error("unresolvable constant pool entry #{index}")]
    UnresolvableConstant { index: u16 },

    #[error("class not on analysis path: {name}")]
    MissingClass { name: String },

    #[error("detector {detector} failed: {reason}")]
    DetectorFailure {
        detector: &'static str,
        reason: String,
    },
}

impl EngineError {
    pub(crate) fn malformed(offset: u32, reason: impl Into<String>) -> Self {
        EngineError::MalformedBytecode {
            offset,
            reason: reason.into(),
        }
    }

    /// Errors that skip the current method rather than one check.
    pub(crate) fn is_method_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedBytecode { .. }
                | EngineError::OutOfRange { .. }
                | EngineError::UnresolvableConstant { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_class_is_not_method_fatal() {
        let error = EngineError::MissingClass {
            name: "com/example/Gone".to_string(),
        };
        assert!(!error.is_method_fatal());
        assert!(EngineError::malformed(3, "truncated").is_method_fatal());
    }

    #[test]
    fn messages_name_the_location() {
        let error = EngineError::OutOfRange {
            offset: 40,
            code_length: 12,
        };
        assert_eq!(
            "offset 40 is outside method bounds (code length 12)",
            error.to_string()
        );
    }
}

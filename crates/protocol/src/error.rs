//! Descriptor decoding errors

use thiserror::Error;

/// Errors raised while parsing raw descriptor bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer shorter than the descriptor requires
    #[error("Descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// bDescriptorType does not match the descriptor being parsed
    #[error("Unexpected descriptor type: 0x{actual:02x} (expected 0x{expected:02x})")]
    UnexpectedType { expected: u8, actual: u8 },

    /// bLength is smaller than the fixed part of the descriptor
    #[error("Invalid descriptor length: {length}")]
    InvalidLength { length: u8 },
}

/// Type alias for decoding results
pub type Result<T> = std::result::Result<T, DecodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::Truncated {
            needed: 18,
            available: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("truncated"));
        assert!(msg.contains("18"));

        let err = DecodeError::UnexpectedType {
            expected: 0x01,
            actual: 0x02,
        };
        assert!(err.to_string().contains("0x02"));
    }
}

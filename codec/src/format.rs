use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// Shape contract for one sample of the inputs stream, parsed from the
/// session-creation notification (e.g. `"(1,28,28)"` or `"(224,224,3)"`).
/// Elements are always little-endian f32 on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputsFormat {
    pub shape: Vec<usize>,
}

impl InputsFormat {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    /// Number of f32 elements in a single sample.
    pub fn sample_size(&self) -> usize {
        self.shape.iter().product()
    }
}

impl FromStr for InputsFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CodecError::InvalidFormat(s.to_string()));
        }
        if !(trimmed.starts_with('(') && trimmed.ends_with(')')) {
            return Err(CodecError::InvalidFormat(s.to_string()));
        }

        let inner = &trimmed[1..trimmed.len() - 1];
        let mut shape = Vec::new();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                // tolerate a trailing comma, as in "(28,)"
                continue;
            }
            let dim: i64 = part
                .parse()
                .map_err(|_| CodecError::InvalidFormat(s.to_string()))?;
            if dim <= 0 {
                return Err(CodecError::InvalidFormat(s.to_string()));
            }
            shape.push(dim as usize);
        }

        if shape.is_empty() {
            return Err(CodecError::InvalidFormat(s.to_string()));
        }

        Ok(InputsFormat { shape })
    }
}

impl fmt::Display for InputsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        write!(f, "({})", dims.join(","))
    }
}

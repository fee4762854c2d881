//! Register value formats
//!
//! A format knows how many 16-bit words it occupies and how to turn those
//! words into a [`Value`] and back. Multi-word formats come in both word
//! orders since meters disagree on which half comes first.
//!
//! # Word Layout
//! ```text
//! U32Be: [hi] [lo]      U32Le: [lo] [hi]
//! F32Be: [hi] [lo]      (IEEE-754 single precision)
//! Text(n): n words, two ASCII chars per word, high byte first
//! ```

use crate::error::CodecError;
use crate::value::Value;

/// Encoding of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Format {
    /// Unsigned 16-bit integer
    U16,
    /// Signed 16-bit integer
    S16,
    /// Unsigned 32-bit integer, high word first
    U32Be,
    /// Unsigned 32-bit integer, low word first
    U32Le,
    /// Signed 32-bit integer, high word first
    S32Be,
    /// Signed 32-bit integer, low word first
    S32Le,
    /// IEEE-754 single precision float, high word first
    F32Be,
    /// Fixed-length ASCII text spanning the given number of registers
    Text(u16),
}

impl Format {
    /// Returns a human-readable name for the format
    pub fn name(&self) -> &'static str {
        match self {
            Format::U16 => "u16",
            Format::S16 => "s16",
            Format::U32Be => "u32be",
            Format::U32Le => "u32le",
            Format::S32Be => "s32be",
            Format::S32Le => "s32le",
            Format::F32Be => "f32be",
            Format::Text(_) => "text",
        }
    }

    /// Number of registers the format occupies
    pub fn register_count(&self) -> u16 {
        match self {
            Format::U16 | Format::S16 => 1,
            Format::U32Be | Format::U32Le | Format::S32Be | Format::S32Le | Format::F32Be => 2,
            Format::Text(n) => (*n).max(1),
        }
    }

    /// Whether the decoded value is numeric (and therefore scalable)
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Format::Text(_))
    }

    /// Decode raw register words into an unscaled value
    pub fn decode(&self, words: &[u16]) -> Result<Value, CodecError> {
        let expected = self.register_count();
        if words.len() != expected as usize {
            return Err(CodecError::WrongCount {
                expected,
                actual: words.len(),
            });
        }

        let value = match self {
            Format::U16 => Value::Int(words[0] as i64),
            Format::S16 => Value::Int(words[0] as i16 as i64),
            Format::U32Be => Value::Int(join(words[0], words[1]) as i64),
            Format::U32Le => Value::Int(join(words[1], words[0]) as i64),
            Format::S32Be => Value::Int(join(words[0], words[1]) as i32 as i64),
            Format::S32Le => Value::Int(join(words[1], words[0]) as i32 as i64),
            Format::F32Be => Value::Float(f32::from_bits(join(words[0], words[1])) as f64),
            Format::Text(_) => {
                let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
                let text = String::from_utf8_lossy(&bytes);
                Value::Text(text.trim_end_matches(&['\0', ' '][..]).to_string())
            }
        };

        Ok(value)
    }

    /// Encode an unscaled value into register words
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>, CodecError> {
        match self {
            Format::U16 => {
                let v = self.integer(value, 0, u16::MAX as i64)?;
                Ok(vec![v as u16])
            }
            Format::S16 => {
                let v = self.integer(value, i16::MIN as i64, i16::MAX as i64)?;
                Ok(vec![v as i16 as u16])
            }
            Format::U32Be | Format::U32Le => {
                let v = self.integer(value, 0, u32::MAX as i64)? as u32;
                Ok(self.split(v))
            }
            Format::S32Be | Format::S32Le => {
                let v = self.integer(value, i32::MIN as i64, i32::MAX as i64)? as i32;
                Ok(self.split(v as u32))
            }
            Format::F32Be => {
                let v = value.as_f64().ok_or(CodecError::WrongKind {
                    kind: value.kind(),
                    format: self.name(),
                })?;
                let bits = (v as f32).to_bits();
                Ok(vec![(bits >> 16) as u16, bits as u16])
            }
            Format::Text(_) => {
                let text = value.as_str().ok_or(CodecError::WrongKind {
                    kind: value.kind(),
                    format: self.name(),
                })?;
                let capacity = self.register_count() as usize * 2;
                if !text.is_ascii() || text.len() > capacity {
                    return Err(CodecError::OutOfRange {
                        value: text.to_string(),
                        format: self.name(),
                    });
                }
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(capacity, 0);
                Ok(bytes
                    .chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect())
            }
        }
    }

    fn integer(&self, value: &Value, min: i64, max: i64) -> Result<i64, CodecError> {
        let v = match value {
            Value::Int(v) => *v,
            Value::Float(f) if f.is_finite() => f.round() as i64,
            other => {
                return Err(CodecError::WrongKind {
                    kind: other.kind(),
                    format: self.name(),
                })
            }
        };

        if v < min || v > max {
            return Err(CodecError::OutOfRange {
                value: value.to_string(),
                format: self.name(),
            });
        }

        Ok(v)
    }

    fn split(&self, v: u32) -> Vec<u16> {
        let (hi, lo) = ((v >> 16) as u16, v as u16);
        match self {
            Format::U32Le | Format::S32Le => vec![lo, hi],
            _ => vec![hi, lo],
        }
    }
}

fn join(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        assert_eq!(Format::U16.decode(&[0x4000]).unwrap(), Value::Int(16384));
        assert_eq!(Format::S16.decode(&[0xFFFF]).unwrap(), Value::Int(-1));
        assert_eq!(
            Format::U32Be.decode(&[0x0001, 0x0002]).unwrap(),
            Value::Int(0x0001_0002)
        );
        assert_eq!(
            Format::U32Le.decode(&[0x0002, 0x0001]).unwrap(),
            Value::Int(0x0001_0002)
        );
        assert_eq!(
            Format::S32Be.decode(&[0xFFFF, 0xFFFE]).unwrap(),
            Value::Int(-2)
        );
    }

    #[test]
    fn test_decode_float() {
        // 230.0 = 0x43660000
        assert_eq!(
            Format::F32Be.decode(&[0x4366, 0x0000]).unwrap(),
            Value::Float(230.0)
        );
    }

    #[test]
    fn test_decode_text_trims_padding() {
        let words = [0x5341, 0x3132, 0x3300, 0x0000];
        assert_eq!(
            Format::Text(4).decode(&words).unwrap(),
            Value::Text("SA123".to_string())
        );
    }

    #[test]
    fn test_decode_wrong_count() {
        assert_eq!(
            Format::U32Be.decode(&[1]),
            Err(CodecError::WrongCount {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_encode_range_checks() {
        assert_eq!(Format::U16.encode(&Value::Int(1000)).unwrap(), vec![1000]);
        assert!(matches!(
            Format::U16.encode(&Value::Int(-1)),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            Format::S16.encode(&Value::Int(40_000)),
            Err(CodecError::OutOfRange { .. })
        ));
        assert_eq!(Format::S16.encode(&Value::Int(-1)).unwrap(), vec![0xFFFF]);
        assert!(matches!(
            Format::U16.encode(&Value::Text("x".into())),
            Err(CodecError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_encode_word_order() {
        assert_eq!(
            Format::U32Be.encode(&Value::Int(0x0001_0002)).unwrap(),
            vec![0x0001, 0x0002]
        );
        assert_eq!(
            Format::U32Le.encode(&Value::Int(0x0001_0002)).unwrap(),
            vec![0x0002, 0x0001]
        );
    }

    #[test]
    fn test_encode_text_pads() {
        assert_eq!(
            Format::Text(2).encode(&Value::from("AB1")).unwrap(),
            vec![0x4142, 0x3100]
        );
        assert!(Format::Text(1).encode(&Value::from("ABC")).is_err());
    }
}

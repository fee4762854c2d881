//! Register descriptors
//!
//! A descriptor names one value on a device: where it lives, how it is
//! encoded, how it is scaled and how stale a cached copy may get before the
//! bus has to be asked again.

use std::time::Duration;

use crate::error::CodecError;
use crate::format::Format;
use crate::value::Value;
use crate::Access;

/// A typed register address
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDescriptor {
    /// First register number on the bus
    pub address: u16,
    /// Value encoding (determines the register count)
    pub format: Format,
    /// Register table the value is read from
    pub access: Access,
    /// Path label under which the value is published (e.g. `/Ac/Power`)
    pub path: String,
    /// Unit label for display (e.g. `W`)
    pub unit: Option<String>,
    /// Raw values are divided by this on decode and multiplied on encode
    pub scale: Option<f64>,
    /// Cached reads younger than this are served without bus I/O
    pub max_age: Option<Duration>,
}

impl RegisterDescriptor {
    /// Create a holding-register descriptor with the given format
    pub fn new(address: u16, format: Format) -> Self {
        Self {
            address,
            format,
            access: Access::Holding,
            path: String::new(),
            unit: None,
            scale: None,
            max_age: None,
        }
    }

    pub fn u16(address: u16) -> Self {
        Self::new(address, Format::U16)
    }

    pub fn s16(address: u16) -> Self {
        Self::new(address, Format::S16)
    }

    pub fn u32_be(address: u16) -> Self {
        Self::new(address, Format::U32Be)
    }

    pub fn u32_le(address: u16) -> Self {
        Self::new(address, Format::U32Le)
    }

    pub fn s32_be(address: u16) -> Self {
        Self::new(address, Format::S32Be)
    }

    pub fn f32_be(address: u16) -> Self {
        Self::new(address, Format::F32Be)
    }

    pub fn text(address: u16, registers: u16) -> Self {
        Self::new(address, Format::Text(registers))
    }

    /// Read from the holding register table
    pub fn holding(mut self) -> Self {
        self.access = Access::Holding;
        self
    }

    /// Read from the input register table
    pub fn input(mut self) -> Self {
        self.access = Access::Input;
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Number of registers covered
    pub fn count(&self) -> u16 {
        self.format.register_count()
    }

    /// One past the last register covered
    pub fn end(&self) -> u32 {
        self.address as u32 + self.count() as u32
    }

    /// Decode this descriptor's words, applying the scale factor
    pub fn decode(&self, words: &[u16]) -> Result<Value, CodecError> {
        let raw = self.format.decode(words)?;
        match (self.scale, raw.as_f64()) {
            (Some(scale), Some(v)) if scale != 0.0 => Ok(Value::Float(v / scale)),
            _ => Ok(raw),
        }
    }

    /// Encode a value for writing, undoing the scale factor
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>, CodecError> {
        if !self.access.is_writable() {
            return Err(CodecError::ReadOnly(self.access.name()));
        }

        match (self.scale, value.as_f64()) {
            (Some(scale), Some(v)) if self.format.is_numeric() => {
                let raw = v * scale;
                if matches!(self.format, Format::F32Be) {
                    self.format.encode(&Value::Float(raw))
                } else {
                    self.format.encode(&Value::Float(raw.round()))
                }
            }
            _ => self.format.encode(value),
        }
    }

    /// Format a decoded value with its unit label
    pub fn display(&self, value: &Value) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", value, unit),
            None => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let reg = RegisterDescriptor::u16(0x001c);
        assert_eq!(reg.access, Access::Holding);
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.end(), 0x001d);
        assert!(reg.max_age.is_none());

        let reg = RegisterDescriptor::text(209, 15).input().with_path("/Serial");
        assert_eq!(reg.access, Access::Input);
        assert_eq!(reg.count(), 15);
        assert_eq!(reg.path, "/Serial");
    }

    #[test]
    fn test_scaled_decode() {
        let reg = RegisterDescriptor::u16(38)
            .input()
            .with_scale(10.0)
            .with_unit("V");
        let value = reg.decode(&[2301]).unwrap();
        assert_eq!(value, Value::Float(230.1));
        assert_eq!(reg.display(&value), "230.1 V");
    }

    #[test]
    fn test_scaled_encode() {
        let reg = RegisterDescriptor::u16(123).with_scale(10.0);
        assert_eq!(reg.encode(&Value::Float(2.0)).unwrap(), vec![20]);
        assert_eq!(reg.encode(&Value::Int(100)).unwrap(), vec![1000]);
    }

    #[test]
    fn test_input_registers_are_read_only() {
        let reg = RegisterDescriptor::u16(0).input();
        assert_eq!(
            reg.encode(&Value::Int(1)),
            Err(CodecError::ReadOnly("input"))
        );
    }
}

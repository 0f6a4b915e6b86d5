// ctr-fuzzing/src/generators/mod.rs
//! Input generators that turn raw fuzz bytes into typed values
//!
//! Every value is drawn from the front of the buffer in call order, so the
//! same bytes always produce the same operation sequence. Running out of
//! bytes is reported as [`InputError::Exhausted`], never as a default value.

pub mod archive;
pub mod spec;

use arbitrary::{Arbitrary, Unstructured};

use crate::error::InputError;

pub use archive::archive_from;
pub use spec::{ContainerSpec, MountSpec, ProcessSpec, RootSpec, UserSpec};

/// Sequential decoder over a single fuzz input
pub struct FuzzConsumer<'a> {
    data: Unstructured<'a>,
}

impl<'a> FuzzConsumer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Unstructured::new(data),
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, size: usize, what: &'static str) -> Result<&'a [u8], InputError> {
        self.data.bytes(size).map_err(|_| InputError::Exhausted(what))
    }

    /// A single raw byte
    pub fn next_byte(&mut self) -> Result<u8, InputError> {
        Ok(self.take(1, "byte")?[0])
    }

    /// A signed integer, 4 bytes little-endian
    pub fn next_int(&mut self) -> Result<i32, InputError> {
        let raw = self.take(4, "int")?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// A boolean taken from the low bit of one byte
    pub fn next_bool(&mut self) -> Result<bool, InputError> {
        Ok(self.take(1, "bool")?[0] & 1 == 1)
    }

    /// A string: one length byte followed by that many bytes, decoded lossily
    pub fn next_string(&mut self) -> Result<String, InputError> {
        let len = self.take(1, "string length")?[0] as usize;
        let raw = self.take(len, "string")?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// A byte blob: two length bytes (little-endian) followed by the payload
    pub fn next_bytes(&mut self) -> Result<&'a [u8], InputError> {
        let raw = self.take(2, "blob length")?;
        let len = u16::from_le_bytes([raw[0], raw[1]]) as usize;
        self.take(len, "blob")
    }

    /// A structured record generated from the remaining bytes
    pub fn next_struct<T: Arbitrary<'a>>(&mut self) -> Result<T, InputError> {
        if self.data.is_empty() {
            return Err(InputError::Exhausted("struct"));
        }
        T::arbitrary(&mut self.data).map_err(|err| match err {
            arbitrary::Error::NotEnoughData => InputError::Exhausted("struct"),
            other => InputError::Malformed(other.to_string()),
        })
    }

    /// A well-formed tar stream
    pub fn next_archive(&mut self) -> Result<Vec<u8>, InputError> {
        archive_from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ints_are_little_endian_and_signed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&31i32.to_le_bytes());
        bytes.extend_from_slice(&(-7i32).to_le_bytes());
        let mut input = FuzzConsumer::new(&bytes);

        assert_eq!(input.next_int(), Ok(31));
        assert_eq!(input.next_int(), Ok(-7));
        assert!(input.is_exhausted());
    }

    #[test]
    fn test_short_int_is_exhaustion() {
        let mut input = FuzzConsumer::new(&[1, 2, 3]);
        assert_eq!(input.next_int(), Err(InputError::Exhausted("int")));
    }

    #[test]
    fn test_empty_input_is_exhausted_for_every_kind() {
        let mut input = FuzzConsumer::new(&[]);
        assert!(input.next_bool().is_err());
        assert!(input.next_string().is_err());
        assert!(input.next_struct::<ContainerSpec>().is_err());
        assert!(input.next_archive().is_err());
    }

    #[test]
    fn test_strings_and_bools() {
        let bytes = [3, b'a', b'b', b'c', 0x01, 0x02];
        let mut input = FuzzConsumer::new(&bytes);

        assert_eq!(input.next_string().unwrap(), "abc");
        assert!(input.next_bool().unwrap());
        assert!(!input.next_bool().unwrap());
    }

    #[test]
    fn test_truncated_string_is_exhaustion() {
        let mut input = FuzzConsumer::new(&[5, b'a']);
        assert_eq!(input.next_string(), Err(InputError::Exhausted("string")));
    }

    #[test]
    fn test_blob_length_prefix() {
        let bytes = [2, 0, 0xde, 0xad, 0xff];
        let mut input = FuzzConsumer::new(&bytes);

        assert_eq!(input.next_bytes().unwrap(), &[0xde, 0xad]);
        assert_eq!(input.remaining(), 1);
    }
}

//! Low-level binary codec primitives shared by every section of the save-state format (§6).
//! `sim86-cpu` and `sim86-devices` depend on this crate only for `StateWriter`/`StateReader`;
//! the full system-level save/load driver lives in `sim86-machine`, which is the only crate that
//! needs to see every component at once.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("save state signature mismatch: expected {expected:#010x}, found {found:#010x}")]
    SignatureMismatch { expected: u32, found: u32 },
    #[error("save state version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("save state component set mismatch: expected {expected:?}, found {found:?}")]
    ComponentSetMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("save state truncated while reading {context}")]
    Truncated { context: &'static str },
    #[error("save state section contained invalid UTF-8")]
    InvalidUtf8,
    #[error("save state RAM size did not match the live system ({expected} bytes expected, got {found})")]
    RamSizeMismatch { expected: u32, found: u32 },
}

/// Append-only binary writer. Every multi-byte integer is little-endian per §6.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A `u32` byte-length followed by the bytes themselves — the "each preceded by a `u32`
    /// byte-length" convention §6 uses for every top-level section.
    pub fn write_section(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }
}

/// Cursor-based binary reader over a byte slice, returning `Truncated` rather than panicking
/// when a section runs short.
pub struct StateReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], StateLoadError> {
        if self.remaining() < n {
            return Err(StateLoadError::Truncated { context });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, StateLoadError> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, StateLoadError> {
        Ok(u16::from_le_bytes(self.take(2, "u16")?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, StateLoadError> {
        Ok(u32::from_le_bytes(self.take(4, "u32")?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, StateLoadError> {
        Ok(u64::from_le_bytes(self.take(8, "u64")?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, StateLoadError> {
        Ok(i64::from_le_bytes(self.take(8, "i64")?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64, StateLoadError> {
        Ok(f64::from_le_bytes(self.take(8, "f64")?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], StateLoadError> {
        self.take(n, "raw bytes")
    }

    pub fn read_section(&mut self) -> Result<&'a [u8], StateLoadError> {
        let len = self.read_u32()? as usize;
        self.take(len, "section")
    }

    pub fn read_string(&mut self) -> Result<String, StateLoadError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StateLoadError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_fields() {
        let mut w = StateWriter::new();
        w.write_u32(0xDEAD_BEEF);
        w.write_string("pit");
        w.write_i64(-12345);
        w.write_f64(1_193_182.0);
        let bytes = w.into_bytes();

        let mut r = StateReader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_string().unwrap(), "pit");
        assert_eq!(r.read_i64().unwrap(), -12345);
        assert_eq!(r.read_f64().unwrap(), 1_193_182.0);
    }

    #[test]
    fn truncated_section_is_reported_not_panicked() {
        let mut r = StateReader::new(&[1, 2, 3]);
        assert!(matches!(r.read_u64(), Err(StateLoadError::Truncated { .. })));
    }

    #[test]
    fn nested_sections_round_trip() {
        let mut inner = StateWriter::new();
        inner.write_u32(42);
        let mut outer = StateWriter::new();
        outer.write_section(&inner.into_bytes());
        outer.write_u8(9);
        let bytes = outer.into_bytes();

        let mut r = StateReader::new(&bytes);
        let section = r.read_section().unwrap();
        let mut inner_r = StateReader::new(section);
        assert_eq!(inner_r.read_u32().unwrap(), 42);
        assert_eq!(r.read_u8().unwrap(), 9);
    }
}

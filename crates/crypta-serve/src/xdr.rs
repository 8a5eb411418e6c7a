//! Minimal XDR (RFC 4506) codec.
//!
//! Only the shapes the NFSv4 subset needs: 32/64-bit integers, booleans,
//! variable and fixed opaques, and UTF-8 strings, all 4-byte aligned.
//! Decoding failures mean malformed framing; the connection that produced
//! them is closed.

/// Decode error. Carries no detail on purpose: the only response to a
/// malformed request is dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed XDR")]
pub struct XdrError;

pub struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u32(&mut self) -> Result<u32, XdrError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, XdrError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> Result<bool, XdrError> {
        Ok(self.u32()? != 0)
    }

    /// Variable-length opaque with a sanity cap.
    pub fn opaque(&mut self, max: usize) -> Result<&'a [u8], XdrError> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(XdrError);
        }
        let data = self.take(len)?;
        self.skip_pad(len)?;
        Ok(data)
    }

    pub fn opaque_fixed(&mut self, len: usize) -> Result<&'a [u8], XdrError> {
        let data = self.take(len)?;
        self.skip_pad(len)?;
        Ok(data)
    }

    pub fn string(&mut self, max: usize) -> Result<&'a str, XdrError> {
        std::str::from_utf8(self.opaque(max)?).map_err(|_| XdrError)
    }

    /// A bitmap4: counted array of u32 words.
    pub fn bitmap(&mut self) -> Result<Vec<u32>, XdrError> {
        let words = self.u32()? as usize;
        if words > 8 {
            return Err(XdrError);
        }
        (0..words).map(|_| self.u32()).collect()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], XdrError> {
        if self.remaining() < len {
            return Err(XdrError);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn skip_pad(&mut self, len: usize) -> Result<(), XdrError> {
        let pad = (4 - len % 4) % 4;
        self.take(pad).map(|_| ())
    }
}

#[derive(Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn opaque(&mut self, data: &[u8]) -> &mut Self {
        self.u32(data.len() as u32);
        self.opaque_fixed(data)
    }

    pub fn opaque_fixed(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat_n(0u8, (4 - data.len() % 4) % 4));
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.opaque(s.as_bytes())
    }

    pub fn bitmap(&mut self, words: &[u32]) -> &mut Self {
        self.u32(words.len() as u32);
        for w in words {
            self.u32(*w);
        }
        self
    }

    /// Appends raw, already-encoded bytes.
    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Overwrites a previously written u32 (list counts, record marks).
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars_and_opaques() {
        let mut w = XdrWriter::new();
        w.u32(7).u64(1 << 40).bool(true).opaque(b"abcde").string("ok");
        let bytes = w.into_vec();
        // opaque "abcde" pads to 8, string "ok" pads to 4
        assert_eq!(bytes.len(), 4 + 8 + 4 + 4 + 8 + 4 + 4);

        let mut r = XdrReader::new(&bytes);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.u64().unwrap(), 1 << 40);
        assert!(r.bool().unwrap());
        assert_eq!(r.opaque(64).unwrap(), b"abcde");
        assert_eq!(r.string(64).unwrap(), "ok");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_input_errors() {
        let mut r = XdrReader::new(&[0, 0, 0]);
        assert_eq!(r.u32(), Err(XdrError));
    }

    #[test]
    fn oversized_opaque_rejected() {
        let mut w = XdrWriter::new();
        w.opaque(&[0u8; 100]);
        let bytes = w.into_vec();
        let mut r = XdrReader::new(&bytes);
        assert_eq!(r.opaque(10).err(), Some(XdrError));
    }

    #[test]
    fn bitmap_round_trip() {
        let mut w = XdrWriter::new();
        w.bitmap(&[0x0018_090a, 0x00b0_a23a]);
        let bytes = w.into_vec();
        let mut r = XdrReader::new(&bytes);
        assert_eq!(r.bitmap().unwrap(), vec![0x0018_090a, 0x00b0_a23a]);
    }
}

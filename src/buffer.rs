//! Framed reading and writing of wire messages.
//!
//! Every message on the wire is `type: u8` followed by `length: u32`
//! (big-endian, counting the length field itself but not the type byte) and
//! `length - 4` body bytes. The [`Reader`] walks a received byte run one
//! message at a time; the [`Writer`] builds outgoing messages and
//! back-patches the length on `end_message`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

fn underrun() -> Error {
    Error::Protocol("message shorter than its declared length".to_string())
}

/// Cursor over received bytes, bounded to the current message body.
pub struct Reader {
    buf: Bytes,
    pos: usize,
    msg_type: u8,
    msg_end: usize,
}

impl Reader {
    /// Reader over a framed message stream. Call [`Reader::next_message`]
    /// before popping.
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Reader {
            buf: buf.into(),
            pos: 0,
            msg_type: 0,
            msg_end: 0,
        }
    }

    /// Reader treating the entire input as one message body.
    pub fn message(body: impl Into<Bytes>) -> Self {
        let buf = body.into();
        let msg_end = buf.len();
        Reader {
            buf,
            pos: 0,
            msg_type: 0,
            msg_end,
        }
    }

    /// Advance past any unread remainder of the current message and frame
    /// the next one. Returns `false` at a clean end of input.
    pub fn next_message(&mut self) -> Result<bool> {
        self.pos = self.msg_end;
        if self.pos == self.buf.len() {
            return Ok(false);
        }
        if self.buf.len() - self.pos < 5 {
            return Err(Error::Protocol("truncated message header".to_string()));
        }
        self.msg_type = self.buf[self.pos];
        let len = u32::from_be_bytes(
            self.buf[self.pos + 1..self.pos + 5]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;
        if len < 4 {
            return Err(Error::Protocol(format!("message length {} too small", len)));
        }
        self.pos += 5;
        self.msg_end = self.pos + (len - 4);
        if self.msg_end > self.buf.len() {
            return Err(Error::Protocol("truncated message body".to_string()));
        }
        Ok(true)
    }

    /// Type byte of the current message.
    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// Unread bytes left in the current message.
    pub fn remaining(&self) -> usize {
        self.msg_end - self.pos
    }

    /// Read the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(underrun());
        }
        Ok(self.buf[self.pos])
    }

    /// Borrow `n` bytes from the current message. The view is only valid
    /// until the reader is dropped; callers that retain data must copy.
    pub fn pop_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(underrun());
        }
        let view = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(view)
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        Ok(self.pop_bytes(1)?[0])
    }

    pub fn pop_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.pop_array()?))
    }

    pub fn pop_uuid(&mut self) -> Result<[u8; 16]> {
        self.pop_array()
    }

    /// Read a u32 length then that many bytes, borrowed.
    pub fn pop_len_prefixed(&mut self) -> Result<&[u8]> {
        let n = self.pop_u32()? as usize;
        self.pop_bytes(n)
    }

    /// Read a u32-length-prefixed UTF-8 string into owned storage.
    pub fn pop_str(&mut self) -> Result<String> {
        let bytes = self.pop_len_prefixed()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {}", e)))
    }

    fn pop_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.pop_bytes(N)?;
        Ok(bytes.try_into().expect("length checked"))
    }
}

/// Growable buffer for outgoing messages.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
    msg_start: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    /// Push the message type byte and reserve four bytes for the body
    /// length. Messages may not be nested.
    pub fn begin_message(&mut self, msg_type: u8) -> Result<()> {
        if self.msg_start.is_some() {
            return Err(Error::Interface(
                "begin_message while a message is already open".to_string(),
            ));
        }
        self.buf.put_u8(msg_type);
        self.msg_start = Some(self.buf.len());
        self.buf.put_u32(0);
        Ok(())
    }

    /// Back-patch the length of the message opened by `begin_message`.
    pub fn end_message(&mut self) -> Result<()> {
        let start = self.msg_start.take().ok_or_else(|| {
            Error::Interface("end_message without a matching begin_message".to_string())
        })?;
        let len = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Reserve a u32 length slot for a nested value; returns a marker for
    /// [`Writer::end_bytes`].
    pub fn begin_bytes(&mut self) -> usize {
        let marker = self.buf.len();
        self.buf.put_u32(0);
        marker
    }

    /// Patch the slot reserved at `marker` with the byte count written
    /// since.
    pub fn end_bytes(&mut self, marker: usize) {
        let len = (self.buf.len() - marker - 4) as u32;
        self.buf[marker..marker + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn push_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn push_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn push_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn push_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn push_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn push_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn push_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn push_uuid(&mut self, v: [u8; 16]) {
        self.buf.put_slice(&v);
    }

    pub fn push_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Write `inner`'s length as a u32 followed by `inner`.
    pub fn push_len_prefixed(&mut self, inner: &[u8]) {
        self.buf.put_u32(inner.len() as u32);
        self.buf.put_slice(inner);
    }

    /// Write a u32-length-prefixed UTF-8 string.
    pub fn push_str(&mut self, s: &str) {
        self.push_len_prefixed(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_length_is_back_patched() {
        let mut w = Writer::new();
        w.begin_message(0xff).unwrap();
        w.push_u32(4);
        w.push_u32(0);
        w.end_message().unwrap();

        // type byte + length (4 + 8 body) + body
        assert_eq!(w.as_slice(), &[0xff, 0, 0, 0, 12, 0, 0, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn nested_begin_message_is_an_invariant_error() {
        let mut w = Writer::new();
        w.begin_message(1).unwrap();
        match w.begin_message(2) {
            Err(Error::Interface(_)) => {}
            other => panic!("expected InterfaceError, got {:?}", other),
        }
        match Writer::new().end_message() {
            Err(Error::Interface(_)) => {}
            other => panic!("expected InterfaceError, got {:?}", other),
        }
    }

    #[test]
    fn nested_byte_slots_patch_independently() {
        let mut w = Writer::new();
        let outer = w.begin_bytes();
        w.push_u32(1);
        let inner = w.begin_bytes();
        w.push_u16(7);
        w.end_bytes(inner);
        w.end_bytes(outer);

        assert_eq!(w.as_slice(), &[0, 0, 0, 10, 0, 0, 0, 1, 0, 0, 0, 2, 0, 7]);
    }

    #[test]
    fn reader_walks_framed_messages() {
        let mut w = Writer::new();
        w.begin_message(b'A').unwrap();
        w.push_u16(3);
        w.end_message().unwrap();
        w.begin_message(b'B').unwrap();
        w.end_message().unwrap();

        let mut r = Reader::new(w.into_bytes());
        assert!(r.next_message().unwrap());
        assert_eq!(r.msg_type(), b'A');
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.pop_u16().unwrap(), 3);

        assert!(r.next_message().unwrap());
        assert_eq!(r.msg_type(), b'B');
        assert_eq!(r.remaining(), 0);

        assert!(!r.next_message().unwrap());
    }

    #[test]
    fn next_message_skips_unread_body() {
        let mut w = Writer::new();
        w.begin_message(b'A').unwrap();
        w.push_u64(9);
        w.end_message().unwrap();
        w.begin_message(b'B').unwrap();
        w.end_message().unwrap();

        let mut r = Reader::new(w.into_bytes());
        assert!(r.next_message().unwrap());
        // leave the u64 unread
        assert!(r.next_message().unwrap());
        assert_eq!(r.msg_type(), b'B');
    }

    #[test]
    fn pops_are_bounded_by_the_current_message() {
        let mut r = Reader::message(vec![0u8, 1]);
        assert_eq!(r.peek_u8().unwrap(), 0);
        assert_eq!(r.pop_u16().unwrap(), 1);
        match r.pop_u8() {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected ProtocolError, got {:?}", other),
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let mut r = Reader::new(vec![b'A', 0, 0]);
        assert!(matches!(r.next_message(), Err(Error::Protocol(_))));

        let mut r = Reader::new(vec![b'A', 0, 0, 0, 9, 1]);
        assert!(matches!(r.next_message(), Err(Error::Protocol(_))));
    }

    #[test]
    fn popped_strings_own_their_storage() {
        let data = vec![0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'];
        let mut r = Reader::message(data);
        let s = r.pop_str().unwrap();
        drop(r);
        assert_eq!(s, "hello");
    }
}

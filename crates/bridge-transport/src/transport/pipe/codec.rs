//! Local-pipe wire framing
//!
//! ```text
//! +----------------+--------------------------------------------+
//! | len: u16 (LE)  | payload: `len` bytes of UTF-16LE text       |
//! +----------------+--------------------------------------------+
//! payload text: key=value,key=value,...
//! ```
//!
//! A zero, odd, or oversized length is a protocol error. The decoder never
//! skips ahead to look for the next plausible frame; the caller drops the
//! connection instead.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Field added by the peer to every reply
pub const ANSWER_KEY: &str = "__answ#";
/// Field carrying the reply value
pub const REPLY_KEY: &str = "reply";

const LENGTH_PREFIX: usize = 2;

/// Ordered list of `key=value` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeMessage {
    fields: Vec<(String, String)>,
}

impl PipeMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Replace an existing field or append a new one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn is_reply(&self) -> bool {
        self.get(ANSWER_KEY).is_some()
    }

    /// Parse the comma-separated payload text
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Err(Error::Protocol("empty pipe message".into()));
        }
        let mut message = PipeMessage::new();
        for pair in text.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Protocol(format!("malformed field '{}'", pair)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Protocol(format!("empty key in field '{}'", pair)));
            }
            message.fields.push((key.to_string(), value.trim().to_string()));
        }
        Ok(message)
    }

    pub fn to_wire(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Length-prefixed UTF-16LE codec
#[derive(Debug, Clone)]
pub struct PipeFrameCodec {
    max_frame_len: usize,
}

impl PipeFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u16::MAX as usize),
        }
    }
}

impl Decoder for PipeFrameCodec {
    type Item = PipeMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PipeMessage>, Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if len == 0 || len % 2 != 0 || len > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "invalid frame length {} (max {})",
                len, self.max_frame_len
            )));
        }

        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(len);
        let units: Vec<u16> = payload
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|_| Error::Protocol("payload is not valid UTF-16".into()))?;

        PipeMessage::parse(&text).map(Some)
    }
}

impl Encoder<PipeMessage> for PipeFrameCodec {
    type Error = Error;

    fn encode(&mut self, item: PipeMessage, dst: &mut BytesMut) -> Result<(), Error> {
        let units: Vec<u16> = item.to_wire().encode_utf16().collect();
        let len = units.len() * 2;
        if len == 0 || len > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "outgoing frame length {} exceeds {}",
                len, self.max_frame_len
            )));
        }

        dst.reserve(LENGTH_PREFIX + len);
        dst.put_u16_le(len as u16);
        for unit in units {
            dst.put_u16_le(unit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        let units: Vec<u16> = text.encode_utf16().collect();
        buf.put_u16_le((units.len() * 2) as u16);
        for unit in units {
            buf.put_u16_le(unit);
        }
        buf
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = PipeFrameCodec::new(1024);
        let full = frame("event=call,callid=4,state=offered");
        let mut partial = BytesMut::from(&full[..7]);

        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[7..]);

        let message = codec.decode(&mut partial).unwrap().expect("complete frame");
        assert_eq!(message.get("callid"), Some("4"));
        assert_eq!(message.get("state"), Some("offered"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_non_ascii_names_survive() {
        let mut codec = PipeFrameCodec::new(1024);
        let mut buf = frame("event=call,name=Jürgen Müller");
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.get("name"), Some("Jürgen Müller"));
    }

    #[test]
    fn test_invalid_lengths_are_errors() {
        let mut codec = PipeFrameCodec::new(64);

        let mut zero = BytesMut::from(&[0u8, 0u8][..]);
        assert!(codec.decode(&mut zero).is_err());

        let mut odd = BytesMut::from(&[3u8, 0u8, b'a', 0, b'b'][..]);
        assert!(codec.decode(&mut odd).is_err());

        let mut oversized = BytesMut::from(&[0u8, 1u8][..]);
        assert!(codec.decode(&mut oversized).is_err());
    }

    #[test]
    fn test_malformed_fields_are_errors() {
        let mut codec = PipeFrameCodec::new(1024);
        let mut buf = frame("event=call,garbage");
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_reply_detection() {
        let reply = PipeMessage::new()
            .with("cmd", "makecall")
            .with("seq", "3")
            .with(ANSWER_KEY, "1")
            .with(REPLY_KEY, "ok:17");
        assert!(reply.is_reply());
        assert_eq!(reply.to_wire(), "cmd=makecall,seq=3,__answ#=1,reply=ok:17");
    }

    #[test]
    fn test_encoder_rejects_oversized_frames() {
        let mut codec = PipeFrameCodec::new(8);
        let mut dst = BytesMut::new();
        let message = PipeMessage::new().with("number", "0891234567");
        assert!(codec.encode(message, &mut dst).is_err());
        assert!(dst.is_empty());
    }
}

//! Framing for stream transports: 4 bytes LE length + 1 byte kind + payload.
//!
//! Only hosts whose transport does not keep message boundaries (TCP) need this.
//! It restores the boundaries and the text/binary distinction of [`WireMessage`].

use crate::protocol::WireMessage;

const LEN_SIZE: usize = 4;
/// Length prefix plus kind byte.
pub const HEADER_SIZE: usize = LEN_SIZE + 1;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

/// Encode a message into a single frame.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let (kind, payload) = match msg {
        WireMessage::Text(s) => (KIND_TEXT, s.as_bytes()),
        WireMessage::Binary(b) => (KIND_BINARY, b.as_slice()),
    };
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: usize,
    kind: u8,
}

impl FrameHeader {
    /// Parse and validate a header. Readers call this before reading `len` payload bytes.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FrameDecodeError> {
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if len > MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        let kind = bytes[4];
        if kind != KIND_TEXT && kind != KIND_BINARY {
            return Err(FrameDecodeError::UnknownKind(kind));
        }
        Ok(Self {
            len: len as usize,
            kind,
        })
    }

    /// Build the message from a payload of exactly `self.len` bytes.
    pub fn into_message(self, payload: Vec<u8>) -> Result<WireMessage, FrameDecodeError> {
        if self.kind == KIND_TEXT {
            String::from_utf8(payload)
                .map(WireMessage::Text)
                .map_err(|_| FrameDecodeError::InvalidText)
        } else {
            Ok(WireMessage::Binary(payload))
        }
    }
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireMessage, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = FrameHeader::parse(&head)?;
    let end = HEADER_SIZE + header.len;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = header.into_message(bytes[HEADER_SIZE..end].to_vec())?;
    Ok((msg, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("text frame is not valid UTF-8")]
    InvalidText,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_binary_keep_their_kind() {
        let text = WireMessage::Text(r#"{"type":"end"}"#.into());
        let bin = WireMessage::Binary(vec![0, 1, 2, 255]);
        let (t, n) = decode_frame(&encode_frame(&text).unwrap()).unwrap();
        assert_eq!(t, text);
        assert_eq!(n, HEADER_SIZE + 14);
        let (b, _) = decode_frame(&encode_frame(&bin).unwrap()).unwrap();
        assert_eq!(b, bin);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&WireMessage::Binary(vec![7; 10])).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..HEADER_SIZE + 3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = encode_frame(&WireMessage::Text("{}".into())).unwrap();
        let b = encode_frame(&WireMessage::Binary(vec![9; 4])).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert!(matches!(m1, WireMessage::Text(_)));
        assert!(matches!(m2, WireMessage::Binary(_)));
    }

    #[test]
    fn empty_binary_frame() {
        let (m, n) = decode_frame(&encode_frame(&WireMessage::Binary(Vec::new())).unwrap()).unwrap();
        assert_eq!(m, WireMessage::Binary(Vec::new()));
        assert_eq!(n, HEADER_SIZE);
    }

    #[test]
    fn rejects_oversize_and_unknown_kind() {
        let mut head = [0u8; HEADER_SIZE];
        head[..4].copy_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        head[4] = KIND_BINARY;
        assert!(matches!(
            FrameHeader::parse(&head),
            Err(FrameDecodeError::TooLarge)
        ));
        let head = [0, 0, 0, 0, 9];
        assert!(matches!(
            FrameHeader::parse(&head),
            Err(FrameDecodeError::UnknownKind(9))
        ));
    }

    #[test]
    fn invalid_utf8_text() {
        let mut frame = vec![2, 0, 0, 0, KIND_TEXT];
        frame.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::InvalidText)
        ));
    }
}

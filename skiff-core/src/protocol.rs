//! Skiff wire protocol: control and data frames.
//!
//! Control frames are JSON text tagged by `type`; data frames are raw binary.
//! A peer tells them apart by payload kind, never by inspecting content. The
//! channel preserves message boundaries, so neither family carries a length.

use serde::{Deserialize, Serialize};

/// One message as the duplex channel carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Payload length in bytes, as counted against the channel's pending buffer.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-file metadata announced before the file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(default, alias = "fileType")]
    pub content_type: String,
    /// 1-based position within the batch.
    #[serde(alias = "currentFile")]
    pub index: u32,
    #[serde(alias = "totalFiles")]
    pub total: u32,
}

impl FileMetadata {
    pub fn is_first(&self) -> bool {
        self.index == 1
    }

    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}

/// Structured control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Metadata(FileMetadata),
    /// End of the current file.
    End,
    /// Abort the in-flight batch; either side may send it.
    Cancel,
    /// Keeps the underlying transport from treating the session as idle.
    Heartbeat,
    /// Peer is ending the session on purpose; skip the grace period.
    IntentionalDisconnect,
}

impl ControlFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Metadata(_) => "metadata",
            ControlFrame::End => "end",
            ControlFrame::Cancel => "cancel",
            ControlFrame::Heartbeat => "heartbeat",
            ControlFrame::IntentionalDisconnect => "intentional-disconnect",
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Data(Vec<u8>),
}

/// Encode a control frame as JSON text.
pub fn encode_control(frame: &ControlFrame) -> Result<WireMessage, CodecError> {
    let text = serde_json::to_string(frame).map_err(CodecError::Encode)?;
    Ok(WireMessage::Text(text))
}

/// Decode a channel message. Binary payloads are always data frames.
pub fn decode(msg: WireMessage) -> Result<Frame, CodecError> {
    match msg {
        WireMessage::Text(text) => serde_json::from_str(&text)
            .map(Frame::Control)
            .map_err(CodecError::Malformed),
        WireMessage::Binary(bytes) => Ok(Frame::Data(bytes)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(serde_json::Error),
    #[error("malformed control frame: {0}")]
    Malformed(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> ControlFrame {
        ControlFrame::Metadata(FileMetadata {
            name: "report.pdf".into(),
            size: 1_048_577,
            content_type: "application/pdf".into(),
            index: 1,
            total: 2,
        })
    }

    #[test]
    fn metadata_uses_type_tag_and_camel_case() {
        let msg = encode_control(&sample_metadata()).unwrap();
        let WireMessage::Text(text) = msg else {
            panic!("control frames are text");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "metadata");
        assert_eq!(v["contentType"], "application/pdf");
        assert_eq!(v["index"], 1);
        assert_eq!(v["total"], 2);
    }

    #[test]
    fn unit_frames_are_bare_type_objects() {
        let WireMessage::Text(text) = encode_control(&ControlFrame::IntentionalDisconnect).unwrap()
        else {
            panic!("expected text");
        };
        assert_eq!(text, r#"{"type":"intentional-disconnect"}"#);
    }

    #[test]
    fn decode_control_frame() {
        let frame = decode(WireMessage::Text(r#"{"type":"heartbeat"}"#.into())).unwrap();
        assert_eq!(frame, Frame::Control(ControlFrame::Heartbeat));
    }

    #[test]
    fn binary_is_data_even_if_it_looks_like_json() {
        let bytes = br#"{"type":"cancel"}"#.to_vec();
        let frame = decode(WireMessage::Binary(bytes.clone())).unwrap();
        assert_eq!(frame, Frame::Data(bytes));
    }

    #[test]
    fn accepts_legacy_metadata_field_names() {
        let text = r#"{"type":"metadata","name":"a.txt","size":3,"fileType":"text/plain","currentFile":2,"totalFiles":2}"#;
        let Frame::Control(ControlFrame::Metadata(m)) = decode(WireMessage::Text(text.into())).unwrap()
        else {
            panic!("expected metadata");
        };
        assert_eq!(m.content_type, "text/plain");
        assert!(m.is_last());
        assert!(!m.is_first());
    }

    #[test]
    fn missing_content_type_defaults_empty() {
        let text = r#"{"type":"metadata","name":"a","size":0,"index":1,"total":1}"#;
        let Frame::Control(ControlFrame::Metadata(m)) = decode(WireMessage::Text(text.into())).unwrap()
        else {
            panic!("expected metadata");
        };
        assert_eq!(m.content_type, "");
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(matches!(
            decode(WireMessage::Text("{not json".into())),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode(WireMessage::Text(r#"{"type":"launch"}"#.into())),
            Err(CodecError::Malformed(_))
        ));
    }
}

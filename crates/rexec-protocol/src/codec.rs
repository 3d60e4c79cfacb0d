//! JSON encoding of messages and framing of the TCP command stream
//!
//! Datagrams carry exactly one message, so [`encode`] and [`decode`] are used
//! directly on the discovery socket. The command connection is a byte stream
//! on which engine nodes write bare JSON documents back to back, with no
//! delimiter; [`JsonFrameCodec`] splits that stream on document boundaries.

use bytes::{Buf, BytesMut};
use serde::de::IgnoredAny;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use crate::node::NodeId;

/// Maximum size of a single frame on the command stream (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct WireMessage<'a> {
    version: u32,
    magic: &'a str,
    #[serde(rename = "type")]
    message_type: MessageType,
    source: &'a NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest: Option<&'a NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// Encode a message as compact UTF-8 JSON
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    if message.source.is_empty() {
        return Err(ProtocolError::Validation(
            "\"source\" cannot be empty".to_string(),
        ));
    }

    let wire = WireMessage {
        version: PROTOCOL_VERSION,
        magic: PROTOCOL_MAGIC,
        message_type: message.message_type,
        source: &message.source,
        dest: message.dest.as_ref().filter(|dest| !dest.is_empty()),
        data: message.data.as_ref().filter(|data| !data.is_null()),
    };

    serde_json::to_vec(&wire).map_err(|e| ProtocolError::Validation(e.to_string()))
}

/// Decode a message, validating version, magic and required fields
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let mut object: Map<String, Value> = serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::Malformed(format!("not a JSON object: {}", e)))?;

    let version = object.get("version");
    if version.and_then(Value::as_u64) != Some(u64::from(PROTOCOL_VERSION)) {
        return Err(ProtocolError::ProtocolMismatch {
            field: "version",
            expected: PROTOCOL_VERSION.to_string(),
            got: describe(version),
        });
    }

    let magic = object.get("magic");
    if magic.and_then(Value::as_str) != Some(PROTOCOL_MAGIC) {
        return Err(ProtocolError::ProtocolMismatch {
            field: "magic",
            expected: PROTOCOL_MAGIC.to_string(),
            got: describe(magic),
        });
    }

    let type_name = required_str(&object, "type")?;
    let message_type = MessageType::parse(type_name).ok_or_else(|| {
        ProtocolError::Malformed(format!("unknown message type \"{}\"", type_name))
    })?;
    let source = NodeId::new(required_str(&object, "source")?);

    let dest = match object.remove("dest") {
        None | Some(Value::Null) => None,
        Some(Value::String(dest)) if dest.is_empty() => None,
        Some(Value::String(dest)) => Some(NodeId::new(dest)),
        Some(other) => {
            return Err(ProtocolError::Malformed(format!(
                "\"dest\" must be a string, got {}",
                other
            )))
        }
    };

    let data = object.remove("data").filter(|data| !data.is_null());

    Ok(Message {
        message_type,
        source,
        dest,
        data,
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, ProtocolError> {
    match object.get(key).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ProtocolError::Malformed(format!(
            "\"{}\" is missing or empty",
            key
        ))),
    }
}

fn describe(value: Option<&Value>) -> String {
    value.map_or_else(|| "nothing".to_string(), Value::to_string)
}

/// Codec splitting a byte stream into complete JSON documents
///
/// Decoding yields the raw bytes of each document; callers run [`decode`] on
/// them so that a single bad message can be dropped without tearing down the
/// stream. Whitespace between documents is skipped, which also makes
/// newline-delimited peers work.
///
/// The codec remembers how far it has scanned the current document, so a
/// large frame arriving over many reads is examined once per byte.
#[derive(Debug, Clone)]
pub struct JsonFrameCodec {
    max_frame_size: usize,
    scan: FrameScan,
}

/// Progress through the document at the front of the buffer
#[derive(Debug, Clone, Copy, Default)]
struct FrameScan {
    /// Bytes of the buffer already examined
    offset: usize,
    /// Open `{` / `[` not yet closed
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScan {
    /// Advance over `src` from the saved offset.
    ///
    /// Returns the length of the document once its outermost bracket closes.
    fn advance(&mut self, src: &[u8]) -> Option<usize> {
        while self.offset < src.len() {
            let byte = src[self.offset];
            self.offset += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.offset);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl JsonFrameCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scan: FrameScan::default(),
        }
    }

    /// Drop bytes up to the next possible document start
    fn resync(&mut self, src: &mut BytesMut, reason: &str) {
        let skip = src
            .iter()
            .skip(1)
            .position(|&b| b == b'{')
            .map(|pos| pos + 1)
            .unwrap_or(src.len());
        tracing::warn!(discarded = skip, "Discarding undecodable stream data: {}", reason);
        src.advance(skip);
        self.scan = FrameScan::default();
    }
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonFrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.scan.offset == 0 {
                // Skip inter-document whitespace
                match src.iter().position(|b| !b.is_ascii_whitespace()) {
                    Some(start) => src.advance(start),
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }

                if src[0] != b'{' {
                    self.resync(src, "expected start of a JSON object");
                    continue;
                }
            }

            let Some(end) = self.scan.advance(src) else {
                if src.len() > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            // Brackets balance; make sure the document itself is valid JSON
            match serde_json::from_slice::<IgnoredAny>(&src[..end]) {
                Ok(_) => {
                    self.scan = FrameScan::default();
                    return Ok(Some(src.split_to(end)));
                }
                Err(e) => self.resync(src, &e.to_string()),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            tracing::debug!(discarded = src.len(), "Stream ended inside a document");
            src.clear();
            self.scan = FrameScan::default();
        }
        Ok(None)
    }
}

impl Encoder<Message> for JsonFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode(&message)?;
        if bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{CommandResultData, ExecMode, OpenConnectionData};
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_roundtrip_keeps_absent_fields_absent() {
        let messages = [
            Message::ping(node("session")),
            Message::close_connection(node("session"), node("engine")),
            Message::pong(node("engine"), node("session"), json!({"project_name": "Foo"})),
            Message::open_connection(
                node("session"),
                node("engine"),
                OpenConnectionData {
                    command_ip: "127.0.0.1".to_string(),
                    command_port: 6776,
                },
            ),
            Message::command(node("session"), "print('hi')", false, ExecMode::ExecuteFile),
        ];

        for message in messages {
            let decoded = decode(&encode(&message).unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_encode_omits_absent_keys() {
        let bytes = encode(&Message::ping(node("abc"))).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"version":1,"magic":"ue_py","type":"ping","source":"abc"}"#
        );
    }

    #[test]
    fn test_encode_rejects_empty_source() {
        let result = encode(&Message::ping(node("")));
        assert!(matches!(result, Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let bytes = br#"{"version":2,"magic":"ue_py","type":"ping","source":"a"}"#;
        match decode(bytes) {
            Err(ProtocolError::ProtocolMismatch { field, got, .. }) => {
                assert_eq!(field, "version");
                assert_eq!(got, "2");
            }
            other => panic!("Expected ProtocolMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_magic() {
        let bytes = br#"{"version":1,"magic":"ue_js","type":"ping","source":"a"}"#;
        assert!(matches!(
            decode(bytes),
            Err(ProtocolError::ProtocolMismatch { field: "magic", .. })
        ));

        let bytes = br#"{"version":1,"type":"ping","source":"a"}"#;
        assert!(matches!(
            decode(bytes),
            Err(ProtocolError::ProtocolMismatch { field: "magic", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode(b"[1,2]"), Err(ProtocolError::Malformed(_))));

        let missing_source = br#"{"version":1,"magic":"ue_py","type":"ping"}"#;
        assert!(matches!(decode(missing_source), Err(ProtocolError::Malformed(_))));

        let empty_type = br#"{"version":1,"magic":"ue_py","type":"","source":"a"}"#;
        assert!(matches!(decode(empty_type), Err(ProtocolError::Malformed(_))));

        let unknown_type = br#"{"version":1,"magic":"ue_py","type":"hello","source":"a"}"#;
        assert!(matches!(decode(unknown_type), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_null_dest_and_data_are_absent() {
        let bytes = br#"{"version":1,"magic":"ue_py","type":"ping","source":"a","dest":null,"data":null}"#;
        let message = decode(bytes).unwrap();
        assert_eq!(message.dest, None);
        assert_eq!(message.data, None);
    }

    #[test]
    fn test_frame_codec_partial_read() {
        let mut codec = JsonFrameCodec::new();
        let result = CommandResultData {
            success: true,
            result: "2".to_string(),
            output: vec![],
        };
        let full = encode(&Message::command_result(node("engine"), None, &result)).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let message = decode(&frame).unwrap();
        assert_eq!(message.data_as::<CommandResultData>().unwrap(), result);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_codec_back_to_back_documents() {
        let mut codec = JsonFrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::ping(node("a")), &mut buf).unwrap();
        codec.encode(Message::ping(node("b")), &mut buf).unwrap();
        buf.extend_from_slice(b"\n");

        let first = decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        let second = decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(first.source, node("a"));
        assert_eq!(second.source, node("b"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_codec_newline_delimited() {
        let mut codec = JsonFrameCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"version\":1,\"magic\":\"ue_py\",\"type\":\"ping\",\"source\":\"a\"}\r\n\r\n"[..],
        );
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_codec_resyncs_after_garbage() {
        let mut codec = JsonFrameCodec::new();
        let mut buf = BytesMut::from(&b"garbage{\"a\": ]}"[..]);
        buf.extend_from_slice(&encode(&Message::ping(node("a"))).unwrap());

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&frame).unwrap().source, node("a"));
    }

    #[test]
    fn test_frame_codec_large_frame_in_chunks() {
        let mut codec = JsonFrameCodec::new();
        let result = CommandResultData {
            success: true,
            result: "x".repeat(256 * 1024),
            output: vec![],
        };
        let full = encode(&Message::command_result(node("engine"), None, &result)).unwrap();

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in full.chunks(8 * 1024) {
            buf.extend_from_slice(chunk);
            match codec.decode(&mut buf).unwrap() {
                Some(frame) => frames.push(frame),
                // Nothing buffered is scanned a second time
                None => assert_eq!(codec.scan.offset, buf.len()),
            }
        }

        assert_eq!(frames.len(), 1);
        let message = decode(&frames[0]).unwrap();
        assert_eq!(message.data_as::<CommandResultData>().unwrap(), result);
        assert_eq!(codec.scan.offset, 0);
    }

    #[test]
    fn test_frame_codec_ignores_brackets_in_strings() {
        let mut codec = JsonFrameCodec::new();
        let result = CommandResultData {
            success: false,
            result: "unbalanced }] and a quote \" {[".to_string(),
            output: vec![],
        };
        let mut buf = BytesMut::new();
        codec
            .encode(Message::command_result(node("engine"), None, &result), &mut buf)
            .unwrap();
        codec.encode(Message::ping(node("a")), &mut buf).unwrap();

        let first = decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(first.data_as::<CommandResultData>().unwrap(), result);
        let second = decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(second.source, node("a"));
    }

    #[test]
    fn test_frame_codec_discards_partial_frame_at_eof() {
        let mut codec = JsonFrameCodec::new();
        let full = encode(&Message::ping(node("a"))).unwrap();

        let mut buf = BytesMut::from(&full[..]);
        buf.extend_from_slice(&full[..full.len() / 2]);

        let frame = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(decode(&frame).unwrap().source, node("a"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_codec_rejects_oversized_frame() {
        let mut codec = JsonFrameCodec::with_max_frame_size(16);
        let mut buf = BytesMut::from(&b"{\"command\": \"aaaaaaaaaaaaaaaaaaaaaaaa"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));
    }
}

//! Wire framing for firehose messages.
//!
//! A frame is two concatenated DAG-CBOR objects: a header `{op, t}` and the
//! payload. `op` is `1` for messages (with `t` naming the type) and `-1` for
//! error frames (with no `t`).

use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::Bytes;
use civpds_types::cbor::{self, get_int, get_opt_str};
use civpds_types::Ipld;
use libipld::cbor::DagCborCodec;
use libipld::codec::Decode;

use crate::error::{EventError, EventResult};
use crate::event::StreamEvent;

/// Header op for a regular message.
pub const OP_MESSAGE: i64 = 1;
/// Header op for an error frame.
pub const OP_ERROR: i64 = -1;

/// An event together with its serialized frame.
///
/// Frames are encoded once and shared between the persister and every
/// subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub event: StreamEvent,
    pub bytes: Bytes,
}

impl EventFrame {
    /// Serialize `event`.
    pub fn new(event: StreamEvent) -> EventResult<Self> {
        let bytes = Bytes::from(encode_frame(&event)?);
        Ok(Self { event, bytes })
    }

    /// Decode a frame received from the wire or read back from disk.
    pub fn decode(bytes: Bytes) -> EventResult<Self> {
        let event = decode_frame(&bytes)?;
        Ok(Self { event, bytes })
    }

    pub fn seq(&self) -> Option<i64> {
        self.event.seq()
    }
}

/// Encode header and payload.
pub fn encode_frame(event: &StreamEvent) -> EventResult<Vec<u8>> {
    let mut header = BTreeMap::new();
    match event.message_type() {
        Some(t) => {
            header.insert("op".to_string(), Ipld::Integer(OP_MESSAGE.into()));
            header.insert("t".to_string(), Ipld::String(t.to_string()));
        }
        None => {
            header.insert("op".to_string(), Ipld::Integer(OP_ERROR.into()));
        }
    }
    let mut out = cbor::encode(&Ipld::Map(header))?;
    out.extend_from_slice(&cbor::encode(&event.payload_ipld())?);
    Ok(out)
}

/// Decode header and payload.
pub fn decode_frame(bytes: &[u8]) -> EventResult<StreamEvent> {
    let mut cursor = Cursor::new(bytes);
    let header = Ipld::decode(DagCborCodec, &mut cursor)
        .map_err(|e| EventError::Frame(format!("header: {e}")))?;
    let payload = Ipld::decode(DagCborCodec, &mut cursor)
        .map_err(|e| EventError::Frame(format!("payload: {e}")))?;
    if (cursor.position() as usize) != bytes.len() {
        return Err(EventError::Frame("trailing bytes after payload".into()));
    }

    let header = cbor::as_map(&header, "frame header")?;
    match get_int(header, "op", "frame header")? {
        OP_MESSAGE => {
            let t = get_opt_str(header, "t", "frame header")?
                .ok_or_else(|| EventError::Frame("message header without type".into()))?;
            StreamEvent::from_payload(Some(t), &payload)
        }
        OP_ERROR => StreamEvent::from_payload(None, &payload),
        op => Err(EventError::Frame(format!("unknown op {op}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        AccountEvent, CommitEvent, ErrorFrame, InfoEvent, Label, LabelsEvent, RepoOp,
    };
    use civpds_types::cid_for_cbor;

    fn commit() -> StreamEvent {
        StreamEvent::Commit(CommitEvent {
            seq: 7,
            repo: "did:plc:aaa".into(),
            rev: "3kabcdefghijk".into(),
            since: None,
            blocks: vec![1, 2, 3],
            ops: vec![
                RepoOp {
                    action: "create".into(),
                    path: "com.example.post/1".into(),
                    cid: Some(cid_for_cbor(b"post")),
                },
                RepoOp {
                    action: "delete".into(),
                    path: "com.example.post/0".into(),
                    cid: None,
                },
            ],
            commit: cid_for_cbor(b"commit"),
            too_big: false,
            time: "2024-01-01T00:00:00.000Z".into(),
        })
    }

    #[test]
    fn message_frames_carry_type_header() {
        let event = commit();
        let bytes = encode_frame(&event).unwrap();
        let mut cursor = Cursor::new(bytes.as_slice());
        let header = Ipld::decode(DagCborCodec, &mut cursor).unwrap();
        let header = cbor::as_map(&header, "h").unwrap();
        assert_eq!(get_int(header, "op", "h").unwrap(), 1);
        assert_eq!(get_opt_str(header, "t", "h").unwrap(), Some("#commit"));

        assert_eq!(decode_frame(&bytes).unwrap(), event);
    }

    #[test]
    fn error_frames_use_negative_op() {
        let event = StreamEvent::Error(ErrorFrame::consumer_too_slow());
        let bytes = encode_frame(&event).unwrap();
        let mut cursor = Cursor::new(bytes.as_slice());
        let header = Ipld::decode(DagCborCodec, &mut cursor).unwrap();
        let header = cbor::as_map(&header, "h").unwrap();
        assert_eq!(get_int(header, "op", "h").unwrap(), -1);
        assert!(!header.contains_key("t"));

        assert_eq!(decode_frame(&bytes).unwrap(), event);
    }

    #[test]
    fn other_message_types_decode() {
        for event in [
            StreamEvent::Account(AccountEvent {
                seq: 3,
                did: "did:plc:aaa".into(),
                active: false,
                status: Some("takendown".into()),
                time: "t".into(),
            }),
            StreamEvent::Info(InfoEvent {
                name: "OutdatedCursor".into(),
                message: Some("cursor too old".into()),
            }),
            StreamEvent::Labels(LabelsEvent {
                seq: 4,
                labels: vec![Label {
                    src: "did:plc:mod".into(),
                    uri: "at://did:plc:aaa/com.example.post/1".into(),
                    val: "spam".into(),
                    cts: "t".into(),
                }],
            }),
        ] {
            let frame = EventFrame::new(event.clone()).unwrap();
            assert_eq!(EventFrame::decode(frame.bytes.clone()).unwrap().event, event);
        }
    }

    #[test]
    fn truncated_and_trailing_bytes_are_rejected() {
        let bytes = encode_frame(&commit()).unwrap();
        assert!(decode_frame(&bytes[..bytes.len() - 1]).is_err());

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(matches!(decode_frame(&extra), Err(EventError::Frame(_))));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let mut header = BTreeMap::new();
        header.insert("op".to_string(), Ipld::Integer(2));
        let mut bytes = cbor::encode(&Ipld::Map(header)).unwrap();
        bytes.extend(cbor::encode(&Ipld::Map(BTreeMap::new())).unwrap());
        assert!(matches!(decode_frame(&bytes), Err(EventError::Frame(_))));
    }
}

//! Binary event-stream framing used by the streaming converse response.
//!
//! A frame is `total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers |
//! payload | message_crc:u32`, big-endian. Checksums are skipped; the
//! transport is TLS.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use super::UpstreamError;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const STRING_TYPE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl EventFrame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Serialize with string headers only. Checksums are written as zero.
    pub fn encode(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut encoded_headers = BytesMut::new();
        for (name, value) in headers {
            encoded_headers.put_u8(name.len() as u8);
            encoded_headers.put_slice(name.as_bytes());
            encoded_headers.put_u8(STRING_TYPE);
            encoded_headers.put_u16(value.len() as u16);
            encoded_headers.put_slice(value.as_bytes());
        }
        let total = PRELUDE_LEN + encoded_headers.len() + payload.len() + TRAILER_LEN;
        let mut frame = BytesMut::with_capacity(total);
        frame.put_u32(total as u32);
        frame.put_u32(encoded_headers.len() as u32);
        frame.put_u32(0);
        frame.put_slice(&encoded_headers);
        frame.put_slice(payload);
        frame.put_u32(0);
        frame.to_vec()
    }

    /// Text of a `contentBlockDelta` event; `None` for every other event.
    /// Exception frames become errors.
    pub fn delta_text(&self) -> Result<Option<String>, UpstreamError> {
        match self.header(":message-type") {
            Some("event") => {
                if self.header(":event-type") != Some("contentBlockDelta") {
                    return Ok(None);
                }
                let value: Value = serde_json::from_slice(&self.payload)
                    .map_err(|err| UpstreamError::Decode(format!("delta payload: {err}")))?;
                let delta = value
                    .get("delta")
                    .or_else(|| value.get("contentBlockDelta").and_then(|inner| inner.get("delta")));
                Ok(delta
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string))
            }
            Some("exception") | Some("error") => {
                let kind = self
                    .header(":exception-type")
                    .or_else(|| self.header(":error-code"))
                    .unwrap_or("exception")
                    .to_string();
                let message = serde_json::from_slice::<Value>(&self.payload)
                    .ok()
                    .and_then(|value| {
                        value
                            .get("message")
                            .or_else(|| value.get("Message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| String::from_utf8_lossy(&self.payload).into_owned());
                Err(UpstreamError::Exception { kind, message })
            }
            other => Err(UpstreamError::Decode(format!(
                "unexpected message type {other:?}"
            ))),
        }
    }
}

/// Reassembles frames from arbitrarily split network reads.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes of an incomplete frame are still buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn next_frame(&mut self) -> Result<Option<EventFrame>, UpstreamError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        let headers_len =
            u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]])
                as usize;
        if total > MAX_FRAME_LEN || total < PRELUDE_LEN + headers_len + TRAILER_LEN {
            return Err(UpstreamError::Decode(format!(
                "frame length {total} with {headers_len} header bytes"
            )));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        let headers = parse_headers(frame.slice(PRELUDE_LEN..PRELUDE_LEN + headers_len))?;
        let payload = frame.slice(PRELUDE_LEN + headers_len..total - TRAILER_LEN);
        Ok(Some(EventFrame { headers, payload }))
    }
}

fn take(raw: &mut Bytes, len: usize) -> Result<Bytes, UpstreamError> {
    if raw.remaining() < len {
        return Err(UpstreamError::Decode("truncated header block".to_string()));
    }
    Ok(raw.split_to(len))
}

fn parse_headers(mut raw: Bytes) -> Result<HashMap<String, String>, UpstreamError> {
    let mut headers = HashMap::new();
    while raw.has_remaining() {
        let name_len = take(&mut raw, 1)?.get_u8() as usize;
        let name = String::from_utf8(take(&mut raw, name_len)?.to_vec())
            .map_err(|_| UpstreamError::Decode("header name is not utf-8".to_string()))?;
        let value_type = take(&mut raw, 1)?.get_u8();
        let fixed = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | STRING_TYPE => None,
            other => {
                return Err(UpstreamError::Decode(format!(
                    "unknown header value type {other}"
                )))
            }
        };
        match fixed {
            Some(len) => {
                take(&mut raw, len)?;
            }
            None => {
                let len = take(&mut raw, 2)?.get_u16() as usize;
                let value = take(&mut raw, len)?;
                if value_type == STRING_TYPE {
                    let value = String::from_utf8(value.to_vec())
                        .map_err(|_| UpstreamError::Decode(format!("header {name} is not utf-8")))?;
                    headers.insert(name, value);
                }
            }
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> Vec<u8> {
        EventFrame::encode(
            &[
                (":message-type", "event"),
                (":event-type", "contentBlockDelta"),
                (":content-type", "application/json"),
            ],
            format!(r#"{{"contentBlockIndex":0,"delta":{{"text":"{text}"}}}}"#).as_bytes(),
        )
    }

    #[test]
    fn reassembles_frames_split_at_any_byte() {
        let mut wire = delta("Hel");
        wire.extend(delta("lo"));
        for split in 1..wire.len() {
            let mut decoder = EventStreamDecoder::new();
            let mut texts = Vec::new();
            for part in [&wire[..split], &wire[split..]] {
                decoder.push(part);
                while let Some(frame) = decoder.next_frame().expect("decode") {
                    texts.extend(frame.delta_text().expect("event"));
                }
            }
            assert_eq!(texts, vec!["Hel", "lo"], "split at {split}");
            assert!(!decoder.has_partial());
        }
    }

    #[test]
    fn skips_non_string_headers_and_other_events() {
        let mut raw = BytesMut::new();
        raw.put_u8(4);
        raw.put_slice(b"flag");
        raw.put_u8(0);
        raw.put_u8(2);
        raw.put_slice(b"id");
        raw.put_u8(4);
        raw.put_u32(7);
        let headers = parse_headers(raw.freeze()).expect("headers");
        assert!(headers.is_empty());

        let stop = EventFrame::encode(
            &[(":message-type", "event"), (":event-type", "messageStop")],
            br#"{"stopReason":"end_turn"}"#,
        );
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&stop);
        let frame = decoder.next_frame().expect("decode").expect("frame");
        assert_eq!(frame.delta_text(), Ok(None));
    }

    #[test]
    fn exception_frames_become_errors() {
        let frame = EventFrame::encode(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"slow down"}"#,
        );
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);
        let err = decoder
            .next_frame()
            .expect("decode")
            .expect("frame")
            .delta_text()
            .unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Exception {
                kind: "throttlingException".to_string(),
                message: "slow down".to_string(),
            }
        );
    }

    #[test]
    fn rejects_impossible_lengths() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&[0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(decoder.next_frame(), Err(UpstreamError::Decode(_))));
    }
}

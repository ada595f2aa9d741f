use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::mem;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

const READ_CHUNK: usize = 8 * 1024;

/// One Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    /// `data:` lines of the block joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Terminal marker used by OpenAI-compatible streams.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Decodes the data payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StreamDecode`] when the payload is not JSON.
    pub fn json(&self) -> Result<Value, BridgeError> {
        serde_json::from_str(&self.data).map_err(|err| BridgeError::StreamDecode {
            message: format!("event data is not JSON: {err}"),
        })
    }
}

#[derive(Debug, Default)]
struct PendingBlock {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    malformed: bool,
}

/// Incremental SSE parser.
///
/// Bytes may arrive split at any position, including inside a field name or a
/// multi-byte character; partial lines are buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    block: PendingBlock,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event it completes.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_bridge::stream::SseDecoder;
    ///
    /// let mut decoder = SseDecoder::new();
    /// assert!(decoder.feed(b"event: ping\nda").is_empty());
    /// let events = decoder.feed(b"ta: hello\n\n");
    /// assert_eq!(events[0].event.as_deref(), Some("ping"));
    /// assert_eq!(events[0].data, "hello");
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = Self::drain_line(&mut self.buffer) {
            if line.is_empty() {
                if let Some(event) = self.finish_block() {
                    events.push(event);
                }
            } else {
                self.handle_line(&line);
            }
        }
        events
    }

    /// Signals end of input. A block without its terminating blank line is discarded.
    pub fn finish(&mut self) {
        let pending = !self.buffer.is_empty() || !self.block.data.is_empty();
        self.buffer.clear();
        self.block = PendingBlock::default();
        if pending {
            tracing::debug!("stream closed inside an unterminated event block");
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        if line.starts_with(b":") {
            return;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            self.block.malformed = true;
            return;
        };
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text, ""),
        };
        match field {
            "id" => self.block.id = Some(value.to_string()),
            "event" => self.block.event = Some(value.to_string()),
            "data" => self.block.data.push(value.to_string()),
            _ => {}
        }
    }

    fn finish_block(&mut self) -> Option<SseEvent> {
        let block = mem::take(&mut self.block);
        if block.malformed {
            let err = BridgeError::StreamDecode {
                message: "invalid UTF-8 in event block".to_string(),
            };
            tracing::warn!(error = %err, "skipping malformed event block");
            return None;
        }
        if block.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            id: block.id,
            event: block.event,
            data: block.data.join("\n"),
        })
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }
}

/// Lazy sequence of events read from a streaming body.
///
/// Ends when the server closes the body. A read failure is yielded once as
/// [`BridgeError::Transport`] and ends the sequence.
pub struct SseStream<R> {
    reader: R,
    source: String,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    chunk: Vec<u8>,
    finished: bool,
}

impl<R: Read> SseStream<R> {
    /// Wraps `reader`; `source` names the endpoint in errors.
    pub fn new(reader: R, source: impl Into<String>) -> Self {
        Self {
            reader,
            source: source.into(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            chunk: vec![0; READ_CHUNK],
            finished: false,
        }
    }
}

impl<R: Read> Iterator for SseStream<R> {
    type Item = Result<SseEvent, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    self.finished = true;
                    self.decoder.finish();
                }
                Ok(read) => {
                    let events = self.decoder.feed(&self.chunk[..read]);
                    self.pending.extend(events);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    self.finished = true;
                    return Some(Err(BridgeError::transport(&self.source, err.to_string())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    /// Reader that hands out pre-split chunks, one per `read` call.
    struct ChunkedReader {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ChunkedReader {
        fn new(chunks: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Ok(0),
                Some(Err(err)) => Err(err),
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    const BODY: &[u8] = b": keep-alive\n\
id: 1\n\
event: message\n\
data: {\"text\":\"h\xc3\xa9llo\"}\n\
\n\
data: line one\r\n\
data: line two\r\n\
\r\n\
event: ping\n\
\n\
data: [DONE]\n\
\n";

    fn decode_all(chunks: &[&[u8]]) -> Vec<SseEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk));
        }
        decoder.finish();
        events
    }

    #[test]
    fn decodes_fields_comments_and_multiline_data() {
        let events = decode_all(&[BODY]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"text\":\"héllo\"}");
        assert_eq!(events[1].data, "line one\nline two");
        assert_eq!(events[1].id, None);
        assert!(events[2].is_done());
    }

    #[test]
    fn any_two_chunk_split_yields_same_events() {
        let whole = decode_all(&[BODY]);
        for split in 0..=BODY.len() {
            let (head, tail) = BODY.split_at(split);
            assert_eq!(decode_all(&[head, tail]), whole, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_yields_same_events() {
        let whole = decode_all(&[BODY]);
        let bytes: Vec<&[u8]> = BODY.chunks(1).collect();
        assert_eq!(decode_all(&bytes), whole);
    }

    #[test]
    fn block_without_data_produces_no_event() {
        let events = decode_all(&[b"id: 7\nevent: ping\n\n: comment only\n\n"]);
        assert!(events.is_empty());
    }

    #[test]
    fn empty_data_line_still_produces_event() {
        let events = decode_all(&[b"data\n\ndata:\n\n"]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.data.is_empty()));
    }

    #[test]
    fn malformed_block_is_skipped_and_decoding_continues() {
        let events = decode_all(&[b"data: \xff\xfe\n\ndata: ok\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn unterminated_trailing_block_is_discarded() {
        let events = decode_all(&[b"data: complete\n\ndata: partial"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "complete");
    }

    #[test]
    fn stream_iterates_over_reader_chunks() {
        let reader = ChunkedReader::new(vec![
            Ok(b"data: {\"a\"".to_vec()),
            Ok(b":1}\n".to_vec()),
            Ok(b"\ndata: [DONE]\n\n".to_vec()),
        ]);
        let events: Vec<SseEvent> = SseStream::new(reader, "http://test/sse")
            .collect::<Result<_, _>>()
            .expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].json().expect("json")["a"], 1);
        assert!(events[1].is_done());
    }

    #[test]
    fn read_failure_surfaces_once_then_ends() {
        let reader = ChunkedReader::new(vec![
            Ok(b"data: first\n\n".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"data: never\n\n".to_vec()),
        ]);
        let mut stream = SseStream::new(reader, "http://test/sse");
        assert_eq!(stream.next().expect("event").expect("ok").data, "first");
        match stream.next() {
            Some(Err(BridgeError::Transport { url, message })) => {
                assert_eq!(url, "http://test/sse");
                assert!(message.contains("reset"), "message: {message}");
            }
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let reader = ChunkedReader::new(vec![
            Err(io::Error::new(io::ErrorKind::Interrupted, "signal")),
            Ok(b"data: after\n\n".to_vec()),
        ]);
        let events: Vec<_> = SseStream::new(reader, "http://test/sse").collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().expect("ok").data, "after");
    }
}

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};

use crate::errors::AppError;
use crate::models::BackendEvent;

/// Splits a byte stream into SSE events and yields their `data` payloads.
///
/// Bytes are buffered until a blank line closes the event, so multi-byte
/// characters and frames split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns the data payloads of every completed event.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some((end, sep_len)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&block)) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&rest))
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn event_data(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
    data
}

/// Decodes one data payload. `None` for the optional `[DONE]` sentinel.
pub fn decode_event(data: &str) -> Option<Result<BackendEvent, AppError>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(serde_json::from_str(data).map_err(|e| AppError::BackendProtocol {
        message: format!("undecodable stream event: {e}"),
    }))
}

struct DecodeState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<BackendEvent, AppError>>,
    finished: bool,
}

/// Turns a raw backend body into a stream of [`BackendEvent`]s. A transport
/// error is yielded once and ends the stream.
pub fn event_stream<S>(bytes: S) -> BoxStream<'static, Result<BackendEvent, AppError>>
where
    S: Stream<Item = Result<Bytes, AppError>> + Send + Unpin + 'static,
{
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let payloads = st.decoder.push(&chunk);
                    st.pending.extend(payloads.iter().filter_map(|d| decode_event(d)));
                }
                Some(Err(err)) => {
                    st.finished = true;
                    st.pending.push_back(Err(err));
                }
                None => {
                    st.finished = true;
                    if let Some(event) = st.decoder.finish().and_then(|d| decode_event(&d)) {
                        st.pending.push_back(event);
                    }
                }
            }
        }
    })
    .boxed()
}

//! Newline-delimited JSON decoding for Ollama's streaming responses.
//!
//! HTTP chunks do not line up with JSON lines: a chunk can hold several
//! lines or end in the middle of one.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use edgellm_core::BackendError;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, non-blank line without its terminator
    pub fn next_line(&mut self) -> Option<Bytes> {
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(line.freeze());
            }
        }
        None
    }

    /// Whatever is left once the input ended without a final newline
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.buffer.split();
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest.freeze())
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

struct DecodeState<S> {
    inner: Pin<Box<S>>,
    decoder: LineDecoder,
    exhausted: bool,
}

/// Decode every line of `bytes` as a `T`.
///
/// A malformed line yields an error item and decoding carries on; a
/// transport error ends the stream after being yielded.
pub fn decode<T, S>(bytes: S) -> impl Stream<Item = Result<T, BackendError>> + Send
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, BackendError>> + Send + 'static,
{
    let state = DecodeState { inner: Box::pin(bytes), decoder: LineDecoder::new(), exhausted: false };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.decoder.next_line() {
                return Some((parse_line(&line), state));
            }
            if state.exhausted {
                let line = state.decoder.finish()?;
                return Some((parse_line(&line), state));
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(err)) => {
                    state.decoder = LineDecoder::new();
                    state.exhausted = true;
                    return Some((Err(err), state));
                }
                None => state.exhausted = true,
            }
        }
    })
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, BackendError> {
    serde_json::from_slice(line).map_err(|e| {
        let preview: String = String::from_utf8_lossy(line).chars().take(120).collect();
        BackendError::invalid(format!("{} in line: {}", e, preview))
    })
}

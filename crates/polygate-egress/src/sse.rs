//! SSE decoding for upstream streams
//!
//! Splits a byte stream into `data:` payloads and wraps the result so the
//! per-request cancellation token terminates the stream promptly, releasing
//! the upstream connection.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use polygate_core::{Error, ProviderId, Result};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

struct SseState<S> {
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

fn drain_lines(buffer: &mut Vec<u8>, pending: &mut VecDeque<String>) {
    while let Some(position) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=position).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\n', '\r']);
        if let Some(data) = text.strip_prefix("data:") {
            pending.push_back(data.trim_start().to_string());
        }
        // Event/id/comment lines are irrelevant to the chat dialects.
    }
}

/// Decode `data:` payload lines from an SSE byte stream.
pub fn sse_data_stream<S>(
    provider: ProviderId,
    byte_stream: S,
) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    let state = SseState {
        inner: byte_stream,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(data) = state.pending.pop_front() {
                return Some((Ok(data), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    drain_lines(&mut state.buffer, &mut state.pending);
                }
                Some(Err(error)) => {
                    state.done = true;
                    return Some((
                        Err(Error::Network {
                            provider,
                            message: error.to_string(),
                        }),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                }
            }
        }
    })
}

/// End a stream as soon as the cancellation token fires.
pub fn cancel_on<S, T>(stream: S, cancel: CancellationToken) -> impl Stream<Item = T> + Send
where
    S: Stream<Item = T> + Send + Unpin + 'static,
    T: Send,
{
    futures::stream::unfold((stream, cancel), |(mut stream, cancel)| async move {
        tokio::select! {
            _ = cancel.cancelled() => None,
            item = stream.next() => item.map(|item| (item, (stream, cancel))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + Unpin {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn test_decodes_data_lines() {
        let stream = sse_data_stream(
            ProviderId::OpenAi,
            byte_stream(vec!["data: one\n\ndata: two\n\n"]),
        );
        let lines: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_reassembles_split_lines() {
        let stream = sse_data_stream(
            ProviderId::OpenAi,
            byte_stream(vec!["data: hel", "lo\n\n", "data: [DONE]\n\n"]),
        );
        let lines: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines, vec!["hello", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_ignores_non_data_lines() {
        let stream = sse_data_stream(
            ProviderId::Anthropic,
            byte_stream(vec![
                "event: message_start\ndata: {\"a\":1}\n\n: keepalive\n\n",
            ]),
        );
        let lines: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[tokio::test]
    async fn test_handles_crlf() {
        let stream = sse_data_stream(
            ProviderId::OpenAi,
            byte_stream(vec!["data: one\r\n\r\ndata: two\r\n\r\n"]),
        );
        let lines: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_cancel_on_terminates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = cancel_on(
            futures::stream::iter(vec![1, 2, 3]),
            cancel,
        );
        let items: Vec<i32> = stream.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_on_passes_items_while_live() {
        let cancel = CancellationToken::new();
        let stream = cancel_on(futures::stream::iter(vec![1, 2, 3]), cancel);
        let items: Vec<i32> = stream.collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }
}

//! Server-Sent Events line parser shared by every model client.
//!
//! Buffers chunked response bytes, splits on newlines and yields the payload
//! of each `data:` line. Comments, blank lines and the `[DONE]` marker are
//! skipped. Event names are not surfaced: both supported wire formats carry
//! their discriminator inside the JSON payload.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;

use crate::error::ProviderError;

/// Yield raw `data:` payloads from an SSE byte stream.
///
/// When no bytes arrive for `idle_timeout` the stream yields
/// [`ProviderError::IdleTimeout`] and ends. A transport error ends the stream
/// with [`ProviderError::StreamInterrupted`].
pub fn data_lines<S, E>(
    byte_stream: S,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        move |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line_bytes = buffer.split_to(newline_pos + 1);
                    line_bytes.truncate(line_bytes.len() - 1);
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.truncate(line_bytes.len() - 1);
                    }

                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        continue;
                    };
                    if let Some(data) = extract_data(line) {
                        return Some((Ok(data), (stream, buffer, false)));
                    }
                    continue;
                }

                match tokio::time::timeout(idle_timeout, stream.next()).await {
                    Ok(Some(Ok(chunk))) => buffer.extend_from_slice(&chunk),
                    Ok(Some(Err(e))) => {
                        let err = ProviderError::StreamInterrupted(e.to_string());
                        return Some((Err(err), (stream, buffer, true)));
                    }
                    Ok(None) => {
                        // Unterminated trailing line.
                        let data = std::str::from_utf8(&buffer).ok().and_then(extract_data);
                        buffer.clear();
                        return data.map(|d| (Ok(d), (stream, buffer, true)));
                    }
                    Err(_) => {
                        let err = ProviderError::IdleTimeout(idle_timeout);
                        return Some((Err(err), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

/// Returns the payload of a `data:` line, or `None` for comments, other
/// fields, empty data and `[DONE]`.
pub fn extract_data(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();

    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

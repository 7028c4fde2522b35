use crate::error::{ErrorCategory, UpstreamError};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

pub(crate) fn build_client() -> Result<Client, reqwest::Error> {
    // Timeouts are set per request; operations have different bounds.
    Client::builder().build()
}

/// Sends a request and maps transport failures and non-2xx statuses into
/// the shared error taxonomy. The core never retries.
pub(crate) async fn send(vendor: &'static str, request: RequestBuilder) -> Result<Response, UpstreamError> {
    let response = request
        .send()
        .await
        .map_err(|err| UpstreamError::from_transport(vendor, &err))?;

    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::from_status(vendor, status, &body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    vendor: &'static str,
    response: Response,
) -> Result<T, UpstreamError> {
    let body = response
        .text()
        .await
        .map_err(|err| UpstreamError::from_transport(vendor, &err))?;
    tracing::debug!("{} response: {}", vendor, preview(&body, 500));
    serde_json::from_str(&body).map_err(|err| {
        UpstreamError::new(
            vendor,
            ErrorCategory::Unknown,
            format!("unexpected response payload: {}", err),
        )
    })
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// What one framed line of a streaming body means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Text(String),
    /// Text that is also the last fragment of the stream.
    Last(String),
    Skip,
    Done,
}

/// Payload of an SSE `data:` line, if the line is one.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

struct LineReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(response: Response) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            body,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> reqwest::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
            }
            match self.body.next().await {
                Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                Some(Err(err)) => return Err(err),
                None if self.buf.is_empty() => return Ok(None),
                None => {
                    let rest = std::mem::take(&mut self.buf);
                    return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
                }
            }
        }
    }
}

enum StreamState<F> {
    Pending(RequestBuilder, F),
    Reading(LineReader, F),
    Finished,
}

/// Turns a line-framed streaming response into text fragments.
///
/// `decode` interprets one line at a time. The stream ends at `Frame::Done`,
/// after `Frame::Last`, or when the body closes; transport or status
/// failures end it with a single `Error: ...` fragment.
pub(crate) fn frame_stream<F>(
    vendor: &'static str,
    request: RequestBuilder,
    decode: F,
) -> BoxStream<'static, String>
where
    F: FnMut(&str) -> Frame + Send + 'static,
{
    stream::unfold(StreamState::Pending(request, decode), move |state| async move {
        match state {
            StreamState::Pending(request, decode) => match send(vendor, request).await {
                Ok(response) => next_fragment(vendor, LineReader::new(response), decode).await,
                Err(err) => {
                    tracing::error!("{} streaming error: {}", vendor, err);
                    Some((format!("Error: {}", err), StreamState::Finished))
                }
            },
            StreamState::Reading(reader, decode) => next_fragment(vendor, reader, decode).await,
            StreamState::Finished => None,
        }
    })
    .boxed()
}

async fn next_fragment<F>(
    vendor: &'static str,
    mut reader: LineReader,
    mut decode: F,
) -> Option<(String, StreamState<F>)>
where
    F: FnMut(&str) -> Frame,
{
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode(&line) {
                    Frame::Text(text) if !text.is_empty() => {
                        return Some((text, StreamState::Reading(reader, decode)));
                    }
                    Frame::Last(text) if !text.is_empty() => {
                        return Some((text, StreamState::Finished));
                    }
                    Frame::Last(_) | Frame::Done => return None,
                    Frame::Text(_) | Frame::Skip => continue,
                }
            }
            Ok(None) => return None,
            Err(err) => {
                let err = UpstreamError::from_transport(vendor, &err);
                tracing::error!("{} streaming error: {}", vendor, err);
                return Some((format!("Error: {}", err), StreamState::Finished));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_strips_prefix() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: message_start"), None);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn status_failure_becomes_single_error_fragment() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/stream")
            .with_status(401)
            .with_body("nope")
            .create_async()
            .await;

        let client = build_client().unwrap();
        let request = client.post(format!("{}/stream", server.url()));
        let fragments: Vec<String> = frame_stream("test", request, |_| Frame::Skip).collect().await;

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].starts_with("Error:"));
        assert!(fragments[0].contains("auth"));
    }

    #[tokio::test]
    async fn body_without_trailing_newline_still_yields_last_line() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/lines")
            .with_status(200)
            .with_body("one\ntwo")
            .create_async()
            .await;

        let client = build_client().unwrap();
        let request = client.get(format!("{}/lines", server.url()));
        let fragments: Vec<String> =
            frame_stream("test", request, |line| Frame::Text(line.to_string()))
                .collect()
                .await;

        assert_eq!(fragments, vec!["one".to_string(), "two".to_string()]);
    }
}

use std::pin::pin;

use futures::{Stream, StreamExt, stream};
use replica_core::{ChangeEvent, DecodeError, ErrorCategory, EventDecoder, Resource, SyncFailure};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{ByteStream, HttpRequest, Transport, TransportError};

/// How a watch ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The server closed the stream cleanly.
    Closed,
    /// The cancellation token fired.
    Cancelled,
}

/// Failures while opening or reading a watch stream.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch {url}: connection failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("watch {url}: server responded with status code {status}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        status_text: String,
    },
    #[error("watch {url}: missing response body")]
    MissingBody { url: String },
    #[error("watch {url}: {source}")]
    Stream {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("watch {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: DecodeError,
    },
    #[error("watch {url}: cancelled while opening")]
    Cancelled { url: String },
}

impl From<&WatchError> for SyncFailure {
    fn from(err: &WatchError) -> Self {
        let (category, code) = match err {
            WatchError::Connect { .. } => (ErrorCategory::Transport, "watch_connect_error"),
            WatchError::UnexpectedStatus { status, .. } => {
                return SyncFailure::new(
                    ErrorCategory::Protocol,
                    "watch_unexpected_status",
                    err.to_string(),
                )
                .with_status(*status);
            }
            WatchError::MissingBody { .. } => (ErrorCategory::Protocol, "watch_missing_body"),
            WatchError::Stream { .. } => (ErrorCategory::Transport, "watch_stream_error"),
            WatchError::Decode { source, .. } => {
                return SyncFailure {
                    message: err.to_string(),
                    ..SyncFailure::from(source)
                };
            }
            WatchError::Cancelled { .. } => (ErrorCategory::Transport, "watch_cancelled"),
        };
        SyncFailure::new(category, code, err.to_string())
    }
}

/// Lazily decode a watch body into change events.
///
/// The stream ends after the body ends or after the first error.
pub fn decode_events<T>(
    url: String,
    body: ByteStream,
) -> impl Stream<Item = Result<ChangeEvent<T>, WatchError>> + Send + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    stream::unfold(Some((body, EventDecoder::<T>::new())), move |state| {
        let url = url.clone();
        async move {
            let (mut body, mut decoder) = state?;
            loop {
                if let Some(decoded) = decoder.next_event() {
                    return match decoded {
                        Ok(event) => Some((Ok(event), Some((body, decoder)))),
                        Err(source) => Some((Err(WatchError::Decode { url, source }), None)),
                    };
                }

                match body.next().await {
                    Some(Ok(chunk)) => {
                        trace!(bytes = chunk.len(), "watch chunk");
                        decoder.feed(&chunk);
                    }
                    Some(Err(source)) => {
                        return Some((Err(WatchError::Stream { url, source }), None));
                    }
                    None => {
                        decoder.finish();
                        return None;
                    }
                }
            }
        }
    })
}

/// One open watch connection.
///
/// Events are handed to the caller in arrival order; the next chunk is not
/// read until the handler returns.
pub struct WatchChannel<T> {
    url: String,
    body: ByteStream,
    cancel: CancellationToken,
    _resource: std::marker::PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for WatchChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchChannel")
            .field("url", &self.url)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T> WatchChannel<T>
where
    T: Resource + DeserializeOwned,
{
    /// Open the stream, failing before any event on connect errors, non-200
    /// statuses, or a missing body.
    pub async fn open(
        transport: &dyn Transport,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError> {
        let url = request.url.to_string();
        if cancel.is_cancelled() {
            return Err(WatchError::Cancelled { url });
        }

        debug!(%url, "opening watch");
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WatchError::Cancelled { url: url.clone() }),
            opened = transport.open_stream(request) => opened,
        };
        let response = opened.map_err(|source| WatchError::Connect {
            url: url.clone(),
            source,
        })?;

        if response.status != 200 {
            return Err(WatchError::UnexpectedStatus {
                url,
                status: response.status,
                status_text: response.status_text,
            });
        }
        let Some(body) = response.body else {
            return Err(WatchError::MissingBody { url });
        };

        Ok(Self {
            url,
            body,
            cancel,
            _resource: std::marker::PhantomData,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Token that aborts this channel. Cancelling is idempotent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read until the stream ends, fails, or the token fires.
    pub async fn run<F>(self, mut handler: F) -> Result<WatchEnd, WatchError>
    where
        F: FnMut(ChangeEvent<T>),
    {
        let Self {
            url, body, cancel, ..
        } = self;
        let mut events = pin!(decode_events::<T>(url.clone(), body));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%url, "watch cancelled");
                    return Ok(WatchEnd::Cancelled);
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if cancel.is_cancelled() {
                        return Ok(WatchEnd::Cancelled);
                    }
                    handler(event);
                }
                Some(Err(err)) => return Err(err),
                None => {
                    debug!(%url, "server terminated watch stream");
                    return Ok(WatchEnd::Closed);
                }
            }
        }
    }

    /// Open and run in one step; cancellation during open is a clean end.
    pub async fn watch<F>(
        transport: &dyn Transport,
        request: HttpRequest,
        cancel: CancellationToken,
        handler: F,
    ) -> Result<WatchEnd, WatchError>
    where
        F: FnMut(ChangeEvent<T>),
    {
        match Self::open(transport, request, cancel).await {
            Ok(channel) => channel.run(handler).await,
            Err(WatchError::Cancelled { .. }) => Ok(WatchEnd::Cancelled),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use replica_core::{DynamicObject, EventKind};
    use reqwest::{Method, header::HeaderMap};
    use tokio::time::timeout;
    use url::Url;

    use super::*;
    use crate::testing::{FakeTransport, StreamScript, event_line};

    fn request() -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            url: Url::parse("http://server/apis/g/v1/things?watch=1").expect("valid url"),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    async fn collect(
        transport: &FakeTransport,
        cancel: CancellationToken,
    ) -> (Result<WatchEnd, WatchError>, Vec<ChangeEvent<DynamicObject>>) {
        let mut seen = Vec::new();
        let result = timeout(
            Duration::from_secs(5),
            WatchChannel::<DynamicObject>::watch(transport, request(), cancel, |event| {
                seen.push(event)
            }),
        )
        .await
        .expect("watch should finish");
        (result, seen)
    }

    #[tokio::test]
    async fn delivers_events_in_order_then_reports_clean_close() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::chunks(vec![
            Ok(Bytes::from(event_line("ADDED", "a"))),
            Ok(Bytes::from(format!(
                "{}{}",
                event_line("MODIFIED", "a"),
                event_line("DELETED", "a")
            ))),
        ]));

        let (result, seen) = collect(&transport, CancellationToken::new()).await;
        assert_eq!(result.expect("clean close"), WatchEnd::Closed);
        let kinds: Vec<_> = seen.iter().map(ChangeEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Added, EventKind::Modified, EventKind::Deleted]);
    }

    #[tokio::test]
    async fn rejects_non_ok_status_before_any_event() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::Status(410));

        let (result, seen) = collect(&transport, CancellationToken::new()).await;
        let err = result.expect_err("410 must fail");
        assert!(matches!(err, WatchError::UnexpectedStatus { status: 410, .. }));
        assert!(seen.is_empty());
        assert_eq!(SyncFailure::from(&err).status, Some(410));
    }

    #[tokio::test]
    async fn reports_missing_body_and_connect_failures_distinctly() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::NoBody);
        transport.push_stream(StreamScript::ConnectError(TransportError::Connect(
            "refused".to_owned(),
        )));

        let (first, _) = collect(&transport, CancellationToken::new()).await;
        assert!(matches!(first, Err(WatchError::MissingBody { .. })));

        let (second, _) = collect(&transport, CancellationToken::new()).await;
        let err = second.expect_err("connect must fail");
        assert!(matches!(err, WatchError::Connect { .. }));
        assert_eq!(SyncFailure::from(&err).category, ErrorCategory::Transport);
    }

    #[tokio::test]
    async fn mid_stream_error_follows_already_delivered_events() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::chunks(vec![
            Ok(Bytes::from(event_line("ADDED", "a"))),
            Err(TransportError::Stream("connection reset".to_owned())),
        ]));

        let (result, seen) = collect(&transport, CancellationToken::new()).await;
        assert!(matches!(result, Err(WatchError::Stream { .. })));
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn malformed_line_fails_the_stream() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::chunks(vec![Ok(Bytes::from_static(
            b"{\"type\":\"ADDED\"\n",
        ))]));

        let (result, seen) = collect(&transport, CancellationToken::new()).await;
        let err = result.expect_err("bad json must fail");
        assert!(matches!(err, WatchError::Decode { .. }));
        let failure = SyncFailure::from(&err);
        assert_eq!(failure.category, ErrorCategory::Protocol);
        assert_eq!(failure.code, "watch_decode_error");
        assert_eq!(failure.status, None);
        assert!(failure.message.starts_with(&format!("watch {}: ", request().url)));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_open_skips_the_transport() {
        let transport = FakeTransport::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        cancel.cancel();

        let (result, seen) = collect(&transport, cancel).await;
        assert_eq!(result.expect("cancel is clean"), WatchEnd::Cancelled);
        assert!(seen.is_empty());
        assert!(transport.stream_requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_open_aborts_it() {
        let transport = FakeTransport::default();
        transport.push_stream(StreamScript::Hang);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let (result, _) = collect(&transport, cancel).await;
        assert_eq!(result.expect("cancel is clean"), WatchEnd::Cancelled);
    }

    #[tokio::test]
    async fn handler_is_not_called_after_cancellation() {
        let transport = FakeTransport::default();
        let live = transport.push_live_stream();
        let cancel = CancellationToken::new();

        let channel = WatchChannel::<DynamicObject>::open(&transport, request(), cancel.clone())
            .await
            .expect("stream opens");
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(channel.run(move |event| {
            let _ = seen_tx.send(event.kind());
        }));

        live.send(Ok(Bytes::from(event_line("ADDED", "a"))))
            .expect("stream alive");
        assert_eq!(seen_rx.recv().await, Some(EventKind::Added));

        cancel.cancel();
        let end = timeout(Duration::from_secs(5), task)
            .await
            .expect("run should stop")
            .expect("task should not panic")
            .expect("cancel is clean");
        assert_eq!(end, WatchEnd::Cancelled);

        let _ = live.send(Ok(Bytes::from(event_line("ADDED", "b"))));
        assert_eq!(seen_rx.recv().await, None);
    }
}

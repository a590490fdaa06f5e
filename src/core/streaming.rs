//! Long-lived upstream stream relay.
//!
//! Upstream SSE bodies are re-framed into whole events and relayed to the
//! client under one of two overflow policies:
//!
//! * [`OverflowPolicy::Block`]: pull based. The upstream is polled only when
//!   the client asks for the next event, so TCP backpressure reaches the
//!   upstream.
//! * [`OverflowPolicy::DropOldest`]: a reader task fills a bounded queue; when
//!   it is full the oldest queued event is discarded and counted.
//!
//! Dropping the relay (client disconnect) drops or aborts the upstream reader.
use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use axum::{BoxError, body::Body};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{
    config::{OverflowPolicy, StreamingConfig},
    metrics::{ActiveStreamGuard, increment_stream_dropped_events},
};

type EventStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Splits a byte stream into SSE events at blank lines.
///
/// Lines may end in LF, CRLF or a bare CR. Scanning resumes where the
/// previous chunk left off, so a long partial event is examined once.
#[derive(Debug)]
pub struct SseFramer {
    buf: BytesMut,
    /// Next unexamined byte in `buf`.
    scan: usize,
    /// Nothing but a line terminator seen since the last line ended.
    line_empty: bool,
    /// Last terminator was a CR; a following LF belongs to it.
    after_cr: bool,
}

impl Default for SseFramer {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            scan: 0,
            line_empty: true,
            after_cr: false,
        }
    }
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completed, each including its
    /// terminating blank line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut i = self.scan;

        while i < self.buf.len() {
            let byte = self.buf[i];
            i += 1;
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\r' | b'\n' => {
                    self.after_cr = byte == b'\r';
                    if !self.line_empty {
                        self.line_empty = true;
                        continue;
                    }
                    if self.after_cr && self.buf.get(i) == Some(&b'\n') {
                        i += 1;
                        self.after_cr = false;
                    }
                    events.push(self.buf.split_to(i).freeze());
                    i = 0;
                }
                _ => {
                    self.after_cr = false;
                    self.line_empty = false;
                }
            }
        }

        self.scan = i;
        events
    }

    /// Bytes of the event still being assembled.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Whatever is left after the upstream ended mid-event.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scan = 0;
        self.line_empty = true;
        self.after_cr = false;
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

/// An upstream event outgrew `streaming.max_event_bytes`.
#[derive(Debug, thiserror::Error)]
#[error("upstream SSE event exceeds {limit} bytes")]
pub struct EventTooLarge {
    pub limit: usize,
}

/// Re-frame a chunked upstream into whole SSE events, pulling lazily.
///
/// An event larger than `max_event_bytes` ends the stream with
/// [`EventTooLarge`] after the events completed before it.
pub fn sse_events<S, E>(
    upstream: S,
    max_event_bytes: usize,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<BoxError> + Send + 'static,
{
    struct State<S> {
        upstream: S,
        framer: SseFramer,
        ready: VecDeque<Result<Bytes, BoxError>>,
        done: bool,
    }

    let state = State {
        upstream,
        framer: SseFramer::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.ready.extend(state.framer.push(&chunk).into_iter().map(Ok));
                    if state.framer.pending() > max_event_bytes {
                        tracing::warn!(
                            "Upstream SSE event exceeded {} bytes, closing stream",
                            max_event_bytes
                        );
                        state.done = true;
                        state.ready.push_back(Err(Box::new(EventTooLarge {
                            limit: max_event_bytes,
                        })));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.ready.push_back(Err(e.into()));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.framer.finish().map(Ok));
                }
            }
        }
    })
}

struct DropQueue {
    events: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Result<Bytes, BoxError>>,
    closed: bool,
}

impl DropQueue {
    fn push(&self, item: Result<Bytes, BoxError>) {
        let mut inner = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            increment_stream_dropped_events(1);
        }
        inner.queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Result<Bytes, BoxError>> {
        loop {
            {
                let mut inner = self.events.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Aborts the upstream reader when the client side goes away.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Client-facing side of a relayed stream.
pub struct EventRelay {
    inner: EventStream,
    dropped: Arc<AtomicU64>,
    _active: ActiveStreamGuard,
}

impl fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRelay")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl EventRelay {
    /// Relay already-framed events under `config`'s overflow policy.
    pub fn new<S>(events: S, config: &StreamingConfig) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        let dropped = Arc::new(AtomicU64::new(0));
        let inner: EventStream = match config.overflow {
            OverflowPolicy::Block => Box::pin(events),
            OverflowPolicy::DropOldest => {
                let queue = Arc::new(DropQueue {
                    events: Mutex::new(Inner::default()),
                    notify: Notify::new(),
                    capacity: config.buffer_capacity.max(1),
                    dropped: dropped.clone(),
                });

                let writer = queue.clone();
                let reader = tokio::spawn(async move {
                    let mut events = Box::pin(events);
                    while let Some(item) = events.next().await {
                        let failed = item.is_err();
                        writer.push(item);
                        if failed {
                            break;
                        }
                    }
                    writer.close();
                });

                let guard = AbortOnDrop(reader);
                Box::pin(stream::unfold((queue, guard), |(queue, guard)| async move {
                    let item = queue.pop().await?;
                    Some((item, (queue, guard)))
                }))
            }
        };

        Self {
            inner,
            dropped,
            _active: ActiveStreamGuard::new(),
        }
    }

    /// Events discarded so far by the `drop_oldest` policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for EventRelay {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Wrap an upstream `text/event-stream` body for relaying to the client.
pub fn relay_sse_body(body: Body, config: &StreamingConfig) -> Body {
    let events = sse_events(body.into_data_stream(), config.max_event_bytes);
    Body::from_stream(EventRelay::new(events, config))
}

pub fn is_event_stream(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

pub type UpstreamWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connected upstream WebSocket handed from the gateway to the inbound
/// handler through response extensions. The socket can be taken once.
#[derive(Clone)]
pub struct UpstreamSocket(Arc<Mutex<Option<UpstreamWebSocket>>>);

impl UpstreamSocket {
    pub fn new(socket: UpstreamWebSocket) -> Self {
        Self(Arc::new(Mutex::new(Some(socket))))
    }

    pub fn take(&self) -> Option<UpstreamWebSocket> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl fmt::Debug for UpstreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpstreamSocket")
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;

    fn config(overflow: OverflowPolicy, buffer_capacity: usize) -> StreamingConfig {
        StreamingConfig {
            buffer_capacity,
            overflow,
            ..StreamingConfig::default()
        }
    }

    #[test]
    fn test_framer_splits_on_blank_lines() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: {\"id\":1}\n").is_empty());
        let events = framer.push(b"\ndata: {\"id\":2}\n\ndata: par");
        assert_eq!(
            events,
            vec![
                Bytes::from_static(b"data: {\"id\":1}\n\n"),
                Bytes::from_static(b"data: {\"id\":2}\n\n"),
            ]
        );
        assert_eq!(framer.finish(), Some(Bytes::from_static(b"data: par")));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_framer_handles_crlf() {
        let mut framer = SseFramer::new();
        let events = framer.push(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Bytes::from_static(b"data: a\r\n\r\n"));
    }

    #[test]
    fn test_framer_handles_bare_cr() {
        let mut framer = SseFramer::new();
        let mut emitted = 0;
        for i in 0..1000 {
            emitted += framer.push(format!("data: {i}\r\r").as_bytes()).len();
        }
        assert_eq!(emitted, 1000);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_framer_crlf_split_across_chunks() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: a\r").is_empty());
        assert!(framer.push(b"\n").is_empty());
        assert_eq!(framer.push(b"\r"), vec![Bytes::from_static(b"data: a\r\n\r")]);
        // The LF finishing that CRLF is not a second blank line.
        assert!(framer.push(b"\ndata: b").is_empty());
        assert_eq!(framer.push(b"\n\n"), vec![Bytes::from_static(b"\ndata: b\n\n")]);
    }

    #[test]
    fn test_framer_long_partial_event_is_scanned_once() {
        let mut framer = SseFramer::new();
        let chunk = vec![b'x'; 1024];
        for _ in 0..10_000 {
            assert!(framer.push(&chunk).is_empty());
        }
        assert_eq!(framer.pending(), 10_000 * 1024);
        assert_eq!(framer.push(b"\n\n").len(), 1);
        assert_eq!(framer.pending(), 0);
    }

    #[tokio::test]
    async fn test_oversized_event_ends_stream() {
        let chunks = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"data: ok\n\n"))])
            .chain(stream::repeat_with(|| {
                Ok::<_, Infallible>(Bytes::from(vec![b'a'; 1024]))
            }));
        let items: Vec<_> = sse_events(chunks, 4 * 1024).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"data: ok\n\n"));
        let err = items[1].as_ref().unwrap_err();
        assert!(err.is::<EventTooLarge>());
    }

    #[tokio::test]
    async fn test_sse_events_reassembles_split_chunks() {
        let chunks: Vec<Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from_static(b"data: 1")),
            Ok(Bytes::from_static(b"\n\ndata: 2\n")),
            Ok(Bytes::from_static(b"\n")),
        ];
        let events: Vec<Bytes> = sse_events(stream::iter(chunks), 1024)
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                Bytes::from_static(b"data: 1\n\n"),
                Bytes::from_static(b"data: 2\n\n")
            ]
        );
    }

    #[tokio::test]
    async fn test_block_policy_relays_everything_in_order() {
        let events: Vec<Result<Bytes, BoxError>> =
            (0..20).map(|i| Ok(Bytes::from(format!("data: {i}\n\n")))).collect();
        let relay = EventRelay::new(stream::iter(events), &config(OverflowPolicy::Block, 2));
        let received: Vec<_> = relay.map(|e| e.unwrap()).collect().await;
        assert_eq!(received.len(), 20);
        assert_eq!(received[19], Bytes::from("data: 19\n\n"));
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_events() {
        let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(16);
        for i in 1..=10 {
            tx.send(Ok(Bytes::from(format!("data: {i}\n\n")))).await.unwrap();
        }
        drop(tx);

        let relay = EventRelay::new(
            ReceiverStream::new(rx),
            &config(OverflowPolicy::DropOldest, 3),
        );
        // Let the reader drain the upstream before the client pulls anything.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(relay.dropped(), 7);
        let received: Vec<_> = relay.map(|e| e.unwrap()).collect().await;
        assert_eq!(
            received,
            vec![
                Bytes::from("data: 8\n\n"),
                Bytes::from("data: 9\n\n"),
                Bytes::from("data: 10\n\n")
            ]
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_upstream() {
        for policy in [OverflowPolicy::Block, OverflowPolicy::DropOldest] {
            let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(4);
            let (other_tx, other_rx) = mpsc::channel::<Result<Bytes, BoxError>>(4);

            let mut relay = EventRelay::new(ReceiverStream::new(rx), &config(policy, 4));
            let mut other = EventRelay::new(ReceiverStream::new(other_rx), &config(policy, 4));

            tx.send(Ok(Bytes::from_static(b"data: 1\n\n"))).await.unwrap();
            assert!(relay.next().await.is_some());

            drop(relay);
            tokio::time::timeout(Duration::from_secs(1), tx.closed())
                .await
                .expect("upstream should observe the disconnect");

            // The other client is unaffected.
            other_tx
                .send(Ok(Bytes::from_static(b"data: 2\n\n")))
                .await
                .unwrap();
            let event = other.next().await.unwrap().unwrap();
            assert_eq!(event, Bytes::from_static(b"data: 2\n\n"));
            assert!(!other_tx.is_closed());
        }
    }

    #[test]
    fn test_is_event_stream() {
        let mut headers = http::HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert(
            http::header::CONTENT_TYPE,
            "text/event-stream;charset=UTF-8".parse().unwrap(),
        );
        assert!(is_event_stream(&headers));
    }
}

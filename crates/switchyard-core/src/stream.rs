//! Backpressured duplex streams.
//!
//! A [`Stream`] is a bounded FIFO channel of values with explicit lifecycle:
//!
//! ```text
//!            end()             drained
//!   Open ───────────▶ Closing ─────────▶ Closed
//!     │                  │
//!     └── error() / cancel() / signal ──▶ Errored
//! ```
//!
//! Writers suspend while `high_water_mark` values are buffered. Readers can
//! pause the stream; a paused stream still accepts one write per writer but
//! suspends that writer until resumed. Every stream owns a cancellation token
//! derived from the context it was opened under, so cancelling the context
//! unblocks pending reads and writes with [`RpcError::Cancelled`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::Stream as FuturesStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, RpcResult};

/// Identifier of a stream, unique per router.
pub type StreamId = u64;

/// A shared stream of JSON values, as produced by the router.
pub type StreamHandle = Arc<Stream<Value>>;

/// Default number of values buffered before writers suspend.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Stream construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Buffered values at which writers suspend. Zero is treated as one.
    pub high_water_mark: usize,
    /// Scheduling hint for multiplexers; higher drains first.
    pub priority: u8,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            priority: 0,
        }
    }
}

impl StreamOptions {
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// One read result.
///
/// `done` is reported exactly once per stream from the reader's point of
/// view, then idempotently; no value follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk<T> {
    pub done: bool,
    pub value: Option<T>,
}

impl<T> StreamChunk<T> {
    pub fn value(value: T) -> Self {
        Self {
            done: false,
            value: Some(value),
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            value: None,
        }
    }
}

#[derive(Debug, Clone)]
enum State {
    Open,
    Closing,
    Closed,
    Errored(RpcError),
}

struct Shared<T> {
    state: State,
    buffer: VecDeque<T>,
    paused: bool,
}

/// A backpressured, cancellable stream.
pub struct Stream<T = Value> {
    id: StreamId,
    priority: u8,
    high_water_mark: usize,
    shared: Mutex<Shared<T>>,
    changed: Notify,
    signal: CancellationToken,
}

impl<T> Stream<T> {
    /// Creates an open stream bound to `parent`: cancelling `parent` cancels
    /// the stream, cancelling the stream never cancels `parent`.
    pub fn new(id: StreamId, options: StreamOptions, parent: &CancellationToken) -> Self {
        Self::with_signal(id, options, parent.child_token())
    }

    /// Creates an open stream with its own cancellation signal.
    pub fn detached(id: StreamId, options: StreamOptions) -> Self {
        Self::with_signal(id, options, CancellationToken::new())
    }

    fn with_signal(id: StreamId, options: StreamOptions, signal: CancellationToken) -> Self {
        Self {
            id,
            priority: options.priority,
            high_water_mark: options.high_water_mark.max(1),
            shared: Mutex::new(Shared {
                state: State::Open,
                buffer: VecDeque::new(),
                paused: false,
            }),
            changed: Notify::new(),
            signal,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// The stream's own cancellation token. Producers select on it.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    // ─── Writer side ──────────────────────────────────────────────────────────

    /// Buffers a value.
    ///
    /// Suspends while the buffer is full, and after buffering while the
    /// stream is paused. Fails with [`RpcError::StreamTerminated`] once the
    /// stream is no longer open, or [`RpcError::Cancelled`] if it was
    /// cancelled.
    pub async fn write(&self, value: T) -> RpcResult<()> {
        let mut pending = Some(value);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut shared = self.lock();
                if let Err(err) = Self::writable_state(&shared.state) {
                    return Err(err);
                }
                match pending.take() {
                    Some(value) if shared.buffer.len() < self.high_water_mark => {
                        shared.buffer.push_back(value);
                        self.changed.notify_waiters();
                        if !shared.paused {
                            return Ok(());
                        }
                    }
                    Some(value) => pending = Some(value),
                    // Buffered while paused, waiting for resume.
                    None if !shared.paused => return Ok(()),
                    None => {}
                }
            }

            self.wait(notified).await;
        }
    }

    /// Stops writing. Buffered values remain readable.
    ///
    /// Ending an ending or ended stream is a no-op.
    pub fn end(&self) -> RpcResult<()> {
        let mut shared = self.lock();
        match &shared.state {
            State::Open => {
                shared.state = State::Closing;
                self.changed.notify_waiters();
                Ok(())
            }
            State::Closing | State::Closed => Ok(()),
            State::Errored(_) => Err(RpcError::StreamTerminated),
        }
    }

    /// Fails the stream. Buffered values are discarded, reads surface `err`
    /// and pending writes fail.
    pub fn error(&self, err: RpcError) {
        let mut shared = self.lock();
        if matches!(shared.state, State::Errored(_) | State::Closed) {
            return;
        }
        shared.state = State::Errored(err);
        shared.buffer.clear();
        self.changed.notify_waiters();
    }

    // ─── Reader side ──────────────────────────────────────────────────────────

    /// Reads the next value.
    ///
    /// Suspends until a value is available, the stream ends, or it fails.
    pub async fn read(&self) -> RpcResult<StreamChunk<T>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut shared = self.lock();
                if let State::Errored(err) = &shared.state {
                    return Err(err.clone());
                }
                if !shared.paused {
                    if let Some(value) = shared.buffer.pop_front() {
                        self.changed.notify_waiters();
                        return Ok(StreamChunk::value(value));
                    }
                }
                if shared.buffer.is_empty() && matches!(shared.state, State::Closing | State::Closed) {
                    shared.state = State::Closed;
                    return Ok(StreamChunk::done());
                }
            }

            self.wait(notified).await;
        }
    }

    /// Stops delivering values to readers. Buffered values are kept.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut shared = self.lock();
        if shared.paused {
            shared.paused = false;
            self.changed.notify_waiters();
        }
    }

    /// Forcibly terminates the stream, unblocking pending reads and writes
    /// with [`RpcError::Cancelled`].
    pub fn cancel(&self, reason: impl Into<String>) {
        self.terminate(RpcError::cancelled(reason));
        self.signal.cancel();
    }

    // ─── State ────────────────────────────────────────────────────────────────

    /// `true` while values may still be read.
    pub fn readable(&self) -> bool {
        matches!(self.lock().state, State::Open | State::Closing)
    }

    /// `true` while values may be written.
    pub fn writable(&self) -> bool {
        matches!(self.lock().state, State::Open)
    }

    /// `true` once the reader observed the end.
    pub fn closed(&self) -> bool {
        matches!(self.lock().state, State::Closed)
    }

    pub fn errored(&self) -> bool {
        matches!(self.lock().state, State::Errored(_))
    }

    /// The terminal error, if the stream failed.
    pub fn error_value(&self) -> Option<RpcError> {
        match &self.lock().state {
            State::Errored(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Number of values currently buffered.
    pub fn buffered_amount(&self) -> usize {
        self.lock().buffer.len()
    }

    // ─── Internals ────────────────────────────────────────────────────────────

    /// Locks the shared state, first folding in a fired cancellation signal.
    fn lock(&self) -> parking_lot::MutexGuard<'_, Shared<T>> {
        let mut shared = self.shared.lock();
        if self.signal.is_cancelled() && !matches!(shared.state, State::Errored(_) | State::Closed) {
            shared.state = State::Errored(RpcError::cancelled("stream cancelled"));
            shared.buffer.clear();
            self.changed.notify_waiters();
        }
        shared
    }

    fn terminate(&self, err: RpcError) {
        let mut shared = self.shared.lock();
        if matches!(shared.state, State::Errored(_) | State::Closed) {
            return;
        }
        shared.state = State::Errored(err);
        shared.buffer.clear();
        self.changed.notify_waiters();
    }

    fn writable_state(state: &State) -> RpcResult<()> {
        match state {
            State::Open => Ok(()),
            State::Errored(err) if err.is_cancelled() => Err(err.clone()),
            _ => Err(RpcError::StreamTerminated),
        }
    }

    async fn wait(&self, notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>) {
        tokio::select! {
            _ = notified => {}
            _ = self.signal.cancelled() => {
                self.terminate(RpcError::cancelled("stream cancelled"));
            }
        }
    }
}

impl<T: Send + 'static> Stream<T> {
    /// Adapts a shared stream into a [`futures::Stream`] of values.
    ///
    /// The adapter ends after `done` and yields the terminal error, if any,
    /// as its last item.
    pub fn into_stream(self: Arc<Self>) -> impl FuturesStream<Item = RpcResult<T>> + Send + 'static {
        futures::stream::unfold(Some(self), |stream| async move {
            let stream = stream?;
            match stream.read().await {
                Ok(StreamChunk {
                    value: Some(value), ..
                }) => Some((Ok(value), Some(stream))),
                Ok(_) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &shared.state)
            .field("buffered", &shared.buffer.len())
            .field("paused", &shared.paused)
            .finish()
    }
}

// =============================================================================
// StreamSet
// =============================================================================

/// The live streams of one multiplexed connection (or one router).
#[derive(Debug)]
pub struct StreamSet<T = Value> {
    streams: Mutex<BTreeMap<StreamId, Arc<Stream<T>>>>,
}

impl<T> Default for StreamSet<T> {
    fn default() -> Self {
        Self {
            streams: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> StreamSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream, replacing any stream with the same id.
    pub fn insert(&self, stream: Arc<Stream<T>>) -> Option<Arc<Stream<T>>> {
        self.streams.lock().insert(stream.id(), stream)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream<T>>> {
        self.streams.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: StreamId) -> Option<Arc<Stream<T>>> {
        self.streams.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Streams in draining order: highest priority first, then by id.
    pub fn by_priority(&self) -> Vec<Arc<Stream<T>>> {
        let mut streams: Vec<_> = self.streams.lock().values().cloned().collect();
        streams.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id().cmp(&b.id())));
        streams
    }

    /// Drops streams that are closed or errored. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|_, stream| stream.readable());
        before - streams.len()
    }

    /// Cancels and drops every stream.
    pub fn cancel_all(&self, reason: &str) {
        let drained = std::mem::take(&mut *self.streams.lock());
        for stream in drained.values() {
            stream.cancel(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn stream(hwm: usize) -> Arc<Stream<u32>> {
        Arc::new(Stream::detached(1, StreamOptions::default().with_high_water_mark(hwm)))
    }

    #[tokio::test]
    async fn test_fifo_and_idempotent_done() {
        let s = stream(8);
        for i in 0..3 {
            s.write(i).await.unwrap();
        }
        s.end().unwrap();
        assert!(!s.writable());
        assert!(s.readable());

        for i in 0..3 {
            assert_eq!(s.read().await.unwrap(), StreamChunk::value(i));
        }
        assert_eq!(s.read().await.unwrap(), StreamChunk::done());
        assert_eq!(s.read().await.unwrap(), StreamChunk::done());
        assert!(s.closed());
        assert!(s.end().is_ok());
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let s = stream(8);
        s.end().unwrap();
        assert!(matches!(s.write(1).await, Err(RpcError::StreamTerminated)));
    }

    #[tokio::test]
    async fn test_backpressure_suspends_writer() {
        let s = stream(2);
        s.write(1).await.unwrap();
        s.write(2).await.unwrap();
        assert_eq!(s.buffered_amount(), 2);

        let mut write = task::spawn(s.write(3));
        assert_pending!(write.poll());

        assert_eq!(s.read().await.unwrap().value, Some(1));
        assert!(write.is_woken());
        assert_ready!(write.poll()).unwrap();
        assert_eq!(s.buffered_amount(), 2);
    }

    #[tokio::test]
    async fn test_pause_buffers_and_holds_writer() {
        let s = stream(8);
        s.pause();

        let mut write = task::spawn(s.write(7));
        assert_pending!(write.poll());
        assert_eq!(s.buffered_amount(), 1);

        let mut read = task::spawn(s.read());
        assert_pending!(read.poll());

        s.resume();
        assert_ready!(write.poll()).unwrap();
        assert_eq!(assert_ready!(read.poll()).unwrap().value, Some(7));
    }

    #[tokio::test]
    async fn test_error_surfaces_to_reader() {
        let s = stream(8);
        s.write(1).await.unwrap();
        s.error(RpcError::internal("producer failed"));

        assert!(s.errored());
        assert_eq!(s.buffered_amount(), 0);
        assert!(matches!(s.read().await, Err(RpcError::Internal(_))));
        assert!(matches!(s.write(2).await, Err(RpcError::StreamTerminated)));
        assert!(s.end().is_err());
    }

    #[tokio::test]
    async fn test_parent_cancellation_unblocks_read() {
        let parent = CancellationToken::new();
        let s: Arc<Stream<u32>> = Arc::new(Stream::new(9, StreamOptions::default(), &parent));

        let reader = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.read().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(RpcError::Cancelled(_))));
        assert!(s.errored());
    }

    #[tokio::test]
    async fn test_cancel_does_not_touch_parent() {
        let parent = CancellationToken::new();
        let s: Stream<u32> = Stream::new(1, StreamOptions::default(), &parent);
        s.cancel("consumer gone");

        assert!(s.signal().is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(matches!(s.write(1).await, Err(RpcError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_into_stream_collects_values() {
        let s = stream(8);
        s.write(1).await.unwrap();
        s.write(2).await.unwrap();
        s.end().unwrap();

        let values: Vec<u32> = s.into_stream().map(|item| item.unwrap()).collect().await;
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_stream_set_priority_order() {
        let set: StreamSet<u32> = StreamSet::new();
        set.insert(Arc::new(Stream::detached(1, StreamOptions::default().with_priority(1))));
        set.insert(Arc::new(Stream::detached(2, StreamOptions::default().with_priority(5))));
        set.insert(Arc::new(Stream::detached(3, StreamOptions::default().with_priority(5))));

        let order: Vec<_> = set.by_priority().iter().map(|s| s.id()).collect();
        assert_eq!(order, vec![2, 3, 1]);

        set.get(1).unwrap().cancel("gone");
        assert_eq!(set.prune(), 1);
        assert_eq!(set.len(), 2);

        set.cancel_all("shutdown");
        assert!(set.is_empty());
    }
}

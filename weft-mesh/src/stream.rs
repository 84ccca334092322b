//! Buffered multi-consumer streams with late-join semantics.
//!
//! A [`BufferingStreamSource`] retains the last `max_buffer_size` items; a
//! [`BufferedStream`] snapshots that buffer when it subscribes and then
//! receives every later item, so consumers that attach after production
//! started lose nothing the source still retains. Events and query results
//! are handed to the application through these.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Why [`BufferedStream::next`] did not produce an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NextError {
    /// The timeout elapsed before an item arrived.
    #[error("timeout")]
    Timeout,
    /// The source ended and everything buffered was consumed.
    #[error("end")]
    End,
}

enum Sink<T> {
    Stream(mpsc::UnboundedSender<T>),
    Callback(Arc<dyn Fn(&T) + Send + Sync>),
}

struct SourceInner<T> {
    buffer: VecDeque<T>,
    max_buffer_size: usize,
    next_id: u64,
    sinks: HashMap<u64, Sink<T>>,
    end_callbacks: HashMap<u64, Arc<dyn Fn() + Send + Sync>>,
    ended: bool,
    on_idle: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// A stream source retaining a bounded FIFO buffer of recent items.
pub struct BufferingStreamSource<T> {
    inner: Arc<Mutex<SourceInner<T>>>,
}

impl<T> Clone for BufferingStreamSource<T> {
    fn clone(&self) -> Self {
        BufferingStreamSource {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BufferingStreamSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "BufferingStreamSource(buffered={}, subscribers={}, ended={})",
            inner.buffer.len(),
            inner.sinks.len(),
            inner.ended
        )
    }
}

impl<T: Clone + Send + 'static> BufferingStreamSource<T> {
    /// Create a source retaining up to `max_buffer_size` items.
    pub fn new(max_buffer_size: usize) -> Self {
        BufferingStreamSource {
            inner: Arc::new(Mutex::new(SourceInner {
                buffer: VecDeque::new(),
                max_buffer_size,
                next_id: 0,
                sinks: HashMap::new(),
                end_callbacks: HashMap::new(),
                ended: false,
                on_idle: None,
            })),
        }
    }

    /// Feed one item to the buffer and every subscriber. Items ingested
    /// after [`end`](Self::end) are dropped.
    pub fn ingest(&self, item: T) {
        let sinks: Vec<Sink<T>> = {
            let mut inner = self.inner.lock();
            if inner.ended {
                return;
            }
            inner.buffer.push_back(item.clone());
            while inner.buffer.len() > inner.max_buffer_size {
                inner.buffer.pop_front();
            }
            inner
                .sinks
                .values()
                .map(|sink| match sink {
                    Sink::Stream(tx) => Sink::Stream(tx.clone()),
                    Sink::Callback(cb) => Sink::Callback(cb.clone()),
                })
                .collect()
        };
        for sink in sinks {
            match sink {
                Sink::Stream(tx) => {
                    // a closed consumer is cleaned up on its unsubscribe
                    tx.send(item.clone()).ok();
                }
                Sink::Callback(cb) => cb(&item),
            }
        }
    }

    /// End the stream: subscribers see the end once their buffered items
    /// are drained, and further ingests are dropped.
    pub fn end(&self) {
        let callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let mut inner = self.inner.lock();
            inner.ended = true;
            inner
                .sinks
                .retain(|_, sink| !matches!(sink, Sink::Stream(_)));
            inner.end_callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Snapshot of the retained buffer.
    pub fn current(&self) -> Vec<T> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    /// Attach a consumer. It starts with a snapshot of the buffer and then
    /// receives every later item until it closes or the stream ends.
    pub fn subscribe(&self) -> BufferedStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let pending: VecDeque<T> = inner.buffer.iter().cloned().collect();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.ended {
            inner.sinks.insert(id, Sink::Stream(tx));
        }
        BufferedStream {
            pending,
            rx,
            source: self.clone(),
            id,
            disconnected: inner.ended,
            closed: false,
        }
    }

    /// Attach a callback invoked on every item ingested from now on.
    pub fn subscribe_new_item(&self, callback: Arc<dyn Fn(&T) + Send + Sync>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sinks.insert(id, Sink::Callback(callback));
        id
    }

    /// Attach a callback invoked when the stream ends.
    pub fn subscribe_end(&self, callback: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.end_callbacks.insert(id, callback);
        id
    }

}

impl<T> BufferingStreamSource<T> {
    /// Whether the stream ended.
    pub fn ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Number of attached subscribers (consumers and callbacks).
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    /// Detach a subscriber by token.
    pub fn unsubscribe(&self, id: u64) {
        let on_idle = {
            let mut inner = self.inner.lock();
            inner.sinks.remove(&id);
            inner.end_callbacks.remove(&id);
            if inner.sinks.is_empty() {
                inner.on_idle.clone()
            } else {
                None
            }
        };
        if let Some(on_idle) = on_idle {
            on_idle();
        }
    }

    /// Install a hook invoked whenever the last subscriber detaches.
    pub fn set_on_idle(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        self.inner.lock().on_idle = Some(hook);
    }
}

/// A consumer over a [`BufferingStreamSource`].
pub struct BufferedStream<T> {
    pending: VecDeque<T>,
    rx: mpsc::UnboundedReceiver<T>,
    source: BufferingStreamSource<T>,
    id: u64,
    disconnected: bool,
    closed: bool,
}

impl<T> std::fmt::Debug for BufferedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferedStream(pending={})", self.pending.len())
    }
}

impl<T: Clone + Send + 'static> BufferedStream<T> {
    /// Wait for the next item. Fails with [`NextError::End`] once the
    /// source ended and everything buffered was consumed.
    pub async fn next(&mut self) -> Result<T, NextError> {
        if let Some(item) = self.pending.pop_front() {
            return Ok(item);
        }
        if self.disconnected || self.closed {
            return Err(NextError::End);
        }
        match self.rx.recv().await {
            Some(item) => Ok(item),
            None => {
                self.disconnected = true;
                Err(NextError::End)
            }
        }
    }

    /// Wait for the next item, at most `timeout`.
    pub async fn next_timeout(&mut self, timeout: std::time::Duration) -> Result<T, NextError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(NextError::Timeout),
        }
    }

    /// Take the next item if one is already available.
    pub fn next_if_available(&mut self) -> Option<T> {
        self.fill_pending();
        self.pending.pop_front()
    }

    /// How many items could be taken without waiting.
    pub fn count_available(&mut self) -> usize {
        self.fill_pending();
        self.pending.len()
    }

    /// Whether the stream is exhausted: source ended or consumer closed,
    /// and nothing is left to take.
    pub fn at_end(&mut self) -> bool {
        self.fill_pending();
        self.pending.is_empty() && (self.disconnected || self.closed)
    }

    /// Detach from the source. Items already buffered remain takeable.
    pub fn close(&mut self) {
        if !self.closed {
            self.fill_pending();
            self.closed = true;
            self.source.unsubscribe(self.id);
        }
    }

    fn fill_pending(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(item) => self.pending.push_back(item),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
    }
}

impl<T> Drop for BufferedStream<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.source.unsubscribe(self.id);
        }
    }
}

/// A source forwarding only the items of another source that match a
/// predicate. It holds an upstream subscription only while it has
/// subscribers of its own.
pub struct FilteredStreamSource<T> {
    upstream: BufferingStreamSource<T>,
    inner: BufferingStreamSource<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    upstream_tokens: Arc<Mutex<Option<(u64, u64)>>>,
}

impl<T: Clone + Send + 'static> FilteredStreamSource<T> {
    /// Wrap `upstream`, forwarding items for which `predicate` holds.
    pub fn new(
        upstream: &BufferingStreamSource<T>,
        max_buffer_size: usize,
        predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    ) -> Arc<Self> {
        let filtered = Arc::new(FilteredStreamSource {
            upstream: upstream.clone(),
            inner: BufferingStreamSource::new(max_buffer_size),
            predicate,
            upstream_tokens: Arc::new(Mutex::new(None)),
        });
        let upstream = filtered.upstream.clone();
        let tokens = filtered.upstream_tokens.clone();
        filtered.inner.set_on_idle(Arc::new(move || {
            if let Some((item_token, end_token)) = tokens.lock().take() {
                upstream.unsubscribe(item_token);
                upstream.unsubscribe(end_token);
            }
        }));
        filtered
    }

    /// Attach a consumer; lazily subscribes upstream.
    pub fn subscribe(&self) -> BufferedStream<T> {
        {
            let mut tokens = self.upstream_tokens.lock();
            if tokens.is_none() {
                let inner = self.inner.clone();
                let predicate = self.predicate.clone();
                let item_token = self.upstream.subscribe_new_item(Arc::new(move |item: &T| {
                    if predicate(item) {
                        inner.ingest(item.clone());
                    }
                }));
                let inner = self.inner.clone();
                let end_token = self
                    .upstream
                    .subscribe_end(Arc::new(move || inner.end()));
                *tokens = Some((item_token, end_token));
            }
        }
        self.inner.subscribe()
    }

    /// Whether this source currently holds an upstream subscription.
    pub fn upstream_subscribed(&self) -> bool {
        self.upstream_tokens.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn late_joiner_sees_retained_buffer_then_new_items() {
        let source = BufferingStreamSource::new(4);
        source.ingest(1u32);
        source.ingest(2);

        let mut stream = source.subscribe();
        source.ingest(3);

        assert_eq!(stream.next().await, Ok(1));
        assert_eq!(stream.next().await, Ok(2));
        assert_eq!(stream.next().await, Ok(3));
    }

    #[tokio::test]
    async fn buffer_drops_oldest_beyond_capacity() {
        let source = BufferingStreamSource::new(2);
        source.ingest(1u32);
        source.ingest(2);
        source.ingest(3);

        let mut stream = source.subscribe();
        assert_eq!(stream.count_available(), 2);
        assert_eq!(stream.next().await, Ok(2));
        assert_eq!(stream.next().await, Ok(3));
        assert_eq!(
            stream.next_timeout(Duration::from_millis(50)).await,
            Err(NextError::Timeout)
        );
    }

    #[tokio::test]
    async fn end_is_observed_after_draining() {
        let source = BufferingStreamSource::new(4);
        source.ingest("a");
        let mut stream = source.subscribe();
        source.ingest("b");
        source.end();
        // ingests after the end are dropped
        source.ingest("c");

        assert_eq!(stream.next().await, Ok("a"));
        assert_eq!(stream.next().await, Ok("b"));
        assert_eq!(stream.next().await, Err(NextError::End));
        assert!(stream.at_end());
    }

    #[tokio::test]
    async fn multiple_consumers_each_get_every_item() {
        let source = BufferingStreamSource::new(8);
        source.ingest(1u32);
        let mut early = source.subscribe();
        source.ingest(2);
        let mut late = source.subscribe();
        source.ingest(3);

        assert_eq!(early.next().await, Ok(1));
        assert_eq!(early.next().await, Ok(2));
        assert_eq!(early.next().await, Ok(3));
        assert_eq!(late.next().await, Ok(1));
        assert_eq!(late.next().await, Ok(2));
        assert_eq!(late.next().await, Ok(3));
    }

    #[tokio::test]
    async fn next_if_available_is_nonblocking() {
        let source = BufferingStreamSource::new(4);
        let mut stream = source.subscribe();
        assert_eq!(stream.next_if_available(), None);
        source.ingest(7u32);
        assert_eq!(stream.next_if_available(), Some(7));
        assert_eq!(stream.next_if_available(), None);
    }

    #[tokio::test]
    async fn filtered_source_forwards_matches_and_releases_upstream() {
        let source = BufferingStreamSource::new(8);
        let filtered =
            FilteredStreamSource::new(&source, 8, Arc::new(|item: &u32| item % 2 == 0));
        assert!(!filtered.upstream_subscribed());

        let mut stream = filtered.subscribe();
        assert!(filtered.upstream_subscribed());
        assert_eq!(source.subscriber_count(), 1);

        for i in 1..=6 {
            source.ingest(i);
        }
        assert_eq!(stream.next().await, Ok(2));
        assert_eq!(stream.next().await, Ok(4));
        assert_eq!(stream.next().await, Ok(6));

        stream.close();
        assert!(!filtered.upstream_subscribed());
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closing_detaches_but_keeps_buffered_items() {
        let source = BufferingStreamSource::new(4);
        let mut stream = source.subscribe();
        source.ingest(1u32);
        stream.close();
        source.ingest(2);

        assert_eq!(stream.next().await, Ok(1));
        assert_eq!(stream.next().await, Err(NextError::End));
        assert_eq!(source.subscriber_count(), 0);
    }
}

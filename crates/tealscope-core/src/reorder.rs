//! Sequenced log reorder buffer.
//!
//! Console entries cross two asynchronous hops (page → content script →
//! background) and can arrive out of order. Each producer stamps a
//! per-stream `sequence`; this buffer holds entries that arrive ahead of the
//! next expected sequence and releases them in order.
//!
//! # Per-stream rules
//!
//! For an entry with sequence `s` on stream `(session_id, url)`:
//!
//! - `s < next_seq`: stale replay, delivered immediately out of band
//! - `s` already buffered: the first arrival wins, the duplicate is
//!   delivered immediately out of band
//! - otherwise buffered, then `buffer[next_seq]` is flushed repeatedly
//! - entries without a sequence bypass the buffer entirely
//!
//! While a gap persists a single gap timer is armed. On expiry `next_seq`
//! jumps to the smallest buffered sequence and flushing resumes. The timer
//! restarts whenever the stream makes progress and is cancelled once the
//! buffer empties.
//!
//! A stream is discarded as soon as its buffer is empty and no gap timer is
//! pending. The next entry on that key starts a fresh stream at sequence 0,
//! which is what a reloaded page (producer reset) sends.
//!
//! A sequence of `u64::MAX` is terminal: it is released but `next_seq`
//! does not advance past it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::entry::LogEntry;

/// Identifies one ordered stream of entries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey {
    pub session_id: String,
    pub url: String,
}

impl StreamKey {
    pub fn new(session_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            url: url.into(),
        }
    }
}

/// Destination for ordered entries
///
/// `deliver` is called with the reorder lock held and must not block.
pub trait LogSink: Send + Sync + 'static {
    fn deliver(&self, key: &StreamKey, entry: LogEntry);
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn deliver(&self, key: &StreamKey, entry: LogEntry) {
        (**self).deliver(key, entry);
    }
}

/// What happened to a submitted entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No sequence; delivered immediately
    Unsequenced,
    /// Sequence already passed; delivered out of band
    Stale,
    /// Sequence already buffered; delivered out of band
    Duplicate,
    /// Held behind a gap
    Buffered { pending: usize },
    /// Released `count` entries, this one included
    Flushed { count: usize },
}

/// Buffer occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReorderStats {
    pub streams: usize,
    pub buffered: usize,
    pub armed_timers: usize,
}

/// Scheduled gap expiry for one stream
#[derive(Debug)]
pub struct GapTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl GapTimer {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Ordering state of one stream
#[derive(Debug, Default)]
pub struct StreamState {
    next_seq: u64,
    buffer: BTreeMap<u64, LogEntry>,
    gap_timer: Option<GapTimer>,
}

impl StreamState {
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.gap_timer.take() {
            timer.cancel();
        }
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.gap_timer.is_none()
    }
}

struct ReorderInner<S> {
    sink: S,
    gap_timeout: Duration,
    streams: Mutex<HashMap<StreamKey, StreamState>>,
    next_epoch: AtomicU64,
}

/// Per-stream reorder buffer in front of a [`LogSink`]
///
/// Arming gap timers spawns tokio tasks; submit from inside a runtime.
pub struct ReorderBuffer<S: LogSink> {
    inner: Arc<ReorderInner<S>>,
}

impl<S: LogSink> Clone for ReorderBuffer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: LogSink> ReorderBuffer<S> {
    pub fn new(sink: S, gap_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ReorderInner {
                sink,
                gap_timeout,
                streams: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.inner.sink
    }

    #[must_use]
    pub fn gap_timeout(&self) -> Duration {
        self.inner.gap_timeout
    }

    /// Route one entry through its stream.
    pub fn submit(&self, key: StreamKey, entry: LogEntry) -> SubmitOutcome {
        let Some(seq) = entry.sequence() else {
            self.inner.sink.deliver(&key, entry);
            return SubmitOutcome::Unsequenced;
        };

        let mut streams = self.inner.lock();
        let state = streams.entry(key.clone()).or_default();

        if seq < state.next_seq {
            debug!(
                session_id = %key.session_id,
                stream_url = %key.url,
                sequence = seq,
                next_seq = state.next_seq,
                "Stale log entry delivered out of order"
            );
            self.inner.sink.deliver(&key, entry);
            return SubmitOutcome::Stale;
        }
        if state.buffer.contains_key(&seq) {
            debug!(
                session_id = %key.session_id,
                stream_url = %key.url,
                sequence = seq,
                "Duplicate log sequence delivered out of order"
            );
            self.inner.sink.deliver(&key, entry);
            return SubmitOutcome::Duplicate;
        }

        state.buffer.insert(seq, entry);
        let count = self.inner.flush_ready(&key, state);
        self.inner.rearm(&key, state, count > 0);
        let pending = state.buffer.len();
        if state.is_idle() {
            streams.remove(&key);
        }

        if count > 0 {
            SubmitOutcome::Flushed { count }
        } else {
            SubmitOutcome::Buffered { pending }
        }
    }

    /// Drain every stream in sequence order, ignoring gaps.
    ///
    /// Returns the number of entries released.
    pub fn flush_all(&self) -> usize {
        let mut streams = self.inner.lock();
        streams
            .drain()
            .map(|(key, mut state)| self.inner.drain_stream(&key, &mut state))
            .sum()
    }

    /// Drain the streams of one session, ignoring gaps.
    pub fn flush_session(&self, session_id: &str) -> usize {
        let mut streams = self.inner.lock();
        let mut released = 0;
        streams.retain(|key, state| {
            if key.session_id == session_id {
                released += self.inner.drain_stream(key, state);
                false
            } else {
                true
            }
        });
        released
    }

    /// Drop all streams of a session. Buffered entries are discarded;
    /// call [`flush_session`](Self::flush_session) first to keep them.
    pub fn forget_session(&self, session_id: &str) -> usize {
        let mut streams = self.inner.lock();
        let mut discarded = 0;
        streams.retain(|key, state| {
            if key.session_id == session_id {
                discarded += state.buffer.len();
                state.cancel_timer();
                false
            } else {
                true
            }
        });
        discarded
    }

    #[must_use]
    pub fn stats(&self) -> ReorderStats {
        let streams = self.inner.lock();
        ReorderStats {
            streams: streams.len(),
            buffered: streams.values().map(|s| s.buffer.len()).sum(),
            armed_timers: streams.values().filter(|s| s.gap_timer.is_some()).count(),
        }
    }

    /// Next expected sequence of a stream that is still holding entries
    #[must_use]
    pub fn next_seq(&self, key: &StreamKey) -> Option<u64> {
        self.inner.lock().get(key).map(StreamState::next_seq)
    }
}

impl<S: LogSink> ReorderInner<S> {
    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, StreamState>> {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn flush_ready(&self, key: &StreamKey, state: &mut StreamState) -> usize {
        let mut count = 0;
        while let Some(entry) = state.buffer.remove(&state.next_seq) {
            self.sink.deliver(key, entry);
            count += 1;
            match state.next_seq.checked_add(1) {
                Some(next) => state.next_seq = next,
                None => break,
            }
        }
        count
    }

    fn drain_stream(&self, key: &StreamKey, state: &mut StreamState) -> usize {
        state.cancel_timer();
        let buffer = std::mem::take(&mut state.buffer);
        let count = buffer.len();
        for (seq, entry) in buffer {
            self.sink.deliver(key, entry);
            state.next_seq = seq.saturating_add(1);
        }
        count
    }

    fn rearm(self: &Arc<Self>, key: &StreamKey, state: &mut StreamState, progressed: bool) {
        if state.buffer.is_empty() {
            state.cancel_timer();
            return;
        }
        if state.gap_timer.is_some() && !progressed {
            return;
        }
        state.cancel_timer();

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_key = key.clone();
        let timeout = self.gap_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_gap_timeout(&timer_key, epoch);
            }
        });
        state.gap_timer = Some(GapTimer { epoch, handle });
    }

    fn on_gap_timeout(self: &Arc<Self>, key: &StreamKey, epoch: u64) {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(key) else {
            return;
        };
        match &state.gap_timer {
            Some(timer) if timer.epoch == epoch => {}
            // cancelled or replaced
            _ => return,
        }
        state.gap_timer = None;

        let lowest = state.buffer.keys().next().copied();
        let Some(lowest) = lowest else {
            streams.remove(key);
            return;
        };
        warn!(
            session_id = %key.session_id,
            stream_url = %key.url,
            expected = state.next_seq,
            resumed_at = lowest,
            skipped = lowest - state.next_seq,
            "Sequence gap timed out; skipping missing entries"
        );
        state.next_seq = lowest;
        self.flush_ready(key, state);
        self.rearm(key, state, true);
        if state.is_idle() {
            streams.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(StreamKey, LogEntry)>>,
    }

    impl RecordingSink {
        fn sequences(&self) -> Vec<u64> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(_, e)| e.sequence().unwrap_or(u64::MAX))
                .collect()
        }
    }

    impl LogSink for RecordingSink {
        fn deliver(&self, key: &StreamKey, entry: LogEntry) {
            self.seen.lock().unwrap().push((key.clone(), entry));
        }
    }

    fn seq(n: u64) -> LogEntry {
        LogEntry::structured("https://shop.example/", "t", vec![json!(n)]).with_sequence(n)
    }

    fn key() -> StreamKey {
        StreamKey::new("s1", "https://shop.example/")
    }

    fn buffer() -> (ReorderBuffer<Arc<RecordingSink>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            ReorderBuffer::new(Arc::clone(&sink), Duration::from_secs(5)),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_arrivals_are_released_in_order() {
        let (buf, sink) = buffer();
        assert_eq!(buf.submit(key(), seq(2)), SubmitOutcome::Buffered { pending: 1 });
        assert_eq!(buf.next_seq(&key()), Some(0));
        assert_eq!(buf.submit(key(), seq(0)), SubmitOutcome::Flushed { count: 1 });
        assert_eq!(buf.submit(key(), seq(1)), SubmitOutcome::Flushed { count: 2 });
        assert_eq!(sink.sequences(), vec![0, 1, 2]);
        assert_eq!(buf.stats(), ReorderStats::default());
        assert_eq!(buf.next_seq(&key()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn producer_reset_is_reordered_from_zero() {
        let (buf, sink) = buffer();
        for n in [0, 1, 2] {
            buf.submit(key(), seq(n));
        }
        // page reload: the producer starts over at 0
        assert_eq!(buf.submit(key(), seq(1)), SubmitOutcome::Buffered { pending: 1 });
        assert_eq!(buf.submit(key(), seq(0)), SubmitOutcome::Flushed { count: 2 });
        assert_eq!(sink.sequences(), vec![0, 1, 2, 0, 1]);
    }

    #[tokio::test]
    async fn drained_streams_are_discarded() {
        let (buf, _sink) = buffer();
        for page in 0..1_000 {
            let key = StreamKey::new("s1", format!("https://shop.example/p/{page}"));
            buf.submit(key.clone(), seq(1));
            buf.submit(key, seq(0));
        }
        assert_eq!(buf.stats(), ReorderStats::default());

        buf.submit(key(), seq(4));
        assert_eq!(buf.stats().streams, 1);
        assert_eq!(buf.flush_all(), 1);
        assert_eq!(buf.stats(), ReorderStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn gap_timer_forces_progress() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(0));
        buf.submit(key(), seq(2));
        buf.submit(key(), seq(3));
        assert_eq!(sink.sequences(), vec![0]);
        assert_eq!(buf.stats().armed_timers, 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(sink.sequences(), vec![0]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.sequences(), vec![0, 2, 3]);
        assert_eq!(buf.stats(), ReorderStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn filled_gap_cancels_timer() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(1));
        assert_eq!(buf.stats().armed_timers, 1);
        buf.submit(key(), seq(0));
        assert_eq!(buf.stats().armed_timers, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sequences(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn successive_gaps_rearm_after_forced_advance() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(1));
        buf.submit(key(), seq(4));

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.sequences(), vec![1]);
        assert_eq!(buf.stats().armed_timers, 1);
        assert_eq!(buf.next_seq(&key()), Some(2));

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.sequences(), vec![1, 4]);
        assert_eq!(buf.stats(), ReorderStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_and_duplicate_entries_are_delivered_out_of_band() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(0));
        buf.submit(key(), seq(2));
        assert_eq!(buf.submit(key(), seq(0)), SubmitOutcome::Stale);
        assert_eq!(buf.submit(key(), seq(2)), SubmitOutcome::Duplicate);
        assert_eq!(sink.sequences(), vec![0, 0, 2]);
        assert_eq!(buf.stats().buffered, 1);
        assert_eq!(buf.next_seq(&key()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn late_entries_after_forced_advance() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(1));
        buf.submit(key(), seq(3));
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.sequences(), vec![1]);

        // stream still waiting on 2, so 0 is behind the watermark
        assert_eq!(buf.submit(key(), seq(0)), SubmitOutcome::Stale);

        buf.submit(key(), seq(2));
        assert_eq!(sink.sequences(), vec![1, 0, 2, 3]);
        assert_eq!(buf.stats(), ReorderStats::default());

        // once drained, a late entry opens a fresh stream
        assert_eq!(buf.submit(key(), seq(0)), SubmitOutcome::Flushed { count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn max_sequence_does_not_overflow() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(u64::MAX));
        buf.submit(key(), seq(u64::MAX - 1));
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(sink.sequences(), vec![u64::MAX - 1, u64::MAX]);
        assert_eq!(buf.stats(), ReorderStats::default());

        buf.submit(key(), seq(u64::MAX));
        assert_eq!(buf.flush_all(), 1);
        assert_eq!(sink.sequences().last(), Some(&u64::MAX));
    }

    #[tokio::test]
    async fn unsequenced_entries_bypass_the_buffer() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(3));
        let outcome = buf.submit(key(), LogEntry::Plain("legacy".into()));
        assert_eq!(outcome, SubmitOutcome::Unsequenced);
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (buf, sink) = buffer();
        let other = StreamKey::new("s1", "https://shop.example/cart");
        buf.submit(key(), seq(1));
        buf.submit(other.clone(), seq(0));
        assert_eq!(sink.sequences(), vec![0]);
        assert_eq!(sink.seen.lock().unwrap()[0].0, other);
        assert_eq!(buf.stats().streams, 1);
        assert_eq!(buf.next_seq(&key()), Some(0));
    }

    #[tokio::test]
    async fn flush_all_drains_gaps_and_discards_streams() {
        let (buf, sink) = buffer();
        buf.submit(key(), seq(3));
        buf.submit(key(), seq(1));
        assert_eq!(buf.flush_all(), 2);
        assert_eq!(sink.sequences(), vec![1, 3]);
        assert_eq!(buf.next_seq(&key()), None);
        assert_eq!(buf.stats(), ReorderStats::default());
    }

    #[tokio::test]
    async fn session_scoped_flush_and_forget() {
        let (buf, sink) = buffer();
        let other = StreamKey::new("s2", "https://shop.example/");
        buf.submit(key(), seq(1));
        buf.submit(other.clone(), seq(1));

        assert_eq!(buf.flush_session("s1"), 1);
        assert_eq!(sink.sequences(), vec![1]);
        assert_eq!(buf.stats().streams, 1);

        assert_eq!(buf.forget_session("s2"), 1);
        assert_eq!(buf.forget_session("s1"), 0);
        assert_eq!(buf.stats(), ReorderStats::default());
    }
}

use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MIN_WAIT_MS: u32 = 500;
const DEFAULT_MAX_WAIT_MS: u32 = 5000;

/// Admission control and read-timeout configuration for inbound requests.
///
/// Cloning is cheap and clones share the same counters, so one `Limits`
/// handed to a [`Server`](crate::Server) budgets admission across every
/// socket it accepts.
///
/// - `buffer_requests = 0` leaves single-buffer requests uncounted.
/// - `stream_requests = 0` disables streaming requests entirely; a peer
///   holding many streams open indefinitely is a cheap way to exhaust
///   memory, so streaming is opt-in.
///
/// When admission is refused the responder replies with a retry message
/// whose wait is drawn uniformly from the configured range.
#[derive(Debug, Clone)]
pub struct Limits {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    read_timeout_ms: AtomicU64,
    buffer_limit: u32,
    stream_limit: u32,
    streams_enabled: bool,
    buffer_count: AtomicU32,
    stream_count: AtomicU32,
    buffer_min_wait_ms: AtomicU32,
    buffer_max_wait_ms: AtomicU32,
    stream_min_wait_ms: AtomicU32,
    stream_max_wait_ms: AtomicU32,
}

impl Limits {
    #[must_use]
    pub fn new(buffer_requests: u32, stream_requests: u32) -> Self {
        Self::build(
            buffer_requests,
            stream_requests,
            stream_requests > 0,
            DEFAULT_READ_TIMEOUT,
        )
    }

    /// No read timeout, no counting, streaming enabled.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::build(0, 0, true, Duration::ZERO)
    }

    fn build(
        buffer_limit: u32,
        stream_limit: u32,
        streams_enabled: bool,
        read_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                read_timeout_ms: AtomicU64::new(read_timeout.as_millis() as u64),
                buffer_limit,
                stream_limit,
                streams_enabled,
                buffer_count: AtomicU32::new(0),
                stream_count: AtomicU32::new(0),
                buffer_min_wait_ms: AtomicU32::new(DEFAULT_MIN_WAIT_MS),
                buffer_max_wait_ms: AtomicU32::new(DEFAULT_MAX_WAIT_MS),
                stream_min_wait_ms: AtomicU32::new(DEFAULT_MIN_WAIT_MS),
                stream_max_wait_ms: AtomicU32::new(DEFAULT_MAX_WAIT_MS),
            }),
        }
    }

    /// Zero disables read-timeout enforcement.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.read_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_read_timeout(&self, d: Duration) {
        self.inner
            .read_timeout_ms
            .store(d.as_millis() as u64, Ordering::Relaxed);
    }

    /// Range the retry wait is drawn from when a buffer request is refused.
    pub fn set_buffer_wait(&self, min: Duration, max: Duration) {
        self.inner
            .buffer_min_wait_ms
            .store(min.as_millis() as u32, Ordering::Relaxed);
        self.inner
            .buffer_max_wait_ms
            .store(max.as_millis() as u32, Ordering::Relaxed);
    }

    /// Range the retry wait is drawn from when a stream request is refused.
    pub fn set_stream_wait(&self, min: Duration, max: Duration) {
        self.inner
            .stream_min_wait_ms
            .store(min.as_millis() as u32, Ordering::Relaxed);
        self.inner
            .stream_max_wait_ms
            .store(max.as_millis() as u32, Ordering::Relaxed);
    }

    /// Currently admitted single-buffer requests.
    #[must_use]
    pub fn buffer_requests_in_flight(&self) -> u32 {
        self.inner.buffer_count.load(Ordering::Relaxed)
    }

    /// Currently admitted streaming requests.
    #[must_use]
    pub fn stream_requests_in_flight(&self) -> u32 {
        self.inner.stream_count.load(Ordering::Relaxed)
    }

    /// Try to admit a single-buffer request. A refused increment is rolled
    /// back before returning.
    pub fn inc_buffer_req(&self) -> bool {
        inc(&self.inner.buffer_count, self.inner.buffer_limit)
    }

    pub fn dec_buffer_req(&self) {
        dec(&self.inner.buffer_count, self.inner.buffer_limit);
    }

    #[must_use]
    pub fn stream_reqs_enabled(&self) -> bool {
        self.inner.streams_enabled
    }

    /// Try to admit a streaming request. Always refuses when streaming is
    /// disabled.
    pub fn inc_stream_req(&self) -> bool {
        self.inner.streams_enabled && inc(&self.inner.stream_count, self.inner.stream_limit)
    }

    pub fn dec_stream_req(&self) {
        dec(&self.inner.stream_count, self.inner.stream_limit);
    }

    pub(crate) fn buffer_retry_wait(&self) -> u32 {
        retry_wait(
            self.inner.buffer_min_wait_ms.load(Ordering::Relaxed),
            self.inner.buffer_max_wait_ms.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn stream_retry_wait(&self) -> u32 {
        retry_wait(
            self.inner.stream_min_wait_ms.load(Ordering::Relaxed),
            self.inner.stream_max_wait_ms.load(Ordering::Relaxed),
        )
    }
}

impl Default for Limits {
    /// 30 second read timeout, uncounted buffer requests, streaming disabled.
    fn default() -> Self {
        Self::new(0, 0)
    }
}

fn inc(count: &AtomicU32, limit: u32) -> bool {
    if limit == 0 {
        return true;
    }
    if count.fetch_add(1, Ordering::AcqRel) + 1 > limit {
        count.fetch_sub(1, Ordering::AcqRel);
        return false;
    }
    true
}

fn dec(count: &AtomicU32, limit: u32) {
    if limit != 0 {
        count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn retry_wait(min: u32, max: u32) -> u32 {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

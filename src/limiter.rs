//! Rate and traffic limiting
//!
//! Two related concerns: request-rate limiting (may this connection
//! proceed?) and traffic limiting (how fast may bytes move?). Both
//! are keyed, typically by client address or client id, and both are
//! token buckets.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Request-rate limiter for one key.
pub trait Limiter: Send + Sync {
    /// Whether `n` more events fit the budget right now.
    fn allow(&self, n: usize) -> bool;
}

/// Keyed factory of request-rate limiters.
pub trait RateLimiter: Send + Sync {
    /// The limiter for `key`, or `None` when the key is unlimited.
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
}

/// Token bucket: `rate` tokens per second with a burst of the same
/// size.
pub struct TokenBucket {
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                refilled: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
        state.refilled = now;
    }

    /// Take `n` tokens, returning how long to wait if the bucket ran
    /// dry.
    fn take(&self, n: f64) -> Option<Duration> {
        let mut state = self.state.lock().expect("bucket poisoned");
        self.refill(&mut state);
        state.tokens -= n;
        if state.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-state.tokens / self.rate))
        }
    }
}

impl Limiter for TokenBucket {
    fn allow(&self, n: usize) -> bool {
        let mut state = self.state.lock().expect("bucket poisoned");
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }
}

/// Rate limiter handing each key its own bucket of `rate` events per
/// second. A zero rate disables limiting.
pub struct KeyedRateLimiter {
    rate: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl KeyedRateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        if self.rate <= 0.0 {
            return None;
        }
        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.rate)))
            .clone();
        Some(bucket)
    }
}

/// Scope of a traffic limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Service,
    Client,
    Conn,
}

/// Annotations describing the flow a traffic budget covers.
#[derive(Debug, Clone, Default)]
pub struct LimitOptions {
    pub service: String,
    pub network: String,
    pub addr: String,
    pub client: String,
    pub src: String,
}

/// Keyed factory of byte budgets for splice traffic.
pub trait TrafficLimiter: Send + Sync {
    fn limiter(&self, scope: Scope, key: &str, opts: &LimitOptions) -> Option<Arc<TokenBucket>>;
}

/// Traffic limiter granting every key the same bytes-per-second
/// budget.
pub struct KeyedTrafficLimiter {
    bytes_per_sec: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl KeyedTrafficLimiter {
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl TrafficLimiter for KeyedTrafficLimiter {
    fn limiter(&self, _scope: Scope, key: &str, _opts: &LimitOptions) -> Option<Arc<TokenBucket>> {
        if self.bytes_per_sec <= 0.0 {
            return None;
        }
        let mut buckets = self.buckets.lock().expect("buckets poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.bytes_per_sec)))
            .clone();
        Some(bucket)
    }
}

/// Stream wrapper charging moved bytes against a byte budget.
///
/// The charge lands after the bytes moved; once the budget runs dry
/// the next operation parks on a timer until it refills.
pub struct LimitedStream<S> {
    inner: S,
    budget: Arc<TokenBucket>,
    backoff: Option<Pin<Box<Sleep>>>,
}

impl<S> LimitedStream<S> {
    pub fn new(inner: S, budget: Arc<TokenBucket>) -> Self {
        Self {
            inner,
            budget,
            backoff: None,
        }
    }

    fn poll_backoff(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(sleep) = &mut self.backoff {
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => self.backoff = None,
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(())
    }

    fn charge(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(wait) = self.budget.take(n as f64) {
            self.backoff = Some(Box::pin(tokio::time::sleep(wait)));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.poll_backoff(cx).is_pending() {
            return Poll::Pending;
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            self.charge(n);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.poll_backoff(cx).is_pending() {
            return Poll::Pending;
        }

        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            let n = *n;
            self.charge(n);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_token_bucket_allow() {
        let bucket = TokenBucket::new(10.0);
        assert!(bucket.allow(10));
        assert!(!bucket.allow(1));
    }

    #[test]
    fn test_rate_limiter_keys_are_independent() {
        let limiter = KeyedRateLimiter::new(1.0);
        let a = limiter.limiter("192.0.2.1").unwrap();
        let b = limiter.limiter("192.0.2.2").unwrap();

        assert!(a.allow(1));
        assert!(!a.allow(1));
        assert!(b.allow(1));
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let limiter = KeyedRateLimiter::new(0.0);
        assert!(limiter.limiter("any").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_stream_paces_reads() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(&[0u8; 3072]).await.unwrap();

        // 1 KiB/s budget with a 1 KiB burst: the third kilobyte sits
        // behind the backoff timer the second one armed.
        let budget = Arc::new(TokenBucket::new(1024.0));
        let mut limited = LimitedStream::new(client, budget);

        let start = tokio::time::Instant::now();
        let mut buf = vec![0u8; 1024];
        limited.read_exact(&mut buf).await.unwrap();
        limited.read_exact(&mut buf).await.unwrap();
        limited.read_exact(&mut buf).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use super::ConnError;

// Token bucket governing piece payload egress on one connection. Callers
// reserve tokens before writing and sleep for the returned delay, so a slow
// allowance stretches writes out instead of failing them.
pub struct EgressLimiter {

    bucket: Mutex<Bucket>,

}

struct Bucket {

    // Bytes per second; zero disables limiting.
    rate: f64,

    // Token capacity. Sized to the largest piece so a full piece can always
    // be reserved in one call.
    burst: u64,

    tokens: f64,

    last_refill: Instant,

}

impl EgressLimiter {

    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_sec as f64,
                burst,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    // Unlimited limiter, for disabled throttling.
    pub fn unlimited(burst: u64) -> Self {
        Self::new(0, burst)
    }

    // Takes `n` tokens and returns how long the caller must wait before
    // using them. The bucket may go negative, which pushes later
    // reservations further out.
    pub fn reserve(&self, n: u64) -> Result<Duration, ConnError> {
        let mut bucket = self.bucket.lock().unwrap();

        if n > bucket.burst {
            return Err(ConnError::PayloadExceedsBurst {
                payload: n,
                burst: bucket.burst,
            });
        }
        if bucket.rate == 0.0 {
            return Ok(Duration::ZERO);
        }

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * bucket.rate)
            .min(bucket.burst as f64);
        bucket.last_refill = now;

        bucket.tokens -= n as f64;
        if bucket.tokens >= 0.0 {
            Ok(Duration::ZERO)
        } else {
            Ok(Duration::from_secs_f64(-bucket.tokens / bucket.rate))
        }
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.rate = bytes_per_sec as f64;
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().unwrap().rate as u64
    }
}

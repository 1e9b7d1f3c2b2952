use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Calls-per-interval ceiling of one upstream, e.g. `60/60` (60 calls per 60 seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_calls: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max_calls: u32, per: Duration) -> Self {
        Self { max_calls, per }
    }

    pub fn per_minute(max_calls: u32) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    pub fn is_valid(&self) -> bool {
        self.max_calls > 0 && !self.per.is_zero()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max_calls, self.per.as_secs_f64())
    }
}

impl FromStr for RateLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (calls, secs) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected CALLS/SECONDS, got {s:?}"))?;
        let max_calls = calls
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad call count in {s:?}: {e}"))?;
        let secs = secs
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("bad interval in {s:?}: {e}"))?;
        let limit = Self::new(max_calls, Duration::from_secs(secs));
        if !limit.is_valid() {
            return Err(format!("rate limit must be positive, got {s:?}"));
        }
        Ok(limit)
    }
}

/// Process-wide limiter for one upstream.
///
/// Keeps the grant times of the last `max_calls` calls. A new grant is never earlier than
/// `per` after the grant `max_calls` positions back, so any window of length `per` contains at
/// most `max_calls` calls no matter how many tasks share the throttle. Grants are reserved
/// under the lock and slept outside it.
pub struct Throttle {
    name: String,
    limit: RateLimit,
    grants: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(name: impl Into<String>, limit: RateLimit) -> Self {
        Self {
            name: name.into(),
            limit,
            grants: Mutex::new(VecDeque::with_capacity(limit.max_calls as usize + 1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until a call slot is available and claims it.
    pub async fn acquire(&self) {
        let at = self.reserve().await;
        let now = Instant::now();
        if at > now {
            tracing::debug!(
                source_name = %self.name,
                wait_ms = (at - now).as_millis() as u64,
                "throttled"
            );
            tokio::time::sleep_until(at).await;
        }
    }

    async fn reserve(&self) -> Instant {
        let max = self.limit.max_calls.max(1) as usize;
        let mut grants = self.grants.lock().await;
        let now = Instant::now();

        let mut at = now;
        if grants.len() >= max {
            if let Some(oldest) = grants.front() {
                at = at.max(*oldest + self.limit.per);
            }
        }
        if let Some(last) = grants.back() {
            at = at.max(*last);
        }

        grants.push_back(at);
        while grants.len() > max {
            grants.pop_front();
        }
        at
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish()
    }
}

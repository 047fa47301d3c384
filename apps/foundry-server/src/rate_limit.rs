use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::store::EphemeralStore;
use crate::util::{self, Clock};

/// Fixed-window throttle keyed by a hash of the caller identifier.
///
/// The window starts with the first request and resets wholesale once it has
/// elapsed; counts do not decay in between.
pub(crate) struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    max: u32,
    window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Throttled {
    pub retry_after: u64,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        max: u32,
        window_secs: u64,
    ) -> Self {
        Self {
            store,
            clock,
            max,
            window_secs,
        }
    }

    pub async fn check(&self, identifier: &str) -> Result<(), Throttled> {
        if self.max == 0 {
            return Ok(());
        }
        let key = format!("foundry:rl:{}", &util::sha256_hex(identifier.as_bytes())[..32]);
        let now = self.clock.now();
        let window = self.window_secs as i64;
        let max = u64::from(self.max);
        let next = self
            .store
            .update(
                &key,
                Some(Duration::from_secs(self.window_secs)),
                Box::new(move |current: Option<&Value>| {
                    let (count, started) = current
                        .map(|v| {
                            (
                                v["count"].as_u64().unwrap_or(0),
                                v["started"].as_i64().unwrap_or(now),
                            )
                        })
                        .unwrap_or((0, now));
                    if now - started >= window {
                        json!({"count": 1, "started": now, "allowed": true})
                    } else if count >= max {
                        json!({"count": count, "started": started, "allowed": false})
                    } else {
                        json!({"count": count + 1, "started": started, "allowed": true})
                    }
                }),
            )
            .await;
        if next["allowed"].as_bool().unwrap_or(false) {
            return Ok(());
        }
        let started = next["started"].as_i64().unwrap_or(now);
        let retry_after = (started + window - now).max(1) as u64;
        Err(Throttled { retry_after })
    }
}

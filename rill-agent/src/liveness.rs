//! Host reachability as reported by an external probe feed.
//!
//! The feed publishes two-part messages `(hostname, "responsive" | "unresponsive")`
//! topic-keyed by host. When the host is marked down and the feed then goes quiet
//! for longer than `stale_after`, the consumer assumes the probe died rather than
//! the host and flips back to alive, so supervision never starves on a dead feed.

use crate::bus::Message;
use crate::config::Config;
use crate::metrics::HOST_ALIVE;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const RESPONSIVE: &str = "responsive";
pub const UNRESPONSIVE: &str = "unresponsive";

#[derive(Debug)]
pub struct LivenessConsumer {
    host: String,
    host_alive: bool,
    last_observed_at: Instant,
    down_since: Option<Instant>,
    stale_after: Duration,
    warn_after: Duration,
    warned: bool,
}

impl LivenessConsumer {
    pub fn new(host: impl Into<String>, stale_after: Duration, warn_after: Duration, now: Instant) -> Self {
        HOST_ALIVE.set(1);
        Self {
            host: host.into(),
            host_alive: true,
            last_observed_at: now,
            down_since: None,
            stale_after,
            warn_after,
            warned: false,
        }
    }

    pub fn from_config(config: &Config, now: Instant) -> Self {
        Self::new(
            config.node.host.clone(),
            Duration::from_millis(config.bus.liveness_stale_after_ms),
            Duration::from_secs(config.bus.host_down_warn_after_secs),
            now,
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bus subscription prefixes for this host's signals.
    pub fn topic_filters(&self) -> Vec<String> {
        vec![self.host.clone()]
    }

    pub fn host_alive(&self) -> bool {
        self.host_alive
    }

    pub fn last_observed_at(&self) -> Instant {
        self.last_observed_at
    }

    /// Apply a feed message. Signals for other hosts (topic prefix matches such as
    /// `web1` vs `web10`) and unknown payloads are ignored.
    pub fn observe_message(&mut self, message: &Message, now: Instant) {
        let [host, state] = message.parts() else {
            debug!(parts = message.parts().len(), "ignoring malformed liveness message");
            return;
        };
        if host != &self.host {
            return;
        }
        match state.as_str() {
            RESPONSIVE => self.observe(true, now),
            UNRESPONSIVE => self.observe(false, now),
            other => debug!(host = %self.host, state = other, "ignoring unknown liveness state"),
        }
    }

    pub fn observe(&mut self, responsive: bool, now: Instant) {
        self.last_observed_at = now;
        self.set_alive(responsive, now);
    }

    /// Re-evaluate staleness; returns the current verdict.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.host_alive && now.saturating_duration_since(self.last_observed_at) > self.stale_after {
            debug!(host = %self.host, "liveness feed silent; assuming host is reachable");
            self.set_alive(true, now);
        }

        if let Some(since) = self.down_since {
            if !self.warned && now.saturating_duration_since(since) >= self.warn_after {
                warn!(
                    host = %self.host,
                    down_secs = now.saturating_duration_since(since).as_secs(),
                    "host has been unreachable for an extended period"
                );
                self.warned = true;
            }
        }
        self.host_alive
    }

    fn set_alive(&mut self, alive: bool, now: Instant) {
        if alive == self.host_alive {
            return;
        }
        self.host_alive = alive;
        HOST_ALIVE.set(i64::from(alive));
        if alive {
            if self.warned {
                info!(host = %self.host, "host reachable again");
            } else {
                debug!(host = %self.host, "host reachable");
            }
            self.down_since = None;
            self.warned = false;
        } else {
            debug!(host = %self.host, "host unreachable");
            self.down_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(now: Instant) -> LivenessConsumer {
        LivenessConsumer::new("jabbah2", Duration::from_secs(5), Duration::from_secs(600), now)
    }

    fn signal(host: &str, state: &str) -> Message {
        Message::multipart(vec![host.to_string(), state.to_string()])
    }

    #[test]
    fn signals_set_the_verdict() {
        let start = Instant::now();
        let mut liveness = consumer(start);
        assert!(liveness.host_alive());

        liveness.observe_message(&signal("jabbah2", UNRESPONSIVE), start);
        assert!(!liveness.tick(start + Duration::from_secs(1)));

        liveness.observe_message(&signal("jabbah2", RESPONSIVE), start + Duration::from_secs(2));
        assert!(liveness.host_alive());
        assert_eq!(liveness.last_observed_at(), start + Duration::from_secs(2));
    }

    #[test]
    fn other_hosts_and_garbage_are_ignored() {
        let start = Instant::now();
        let mut liveness = consumer(start);
        liveness.observe_message(&signal("jabbah20", UNRESPONSIVE), start);
        liveness.observe_message(&signal("jabbah2", "maybe"), start);
        liveness.observe_message(&Message::single("jabbah2"), start);
        assert!(liveness.host_alive());
    }

    #[test]
    fn silent_feed_flips_back_to_alive_after_threshold() {
        let start = Instant::now();
        let mut liveness = consumer(start);
        liveness.observe(false, start);

        assert!(!liveness.tick(start + Duration::from_secs(5)));
        assert!(liveness.tick(start + Duration::from_millis(5_001)));
    }

    #[test]
    fn steady_unresponsive_signals_keep_host_down() {
        let start = Instant::now();
        let mut liveness = consumer(start);
        for second in 0..30 {
            let now = start + Duration::from_secs(second);
            liveness.observe(false, now);
            assert!(!liveness.tick(now));
        }
    }
}

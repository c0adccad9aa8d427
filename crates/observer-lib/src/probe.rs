//! Datapath reachability probing
//!
//! A probe target is either an HTTP(S) URL, a `tcp://host:port` URL or a bare
//! `host:port` address. HTTP probes succeed on any status in [200, 400); TCP
//! probes succeed when a connection is established.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Timeout applied to each individual probe attempt
pub const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of wall-clock time for recorded timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system UTC clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parsed probe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Http(Url),
    Tcp(String),
}

impl ProbeTarget {
    pub fn parse(target: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }

        match Url::parse(target) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Some(ProbeTarget::Http(url))
            }
            Ok(url) if url.scheme() == "tcp" => {
                let host = url.host_str()?;
                let port = url.port()?;
                Some(ProbeTarget::Tcp(format!("{}:{}", host, port)))
            }
            // Anything else, including `host:port` which parses as a scheme, is a
            // bare TCP address.
            _ => Some(ProbeTarget::Tcp(target.to_string())),
        }
    }
}

/// A single reachability check
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &str) -> bool;
}

/// Prober that performs real HTTP and TCP checks
#[derive(Debug, Clone)]
pub struct NetworkProber {
    http: reqwest::Client,
    attempt_timeout: Duration,
}

impl NetworkProber {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(PROBE_ATTEMPT_TIMEOUT)
    }

    pub fn with_timeout(attempt_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(attempt_timeout).build()?;
        Ok(Self {
            http,
            attempt_timeout,
        })
    }

    async fn probe_http(&self, url: Url) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                (200..400).contains(&status)
            }
            Err(e) => {
                debug!(error = %e, "HTTP probe failed");
                false
            }
        }
    }

    async fn probe_tcp(&self, address: &str) -> bool {
        match tokio::time::timeout(self.attempt_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, address = %address, "TCP probe failed");
                false
            }
            Err(_) => {
                debug!(address = %address, "TCP probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &str) -> bool {
        match ProbeTarget::parse(target) {
            Some(ProbeTarget::Http(url)) => self.probe_http(url).await,
            Some(ProbeTarget::Tcp(address)) => self.probe_tcp(&address).await,
            None => {
                warn!(target = %target, "Invalid probe target");
                false
            }
        }
    }
}

/// Probe `target` every `interval` until it succeeds or `timeout` elapses.
///
/// Returns the clock time of the first successful attempt, or `None` once the
/// deadline has passed.
pub async fn probe_until_success(
    prober: &dyn Prober,
    clock: &dyn Clock,
    target: &str,
    timeout: Duration,
    interval: Duration,
) -> Option<DateTime<Utc>> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    while Instant::now() < deadline {
        attempt += 1;
        if prober.probe(target).await {
            let ready_ts = clock.now();
            info!(attempt, "Probe succeeded");
            return Some(ready_ts);
        }
        debug!(
            attempt,
            retry_in_ms = interval.as_millis() as u64,
            "Probe attempt failed"
        );
        sleep(interval).await;
    }

    warn!(attempts = attempt, timeout_secs = timeout.as_secs(), "Probe timed out");
    None
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedProber, TokioClock};
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_targets() {
        assert!(matches!(
            ProbeTarget::parse("http://10.0.0.1:8080/healthz"),
            Some(ProbeTarget::Http(_))
        ));
        assert!(matches!(
            ProbeTarget::parse("https://svc.perf.svc.cluster.local"),
            Some(ProbeTarget::Http(_))
        ));
        assert_eq!(
            ProbeTarget::parse("tcp://10.0.0.1:5201"),
            Some(ProbeTarget::Tcp("10.0.0.1:5201".to_string()))
        );
        assert_eq!(
            ProbeTarget::parse("10.0.0.1:5201"),
            Some(ProbeTarget::Tcp("10.0.0.1:5201".to_string()))
        );
        assert_eq!(
            ProbeTarget::parse("server:80"),
            Some(ProbeTarget::Tcp("server:80".to_string()))
        );
        assert_eq!(ProbeTarget::parse("tcp://host-without-port"), None);
        assert_eq!(ProbeTarget::parse(""), None);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let prober = NetworkProber::with_timeout(Duration::from_millis(500)).unwrap();

        assert!(prober.probe(&format!("tcp://{}", addr)).await);
        assert!(prober.probe(&addr.to_string()).await);

        drop(listener);
        assert!(!prober.probe(&addr.to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_until_success_returns_time_of_success() {
        let base: DateTime<Utc> = "2025-03-01T12:00:00Z".parse().unwrap();
        let clock = TokioClock::starting_at(base);
        let prober = ScriptedProber::succeed_after(3);

        let ready = probe_until_success(
            &prober,
            &clock,
            "10.0.0.1:80",
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(ready, Some(base + chrono::Duration::seconds(3)));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_until_success_times_out() {
        let clock = TokioClock::starting_at(Utc::now());
        let prober = ScriptedProber::never();

        let ready = probe_until_success(
            &prober,
            &clock,
            "10.0.0.1:80",
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
        .await;

        assert!(ready.is_none());
        // Fixed interval, no backoff growth: attempts at 0, 2, 4, 6, 8
        assert_eq!(prober.calls.load(Ordering::SeqCst), 5);
    }
}

//! Bounded fetch pool for one venue.
//!
//! The pool owns `max_workers` venue clients, each holding an isolated HTTP
//! connection pool. The scheduler checks out an idle client, the fetch runs
//! as a spawned task under a hard timeout, and the client rides back to the
//! idle set on the completion message. The pool size is the static upper
//! bound on concurrency; the AIMD-controlled inflight limit is enforced by
//! the scheduler on top.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use harvest_common::Instrument;
use harvest_market::{FetchError, RawBook, VenueClient};

/// Result of one dispatched fetch.
pub struct FetchCompletion {
    pub instrument: Instrument,
    /// Wall clock at fetch start, epoch ms UTC. This is the record's
    /// `ts_ms` and the ordering signal for downstream readers.
    pub ts_ms: i64,
    pub latency_ms: u64,
    pub result: Result<RawBook, FetchError>,
    client: Arc<dyn VenueClient>,
}

pub struct WorkerPool {
    idle: Vec<Arc<dyn VenueClient>>,
    max_workers: usize,
    in_flight: usize,
    request_timeout: Duration,
    tx: mpsc::UnboundedSender<FetchCompletion>,
    rx: mpsc::UnboundedReceiver<FetchCompletion>,
}

impl WorkerPool {
    pub fn new(clients: Vec<Arc<dyn VenueClient>>, request_timeout: Duration) -> Self {
        let max_workers = clients.len();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            idle: clients,
            max_workers,
            in_flight: 0,
            request_timeout,
            tx,
            rx,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_idle_worker(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Spawn a fetch for one instrument. Returns false when every worker is
    /// busy; the caller retries next tick.
    pub fn dispatch(&mut self, instrument: &Instrument) -> bool {
        let Some(client) = self.idle.pop() else {
            return false;
        };
        self.in_flight += 1;

        let tx = self.tx.clone();
        let timeout = self.request_timeout;
        let instrument = instrument.clone();
        tokio::spawn(async move {
            let ts_ms = Utc::now().timestamp_millis();
            let started = Instant::now();
            let result =
                match tokio::time::timeout(timeout, client.get_orderbook(&instrument.poll_key))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                };
            // The receiver only drops at scheduler teardown; a send failure
            // then is harmless.
            let _ = tx.send(FetchCompletion {
                instrument,
                ts_ms,
                latency_ms: started.elapsed().as_millis() as u64,
                result,
                client,
            });
        });
        true
    }

    /// Non-blocking: collect one completed fetch if any, returning its
    /// worker to the idle set.
    pub fn try_recv(&mut self) -> Option<FetchCompletion> {
        match self.rx.try_recv() {
            Ok(completion) => {
                self.in_flight -= 1;
                self.idle.push(Arc::clone(&completion.client));
                Some(completion)
            }
            Err(_) => None,
        }
    }

    /// Shutdown path: await outstanding fetches up to the grace period and
    /// hand back whatever completed. Anything still in flight afterwards is
    /// abandoned.
    pub async fn drain(&mut self, grace: Duration) -> Vec<FetchCompletion> {
        let deadline = Instant::now() + grace;
        let mut drained = Vec::new();
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(completion)) => {
                    self.in_flight -= 1;
                    self.idle.push(Arc::clone(&completion.client));
                    drained.push(completion);
                }
                Ok(None) | Err(_) => break,
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_market::DiscoveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowVenue {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VenueClient for SlowVenue {
        fn venue(&self) -> &str {
            "mock"
        }

        async fn discover(&self) -> Result<Vec<Instrument>, DiscoveryError> {
            Ok(Vec::new())
        }

        async fn get_orderbook(&self, _poll_key: &str) -> Result<RawBook, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(RawBook {
                payload: serde_json::json!({"bids": [], "asks": []}),
                ob_ts_ms: None,
            })
        }
    }

    fn instrument(poll_key: &str) -> Instrument {
        Instrument {
            venue: "mock".to_string(),
            poll_key: poll_key.to_string(),
            market_id: "m1".to_string(),
            expiration_ms: i64::MAX,
            slug: None,
            title: None,
            outcome: None,
            underlying: None,
            rule: None,
            extra: Default::default(),
        }
    }

    fn pool(workers: usize, delay: Duration, calls: Arc<AtomicUsize>) -> WorkerPool {
        let clients: Vec<Arc<dyn VenueClient>> = (0..workers)
            .map(|_| {
                Arc::new(SlowVenue {
                    delay,
                    calls: Arc::clone(&calls),
                }) as Arc<dyn VenueClient>
            })
            .collect();
        WorkerPool::new(clients, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_dispatch_bounded_by_workers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(2, Duration::from_millis(50), Arc::clone(&calls));

        assert!(pool.dispatch(&instrument("a")));
        assert!(pool.dispatch(&instrument("b")));
        assert!(!pool.dispatch(&instrument("c")));
        assert_eq!(pool.in_flight(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let mut done = 0;
        while pool.try_recv().is_some() {
            done += 1;
        }
        assert_eq!(done, 2);
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.has_idle_worker());
        // The freed worker is reusable.
        assert!(pool.dispatch(&instrument("c")));
    }

    #[tokio::test]
    async fn test_timeout_yields_timeout_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clients: Vec<Arc<dyn VenueClient>> = vec![Arc::new(SlowVenue {
            delay: Duration::from_secs(60),
            calls,
        })];
        let mut pool = WorkerPool::new(clients, Duration::from_millis(20));

        pool.dispatch(&instrument("slow"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let completion = pool.try_recv().unwrap();
        assert!(matches!(completion.result, Err(FetchError::Timeout)));
    }

    #[tokio::test]
    async fn test_drain_collects_inflight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(3, Duration::from_millis(30), Arc::clone(&calls));
        for key in ["a", "b", "c"] {
            assert!(pool.dispatch(&instrument(key)));
        }

        let drained = pool.drain(Duration::from_secs(1)).await;
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_abandons_after_grace() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(1, Duration::from_secs(60), Arc::clone(&calls));
        assert!(pool.dispatch(&instrument("stuck")));

        let drained = pool.drain(Duration::from_millis(30)).await;
        assert!(drained.is_empty());
        // Still accounted as in flight; the process is exiting anyway.
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_completion_carries_capture_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(1, Duration::from_millis(10), Arc::clone(&calls));
        let before = Utc::now().timestamp_millis();
        pool.dispatch(&instrument("a"));
        let drained = pool.drain(Duration::from_secs(1)).await;
        let after = Utc::now().timestamp_millis();

        let completion = &drained[0];
        assert!(completion.ts_ms >= before && completion.ts_ms <= after);
        assert!(completion.latency_ms >= 10);
    }
}

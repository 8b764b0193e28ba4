use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pool::{HealthEntry, Upstream, UpstreamPool};

/// Latency at or above which a reachable upstream is still marked unhealthy
const UNHEALTHY_LATENCY_SECS: f64 = 10.0;

/// Periodic TCP health prober for the upstream pool
///
/// Probes run in bounded concurrent batches; each result lands in the
/// pool's health table and the pool order is recomputed after every full
/// pass. Probe failures never stop the prober.
pub struct HealthProber {
    pool: Arc<UpstreamPool>,
    timeout_test: Duration,
    update_timeout: Duration,
    batch_size: usize,
}

impl HealthProber {
    pub fn new(
        pool: Arc<UpstreamPool>,
        timeout_test: Duration,
        update_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            timeout_test,
            update_timeout,
            batch_size: batch_size.max(1),
        }
    }

    /// Probe forever, sleeping `update_timeout` between passes
    pub async fn run(self) {
        loop {
            self.run_pass().await;
            debug!("Upstream list updated");
            tokio::time::sleep(self.update_timeout).await;
        }
    }

    /// One full round of probes across the pool, then a reorder
    pub async fn run_pass(&self) {
        let upstreams = self.pool.snapshot();

        let healthy_count = stream::iter(upstreams.iter().cloned())
            .map(|upstream| {
                let pool = Arc::clone(&self.pool);
                let timeout_test = self.timeout_test;
                async move {
                    let entry = probe(&upstream, timeout_test).await;
                    pool.record_health(upstream.url(), entry).await;
                    entry.healthy
                }
            })
            .buffer_unordered(self.batch_size)
            .fold(0usize, |count, healthy| async move {
                count + usize::from(healthy)
            })
            .await;

        if !upstreams.is_empty() && healthy_count == 0 {
            warn!("No healthy upstream found");
        } else {
            debug!("Found {} healthy upstreams", healthy_count);
        }

        self.pool.reorder().await;
    }
}

/// TCP-probe one upstream and classify the result
///
/// A connect error or deadline miss yields an unhealthy entry with unknown
/// latency; a successful connect records the elapsed wall time with
/// millisecond precision.
async fn probe(upstream: &Upstream, timeout_test: Duration) -> HealthEntry {
    let start = Instant::now();
    match timeout(
        timeout_test,
        TcpStream::connect((upstream.host(), upstream.port())),
    )
    .await
    {
        Ok(Ok(_stream)) => {
            let latency = round_ms(start.elapsed().as_secs_f64());
            HealthEntry {
                latency: Some(latency),
                healthy: latency < UNHEALTHY_LATENCY_SECS,
            }
        }
        _ => HealthEntry {
            latency: None,
            healthy: false,
        },
    }
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

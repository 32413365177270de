use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::{CollectorClient, CollectorConfig};
use crate::metrics::snapshot::MetricsPayload;
use crate::metrics::{Aggregator, AggregatorConfig};
use crate::probes::{EventLoopProbe, GcProbe, GcTally, HostProcessProbe, LagSampler, ProcessProbe};
use crate::sizecache::SizeCache;
use crate::timesync::TimeSync;

/// Composition root. Builds explicit instances of every component and
/// drives the report loop.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Arc<TimeSync>,
    size_cache: Arc<SizeCache>,
    lag_sampler: Arc<LagSampler>,
    gc_tally: Arc<GcTally>,
    aggregator: Arc<Aggregator>,
    exporter: Option<Arc<CollectorClient>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Builds all components from configuration. Nothing is shared through
    /// process globals; embedders reach the live instances via accessors.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let clock = Arc::new(
            TimeSync::new(&cfg.endpoint, cfg.time_sync.enabled, cfg.time_sync.timeout)
                .context("creating time sync")?,
        );

        let size_cache = Arc::new(SizeCache::new(cfg.cache.max_entries, cfg.cache.max_samples));
        let lag_sampler = Arc::new(LagSampler::new(cfg.metrics.lag_sample_interval));
        let gc_tally = Arc::new(GcTally::new());
        let process_probe = Arc::new(HostProcessProbe::new());

        let aggregator = Arc::new(Aggregator::new(
            AggregatorConfig {
                cpu_sample_interval: cfg.metrics.cpu_sample_interval,
                session_timeout: cfg.metrics.session_timeout,
            },
            Arc::clone(&clock),
            Arc::clone(&size_cache),
            Arc::clone(&lag_sampler) as Arc<dyn EventLoopProbe>,
            Arc::clone(&gc_tally) as Arc<dyn GcProbe>,
            process_probe as Arc<dyn ProcessProbe>,
        ));

        let exporter = if cfg.endpoint.is_empty() {
            warn!("no collector endpoint configured, snapshots will not be exported");
            None
        } else {
            Some(Arc::new(
                CollectorClient::new(CollectorConfig {
                    endpoint: cfg.endpoint.clone(),
                    app_id: cfg.app_id.clone(),
                    app_secret: cfg.app_secret.clone(),
                    headers: cfg.export.headers.clone(),
                    compression: cfg.export.compression,
                    timeout: cfg.export.timeout,
                    hostname: cfg.hostname.clone(),
                })
                .context("creating collector client")?,
            ))
        };

        Ok(Self {
            cfg,
            health,
            clock,
            size_cache,
            lag_sampler,
            gc_tally,
            aggregator,
            exporter,
            cancel: CancellationToken::new(),
        })
    }

    /// Starts all components and the report loop.
    pub async fn start(&self) -> Result<()> {
        if !self.cfg.health.addr.is_empty() {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        self.lag_sampler.start();
        self.aggregator.start();
        Arc::clone(&self.clock).sync();

        let interval = self.cfg.report_interval;
        let health = Arc::clone(&self.health);
        let clock = Arc::clone(&self.clock);
        let size_cache = Arc::clone(&self.size_cache);
        let aggregator = Arc::clone(&self.aggregator);
        let exporter = self.exporter.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick so the first window spans a
            // full report interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("report loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let snapshot = aggregator.build_snapshot();

                        health.window_new_sessions.set(snapshot.new_sessions as f64);
                        health.cpu_pct.set(snapshot.pcpu);
                        health.clock_synced.set(f64::from(u8::from(clock.synced())));
                        health.clock_offset_ms.set(clock.offset_ms());
                        health.size_cache_entries.set(size_cache.len() as f64);

                        let Some(exporter) = &exporter else {
                            continue;
                        };

                        let started = Instant::now();
                        match exporter.send(&MetricsPayload::single(snapshot)).await {
                            Ok(()) => {
                                health.snapshots_sent.inc();
                                health
                                    .export_duration
                                    .observe(started.elapsed().as_secs_f64());
                            }
                            Err(e) => {
                                health.export_errors.inc();
                                warn!(error = %e, "snapshot export failed");
                            }
                        }
                    }
                }
            }
        });

        info!(
            report_interval = ?self.cfg.report_interval,
            endpoint = %self.cfg.endpoint,
            "agent started",
        );

        Ok(())
    }

    /// Stops the report loop, timers and servers.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.aggregator.stop();
        self.lag_sampler.stop();
        self.clock.stop();
        self.health.stop().await.context("stopping health server")?;

        info!("agent stopped");
        Ok(())
    }

    /// The aggregator, for feeding session activity from the host server.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// The size cache, for query-path instrumentation.
    pub fn size_cache(&self) -> &Arc<SizeCache> {
        &self.size_cache
    }

    /// The synchronized clock.
    pub fn clock(&self) -> &Arc<TimeSync> {
        &self.clock
    }

    /// The GC pause tally, for an embedding runtime's GC hooks.
    pub fn gc_tally(&self) -> &Arc<GcTally> {
        &self.gc_tally
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("endpoint", &self.cfg.endpoint)
            .field("report_interval", &self.cfg.report_interval)
            .finish()
    }
}

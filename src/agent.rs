//! The synthetic monitoring agent.
//!
//! [`SynthAgent`] wires the clock, the rebalance engine and the latency
//! aggregator together and runs their periodic jobs. The message transport
//! is supplied by the embedding application through [`ClusterAdmin`] and
//! [`ProducerLifecycle`]; it feeds records through
//! [`SynthAgent::record_factory`] and [`SynthAgent::sample_recorder`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = SynthConfig::from_env()?;
//! let mut agent = SynthAgent::builder(config)
//!     .admin(admin)
//!     .producer(producer)
//!     .build()?;
//! agent.start();
//! // ... run the producer and consumer loops ...
//! agent.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use crate::clock::{ClockSync, SyncOutcome};
use crate::cluster::{
    ClusterAdmin, ProducerLifecycle, RebalanceConfig, RebalanceEngine, RefreshOutcome,
    TopologyTracker,
};
use crate::config::SynthConfig;
use crate::error::{Error, Result};
use crate::latency::{AggregatorConfig, LatencyAggregator};
use crate::metrics;
use crate::sampler::{RecordFactory, SampleRecorder};

pub const CLOCK_SYNC_TASK: &str = "clock_sync";
pub const PARTITION_REFRESH_TASK: &str = "partition_refresh";
pub const METRICS_PUBLISH_TASK: &str = "metrics_publish";

/// Builder for [`SynthAgent`].
pub struct AgentBuilder {
    config: SynthConfig,
    admin: Option<Arc<dyn ClusterAdmin>>,
    producer: Option<Arc<dyn ProducerLifecycle>>,
    retry_min_delay: Option<Duration>,
    seed: Option<u64>,
}

impl AgentBuilder {
    pub fn admin(mut self, admin: Arc<dyn ClusterAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn producer(mut self, producer: Arc<dyn ProducerLifecycle>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// First backoff delay for clock sync and partition refresh retries.
    pub fn retry_min_delay(mut self, delay: Duration) -> Self {
        self.retry_min_delay = Some(delay);
        self
    }

    /// Seed for replica selection.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration and assemble the agent.
    pub fn build(self) -> Result<SynthAgent> {
        self.config
            .validate()
            .map_err(|problems| Error::Config(problems.join("; ")))?;
        let admin = self
            .admin
            .ok_or_else(|| Error::Config("cluster admin not set".into()))?;
        let producer = self
            .producer
            .ok_or_else(|| Error::Config("producer not set".into()))?;

        let mut clock = ClockSync::from_config(&self.config);
        let mut rebalance_config = RebalanceConfig::from(&self.config);
        if let Some(delay) = self.retry_min_delay {
            clock = clock.with_retry_min_delay(delay);
            rebalance_config.retry_min_delay = delay;
        }
        let clock = Arc::new(clock);

        let topology = Arc::new(TopologyTracker::new());
        let mut rebalancer =
            RebalanceEngine::new(admin, producer, topology.clone(), rebalance_config);
        if let Some(seed) = self.seed {
            rebalancer = rebalancer.with_seed(seed);
        }

        let aggregator = Arc::new(LatencyAggregator::new(
            AggregatorConfig::from_config(&self.config)?,
            topology.clone(),
        ));

        Ok(SynthAgent {
            record_factory: Arc::new(RecordFactory::new(&self.config, clock.clone())),
            sample_recorder: Arc::new(SampleRecorder::new(clock.clone(), aggregator.clone())),
            config: self.config,
            clock,
            topology,
            rebalancer: Arc::new(rebalancer),
            aggregator,
            tasks: BackgroundTaskRegistry::new(),
        })
    }
}

/// A running synthetic monitoring agent.
pub struct SynthAgent {
    config: SynthConfig,
    clock: Arc<ClockSync>,
    topology: Arc<TopologyTracker>,
    rebalancer: Arc<RebalanceEngine>,
    aggregator: Arc<LatencyAggregator>,
    record_factory: Arc<RecordFactory>,
    sample_recorder: Arc<SampleRecorder>,
    tasks: BackgroundTaskRegistry,
}

impl SynthAgent {
    pub fn builder(config: SynthConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            admin: None,
            producer: None,
            retry_min_delay: None,
            seed: None,
        }
    }

    /// Agent with default retry timing and random replica selection.
    pub fn new(
        config: SynthConfig,
        admin: Arc<dyn ClusterAdmin>,
        producer: Arc<dyn ProducerLifecycle>,
    ) -> Result<Self> {
        Self::builder(config).admin(admin).producer(producer).build()
    }

    /// Spawn the clock sync, partition refresh and metrics publish jobs.
    ///
    /// Clock sync runs immediately and then every `clock_sync_interval`.
    /// Partition refresh waits `partition_refresh_initial_delay` first.
    pub fn start(&mut self) {
        metrics::init_metrics();

        let clock = self.clock.clone();
        self.tasks
            .spawn_periodic(CLOCK_SYNC_TASK, self.config.clock_sync_interval, move |_| {
                let clock = clock.clone();
                async move {
                    match clock.sync_cycle().await {
                        SyncOutcome::Failed { server, error } => {
                            debug!(server = %server, error = %error, "Clock sync cycle failed");
                        }
                        SyncOutcome::Synced { .. }
                        | SyncOutcome::Skipped
                        | SyncOutcome::NoServers => {}
                    }
                }
            });

        let rebalancer = self.rebalancer.clone();
        self.tasks.spawn_periodic_with_delay(
            PARTITION_REFRESH_TASK,
            self.config.partition_refresh_initial_delay,
            self.config.partition_refresh_interval,
            move |_| {
                let rebalancer = rebalancer.clone();
                async move {
                    match rebalancer.refresh().await {
                        RefreshOutcome::Completed(report) => {
                            debug!(?report, "Partition refresh cycle completed");
                        }
                        RefreshOutcome::GaveUp(error) => {
                            warn!(error = %error, "Partition rebalancing disabled");
                        }
                        RefreshOutcome::Skipped | RefreshOutcome::Disabled => {}
                    }
                }
            },
        );

        let aggregator = self.aggregator.clone();
        self.tasks.spawn_periodic(
            METRICS_PUBLISH_TASK,
            self.config.metrics_publish_interval,
            move |_| {
                let aggregator = aggregator.clone();
                async move { aggregator.publish_metrics() }
            },
        );

        info!(
            topic = %self.config.topic,
            rack = %self.config.rack,
            time_servers = self.clock.pool().len(),
            "Synthetic monitoring agent started"
        );
    }

    /// Stop every background job.
    pub async fn shutdown(&mut self) {
        self.tasks.shutdown_all().await;
        info!("Synthetic monitoring agent stopped");
    }

    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks.health_check()
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn topology(&self) -> &Arc<TopologyTracker> {
        &self.topology
    }

    pub fn rebalancer(&self) -> &Arc<RebalanceEngine> {
        &self.rebalancer
    }

    pub fn aggregator(&self) -> &Arc<LatencyAggregator> {
        &self.aggregator
    }

    pub fn record_factory(&self) -> &Arc<RecordFactory> {
        &self.record_factory
    }

    pub fn sample_recorder(&self) -> &Arc<SampleRecorder> {
        &self.sample_recorder
    }
}

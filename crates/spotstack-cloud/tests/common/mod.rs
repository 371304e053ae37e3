use spotstack_cloud::testing::{FakeCloud, FakePricing, FakeProbe};
use spotstack_cloud::{
    DeploymentConfig, DeploymentEngine, DeploymentState, EngineSettings, RetryPolicy, TierKind,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub struct TestCloud {
    pub engine: DeploymentEngine,
    pub cloud: FakeCloud,
    pub probe: Arc<FakeProbe>,
    pub pricing: Arc<FakePricing>,
    // Keeps the state directory alive for the test
    pub dir: TempDir,
}

/// Route engine logs to the test output; `RUST_LOG=spotstack_cloud=debug`
/// shows them for a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings with short intervals so monitor tests finish in seconds.
pub fn fast_settings(dir: &TempDir) -> EngineSettings {
    let mut settings = EngineSettings::default().with_state_dir(dir.path().join("state"));
    settings.lock_timeout_secs = 5;
    settings.operation_lock_timeout_secs = 30;
    settings.monitor.poll_interval_secs = 1;
    settings.monitor.failure_threshold = 3;
    settings.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    };
    settings.pipeline.startup_poll_interval_secs = 1;
    settings.pipeline.service_startup_timeout_secs = 3;
    settings
}

impl TestCloud {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut EngineSettings)) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fast_settings(&dir);
        adjust(&mut settings);

        let cloud = FakeCloud::new();
        let probe = FakeProbe::new();
        let pricing = FakePricing::new(Some(0.0125), Some(0.0416));
        let engine = DeploymentEngine::builder(settings)
            .resource_services(cloud.services())
            .health_probe(probe.clone())
            .pricing_source(pricing.clone())
            .build()
            .unwrap();

        Self {
            engine,
            cloud,
            probe,
            pricing,
            dir,
        }
    }

    /// Poll the record until `done` holds or the timeout elapses.
    #[allow(dead_code)]
    pub async fn wait_for(
        &self,
        stack_id: &str,
        timeout: Duration,
        done: impl Fn(&DeploymentState) -> bool,
    ) -> DeploymentState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(state) = self.engine.status(stack_id).await
                && done(&state)
            {
                return state;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not reached for {} within {:?}", stack_id, timeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub fn dev_config(stack_id: &str) -> DeploymentConfig {
    DeploymentConfig::new(stack_id, TierKind::Dev, "us-east-1")
}

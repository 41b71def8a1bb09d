//! Composition root: one session store, gate, provider registry and executor
//! table per process, wired from a [`HitlConfig`].

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result, anyhow};

use crate::config::{HitlConfig, WaitMode};
use crate::orchestrator::executor::provider_executors;
use crate::orchestrator::{
    Driver, DriverSettings, ExecutorRegistry, PhaseSpec, WaitPolicy, default_pipeline,
};
use crate::provider::{FallbackChain, ProviderRegistry};
use crate::safety::OutputGate;
use crate::session::SessionStore;

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

pub struct Runtime {
    pub config: HitlConfig,
    pub store: Arc<SessionStore>,
    pub gate: Arc<OutputGate>,
    pub providers: Arc<ProviderRegistry>,
    executors: Arc<ExecutorRegistry>,
}

impl Runtime {
    /// Build with provider-backed executors for the default phase types.
    pub fn build(config: HitlConfig) -> Result<Self> {
        let providers = Arc::new(ProviderRegistry::with_defaults());
        let chain = FallbackChain::new(
            providers.clone(),
            config.toml.providers.order.clone(),
            config.provider_configs(),
        );
        let executors = provider_executors(&chain);
        Self::with_executors(config, providers, executors)
    }

    pub fn with_executors(
        config: HitlConfig,
        providers: Arc<ProviderRegistry>,
        executors: ExecutorRegistry,
    ) -> Result<Self> {
        let store = SessionStore::open(config.sessions_dir())
            .context("Failed to open session store")?
            .with_feedback_dir(config.feedback_dir())
            .with_max_reruns(config.toml.hitl.max_reruns);
        let gate = OutputGate::from_config(&config.toml.safety)
            .context("Invalid [safety] patterns")?;
        Ok(Self {
            config,
            store: Arc::new(store),
            gate: Arc::new(gate),
            providers,
            executors: Arc::new(executors),
        })
    }

    pub fn pipeline(&self) -> Vec<PhaseSpec> {
        let configured = &self.config.toml.pipeline.phases;
        if configured.is_empty() {
            default_pipeline()
        } else {
            configured.clone()
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        match self.config.toml.hitl.mode {
            WaitMode::Exit => WaitPolicy::Exit,
            WaitMode::Poll => WaitPolicy::Poll {
                interval: self.config.poll_interval(),
                timeout: self.config.poll_timeout(),
            },
        }
    }

    pub fn driver_with(&self, wait: WaitPolicy) -> Driver {
        let toml = &self.config.toml;
        let settings = DriverSettings {
            max_retries: toml.feedback.max_retries,
            wait,
            hitl: toml.hitl.clone(),
            output_root: self.config.output_root().to_path_buf(),
            feedback_dir: toml
                .feedback
                .persist_history
                .then(|| self.config.feedback_dir()),
        };
        Driver::new(
            self.store.clone(),
            self.executors.clone(),
            self.gate.clone(),
            self.pipeline(),
            settings,
        )
    }

    pub fn driver(&self) -> Driver {
        self.driver_with(self.wait_policy())
    }
}

/// Make `runtime` the process-wide instance, replacing any previous one.
pub fn install(runtime: Runtime) -> Arc<Runtime> {
    let runtime = Arc::new(runtime);
    *RUNTIME.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime.clone());
    runtime
}

pub fn global() -> Result<Arc<Runtime>> {
    RUNTIME
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| anyhow!("Runtime not initialized"))
}

pub fn reset() {
    *RUNTIME.write().unwrap_or_else(PoisonError::into_inner) = None;
}

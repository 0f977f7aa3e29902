use std::sync::Arc;

use ormscope_domain::{CallIdSequence, CapturedCall};
use ormscope_host::CursorError;
use ormscope_runtime::{HostFactory, InstanceFactory, RuntimeError, RuntimeInstance, RuntimeManager};
use ormscope_trace_core::{SubscriptionId, TraceBus, TraceListener};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bridge::{InteractiveOutcome, SessionBridge};
use crate::config::PlaygroundConfig;
use crate::interception::InterceptorRegistry;
use crate::introspect::{ColumnInfo, Introspector, QueryOutcome};
use crate::orchestrator::{Orchestrator, RunOutcome};

#[derive(Debug, Error)]
pub enum PlaygroundError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("database error: {0}")]
    Database(#[from] CursorError),
}

/// Consumer-facing entry point: one runtime, one trace, one configuration.
#[derive(Debug)]
pub struct Playground<F = HostFactory> {
    manager: RuntimeManager<F>,
    registry: InterceptorRegistry,
    config: RwLock<PlaygroundConfig>,
}

impl Playground<HostFactory> {
    #[must_use]
    pub fn new(config: PlaygroundConfig) -> Self {
        Self::with_factory(HostFactory::default(), config)
    }
}

impl Default for Playground<HostFactory> {
    fn default() -> Self {
        Self::new(PlaygroundConfig::default())
    }
}

impl<F: InstanceFactory> Playground<F> {
    #[must_use]
    pub fn with_factory(factory: F, config: PlaygroundConfig) -> Self {
        Self {
            manager: RuntimeManager::new(factory),
            registry: InterceptorRegistry::new(
                Arc::new(TraceBus::new()),
                Arc::new(CallIdSequence::new()),
            ),
            config: RwLock::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> PlaygroundConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn manager(&self) -> &RuntimeManager<F> {
        &self.manager
    }

    #[must_use]
    pub fn bus(&self) -> Arc<TraceBus> {
        Arc::clone(self.registry.bus())
    }

    /// The instance for the current configuration, built on demand.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Configuration`] when provisioning fails.
    pub fn instance(&self) -> Result<Arc<RuntimeInstance>, RuntimeError> {
        let (bootstrap, requirements) = {
            let config = self.config.read();
            (config.bootstrap.clone(), config.requirements.clone())
        };
        let instance = self.manager.get_instance(&bootstrap, &requirements)?;
        self.registry.retain_only(instance.id());
        Ok(instance)
    }

    /// Execute a full script.
    ///
    /// # Errors
    /// Only runtime construction failures are returned; script failures are
    /// part of the outcome.
    pub fn run(&self, source: &str) -> Result<RunOutcome, PlaygroundError> {
        let instance = self.instance()?;
        let config = self.config();
        Ok(Orchestrator::new(&self.registry, &config).run(source, &instance))
    }

    /// # Errors
    /// Only runtime construction failures are returned.
    pub fn execute_interactive(
        &self,
        statement: &str,
    ) -> Result<InteractiveOutcome, PlaygroundError> {
        let instance = self.instance()?;
        Ok(SessionBridge::new(&self.registry).execute(statement, &instance))
    }

    pub fn set_bootstrap(&self, code: &str) {
        self.config.write().bootstrap = code.to_string();
        self.manager.invalidate();
    }

    pub fn set_dependencies(&self, requirements: &str) {
        self.config.write().requirements = requirements.to_string();
        self.manager.invalidate();
    }

    /// Discard the runtime; the next call rebuilds it from scratch.
    pub fn reset_runtime(&self) {
        self.manager.invalidate();
    }

    /// Listeners are called with the runtime instance locked; see
    /// [`TraceListener`] for what they may not do.
    pub fn subscribe(&self, listener: &Arc<dyn TraceListener>) -> SubscriptionId {
        self.registry.bus().subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.bus().unsubscribe(id)
    }

    #[must_use]
    pub fn trace(&self) -> Vec<CapturedCall> {
        self.registry.bus().list()
    }

    pub fn clear_trace(&self) {
        self.registry.bus().clear();
    }

    /// # Errors
    /// Returns runtime construction or storage failures.
    pub fn list_tables(&self) -> Result<Vec<String>, PlaygroundError> {
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).list_tables(&instance)?)
    }

    /// # Errors
    /// Returns runtime construction or storage failures.
    pub fn table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>, PlaygroundError> {
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).table_schema(&instance, table)?)
    }

    /// Rows of `table`, capped at `limit` or the configured row limit.
    ///
    /// # Errors
    /// Returns runtime construction or storage failures.
    pub fn table_rows(
        &self,
        table: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Map<String, Value>>, PlaygroundError> {
        let limit = limit.unwrap_or_else(|| self.config.read().row_limit);
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).table_rows(&instance, table, limit)?)
    }

    /// # Errors
    /// Returns runtime construction or storage failures.
    pub fn table_count(&self, table: &str) -> Result<u64, PlaygroundError> {
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).table_count(&instance, table)?)
    }

    /// # Errors
    /// Only runtime construction failures are returned.
    pub fn execute_query(&self, sql: &str) -> Result<QueryOutcome, PlaygroundError> {
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).execute_query(&instance, sql))
    }

    /// # Errors
    /// Returns runtime construction or storage failures.
    pub fn reset_database(&self) -> Result<Vec<String>, PlaygroundError> {
        let instance = self.instance()?;
        Ok(Introspector::new(&self.registry).reset_database(&instance)?)
    }
}

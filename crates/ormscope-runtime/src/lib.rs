#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ormscope_domain::{now_utc, DateTimeUtc, Fingerprint, InstanceId};
use ormscope_host::{
    parse_requirements, BuiltinPackages, HostError, Interpreter, PackageInstaller, SqliteCursor,
    UnitKind,
};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime configuration failed while {phase}: {source}")]
    Configuration {
        phase: &'static str,
        #[source]
        source: HostError,
    },
}

impl RuntimeError {
    fn configuration(phase: &'static str, source: impl Into<HostError>) -> Self {
        Self::Configuration {
            phase,
            source: source.into(),
        }
    }
}

/// Canonical form of bootstrap code: LF line endings, no trailing
/// whitespace, no trailing blank lines.
#[must_use]
pub fn normalize_bootstrap(code: &str) -> String {
    let unified = code.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Canonical form of a dependency list: lowercase entries, comments and
/// blanks dropped, sorted and deduplicated.
#[must_use]
pub fn normalize_dependencies(text: &str) -> Vec<String> {
    let mut entries: Vec<String> = text
        .lines()
        .map(|line| line.split_once('#').map_or(line, |(head, _)| head))
        .flat_map(|line| line.split(','))
        .map(|entry| entry.trim().to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect();
    entries.sort();
    entries.dedup();
    entries
}

#[must_use]
pub fn fingerprint(bootstrap: &str, dependencies: &str) -> Fingerprint {
    let mut material = normalize_bootstrap(bootstrap);
    material.push('\0');
    material.push_str(&normalize_dependencies(dependencies).join("\n"));
    Fingerprint::of(material.as_bytes())
}

/// A fully provisioned interpreter.
///
/// Replaced, never reconfigured: a configuration change produces a new
/// instance with a fresh id.
#[derive(Debug)]
pub struct RuntimeInstance {
    id: InstanceId,
    fingerprint: Fingerprint,
    created_at: DateTimeUtc,
    interpreter: Mutex<Interpreter>,
}

impl RuntimeInstance {
    #[must_use]
    pub fn new(interpreter: Interpreter, fingerprint: Fingerprint) -> Self {
        Self {
            id: InstanceId::new(),
            fingerprint,
            created_at: now_utc(),
            interpreter: Mutex::new(interpreter),
        }
    }

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn created_at(&self) -> DateTimeUtc {
        self.created_at
    }

    /// Exclusive access to the interpreter. Concurrent callers queue here.
    pub fn lock(&self) -> MutexGuard<'_, Interpreter> {
        self.interpreter.lock()
    }
}

/// Builds provisioned interpreters.
pub trait InstanceFactory: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn build(&self, bootstrap: &str, dependencies: &str) -> Result<Interpreter, RuntimeError>;
}

/// Default factory: a private in-memory SQLite database, packages from
/// `installer`, bootstrap evaluated into the persistent namespace.
#[derive(Debug, Clone, Default)]
pub struct HostFactory<I = BuiltinPackages> {
    installer: I,
}

impl<I: PackageInstaller> HostFactory<I> {
    #[must_use]
    pub fn with_installer(installer: I) -> Self {
        Self { installer }
    }
}

impl<I: PackageInstaller> InstanceFactory for HostFactory<I> {
    fn build(&self, bootstrap: &str, dependencies: &str) -> Result<Interpreter, RuntimeError> {
        let cursor = SqliteCursor::open_in_memory()
            .map_err(|err| RuntimeError::configuration("opening storage", err))?;
        let mut interpreter = Interpreter::new(Box::new(cursor));

        let requirements = parse_requirements(dependencies)
            .map_err(|err| RuntimeError::configuration("reading dependencies", err))?;
        for requirement in &requirements {
            let natives = self
                .installer
                .install(requirement)
                .map_err(|err| RuntimeError::configuration("installing dependencies", err))?;
            for native in natives {
                interpreter.register_native(native);
            }
        }

        let unit = interpreter.new_unit();
        interpreter.begin_capture();
        let evaluated = interpreter.eval_in_globals(bootstrap, unit, UnitKind::Bootstrap);
        let output = interpreter.end_capture();
        if !output.is_empty() {
            tracing::debug!(output = %output, "bootstrap output");
        }
        evaluated.map_err(|err| RuntimeError::configuration("evaluating bootstrap", err))?;
        Ok(interpreter)
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    current: Option<Arc<RuntimeInstance>>,
    invalidated: bool,
}

/// Owns the single current [`RuntimeInstance`] and rebuilds it when the
/// configuration fingerprint changes.
#[derive(Debug)]
pub struct RuntimeManager<F = HostFactory> {
    factory: F,
    state: Mutex<ManagerState>,
    builds: AtomicU64,
}

impl Default for RuntimeManager<HostFactory> {
    fn default() -> Self {
        Self::new(HostFactory::default())
    }
}

impl<F: InstanceFactory> RuntimeManager<F> {
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            state: Mutex::new(ManagerState::default()),
            builds: AtomicU64::new(0),
        }
    }

    /// Return the instance for this configuration, building it if needed.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Configuration`] when dependency installation or
    /// bootstrap evaluation fails. No instance is current afterwards.
    pub fn get_instance(
        &self,
        bootstrap: &str,
        dependencies: &str,
    ) -> Result<Arc<RuntimeInstance>, RuntimeError> {
        let wanted = fingerprint(bootstrap, dependencies);
        let mut state = self.state.lock();
        if !state.invalidated {
            if let Some(current) = state
                .current
                .as_ref()
                .filter(|current| current.fingerprint == wanted)
            {
                return Ok(Arc::clone(current));
            }
        }

        if let Some(previous) = state.current.take() {
            tracing::info!(instance_id = %previous.id(), "discarding runtime instance");
        }
        state.invalidated = false;

        let started = Instant::now();
        let interpreter = self.factory.build(bootstrap, dependencies)?;
        let instance = Arc::new(RuntimeInstance::new(interpreter, wanted));
        self.builds.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            instance_id = %instance.id(),
            fingerprint = %instance.fingerprint(),
            elapsed_ms = started.elapsed().as_millis(),
            "runtime instance built"
        );
        state.current = Some(Arc::clone(&instance));
        Ok(instance)
    }

    /// Force the next [`RuntimeManager::get_instance`] to rebuild.
    pub fn invalidate(&self) {
        self.state.lock().invalidated = true;
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<RuntimeInstance>> {
        self.state.lock().current.clone()
    }

    /// Number of instances successfully constructed so far.
    #[must_use]
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }
}

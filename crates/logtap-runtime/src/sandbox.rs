//! The script sandbox: a rhai VM behind a single serialization lock.
//!
//! Every entry point that touches the VM acquires the `vm` mutex first, so
//! hook invocations never overlap: not `on_log` with `on_tick`, and neither
//! with the error hooks dispatched by the HTTP and Kafka pollers. The
//! collaborators the builtins reach (HTTP client, Kafka producer,
//! configuration, ticker) sit behind their own locks and are never acquired
//! while already holding them, with the `vm` lock always outermost.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, FuncArgs, Scope, AST};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::builtins;
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::handle::RecordHandle;
use crate::http::{AsyncHttpClient, HttpError};
use crate::kafka::{DeliveryReport, KafkaMessage, KafkaOffset, KafkaProducer};

/// Name of the builtin module exposed to scripts.
pub const LOGD_MODULE: &str = "logd";

pub(crate) const ON_LOG: &str = "on_log";
pub(crate) const ON_ERROR: &str = "on_error";
pub(crate) const ON_TICK: &str = "on_tick";
pub(crate) const ON_HTTP_ERROR: &str = "on_http_error";
pub(crate) const ON_KAFKA_REPORT: &str = "on_kafka_report";

/// Which hooks the loaded script defines, read off the compiled AST once
/// at load time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HookSet {
    pub on_log: bool,
    pub on_tick: bool,
    pub on_error: bool,
    pub on_http_error: bool,
    pub on_kafka_report: bool,
}

impl HookSet {
    fn from_ast(ast: &AST) -> Self {
        let mut hooks = Self::default();
        for function in ast.iter_functions() {
            match function.name {
                ON_LOG => hooks.on_log = true,
                ON_TICK => hooks.on_tick = true,
                ON_ERROR => hooks.on_error = true,
                ON_HTTP_ERROR => hooks.on_http_error = true,
                ON_KAFKA_REPORT => hooks.on_kafka_report = true,
                _ => {}
            }
        }
        hooks
    }
}

struct Vm {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
}

impl Vm {
    fn call_raw(&mut self, name: &str, args: impl FuncArgs) -> Result<(), Box<EvalAltResult>> {
        // hooks may return values; they are ignored
        self.engine
            .call_fn::<Dynamic>(&mut self.scope, &self.ast, name, args)
            .map(|_| ())
    }

    fn call(&mut self, hook: &'static str, args: impl FuncArgs) -> Result<(), SandboxError> {
        self.call_raw(hook, args).map_err(|e| SandboxError::Script {
            hook,
            message: e.to_string(),
        })
    }
}

pub(crate) struct Inner {
    /// Serialization point for every VM operation. `None` marks the
    /// sandbox uninitialized (before `init`, after `close`).
    pub(crate) vm: Mutex<Option<Vm>>,
    pub(crate) config: Mutex<SandboxConfig>,
    pub(crate) hooks: Mutex<HookSet>,
    pub(crate) http: Mutex<Option<AsyncHttpClient>>,
    pub(crate) kafka: Mutex<Option<KafkaProducer>>,
    pub(crate) ticker: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) script: Mutex<Option<PathBuf>>,
    pub(crate) get_client: Mutex<Option<reqwest::blocking::Client>>,
    pub(crate) handle: Handle,
}

/// The sandbox host. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Sandbox {
    pub(crate) inner: Arc<Inner>,
}

impl Sandbox {
    /// Create an uninitialized sandbox bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                vm: Mutex::new(None),
                config: Mutex::new(SandboxConfig::default()),
                hooks: Mutex::new(HookSet::default()),
                http: Mutex::new(None),
                kafka: Mutex::new(None),
                ticker: Mutex::new(None),
                script: Mutex::new(None),
                get_client: Mutex::new(None),
                handle: Handle::current(),
            }),
        }
    }

    /// Load (or reload) the script: build a fresh VM with the `logd`
    /// builtin module, compile and run the script's top-level statements
    /// (where `config_set` calls take effect), then start the ticker when
    /// configured. A previously initialized sandbox is closed first,
    /// flushing its pending I/O.
    ///
    /// # Errors
    ///
    /// Fails when the script cannot be compiled or errors at load, or when
    /// the resulting configuration is invalid (e.g. protected mode without
    /// an `on_error` hook).
    pub fn init(&self, script: &Path) -> Result<(), SandboxError> {
        if self.is_initialized() {
            self.close();
        }
        info!(script = %script.display(), "initializing sandbox");

        *lock_mutex(&self.inner.config, "config")? = SandboxConfig::default();
        *lock_mutex(&self.inner.script, "script")? = Some(script.to_path_buf());

        let vm = build_vm(&self.inner, script)?;
        *lock_mutex(&self.inner.hooks, "hooks")? = HookSet::from_ast(&vm.ast);

        let load_result = {
            let mut guard = lock_mutex(&self.inner.vm, "vm")?;
            let vm = guard.insert(vm);
            let Vm { engine, ast, scope } = vm;
            engine
                .run_ast_with_scope(scope, ast)
                .map_err(|e| SandboxError::Load {
                    path: script.to_path_buf(),
                    message: e.to_string(),
                })
        };
        if let Err(e) = load_result {
            *lock_mutex(&self.inner.vm, "vm")? = None;
            return Err(e);
        }

        // protected mode demands the error hook; re-checked here because
        // the flag may predate the reload
        let protected = lock_mutex(&self.inner.config, "config")?.protected;
        if protected && !lock_mutex(&self.inner.hooks, "hooks")?.on_error {
            return Err(SandboxError::Config(format!(
                "protected mode set but not defined: function {LOGD_MODULE}.{ON_ERROR} (record, error)"
            )));
        }

        restart_ticker(&self.inner)?;
        Ok(())
    }

    /// Whether `init` has completed and `close` has not been called since.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        lock_mutex(&self.inner.vm, "vm").map_or(false, |vm| vm.is_some())
    }

    /// Whether hook dispatch runs in protected mode. Toggled by the script
    /// through `config_set("protected", …)`.
    #[must_use]
    pub fn protected_mode(&self) -> bool {
        lock_mutex(&self.inner.config, "config").map_or(false, |c| c.protected)
    }

    /// Path of the currently loaded script, if any. This is what a reload
    /// re-initializes from.
    #[must_use]
    pub fn script_path(&self) -> Option<PathBuf> {
        lock_mutex(&self.inner.script, "script")
            .ok()
            .and_then(|s| s.clone())
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> SandboxConfig {
        lock_mutex(&self.inner.config, "config")
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Invoke `on_log` with the given record.
    ///
    /// # Errors
    ///
    /// Fails when `on_log` is not defined, the sandbox is uninitialized, or
    /// the hook raises.
    pub fn call_on_log(&self, record: &RecordHandle) -> Result<(), SandboxError> {
        if !lock_mutex(&self.inner.hooks, "hooks")?.on_log {
            return Err(SandboxError::HookNotDefined(ON_LOG));
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let vm = guard.as_mut().ok_or(SandboxError::Uninitialized)?;
        vm.call(ON_LOG, (record.clone(),))
    }

    /// Invoke `on_log`, routing catchable script errors to `on_error`
    /// instead of surfacing them. Unrecoverable engine errors still
    /// propagate.
    ///
    /// # Errors
    ///
    /// Fails when `on_log` is not defined, when a script error occurs and
    /// `on_error` is not defined, or on an unrecoverable engine error.
    pub fn protected_call_on_log(&self, record: &RecordHandle) -> Result<(), SandboxError> {
        let hooks = *lock_mutex(&self.inner.hooks, "hooks")?;
        if !hooks.on_log {
            return Err(SandboxError::HookNotDefined(ON_LOG));
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let vm = guard.as_mut().ok_or(SandboxError::Uninitialized)?;
        protected_dispatch(vm, hooks, ON_LOG, record)
    }

    /// Invoke `on_tick` when the script defines it.
    ///
    /// # Errors
    ///
    /// Fails when the sandbox is uninitialized or the hook raises.
    pub fn call_on_tick(&self) -> Result<(), SandboxError> {
        if !lock_mutex(&self.inner.hooks, "hooks")?.on_tick {
            return Ok(());
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let vm = guard.as_mut().ok_or(SandboxError::Uninitialized)?;
        vm.call(ON_TICK, ())
    }

    /// Protected-mode variant of [`Sandbox::call_on_tick`]: a catchable
    /// script error is routed to `on_error` with an empty record.
    ///
    /// # Errors
    ///
    /// Same contract as [`Sandbox::protected_call_on_log`].
    pub fn protected_call_on_tick(&self) -> Result<(), SandboxError> {
        let hooks = *lock_mutex(&self.inner.hooks, "hooks")?;
        if !hooks.on_tick {
            return Ok(());
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let vm = guard.as_mut().ok_or(SandboxError::Uninitialized)?;
        match vm.call_raw(ON_TICK, ()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_catchable() => {
                if !hooks.on_error {
                    return Err(SandboxError::HookNotDefined(ON_ERROR));
                }
                let message = format!("{ON_TICK} : {e}");
                vm.call(ON_ERROR, (RecordHandle::default(), message))
            }
            Err(e) => Err(SandboxError::Script {
                hook: ON_TICK,
                message: e.to_string(),
            }),
        }
    }

    /// Invoke `on_http_error`; silently skipped when the script does not
    /// define it or the sandbox is shutting down.
    pub(crate) fn call_on_http_error(&self, failure: &HttpError) -> Result<(), SandboxError> {
        if !lock_mutex(&self.inner.hooks, "hooks")?.on_http_error {
            return Ok(());
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let Some(vm) = guard.as_mut() else {
            return Ok(());
        };
        vm.call(
            ON_HTTP_ERROR,
            (
                failure.url.clone(),
                failure.method.clone(),
                failure.error.clone(),
            ),
        )
    }

    /// Invoke `on_kafka_report`; silently skipped when the script does not
    /// define it or the sandbox is shutting down.
    pub(crate) fn call_on_kafka_report(&self, report: &DeliveryReport) -> Result<(), SandboxError> {
        if !lock_mutex(&self.inner.hooks, "hooks")?.on_kafka_report {
            return Ok(());
        }
        let mut guard = lock_mutex(&self.inner.vm, "vm")?;
        let Some(vm) = guard.as_mut() else {
            return Ok(());
        };
        let error_arg = report
            .error
            .clone()
            .map_or(Dynamic::UNIT, Dynamic::from);
        vm.call(ON_KAFKA_REPORT, (report.message.clone(), error_arg))
    }

    /// Flush all pending I/O: outstanding Kafka deliveries first, then the
    /// HTTP worker queues. Blocks the calling thread; must not be called
    /// from an async context.
    pub fn flush(&self) {
        if let Ok(kafka) = lock_mutex(&self.inner.kafka, "kafka") {
            if let Some(producer) = kafka.as_ref() {
                producer.flush();
            }
        }
        if let Ok(http) = lock_mutex(&self.inner.http, "http") {
            if let Some(client) = http.as_ref() {
                client.flush();
            }
        }
    }

    /// Flush pending I/O and tear everything down: producer, ticker, HTTP
    /// client and error channel, then the VM itself. `init` must be called
    /// again before further use. Blocks the calling thread; must not be
    /// called from an async context.
    pub fn close(&self) {
        debug!("closing sandbox");
        if let Ok(mut kafka) = lock_mutex(&self.inner.kafka, "kafka") {
            if let Some(producer) = kafka.take() {
                producer.close();
            }
        }
        stop_ticker(&self.inner);
        if let Ok(mut http) = lock_mutex(&self.inner.http, "http") {
            if let Some(client) = http.take() {
                client.close();
            }
        }
        if let Ok(mut vm) = lock_mutex(&self.inner.vm, "vm") {
            *vm = None;
        }
    }

    fn dispatch_tick(&self) -> Result<(), SandboxError> {
        if self.protected_mode() {
            self.protected_call_on_tick()
        } else {
            self.call_on_tick()
        }
    }
}

fn protected_dispatch(
    vm: &mut Vm,
    hooks: HookSet,
    hook: &'static str,
    record: &RecordHandle,
) -> Result<(), SandboxError> {
    match vm.call_raw(hook, (record.clone(),)) {
        Ok(()) => Ok(()),
        Err(e) if e.is_catchable() => {
            if !hooks.on_error {
                return Err(SandboxError::HookNotDefined(ON_ERROR));
            }
            let message = format!("{hook} : {e}");
            vm.call(ON_ERROR, (record.clone(), message))
        }
        Err(e) => Err(SandboxError::Script {
            hook,
            message: e.to_string(),
        }),
    }
}

pub(crate) fn lock_mutex<'a, T>(
    mutex: &'a Mutex<T>,
    name: &'static str,
) -> Result<MutexGuard<'a, T>, SandboxError> {
    mutex.lock().map_err(|_| SandboxError::Poisoned(name))
}

fn build_vm(inner: &Arc<Inner>, script: &Path) -> Result<Vm, SandboxError> {
    let mut engine = Engine::new();

    engine.register_type_with_name::<RecordHandle>("Record");
    engine.register_type_with_name::<KafkaOffset>("KafkaOffset");
    engine.register_type_with_name::<KafkaMessage>("KafkaMessage");
    engine.register_get("key", |m: &mut KafkaMessage| m.key.clone());
    engine.register_get("value", |m: &mut KafkaMessage| m.value.clone());
    engine.register_get("topic", |m: &mut KafkaMessage| m.topic.clone());
    engine.register_get("partition", |m: &mut KafkaMessage| i64::from(m.partition));
    engine.register_get("offset", |m: &mut KafkaMessage| m.offset);

    // the builtins hold a weak capability handle back into the sandbox;
    // it dies with the sandbox, never the other way around
    let module = builtins::logd_module(Arc::downgrade(inner));
    engine.register_static_module(LOGD_MODULE, module.into());

    // let scripts import modules relative to their own directory
    let script_dir = script.parent().map_or_else(PathBuf::new, Path::to_path_buf);
    let script_dir = std::fs::canonicalize(&script_dir).unwrap_or(script_dir);
    engine.set_module_resolver(FileModuleResolver::new_with_path(script_dir));

    let ast = engine
        .compile_file(script.to_path_buf())
        .map_err(|e| SandboxError::Load {
            path: script.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(Vm {
        engine,
        ast,
        scope: Scope::new(),
    })
}

// ── collaborators reached from the builtins ─────────────────────────────

/// Initialize the HTTP client from the current configuration when absent,
/// wiring its error channel into an `on_http_error` poller task.
pub(crate) fn ensure_http(inner: &Arc<Inner>) -> Result<(), SandboxError> {
    let mut slot = lock_mutex(&inner.http, "http")?;
    if slot.is_some() {
        return Ok(());
    }
    let cfg = lock_mutex(&inner.config, "config")?.http.clone();
    let (client, errors) = AsyncHttpClient::new(cfg, inner.handle.clone())?;
    *slot = Some(client);
    spawn_http_error_poller(inner, errors);
    Ok(())
}

/// Tear down and rebuild a live HTTP client after a configuration change.
/// A client that was never initialized picks the new configuration up on
/// first use.
pub(crate) fn reinit_http(inner: &Arc<Inner>) -> Result<(), SandboxError> {
    {
        let mut slot = lock_mutex(&inner.http, "http")?;
        match slot.take() {
            Some(client) => client.close(),
            None => return Ok(()),
        }
    }
    ensure_http(inner)
}

fn spawn_http_error_poller(inner: &Arc<Inner>, mut errors: mpsc::UnboundedReceiver<HttpError>) {
    let weak = Arc::downgrade(inner);
    inner.handle.spawn(async move {
        while let Some(failure) = errors.recv().await {
            let Some(inner) = weak.upgrade() else { return };
            let sandbox = Sandbox { inner };
            let outcome =
                tokio::task::spawn_blocking(move || sandbox.call_on_http_error(&failure)).await;
            if let Ok(Err(e)) = outcome {
                error!(error = %e, "on_http_error hook failed");
            }
        }
    });
}

/// Initialize the Kafka producer from the accumulated configuration map
/// when absent, wiring its events channel into an `on_kafka_report` poller.
pub(crate) fn ensure_kafka(inner: &Arc<Inner>) -> Result<(), SandboxError> {
    let mut slot = lock_mutex(&inner.kafka, "kafka")?;
    if slot.is_some() {
        return Ok(());
    }
    let config = lock_mutex(&inner.config, "config")?.kafka.clone();
    let (producer, reports) = KafkaProducer::new(&config)?;
    *slot = Some(producer);
    spawn_kafka_report_poller(inner, reports);
    Ok(())
}

fn spawn_kafka_report_poller(
    inner: &Arc<Inner>,
    mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
) {
    let weak = Arc::downgrade(inner);
    inner.handle.spawn(async move {
        while let Some(report) = reports.recv().await {
            let Some(inner) = weak.upgrade() else { return };
            let sandbox = Sandbox { inner };
            let outcome =
                tokio::task::spawn_blocking(move || sandbox.call_on_kafka_report(&report)).await;
            if let Ok(Err(e)) = outcome {
                error!(error = %e, "on_kafka_report hook failed");
            }
        }
    });
}

/// Lazily built client for the synchronous `http_get` builtin.
pub(crate) fn blocking_http_client(
    inner: &Arc<Inner>,
) -> Result<reqwest::blocking::Client, SandboxError> {
    let mut slot = lock_mutex(&inner.get_client, "get_client")?;
    if slot.is_none() {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        *slot = Some(client);
    }
    Ok(slot.as_ref().expect("just set").clone())
}

/// Update the tick period and restart the ticker. Safe to call from inside
/// `on_tick`: the old ticker is signalled, not joined, and the replacement
/// only runs once the current hook releases the VM lock.
pub(crate) fn set_tick(inner: &Arc<Inner>, tick_ms: u64) -> Result<(), SandboxError> {
    lock_mutex(&inner.config, "config")?.tick_ms = tick_ms;
    restart_ticker(inner)
}

/// Enable or disable protected mode. Enabling requires the script to
/// define `on_error`.
pub(crate) fn set_protected(inner: &Arc<Inner>, enabled: bool) -> Result<(), SandboxError> {
    if enabled && !lock_mutex(&inner.hooks, "hooks")?.on_error {
        return Err(SandboxError::Config(format!(
            "protected mode set but not defined: function {LOGD_MODULE}.{ON_ERROR} (record, error)"
        )));
    }
    lock_mutex(&inner.config, "config")?.protected = enabled;
    Ok(())
}

pub(crate) fn stop_ticker(inner: &Arc<Inner>) {
    if let Ok(mut slot) = lock_mutex(&inner.ticker, "ticker") {
        if let Some(stop) = slot.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) fn restart_ticker(inner: &Arc<Inner>) -> Result<(), SandboxError> {
    stop_ticker(inner);
    let period_ms = lock_mutex(&inner.config, "config")?.tick_ms;
    if period_ms == 0 {
        return Ok(());
    }

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    *lock_mutex(&inner.ticker, "ticker")? = Some(stop_tx);

    let weak = Arc::downgrade(inner);
    inner.handle.spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the zeroth tick completes immediately; the first real one is a
        // full period out
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { return };
                    let sandbox = Sandbox { inner };
                    let outcome =
                        tokio::task::spawn_blocking(move || sandbox.dispatch_tick()).await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "on_tick failed, stopping ticker");
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "tick dispatch panicked");
                            return;
                        }
                    }
                }
                _ = &mut stop_rx => return,
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_set(script: &str) -> HookSet {
        let engine = Engine::new();
        let ast = engine.compile(script).unwrap();
        HookSet::from_ast(&ast)
    }

    #[test]
    fn hook_set_reads_defined_functions() {
        let hooks = hook_set(
            "fn on_log(rec) { }\nfn on_error(rec, err) { }\nfn helper(x) { x + 1 }",
        );
        assert!(hooks.on_log);
        assert!(hooks.on_error);
        assert!(!hooks.on_tick);
        assert!(!hooks.on_http_error);
        assert!(!hooks.on_kafka_report);
    }

    #[test]
    fn hook_set_of_empty_script_is_empty() {
        let hooks = hook_set("let x = 1;");
        assert!(!hooks.on_log);
        assert!(!hooks.on_error);
    }

    #[test]
    fn uninitialized_sandbox_rejects_hooks() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let sandbox = Sandbox::new();
        assert!(!sandbox.is_initialized());

        let record = RecordHandle::default();
        // on_log is not even defined yet
        let err = sandbox.call_on_log(&record).unwrap_err();
        assert!(matches!(err, SandboxError::HookNotDefined(ON_LOG)));
    }
}

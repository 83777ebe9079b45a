//! Sandbox runtime: evaluates one strategy once and invokes its entry points.

use anyhow::Context;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use wasmtime::{Config, Engine, Linker, Module, Store, TypedFunc};

use crate::protocol::{Message, RunRequest, SystemId};

use super::capability::{self, CapabilitySurface};
use super::config::{SandboxConfig, TickErrorPolicy};
use super::error::{describe, SandboxError};
use super::lifecycle::{Applied, Lifecycle, LifecycleError, SessionState, Transition};
use super::outbox::Outbox;

/// Optional tick entry point, `(param i64)`.
pub const ON_TICK_EXPORT: &str = "onTick";

/// Optional teardown hook, no params.
pub const TEARDOWN_EXPORT: &str = "stop";

/// Build the engine shared by every sandbox of a registry.
///
/// The engine holds compilation settings only; all strategy state lives in
/// per-session stores.
pub fn build_engine(config: &SandboxConfig) -> anyhow::Result<Engine> {
    let mut wasm = Config::new();
    wasm.consume_fuel(config.fuel_per_tick.is_some());
    Engine::new(&wasm).context("Failed to create wasm engine")
}

/// What a call to [`SandboxRuntime::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// `onTick` ran to completion.
    Completed(u64),
    /// No `onTick` export; the tick was a no-op.
    NoEntryPoint(u64),
    /// `onTick` trapped and the policy tolerated it.
    Failed(u64),
    /// `onTick` trapped and the session crashed.
    Crashed(u64),
    /// Cancellation requested or session not running; nothing happened.
    Skipped,
}

/// One strategy instance inside its own wasm store.
pub struct SandboxRuntime {
    system_id: SystemId,
    source: String,
    store: Store<CapabilitySurface>,
    on_tick: Option<TypedFunc<i64, ()>>,
    teardown: Option<TypedFunc<(), ()>>,
    lifecycle: Lifecycle,
    policy: TickErrorPolicy,
    fuel: Option<u64>,
}

impl SandboxRuntime {
    pub fn new(
        engine: &Engine,
        request: RunRequest,
        events: UnboundedSender<Message>,
        config: &SandboxConfig,
    ) -> Self {
        let RunRequest {
            system_id,
            source,
            config: strategy_config,
            meta,
        } = request;

        let outbox = Outbox::new(system_id.clone(), events);
        let surface = CapabilitySurface::new(outbox, strategy_config, &meta);

        Self {
            system_id,
            source,
            store: Store::new(engine, surface),
            on_tick: None,
            teardown: None,
            lifecycle: Lifecycle::new(),
            policy: config.tick_error_policy,
            fuel: config.fuel_per_tick,
        }
    }

    pub fn system_id(&self) -> &SystemId {
        &self.system_id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn tick_count(&self) -> u64 {
        self.lifecycle.tick_count()
    }

    pub fn cancel_requested(&self) -> bool {
        self.lifecycle.cancel_requested()
    }

    pub fn has_entry_point(&self) -> bool {
        self.on_tick.is_some()
    }

    /// Evaluate the strategy source. On failure the session is crashed and a
    /// single fatal `error` has been emitted.
    pub fn start(&mut self) -> Result<(), SandboxError> {
        if self.lifecycle.state() != SessionState::Idle {
            return Err(LifecycleError::InvalidTransition {
                from: self.lifecycle.state(),
                transition: Transition::Run,
            }
            .into());
        }

        match self.evaluate() {
            Ok(()) => {
                self.lifecycle.apply(Transition::Run)?;
                info!(
                    system_id = %self.system_id,
                    on_tick = self.on_tick.is_some(),
                    teardown = self.teardown.is_some(),
                    "Strategy evaluated"
                );
                Ok(())
            }
            Err(err) => {
                warn!(system_id = %self.system_id, error = %err, "Strategy failed to evaluate");
                self.crash(&err)?;
                Err(err)
            }
        }
    }

    fn evaluate(&mut self) -> Result<(), SandboxError> {
        let engine = self.store.engine().clone();
        let compile = |err: anyhow::Error| SandboxError::Compile(describe(&err));

        let module = Module::new(&engine, &self.source).map_err(compile)?;

        let mut linker = Linker::new(&engine);
        capability::link(&mut linker).map_err(compile)?;

        self.refuel().map_err(compile)?;
        self.store.data_mut().set_current_tick(0);
        let instance = linker.instantiate(&mut self.store, &module).map_err(compile)?;

        if instance.get_export(&mut self.store, ON_TICK_EXPORT).is_some() {
            let func = instance
                .get_typed_func::<i64, ()>(&mut self.store, ON_TICK_EXPORT)
                .map_err(|err| {
                    SandboxError::Compile(format!(
                        "`{ON_TICK_EXPORT}` must be a function taking one i64: {}",
                        describe(&err)
                    ))
                })?;
            self.on_tick = Some(func);
        }

        if instance.get_export(&mut self.store, TEARDOWN_EXPORT).is_some() {
            let func = instance
                .get_typed_func::<(), ()>(&mut self.store, TEARDOWN_EXPORT)
                .map_err(|err| {
                    SandboxError::Compile(format!(
                        "`{TEARDOWN_EXPORT}` must be a function without params: {}",
                        describe(&err)
                    ))
                })?;
            self.teardown = Some(func);
        }

        Ok(())
    }

    /// Run one tick.
    pub fn tick(&mut self) -> TickOutcome {
        let Some(tick) = self.lifecycle.begin_tick() else {
            return TickOutcome::Skipped;
        };
        let Some(on_tick) = self.on_tick.clone() else {
            return TickOutcome::NoEntryPoint(tick);
        };

        self.store.data_mut().set_current_tick(tick);
        let result = self
            .refuel()
            .and_then(|()| on_tick.call(&mut self.store, tick as i64));

        match result {
            Ok(()) => {
                self.store.data_mut().outbox_mut().tick(tick);
                TickOutcome::Completed(tick)
            }
            Err(trap) => {
                let err = SandboxError::Tick {
                    tick,
                    message: describe(&trap),
                };
                match self.policy {
                    TickErrorPolicy::Tolerate => {
                        warn!(system_id = %self.system_id, error = %err, "Tick failed, continuing");
                        self.store
                            .data_mut()
                            .outbox_mut()
                            .error(err.to_string(), false);
                        TickOutcome::Failed(tick)
                    }
                    TickErrorPolicy::Fatal => {
                        error!(system_id = %self.system_id, error = %err, "Tick failed, crashing session");
                        if let Err(e) = self.crash(&err) {
                            error!(system_id = %self.system_id, error = %e, "Crash transition rejected");
                        }
                        TickOutcome::Crashed(tick)
                    }
                }
            }
        }
    }

    /// Request a graceful halt. Returns `true` only for the first request.
    pub fn request_stop(&mut self) -> bool {
        match self.lifecycle.apply(Transition::Stop) {
            Ok(Applied::Changed { .. }) => {
                info!(system_id = %self.system_id, ticks = self.tick_count(), "Stop requested");
                true
            }
            Ok(Applied::Ignored) => {
                debug!(system_id = %self.system_id, "Duplicate stop ignored");
                false
            }
            Err(err) => {
                warn!(system_id = %self.system_id, error = %err, "Stop rejected");
                false
            }
        }
    }

    /// Finish a stopping session: run the teardown hook and emit `stopped`.
    ///
    /// A still-running session is asked to stop first. Crashed sessions are
    /// left as they are.
    pub fn finish(mut self) -> SessionState {
        if self.lifecycle.state() == SessionState::Running {
            self.request_stop();
        }
        if self.lifecycle.state() != SessionState::Stopping {
            return self.lifecycle.state();
        }

        if let Some(hook) = self.teardown.clone() {
            let tick = self.tick_count();
            self.store.data_mut().set_current_tick(tick);
            let result = self.refuel().and_then(|()| hook.call(&mut self.store, ()));
            if let Err(trap) = result {
                let err = SandboxError::Teardown(describe(&trap));
                warn!(system_id = %self.system_id, error = %err, "Teardown hook failed");
                self.store
                    .data_mut()
                    .outbox_mut()
                    .error(err.to_string(), false);
            }
        }

        if let Err(err) = self.lifecycle.apply(Transition::Drained) {
            error!(system_id = %self.system_id, error = %err, "Drain transition rejected");
            return self.lifecycle.state();
        }
        self.store.data_mut().outbox_mut().stopped();

        info!(system_id = %self.system_id, ticks = self.tick_count(), "Strategy stopped");
        self.lifecycle.state()
    }

    fn crash(&mut self, err: &SandboxError) -> Result<(), SandboxError> {
        self.lifecycle.apply(Transition::Crash)?;
        self.store
            .data_mut()
            .outbox_mut()
            .error(err.to_string(), true);
        Ok(())
    }

    fn refuel(&mut self) -> wasmtime::Result<()> {
        match self.fuel {
            Some(fuel) => self.store.set_fuel(fuel),
            None => Ok(()),
        }
    }
}

/// Static facts about a strategy module, gathered without running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    /// `module::name` of every import
    pub imports: Vec<String>,
    pub on_tick: bool,
    pub teardown: bool,
}

/// Compile a source and report its imports and entry points. Imports outside
/// the capability surface are a compile error, as they would be at `run`.
pub fn inspect_source(engine: &Engine, source: &str) -> Result<SourceSummary, SandboxError> {
    let module = Module::new(engine, source).map_err(|err| SandboxError::Compile(describe(&err)))?;

    let imports: Vec<String> = module
        .imports()
        .map(|import| format!("{}::{}", import.module(), import.name()))
        .collect();
    if let Some(foreign) = module
        .imports()
        .find(|import| import.module() != capability::HOST_MODULE)
    {
        return Err(SandboxError::Compile(format!(
            "import `{}::{}` is outside the capability surface",
            foreign.module(),
            foreign.name()
        )));
    }

    let exports: Vec<&str> = module.exports().map(|export| export.name()).collect();
    Ok(SourceSummary {
        imports,
        on_tick: exports.contains(&ON_TICK_EXPORT),
        teardown: exports.contains(&TEARDOWN_EXPORT),
    })
}

/// Run request with no config or metadata.
#[cfg(test)]
pub fn bare_request(system_id: impl Into<SystemId>, source: impl Into<String>) -> RunRequest {
    RunRequest {
        system_id: system_id.into(),
        source: source.into(),
        config: serde_json::Map::new(),
        meta: serde_json::Value::Null,
    }
}

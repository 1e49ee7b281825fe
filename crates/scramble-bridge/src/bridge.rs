//! Public surface of the bridge: load, readiness, invoke, shutdown.
//!
//! One `ModuleBridge` owns exactly one module instance. The instance lives
//! on a dedicated driver thread that executes one command at a time (invoke,
//! scheduled resumption, shutdown), which preserves the module's
//! single-turn cooperative execution model without any locking around guest
//! state. The async methods talk to the driver over channels.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{BridgeConfig, ENTRY_SELF_TEST, ENTRY_TRANSFORM};
use crate::error::{BridgeError, Result};
use crate::host::{HostState, ResumeScheduler, StreamSinks};
use crate::loader::{ImageSource, ModuleLoader, RunningInstance};
use crate::readiness::{ReadinessGate, ReadinessState};
use crate::registry::{EntryPointRegistry, EntryToken};

enum DriverCommand {
    Invoke {
        token: EntryToken,
        args: Vec<String>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Resume,
    Shutdown {
        reply: oneshot::Sender<Option<i32>>,
    },
}

/// Handle to one hosted module instance.
///
/// Dropping the bridge tears the instance down; `shutdown` does the same
/// while also reporting the module's exit code.
pub struct ModuleBridge {
    registry: Arc<EntryPointRegistry>,
    state_rx: watch::Receiver<ReadinessState>,
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
    closed: AtomicBool,
}

impl ModuleBridge {
    /// Fetch a module image, start it on a dedicated driver thread, and
    /// begin the readiness handshake.
    ///
    /// Fatal load problems (fetch, link, instantiation) surface here. The
    /// readiness verdict arrives asynchronously; observe it with
    /// [`is_ready`](Self::is_ready) or [`wait_ready`](Self::wait_ready).
    pub async fn load(source: ImageSource, config: BridgeConfig) -> Result<Self> {
        Self::load_with(source, config, StreamSinks::default()).await
    }

    /// Same as [`load`](Self::load) with caller-provided output sinks.
    pub async fn load_with(
        source: ImageSource,
        config: BridgeConfig,
        sinks: StreamSinks,
    ) -> Result<Self> {
        let loader = ModuleLoader::new(config.clone())?;
        // fetch failures leave the lifecycle in Loading: nothing started
        let image = loader.fetch(&source).await?;

        let registry = Arc::new(EntryPointRegistry::new());
        let (state_tx, state_rx) = watch::channel(ReadinessState::Loading);
        let state_tx = Arc::new(state_tx);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let scheduler = {
            let handle = Handle::current();
            // weak: a strong sender parked inside the store would keep the
            // command channel open after the bridge handle is gone
            let resume_tx = cmd_tx.downgrade();
            ResumeScheduler::new(move |delay| {
                let resume_tx = resume_tx.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = resume_tx.upgrade() {
                        let _ = tx.send(DriverCommand::Resume);
                    }
                });
            })
        };

        let host_state =
            HostState::new(Arc::clone(&registry), sinks, scheduler, config.max_memory);

        let (init_tx, init_rx) = oneshot::channel();
        let driver_state = Arc::clone(&state_tx);
        thread::Builder::new()
            .name("scramble-driver".to_string())
            .spawn(move || match loader.instantiate(&image, host_state) {
                Ok(instance) => {
                    if init_tx.send(Ok(())).is_err() {
                        return;
                    }
                    drive(instance, cmd_rx, driver_state);
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| {
                BridgeError::InstantiationError(format!("driver thread spawn failed: {e}"))
            })?;

        init_rx.await.map_err(|_| {
            BridgeError::InstantiationError("driver exited during startup".to_string())
        })??;

        advance(&state_tx, ReadinessState::WaitingForEntryPoints);

        // the gate polls beside other host work, never blocking it
        let gate = ReadinessGate::from_config(&config);
        let gate_registry = Arc::clone(&registry);
        let gate_state = Arc::clone(&state_tx);
        tokio::spawn(async move {
            match gate.wait(&gate_registry).await {
                Ok(attempts) => {
                    tracing::info!(attempts, "module ready");
                    advance(&gate_state, ReadinessState::Ready);
                }
                Err(e) => {
                    tracing::error!(error = %e, "module never became ready");
                    advance(&gate_state, ReadinessState::Failed(e.to_string()));
                }
            }
        });

        Ok(Self {
            registry,
            state_rx,
            cmd_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the bridge accepts invokes right now.
    pub fn is_ready(&self) -> bool {
        self.state_rx.borrow().is_ready()
    }

    /// Current lifecycle state.
    pub fn readiness(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Entry point names the module has registered so far.
    pub fn entry_points(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Wait for the readiness verdict: `Ok` once ready, the terminal
    /// failure otherwise.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ReadinessState::Ready => return Ok(()),
                ReadinessState::Failed(_) => return Err(BridgeError::NotReady(state)),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(BridgeError::ShutDown);
            }
        }
    }

    /// Call a registered entry point with JSON argument values.
    ///
    /// String arguments pass through verbatim, other values travel as their
    /// JSON text. Fails with `NotReady` before the bridge is ready and
    /// `UnknownEntryPoint` for names the module never registered.
    pub async fn invoke(&self, name: &str, args: &[Value]) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }
        let state = self.state_rx.borrow().clone();
        if !state.is_ready() {
            return Err(BridgeError::NotReady(state));
        }
        let token = self
            .registry
            .lookup(name)
            .ok_or_else(|| BridgeError::UnknownEntryPoint(name.to_string()))?;

        let args = args
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCommand::Invoke {
                token,
                args,
                reply: reply_tx,
            })
            .map_err(|_| BridgeError::ShutDown)?;
        reply_rx.await.map_err(|_| BridgeError::ShutDown)?
    }

    /// Run the module's transform entry point on `source_text`.
    ///
    /// `options_json` is handed to the module untouched; the bridge performs
    /// no validation on its contents.
    pub async fn transform(&self, source_text: &str, options_json: &str) -> Result<TransformOutcome> {
        let value = self
            .invoke(
                ENTRY_TRANSFORM,
                &[
                    Value::String(source_text.to_string()),
                    Value::String(options_json.to_string()),
                ],
            )
            .await?;
        TransformOutcome::from_value(value)
    }

    /// Run the module's self test and return its diagnostic value.
    pub async fn self_test(&self) -> Result<Value> {
        self.invoke(ENTRY_SELF_TEST, &[]).await
    }

    /// Stop accepting new invokes immediately, let queued calls finish,
    /// then tear the instance down and release its memory. Returns the exit
    /// code the module reported, if it reported one.
    pub async fn shutdown(&self) -> Result<Option<i32>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::ShutDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCommand::Shutdown { reply: reply_tx })
            .map_err(|_| BridgeError::ShutDown)?;
        reply_rx.await.map_err(|_| BridgeError::ShutDown)
    }
}

impl Drop for ModuleBridge {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // nobody waits for the verdict; the command alone stops the driver
        let (reply, _) = oneshot::channel();
        let _ = self.cmd_tx.send(DriverCommand::Shutdown { reply });
    }
}

impl fmt::Debug for ModuleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBridge")
            .field("state", &*self.state_rx.borrow())
            .field("entry_points", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Advance the lifecycle. `Failed` is sticky: a dead instance never comes
/// back, not even when a late readiness verdict says otherwise.
fn advance(state: &watch::Sender<ReadinessState>, next: ReadinessState) {
    state.send_modify(|current| {
        if !current.is_failed() {
            *current = next;
        }
    });
}

/// Driver loop owning the store. One command at a time: the module runs one
/// logical turn per command and never concurrently with itself.
fn drive(
    mut instance: RunningInstance,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    state: Arc<watch::Sender<ReadinessState>>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            DriverCommand::Invoke { token, args, reply } => {
                if state.borrow().is_failed() {
                    let _ = reply.send(Err(BridgeError::NotReady(state.borrow().clone())));
                    continue;
                }
                let result = instance.dispatch(token, &args);
                if let Err(e) = &result {
                    if e.is_instance_fatal() {
                        tracing::error!(error = %e, "module instance failed");
                        advance(&state, ReadinessState::Failed(e.to_string()));
                    }
                }
                let _ = reply.send(result);
            }
            DriverCommand::Resume => {
                if state.borrow().is_failed() {
                    continue;
                }
                if let Err(e) = instance.resume() {
                    tracing::error!(error = %e, "module fault during scheduled resumption");
                    advance(&state, ReadinessState::Failed(e.to_string()));
                }
            }
            DriverCommand::Shutdown { reply } => {
                let _ = reply.send(instance.exit_code());
                break;
            }
        }
    }
    // the store, and with it the module's memory, drops here
    tracing::debug!("driver thread exiting");
}

/// Validated outcome of the module's transform entry point.
///
/// The module answers with a `{success, output|error, stats}` object; the
/// bridge checks that shape at the boundary instead of trusting it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// The module produced transformed source
    Success {
        /// Transformed source text
        output: String,
        /// Module-reported statistics, passed through untouched
        stats: Value,
    },
    /// The module reported a transform failure
    Failure {
        /// Module-reported reason
        error: String,
    },
}

impl TransformOutcome {
    /// Validate a raw module result.
    pub fn from_value(value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| BridgeError::MalformedResult("result is not an object".to_string()))?;
        let success = object
            .get("success")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                BridgeError::MalformedResult("result lacks a boolean success field".to_string())
            })?;
        if success {
            let output = object.get("output").and_then(Value::as_str).ok_or_else(|| {
                BridgeError::MalformedResult(
                    "successful result lacks a string output field".to_string(),
                )
            })?;
            Ok(TransformOutcome::Success {
                output: output.to_string(),
                stats: object.get("stats").cloned().unwrap_or(Value::Null),
            })
        } else {
            let error = object
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("module reported failure without a reason")
                .to_string();
            Ok(TransformOutcome::Failure { error })
        }
    }
}

//! Module image retrieval and instantiation.

use std::fmt;
use std::path::PathBuf;

use wasmtime::{Config, Engine, Linker, Module, OptLevel, Store, TypedFunc};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::host::{HostFunctions, HostState};
use crate::memory::MemoryView;
use crate::registry::EntryToken;

/// Where a module image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Fetch over HTTP(S)
    Url(String),
    /// Read from the local filesystem
    File(PathBuf),
    /// Bytes already in hand
    Bytes(Vec<u8>),
}

impl ImageSource {
    /// Interpret a locator string: URLs stay URLs, everything else is a
    /// file path.
    pub fn from_locator(locator: &str) -> Self {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            ImageSource::Url(locator.to_string())
        } else {
            ImageSource::File(PathBuf::from(locator))
        }
    }
}

/// Fetches module images and turns them into running instances.
pub struct ModuleLoader {
    engine: Engine,
    config: BridgeConfig,
}

impl ModuleLoader {
    /// Build a loader (and its engine) from a bridge config.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let mut engine_config = Config::new();
        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::InstantiationError(format!("engine creation failed: {e}")))?;

        Ok(Self { engine, config })
    }

    /// Retrieve the module image. The image is immutable once fetched; any
    /// retrieval failure, including a non-success HTTP status, is
    /// `FetchFailed`.
    pub async fn fetch(&self, source: &ImageSource) -> Result<Vec<u8>> {
        match source {
            ImageSource::Url(url) => {
                tracing::debug!(url, "fetching module image");
                let response = reqwest::get(url)
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| BridgeError::FetchFailed(format!("{url}: {e}")))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| BridgeError::FetchFailed(format!("{url}: {e}")))?;
                Ok(bytes.to_vec())
            }
            ImageSource::File(path) => {
                tracing::debug!(path = %path.display(), "reading module image");
                tokio::fs::read(path)
                    .await
                    .map_err(|e| BridgeError::FetchFailed(format!("{}: {e}", path.display())))
            }
            ImageSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// Link the image against the host function table, instantiate it, and
    /// run its entry routine.
    ///
    /// A malformed image is `InstantiationError`; an import the table does
    /// not provide, or a missing required export, is `LinkError` (an
    /// incompatible module build); a fault inside the entry routine is
    /// `InstantiationError` since the module never reached a runnable state.
    pub fn instantiate(&self, image: &[u8], state: HostState) -> Result<RunningInstance> {
        let module = Module::new(&self.engine, image)
            .map_err(|e| BridgeError::InstantiationError(format!("module creation failed: {e}")))?;

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::InstantiationError(format!("fuel setup failed: {e}")))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        HostFunctions::register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| BridgeError::LinkError(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::LinkError("module exports no linear memory".to_string()))?;

        let dispatch = instance
            .get_typed_func::<(i32, i32, i32), i64>(&mut store, &self.config.dispatch_export)
            .map_err(|e| {
                BridgeError::LinkError(format!(
                    "missing dispatch export {:?}: {e}",
                    self.config.dispatch_export
                ))
            })?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, &self.config.alloc_export)
            .map_err(|e| {
                BridgeError::LinkError(format!(
                    "missing allocator export {:?}: {e}",
                    self.config.alloc_export
                ))
            })?;
        let resume = instance
            .get_typed_func::<(), ()>(&mut store, &self.config.resume_export)
            .ok();
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, &self.config.entry_export)
            .map_err(|e| {
                BridgeError::LinkError(format!(
                    "missing entry export {:?}: {e}",
                    self.config.entry_export
                ))
            })?;

        tracing::info!(image_size = image.len(), "module instantiated, starting entry routine");
        entry
            .call(&mut store, ())
            .map_err(|e| BridgeError::InstantiationError(format!("entry routine faulted: {e}")))?;

        Ok(RunningInstance {
            store,
            memory: MemoryView::new(memory),
            dispatch,
            alloc,
            resume,
        })
    }
}

/// A live module instance: the store, its memory, and the exports the
/// bridge drives. Owned by the facade's driver after instantiation.
pub struct RunningInstance {
    store: Store<HostState>,
    memory: MemoryView,
    dispatch: TypedFunc<(i32, i32, i32), i64>,
    alloc: TypedFunc<i32, i32>,
    resume: Option<TypedFunc<(), ()>>,
}

impl RunningInstance {
    /// Call the module's scheduler re-entry export. A module without one
    /// simply never runs again until the next invoke, so this is a no-op
    /// then.
    pub fn resume(&mut self) -> Result<()> {
        let Some(resume) = self.resume.as_ref() else {
            return Ok(());
        };
        resume
            .call(&mut self.store, ())
            .map_err(|e| map_call_error(e, "resume"))
    }

    /// Invoke a registered entry point through the dispatch export and parse
    /// the JSON value it returns.
    ///
    /// Arguments travel through one guest allocation: `argc` little-endian
    /// `(ptr, len)` pairs followed by the argument bytes. The module answers
    /// with a packed pointer/length (pointer in the high 32 bits) addressing
    /// UTF-8 JSON in its memory.
    pub fn dispatch(&mut self, token: EntryToken, args: &[String]) -> Result<serde_json::Value> {
        let argv_ptr = self.marshal_args(args)?;
        let packed = self
            .dispatch
            .call(&mut self.store, (token.0, argv_ptr, args.len() as i32))
            .map_err(|e| map_call_error(e, "dispatch"))?;

        let ptr = ((packed as u64) >> 32) as u32;
        let len = packed as u32;
        let bytes = self.memory.read_bytes(&self.store, ptr, len)?;
        let text = String::from_utf8_lossy(&bytes);
        serde_json::from_str(&text).map_err(|e| BridgeError::MalformedResult(e.to_string()))
    }

    /// Exit code the module reported through the system call surface.
    pub fn exit_code(&self) -> Option<i32> {
        self.store.data().exit_code()
    }

    fn marshal_args(&mut self, args: &[String]) -> Result<i32> {
        if args.is_empty() {
            return Ok(0);
        }

        let header_len = args.len() * 8;
        let payload_len: usize = args.iter().map(|a| a.len()).sum();
        let total = header_len + payload_len;
        if total > i32::MAX as usize {
            return Err(BridgeError::OutOfBounds {
                offset: 0,
                len: total as u64,
                size: self.memory.size(&self.store),
            });
        }

        let block = self
            .alloc
            .call(&mut self.store, total as i32)
            .map_err(|e| map_call_error(e, "alloc"))?;

        let base = block as u32;
        let mut data_offset = base.wrapping_add(header_len as u32);
        for (i, arg) in args.iter().enumerate() {
            let entry = base.wrapping_add((i * 8) as u32);
            self.memory.write_u32(&mut self.store, entry, data_offset)?;
            self.memory
                .write_u32(&mut self.store, entry + 4, arg.len() as u32)?;
            self.memory
                .write_bytes(&mut self.store, data_offset, arg.as_bytes())?;
            data_offset = data_offset.wrapping_add(arg.len() as u32);
        }
        Ok(block)
    }
}

impl fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningInstance")
            .field("resumable", &self.resume.is_some())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

/// Recover the precise bridge error when a host function raised it,
/// otherwise report the trap as a module fault.
fn map_call_error(err: wasmtime::Error, during: &str) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(err) => BridgeError::ModuleFault(format!("{during}: {err}")),
    }
}

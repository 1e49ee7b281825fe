//! Host functions for the sandboxed transform module.
//!
//! The module gets no ambient OS access. Everything it can do to the outside
//! world goes through the functions registered here: stream output, clocks,
//! randomness, exit reporting, entry point registration, and deferred
//! resumption of its internal scheduler. System calls the host does not
//! support resolve to an inert success value instead of failing, so the
//! module keeps running on a host that offers it nothing.
//!
//! ## Import Modules
//!
//! The system call surface lives under `wasi_snapshot_preview1`, the runtime
//! surface under `scramble_rt`:
//!
//! ```wat
//! (import "wasi_snapshot_preview1" "fd_write"
//!     (func $fd_write (param i32 i32 i32 i32) (result i32)))
//! (import "scramble_rt" "register_entry"
//!     (func $register_entry (param i32 i32)))
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use wasmtime::{Caller, Linker, StoreLimits, StoreLimitsBuilder};

use crate::error::{BridgeError, Result};
use crate::memory::MemoryView;
use crate::registry::{EntryPointRegistry, EntryToken};

/// Import namespace for the system call surface.
pub const SYSCALL_NAMESPACE: &str = "wasi_snapshot_preview1";

/// Import namespace for the runtime surface.
pub const RUNTIME_NAMESPACE: &str = "scramble_rt";

const ERRNO_SUCCESS: i32 = 0;

/// Destinations for the module's output streams.
///
/// Stream 1 is standard output, stream 2 is diagnostic output. The defaults
/// route both through `tracing` under the `module` target.
pub struct StreamSinks {
    /// Receives standard output chunks
    pub stdout: Box<dyn FnMut(&str) + Send>,
    /// Receives diagnostic output chunks
    pub diagnostic: Box<dyn FnMut(&str) + Send>,
}

impl Default for StreamSinks {
    fn default() -> Self {
        Self {
            stdout: Box::new(|chunk| tracing::info!(target: "module", "{}", chunk.trim_end())),
            diagnostic: Box::new(|chunk| tracing::warn!(target: "module", "{}", chunk.trim_end())),
        }
    }
}

impl StreamSinks {
    /// Sinks that append into shared buffers instead of logging, for callers
    /// that want to capture module output.
    pub fn captured() -> (Self, Arc<Mutex<String>>, Arc<Mutex<String>>) {
        let stdout = Arc::new(Mutex::new(String::new()));
        let diagnostic = Arc::new(Mutex::new(String::new()));
        let stdout_writer = Arc::clone(&stdout);
        let diagnostic_writer = Arc::clone(&diagnostic);
        let sinks = Self {
            stdout: Box::new(move |chunk| stdout_writer.lock().push_str(chunk)),
            diagnostic: Box::new(move |chunk| diagnostic_writer.lock().push_str(chunk)),
        };
        (sinks, stdout, diagnostic)
    }
}

/// Capability that re-enters the module's internal scheduler after a delay.
///
/// The module never blocks; when it wants to run again later it asks the
/// host for a deferred resumption. Each request arms an independent timer,
/// requests never cancel each other, and requests with equal delays may fire
/// in any order. Injected so tests can swap the host event loop for a
/// recording fake.
#[derive(Clone)]
pub struct ResumeScheduler {
    inner: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl ResumeScheduler {
    /// Wrap a scheduling function.
    pub fn new(schedule: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(schedule),
        }
    }

    /// Request one resumption after `delay`.
    pub fn schedule(&self, delay: Duration) {
        (self.inner)(delay);
    }
}

/// Host-side state carried in the store of one module instance.
pub struct HostState {
    pub(crate) registry: Arc<EntryPointRegistry>,
    pub(crate) sinks: StreamSinks,
    pub(crate) scheduler: ResumeScheduler,
    pub(crate) exit_code: Option<i32>,
    pub(crate) started: Instant,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    /// Build state for a new instance.
    pub fn new(
        registry: Arc<EntryPointRegistry>,
        sinks: StreamSinks,
        scheduler: ResumeScheduler,
        max_memory: usize,
    ) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if max_memory > 0 {
            limits = limits.memory_size(max_memory);
        }
        Self {
            registry,
            sinks,
            scheduler,
            exit_code: None,
            started: Instant::now(),
            limits: limits.build(),
        }
    }

    /// Exit code the module reported, if it reported one.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

/// Host functions exposed to the module.
///
/// Marker struct organizing registration on the linker; the table is built
/// once per instance and immutable after linking.
pub struct HostFunctions;

impl HostFunctions {
    /// Register the full host function table with the wasmtime linker.
    pub fn register(linker: &mut Linker<HostState>) -> Result<()> {
        // System call surface
        Self::register_fd_write(linker)?;
        Self::register_clock(linker)?;
        Self::register_random(linker)?;
        Self::register_exit(linker)?;
        Self::register_inert_stubs(linker)?;

        // Runtime surface
        Self::register_entry_registration(linker)?;
        Self::register_resume_scheduling(linker)?;

        Ok(())
    }

    /// `fd_write(fd, iovs, iovs_len, nwritten) -> errno`
    ///
    /// Gathers the iovec chunks, decodes each as UTF-8, and delivers them to
    /// the sink selected by `fd` (1 = stdout, 2 = diagnostic). Unknown
    /// stream ids are dropped without an error so the module never sees a
    /// failed write on a stream the host does not carry.
    fn register_fd_write(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "fd_write",
                |mut caller: Caller<'_, HostState>,
                 fd: i32,
                 iovs_ptr: i32,
                 iovs_len: i32,
                 nwritten_ptr: i32| {
                    let view = memory_view(&mut caller)?;
                    let array = view.read_bytes(
                        &caller,
                        iovs_ptr as u32,
                        (iovs_len as u32).saturating_mul(8),
                    )?;

                    let mut chunks = Vec::with_capacity(array.len() / 8);
                    let mut total: u32 = 0;
                    for pair in array.chunks_exact(8) {
                        let data_ptr =
                            u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                        let data_len =
                            u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                        let bytes = view.read_bytes(&caller, data_ptr, data_len)?;
                        chunks.push(String::from_utf8_lossy(&bytes).into_owned());
                        total = total.saturating_add(data_len);
                    }

                    let state = caller.data_mut();
                    match fd {
                        1 => {
                            for chunk in &chunks {
                                (state.sinks.stdout)(chunk);
                            }
                        }
                        2 => {
                            for chunk in &chunks {
                                (state.sinks.diagnostic)(chunk);
                            }
                        }
                        other => {
                            tracing::trace!(fd = other, "write to unknown stream dropped");
                        }
                    }

                    view.write_u32(&mut caller, nwritten_ptr as u32, total)?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register fd_write: {e}")))?;
        Ok(())
    }

    /// `clock_time_get(id, precision, time_ptr) -> errno`
    ///
    /// Clock 0 is host wall time in nanoseconds, with no monotonicity
    /// promise beyond the host clock's own. Clock 1 is a monotonically
    /// non-decreasing tick counter measured from instance start, an
    /// independent unit from wall time. Other clock ids write zero.
    fn register_clock(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "clock_time_get",
                |mut caller: Caller<'_, HostState>,
                 clock_id: i32,
                 _precision: i64,
                 time_ptr: i32| {
                    let nanos: u64 = match clock_id {
                        0 => SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_nanos() as u64)
                            .unwrap_or(0),
                        1 => caller.data().started.elapsed().as_nanos() as u64,
                        _ => 0,
                    };
                    let view = memory_view(&mut caller)?;
                    view.write_u64(&mut caller, time_ptr as u32, nanos)?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| {
                BridgeError::LinkError(format!("failed to register clock_time_get: {e}"))
            })?;
        Ok(())
    }

    /// `random_get(buf, len) -> errno`
    ///
    /// Fills module memory from the host's cryptographic source. A source
    /// failure traps the instance.
    fn register_random(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "random_get",
                |mut caller: Caller<'_, HostState>, buf_ptr: i32, buf_len: i32| {
                    let view = memory_view(&mut caller)?;
                    view.fill_random(&mut caller, buf_ptr as u32, buf_len as u32)?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register random_get: {e}")))?;
        Ok(())
    }

    /// `proc_exit(code)`
    ///
    /// Records the module's self-reported exit code and returns. Teardown
    /// stays with the bridge facade.
    fn register_exit(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "proc_exit",
                |mut caller: Caller<'_, HostState>, code: i32| {
                    tracing::info!(code, "module reported exit");
                    caller.data_mut().exit_code = Some(code);
                },
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register proc_exit: {e}")))?;
        Ok(())
    }

    /// System calls the host does not support.
    ///
    /// Each returns errno 0 without doing anything; the `*_sizes_get` pair
    /// additionally writes zero counts through its out-pointers so callers
    /// iterating the results see an empty set.
    fn register_inert_stubs(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "fd_read",
                |_fd: i32, _iovs: i32, _iovs_len: i32, _nread: i32| ERRNO_SUCCESS,
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register fd_read: {e}")))?;
        linker
            .func_wrap(SYSCALL_NAMESPACE, "fd_close", |_fd: i32| ERRNO_SUCCESS)
            .map_err(|e| BridgeError::LinkError(format!("failed to register fd_close: {e}")))?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "fd_seek",
                |_fd: i32, _offset: i64, _whence: i32, _newoffset: i32| ERRNO_SUCCESS,
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register fd_seek: {e}")))?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "path_open",
                |_fd: i32,
                 _dirflags: i32,
                 _path: i32,
                 _path_len: i32,
                 _oflags: i32,
                 _rights_base: i64,
                 _rights_inheriting: i64,
                 _fdflags: i32,
                 _opened_fd: i32| ERRNO_SUCCESS,
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register path_open: {e}")))?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "environ_sizes_get",
                |mut caller: Caller<'_, HostState>, count_ptr: i32, size_ptr: i32| {
                    let view = memory_view(&mut caller)?;
                    view.write_u32(&mut caller, count_ptr as u32, 0)?;
                    view.write_u32(&mut caller, size_ptr as u32, 0)?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| {
                BridgeError::LinkError(format!("failed to register environ_sizes_get: {e}"))
            })?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "environ_get",
                |_environ: i32, _buf: i32| ERRNO_SUCCESS,
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register environ_get: {e}")))?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "args_sizes_get",
                |mut caller: Caller<'_, HostState>, count_ptr: i32, size_ptr: i32| {
                    let view = memory_view(&mut caller)?;
                    view.write_u32(&mut caller, count_ptr as u32, 0)?;
                    view.write_u32(&mut caller, size_ptr as u32, 0)?;
                    Ok(ERRNO_SUCCESS)
                },
            )
            .map_err(|e| {
                BridgeError::LinkError(format!("failed to register args_sizes_get: {e}"))
            })?;
        linker
            .func_wrap(
                SYSCALL_NAMESPACE,
                "args_get",
                |_argv: i32, _argv_buf: i32| ERRNO_SUCCESS,
            )
            .map_err(|e| BridgeError::LinkError(format!("failed to register args_get: {e}")))?;
        Ok(())
    }

    /// `register_entry(name_ptr, token)`
    ///
    /// The module announces one of its entry points: `name_ptr` addresses a
    /// NUL-terminated name in module memory, `token` is whatever value the
    /// module wants handed back through its dispatch export.
    fn register_entry_registration(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                RUNTIME_NAMESPACE,
                "register_entry",
                |mut caller: Caller<'_, HostState>, name_ptr: i32, token: i32| {
                    let view = memory_view(&mut caller)?;
                    let name = view.read_c_string(&caller, name_ptr as u32)?;
                    caller.data().registry.register(name, EntryToken(token));
                    Ok(())
                },
            )
            .map_err(|e| {
                BridgeError::LinkError(format!("failed to register register_entry: {e}"))
            })?;
        Ok(())
    }

    /// `schedule_resume(delay_ns)`
    ///
    /// Forwards to the injected scheduling capability. Negative delays are
    /// treated as zero.
    fn register_resume_scheduling(linker: &mut Linker<HostState>) -> Result<()> {
        linker
            .func_wrap(
                RUNTIME_NAMESPACE,
                "schedule_resume",
                |caller: Caller<'_, HostState>, delay_ns: i64| {
                    let delay = Duration::from_nanos(delay_ns.max(0) as u64);
                    caller.data().scheduler.schedule(delay);
                },
            )
            .map_err(|e| {
                BridgeError::LinkError(format!("failed to register schedule_resume: {e}"))
            })?;
        Ok(())
    }
}

/// Resolve the caller's exported memory as a view.
fn memory_view(caller: &mut Caller<'_, HostState>) -> Result<MemoryView> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .map(MemoryView::new)
        .ok_or_else(|| BridgeError::LinkError("module exports no linear memory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module, Store};

    const PROBE_MODULE: &str = r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "environ_sizes_get"
                (func $environ_sizes_get (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "clock_time_get"
                (func $clock_time_get (param i32 i64 i32) (result i32)))
            (import "wasi_snapshot_preview1" "random_get"
                (func $random_get (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit"
                (func $proc_exit (param i32)))
            (import "scramble_rt" "register_entry"
                (func $register_entry (param i32 i32)))
            (import "scramble_rt" "schedule_resume"
                (func $schedule_resume (param i64)))
            (memory (export "memory") 1)
            (data (i32.const 16) "transform\00")
            (data (i32.const 32) "hello ")
            (data (i32.const 64) "module\0a")
            ;; iovec array at 128: (ptr 32, len 6), (ptr 64, len 7)
            (data (i32.const 128) "\20\00\00\00\06\00\00\00\40\00\00\00\07\00\00\00")
            (func (export "emit") (param i32) (result i32)
                local.get 0
                i32.const 128
                i32.const 2
                i32.const 200
                call $fd_write)
            (func (export "announce")
                i32.const 16
                i32.const 41
                call $register_entry)
            (func (export "ask_resume")
                i64.const 1000000
                call $schedule_resume)
            (func (export "probe_env") (result i32)
                i32.const 240
                i32.const 244
                call $environ_sizes_get)
            (func (export "read_clock") (param i32) (result i32)
                local.get 0
                i64.const 0
                i32.const 256
                call $clock_time_get)
            (func (export "roll") (result i32)
                i32.const 512
                i32.const 32
                call $random_get)
            (func (export "quit")
                i32.const 3
                call $proc_exit)
        )
    "#;

    struct Probe {
        store: Store<HostState>,
        instance: Instance,
        registry: Arc<EntryPointRegistry>,
        stdout: Arc<Mutex<String>>,
        diagnostic: Arc<Mutex<String>>,
        delays: Arc<Mutex<Vec<Duration>>>,
    }

    fn probe() -> Probe {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);
        HostFunctions::register(&mut linker).expect("register host functions");

        let registry = Arc::new(EntryPointRegistry::new());
        let (sinks, stdout, diagnostic) = StreamSinks::captured();
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&delays);
        let scheduler = ResumeScheduler::new(move |delay| recorder.lock().push(delay));

        let state = HostState::new(Arc::clone(&registry), sinks, scheduler, 64 * 1024 * 1024);
        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limits);

        let module = Module::new(&engine, PROBE_MODULE).expect("compile probe module");
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("instantiate probe module");

        Probe {
            store,
            instance,
            registry,
            stdout,
            diagnostic,
            delays,
        }
    }

    fn call(probe: &mut Probe, name: &str) -> i32 {
        let func = probe
            .instance
            .get_typed_func::<(), i32>(&mut probe.store, name)
            .expect("typed func");
        func.call(&mut probe.store, ()).expect("call")
    }

    fn call_with(probe: &mut Probe, name: &str, arg: i32) -> i32 {
        let func = probe
            .instance
            .get_typed_func::<i32, i32>(&mut probe.store, name)
            .expect("typed func");
        func.call(&mut probe.store, arg).expect("call")
    }

    #[test]
    fn fd_write_routes_stdout() {
        let mut probe = probe();
        let errno = call_with(&mut probe, "emit", 1);
        assert_eq!(errno, 0);
        assert_eq!(probe.stdout.lock().as_str(), "hello module\n");
        assert!(probe.diagnostic.lock().is_empty());

        // byte count lands at the nwritten pointer
        let view = MemoryView::new(
            probe
                .instance
                .get_memory(&mut probe.store, "memory")
                .expect("memory"),
        );
        assert_eq!(view.read_u32(&probe.store, 200).expect("nwritten"), 13);
    }

    #[test]
    fn fd_write_routes_diagnostic() {
        let mut probe = probe();
        let errno = call_with(&mut probe, "emit", 2);
        assert_eq!(errno, 0);
        assert_eq!(probe.diagnostic.lock().as_str(), "hello module\n");
        assert!(probe.stdout.lock().is_empty());
    }

    #[test]
    fn fd_write_drops_unknown_streams() {
        let mut probe = probe();
        let errno = call_with(&mut probe, "emit", 9);
        assert_eq!(errno, 0);
        assert!(probe.stdout.lock().is_empty());
        assert!(probe.diagnostic.lock().is_empty());
    }

    #[test]
    fn register_entry_reads_name_from_memory() {
        let mut probe = probe();
        assert!(probe.registry.is_empty());
        let func = probe
            .instance
            .get_typed_func::<(), ()>(&mut probe.store, "announce")
            .expect("typed func");
        func.call(&mut probe.store, ()).expect("call");
        assert_eq!(probe.registry.lookup("transform"), Some(EntryToken(41)));
    }

    #[test]
    fn schedule_resume_reaches_the_capability() {
        let mut probe = probe();
        let func = probe
            .instance
            .get_typed_func::<(), ()>(&mut probe.store, "ask_resume")
            .expect("typed func");
        func.call(&mut probe.store, ()).expect("call");
        func.call(&mut probe.store, ()).expect("call");
        assert_eq!(
            probe.delays.lock().as_slice(),
            &[Duration::from_millis(1), Duration::from_millis(1)]
        );
    }

    #[test]
    fn environ_stub_reports_empty_set() {
        let mut probe = probe();
        let errno = call(&mut probe, "probe_env");
        assert_eq!(errno, 0);
        let view = MemoryView::new(
            probe
                .instance
                .get_memory(&mut probe.store, "memory")
                .expect("memory"),
        );
        assert_eq!(view.read_u32(&probe.store, 240).expect("count"), 0);
        assert_eq!(view.read_u32(&probe.store, 244).expect("size"), 0);
    }

    #[test]
    fn wall_clock_is_plausible() {
        let mut probe = probe();
        let errno = call_with(&mut probe, "read_clock", 0);
        assert_eq!(errno, 0);
        let view = MemoryView::new(
            probe
                .instance
                .get_memory(&mut probe.store, "memory")
                .expect("memory"),
        );
        let bytes = view.read_bytes(&probe.store, 256, 8).expect("time");
        let nanos = u64::from_le_bytes(bytes.try_into().expect("eight bytes"));
        // after 2020-01-01 in nanoseconds
        assert!(nanos > 1_577_836_800_000_000_000);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let mut probe = probe();
        let view = MemoryView::new(
            probe
                .instance
                .get_memory(&mut probe.store, "memory")
                .expect("memory"),
        );

        let mut last = 0u64;
        for _ in 0..3 {
            assert_eq!(call_with(&mut probe, "read_clock", 1), 0);
            let bytes = view.read_bytes(&probe.store, 256, 8).expect("time");
            let ticks = u64::from_le_bytes(bytes.try_into().expect("eight bytes"));
            assert!(ticks >= last);
            last = ticks;
        }
    }

    #[test]
    fn random_get_fills_memory() {
        let mut probe = probe();
        let errno = call(&mut probe, "roll");
        assert_eq!(errno, 0);
        let view = MemoryView::new(
            probe
                .instance
                .get_memory(&mut probe.store, "memory")
                .expect("memory"),
        );
        let bytes = view.read_bytes(&probe.store, 512, 32).expect("read");
        assert_ne!(bytes, vec![0u8; 32]);
    }

    #[test]
    fn proc_exit_records_code_and_returns() {
        let mut probe = probe();
        let func = probe
            .instance
            .get_typed_func::<(), ()>(&mut probe.store, "quit")
            .expect("typed func");
        func.call(&mut probe.store, ()).expect("call returns normally");
        assert_eq!(probe.store.data().exit_code(), Some(3));
    }
}

//! Test transform module for bridge validation.
//!
//! Implements the guest side of the bridge ABI with a deliberately small
//! transform: strip line comments, optionally collapse whitespace. String
//! literals are not honored, which is fine for a test fixture. Build for
//! wasm32-unknown-unknown; the bridge loads the resulting cdylib.

use std::alloc::{alloc as std_alloc, Layout};

// =============================================================================
// Host Imports
// =============================================================================

#[link(wasm_import_module = "scramble_rt")]
extern "C" {
    /// Announce one entry point: NUL-terminated name, dispatch token.
    fn register_entry(name_ptr: *const u8, token: i32);

    /// Ask the host to call `resume` after the given delay in nanoseconds.
    fn schedule_resume(delay_ns: i64);
}

/// Scatter/gather element for `fd_write`.
#[repr(C)]
struct Iovec {
    ptr: u32,
    len: u32,
}

#[link(wasm_import_module = "wasi_snapshot_preview1")]
extern "C" {
    /// Gathered write to a host stream (1 = stdout, 2 = diagnostic).
    fn fd_write(fd: i32, iovs: *const Iovec, iovs_len: i32, nwritten: *mut i32) -> i32;
}

const TOKEN_TRANSFORM: i32 = 1;
const TOKEN_SELF_TEST: i32 = 2;

/// Allocate memory for host-written data.
#[no_mangle]
pub extern "C" fn malloc(size: i32) -> i32 {
    let layout = Layout::from_size_align(size.max(1) as usize, 8).unwrap();
    unsafe { std_alloc(layout) as i32 }
}

/// Entry routine: announce the entry points and request one scheduler tick.
#[no_mangle]
pub extern "C" fn _start() {
    unsafe {
        register_entry(b"transform\0".as_ptr(), TOKEN_TRANSFORM);
        register_entry(b"selfTest\0".as_ptr(), TOKEN_SELF_TEST);
        schedule_resume(1_000_000); // 1ms
    }
    emit(1, "scramble test module online\n");
}

/// Scheduler re-entry point, called by the host after `schedule_resume`.
#[no_mangle]
pub extern "C" fn resume() {
    emit(2, "scheduler tick\n");
}

/// Dispatch one call: decode the packed arguments, run the entry point,
/// answer with `(ptr << 32) | len` addressing leaked result bytes.
#[no_mangle]
pub extern "C" fn invoke(token: i32, argv: i32, argc: i32) -> i64 {
    let args = read_args(argv, argc);
    let result = match token {
        TOKEN_TRANSFORM => run_transform(&args),
        TOKEN_SELF_TEST => self_test(),
        _ => r#"{"success":false,"error":"unknown dispatch token"}"#.to_string(),
    };
    pack(result)
}

fn emit(fd: i32, text: &str) {
    let iov = Iovec {
        ptr: text.as_ptr() as u32,
        len: text.len() as u32,
    };
    let mut nwritten: i32 = 0;
    unsafe { fd_write(fd, &iov, 1, &mut nwritten) };
}

/// Decode the argument block: `argc` little-endian (ptr, len) pairs at
/// `argv`, each addressing UTF-8 bytes.
fn read_args(argv: i32, argc: i32) -> Vec<String> {
    if argv == 0 || argc <= 0 {
        return Vec::new();
    }
    let mut args = Vec::with_capacity(argc as usize);
    let pairs = argv as *const u32;
    for i in 0..argc as usize {
        unsafe {
            let ptr = *pairs.add(i * 2) as *const u8;
            let len = *pairs.add(i * 2 + 1) as usize;
            let bytes = std::slice::from_raw_parts(ptr, len);
            args.push(String::from_utf8_lossy(bytes).into_owned());
        }
    }
    args
}

/// Leak the result so the host can read it after this call returns.
fn pack(result: String) -> i64 {
    let bytes = result.into_bytes().leak();
    ((bytes.as_ptr() as u32 as i64) << 32) | bytes.len() as i64
}

fn run_transform(args: &[String]) -> String {
    let source = match args.first() {
        Some(text) => text.as_str(),
        None => return r#"{"success":false,"error":"missing source argument"}"#.to_string(),
    };
    let options = args.get(1).map(String::as_str).unwrap_or("{}");

    let preserve_comments = flag(options, "preserveComments");
    let compact = flag(options, "compactCode");

    let mut output = String::with_capacity(source.len());
    for line in source.lines() {
        let line = if preserve_comments {
            line
        } else {
            line.split("//").next().unwrap_or(line)
        };
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if compact {
            let mut last_space = false;
            for ch in line.trim().chars() {
                if ch == ' ' {
                    if !last_space {
                        output.push(' ');
                    }
                    last_space = true;
                } else {
                    output.push(ch);
                    last_space = false;
                }
            }
        } else {
            output.push_str(line);
            output.push('\n');
        }
    }

    let ratio = if source.is_empty() {
        1.0
    } else {
        output.len() as f64 / source.len() as f64
    };
    format!(
        r#"{{"success":true,"output":"{}","stats":{{"originalSize":{},"obfuscatedSize":{},"compression":{:.2}}}}}"#,
        escape_json(&output),
        source.len(),
        output.len(),
        ratio
    )
}

fn self_test() -> String {
    let mut checks = 0;

    let sample = "var a = 1; // comment\nvar b = 2;\n";
    let report = run_transform(&[sample.to_string(), "{}".to_string()]);
    if report.contains(r#""success":true"#) {
        checks += 1;
    }
    if !report.contains("comment") {
        checks += 1;
    }
    if malloc(64) != 0 {
        checks += 1;
    }

    format!(r#"{{"ok":{},"checks":{}}}"#, checks == 3, checks)
}

/// Options are a flat boolean map; substring matching is good enough here.
fn flag(options: &str, name: &str) -> bool {
    options.contains(&format!("\"{name}\":true"))
}

fn escape_json(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

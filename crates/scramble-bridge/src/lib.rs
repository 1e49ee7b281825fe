//! # Scramble Bridge
//!
//! Host-side bridge for the sandboxed Scramble transform module.
//!
//! This crate loads a WebAssembly module image, wires up the small syscall
//! surface the module is allowed to see, and exposes the module's entry
//! points behind an async facade. The module gets no filesystem, no network
//! and no ambient authority; everything it can reach is listed in the host
//! function table.
//!
//! ## Lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Loading` | Image fetch, link and instantiation in progress |
//! | `WaitingForEntryPoints` | Module started, required registrations outstanding |
//! | `Ready` | All required entry points registered, invokes accepted |
//! | `Failed` | Readiness timed out or the instance died |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scramble_bridge::{BridgeConfig, ImageSource, ModuleBridge};
//!
//! // Start the module and wait for it to announce its entry points
//! let bridge = ModuleBridge::load(
//!     ImageSource::from_locator("scramble.wasm"),
//!     BridgeConfig::default(),
//! )
//! .await?;
//! bridge.wait_ready().await?;
//!
//! // Run the transform with module-defined options
//! let outcome = bridge
//!     .transform("var answer = 42;", r#"{"identifierObfuscation":true}"#)
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod loader;
pub mod memory;
pub mod readiness;
pub mod registry;

// Re-export main types
pub use bridge::{ModuleBridge, TransformOutcome};
pub use config::{BridgeConfig, ENTRY_SELF_TEST, ENTRY_TRANSFORM};
pub use error::{BridgeError, Result, Severity, StatusMessage};
pub use host::{ResumeScheduler, StreamSinks};
pub use loader::ImageSource;
pub use readiness::{ReadinessGate, ReadinessState};
pub use registry::{EntryPointRegistry, EntryToken};

//! AxVisor Function Boundary Tracing
//!
//! This crate provides the `fbt` probe provider: it finds the entry and
//! return instructions of every function in a loaded module, patches
//! single-byte traps over them on request, and turns each trap into a
//! trace event carrying the call arguments or the return value.
//!
//! # Features
//!
//! - `symbols` - Kernel symbol resolution through kallsyms (default)
//! - `axhal` - Real time and CPU id for trace events
//!
//! # Quick Start
//!
//! ```ignore
//! use axfbt::{FbtConfig, HostEnv};
//!
//! // Register the provider and its trap hook (call once during boot)
//! let fbt = axfbt::init(FbtConfig::default(), env)?;
//!
//! // Create probes for a freshly loaded module
//! let stats = fbt.provide(module)?;
//!
//! // Show what was found
//! for p in fbt.list_probes() {
//!     println!("{:#x} {}:{}:{}", p.addr, p.module, p.function, p.kind.label());
//! }
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicPtr, Ordering};

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Symbols Module
// =============================================================================

pub mod symtab;

#[cfg(feature = "symbols")]
pub mod symbols;

// =============================================================================
// Host and Engine Interfaces
// =============================================================================

pub mod cache;
pub mod engine;
pub mod host;
pub mod text;

// =============================================================================
// Probe Core
// =============================================================================

pub mod arch;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod provider;
pub mod scan;
pub mod table;

// =============================================================================
// Reference Engine and Simulated Host
// =============================================================================

pub mod event;
pub mod sim;

// Re-export key types for convenience
pub use arch::{Arch, Emulate, InsnPattern};
pub use config::FbtConfig;
pub use engine::{ProbeId, ProbeKind, ProbeOps, ProviderId, TraceEngine};
pub use event::{EventQueue, TraceEvent};
pub use host::{HostEnv, ModuleHost, ModuleId, ModuleState, TypeInfo};
pub use provider::{Error, FBT_ATTR, FbtProvider, ProbeInfo};
pub use scan::ScanStats;
pub use symtab::{SymbolEntry, SymbolList};
pub use table::{ProbeHandle, ProbeState};
pub use text::{DirectText, KernelMemory};

// =============================================================================
// Initialization
// =============================================================================

/// The provider the trap hook dispatches to.
static PROVIDER: AtomicPtr<FbtProvider> = AtomicPtr::new(core::ptr::null_mut());

/// Trap hook registered with the engine.
///
/// Returns `None` when FBT is not initialized or the address is not a probe.
pub fn fbt_invop(addr: usize, stack: usize, rval: usize) -> Option<Emulate> {
    let ptr = PROVIDER.load(Ordering::Acquire);
    // SAFETY: the provider outlives its hook registration, see `exit`.
    let provider = unsafe { ptr.as_ref() }?;
    provider.invop(addr, stack, rval)
}

/// The initialized provider, if any.
pub fn provider() -> Option<&'static FbtProvider> {
    // SAFETY: see `exit`.
    unsafe { PROVIDER.load(Ordering::Acquire).as_ref() }
}

/// Initialize the FBT provider.
///
/// Allocates the probe table, registers the provider with `env.engine` and
/// installs [`fbt_invop`] as a trap hook.
pub fn init(config: FbtConfig, env: HostEnv) -> Result<&'static FbtProvider, Error> {
    info!("Initializing fbt...");
    if provider().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let ptr = Box::into_raw(Box::new(FbtProvider::new(config, env)?));
    // SAFETY: just allocated; freed only by `exit` or the failure paths below.
    let fbt: &'static FbtProvider = unsafe { &*ptr };

    if let Err(e) = fbt.attach() {
        error!("fbt: failed to register provider: {}", e);
        // SAFETY: the engine rejected the registration and holds no reference.
        drop(unsafe { Box::from_raw(ptr) });
        return Err(e);
    }

    if PROVIDER
        .compare_exchange(core::ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        let _ = fbt.detach();
        // SAFETY: detached and never published.
        drop(unsafe { Box::from_raw(ptr) });
        return Err(Error::AlreadyInitialized);
    }
    fbt.env.engine.invop_add(fbt_invop);

    info!(
        "fbt initialization complete ({}, {} buckets)",
        fbt.config.arch.label(),
        fbt.table.bucket_count()
    );
    Ok(fbt)
}

/// Tear down the FBT provider.
///
/// Removes the trap hook, unregisters the provider (destroying all of its
/// probes) and frees the probe table. If the engine refuses, for example
/// because probes are still enabled, the hook is reinstalled and the
/// provider stays up.
///
/// # Safety
/// No reference obtained from [`init`] or [`provider`] may be used after
/// this returns `Ok`, and no CPU may still be executing [`fbt_invop`].
pub unsafe fn exit() -> Result<(), Error> {
    let fbt = provider().ok_or(Error::NotInitialized)?;

    fbt.env.engine.invop_remove(fbt_invop);
    if let Err(e) = fbt.detach() {
        warn!("fbt: cannot unregister provider: {}", e);
        fbt.env.engine.invop_add(fbt_invop);
        return Err(e);
    }

    let ptr = PROVIDER.swap(core::ptr::null_mut(), Ordering::AcqRel);
    // SAFETY: caller guarantees no outstanding references.
    drop(unsafe { Box::from_raw(ptr) });
    info!("fbt: provider freed");
    Ok(())
}

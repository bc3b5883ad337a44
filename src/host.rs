//! Interfaces the host kernel provides to the FBT provider.
//!
//! The provider never owns module objects. It identifies them by
//! [`ModuleId`] and asks the [`ModuleHost`] for liveness, load generation and
//! symbols whenever it needs to act on them.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::engine::TraceEngine;
use crate::symtab::SymbolEntry;
use crate::text::KernelMemory;

/// Opaque identity of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub usize);

/// Module load state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Fully loaded; its text may be patched.
    Live,
    /// Still being loaded.
    Coming,
    /// Being unloaded.
    Going,
    /// No longer present.
    Unloaded,
}

/// Module enumeration and binding state.
pub trait ModuleHost: Send + Sync {
    /// Module name, if the module is known.
    fn name(&self, module: ModuleId) -> Option<String>;

    /// Current load state.
    fn state(&self, module: ModuleId) -> ModuleState;

    /// Value that changes whenever the module is unloaded and reloaded.
    fn load_generation(&self, module: ModuleId) -> u64;

    /// Ordered symbol table of the module. Must yield nothing when the table
    /// is empty or not yet populated.
    fn symbols(&self, module: ModuleId) -> Vec<SymbolEntry>;
}

/// Function signature as described by a type introspection service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    /// Native return type name.
    pub return_type: String,
    /// Native argument type names, in order.
    pub args: Vec<String>,
}

/// Optional type introspection service used for argument descriptions.
pub trait TypeInfo: Send + Sync {
    /// Signature of the function at `symndx` in `module`'s symbol list.
    fn function_type(&self, module: ModuleId, symndx: usize) -> Option<FunctionType>;
}

/// Everything the provider needs from its environment.
#[derive(Clone)]
pub struct HostEnv {
    /// Module enumeration and liveness.
    pub modules: Arc<dyn ModuleHost>,
    /// Kernel text and stack access.
    pub memory: Arc<dyn KernelMemory>,
    /// Tracing engine receiving probe events.
    pub engine: Arc<dyn TraceEngine>,
    /// Optional type information for argument descriptions.
    pub types: Option<Arc<dyn TypeInfo>>,
}

impl HostEnv {
    /// Create an environment without type information.
    pub fn new(
        modules: Arc<dyn ModuleHost>,
        memory: Arc<dyn KernelMemory>,
        engine: Arc<dyn TraceEngine>,
    ) -> Self {
        Self {
            modules,
            memory,
            engine,
            types: None,
        }
    }

    /// Attach a type introspection service.
    pub fn with_types(mut self, types: Arc<dyn TypeInfo>) -> Self {
        self.types = Some(types);
        self
    }
}

//! Contract between the FBT provider and the tracing engine.
//!
//! The engine owns probe identities and event recording. The provider
//! registers itself with a set of [`ProbeOps`] callbacks, creates one probe
//! per instrumented function, and fires it from trap context.

use alloc::string::String;

use crate::arch::Emulate;
use crate::host::ModuleId;
use crate::table::ProbeHandle;

/// Engine-assigned probe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId(pub u32);

/// Engine-assigned provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(pub u32);

/// Function boundary event kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Function entry.
    Entry = 0,
    /// Function return.
    Return = 1,
}

impl ProbeKind {
    /// Probe name component.
    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::Entry => "entry",
            ProbeKind::Return => "return",
        }
    }
}

/// Stability level of an interface element.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stability {
    Internal,
    Private,
    Obsolete,
    External,
    Unstable,
    Evolving,
    Stable,
    Standard,
}

/// Architectural dependency class of an interface element.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyClass {
    Unknown,
    Cpu,
    Platform,
    Group,
    Isa,
    Common,
}

/// Name stability, data stability and dependency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub name: Stability,
    pub data: Stability,
    pub class: DependencyClass,
}

impl Attribute {
    pub const fn new(name: Stability, data: Stability, class: DependencyClass) -> Self {
        Self { name, data, class }
    }
}

/// Stability attributes of a provider's probe description components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderAttributes {
    pub provider: Attribute,
    pub module: Attribute,
    pub function: Attribute,
    pub name: Attribute,
    pub args: Attribute,
}

/// Host trap hook: `(faulting address, stack pointer, return value)`.
///
/// Returns the instruction to emulate when the trap belonged to the caller,
/// `None` otherwise.
pub type InvopHandler = fn(addr: usize, stack: usize, rval: usize) -> Option<Emulate>;

/// Error types for engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A provider with this name is already registered.
    ProviderExists(String),
    /// Provider not found.
    ProviderNotFound(u32),
    /// Provider still has probes.
    ProviderBusy(u32),
    /// Probe not found.
    ProbeNotFound(u32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ProviderExists(name) => write!(f, "Provider already registered: {}", name),
            Self::ProviderNotFound(id) => write!(f, "Provider not found: {}", id),
            Self::ProviderBusy(id) => write!(f, "Provider {} still has probes", id),
            Self::ProbeNotFound(id) => write!(f, "Probe not found: {}", id),
        }
    }
}

impl core::error::Error for Error {}

/// Callbacks a provider exposes to the engine.
pub trait ProbeOps: Send + Sync {
    /// Create probes for a newly loaded module.
    fn provide_module(&self, module: ModuleId);

    /// Install the traps of a probe.
    fn enable(&self, probe: ProbeId, handle: ProbeHandle);

    /// Remove the traps of a probe.
    fn disable(&self, probe: ProbeId, handle: ProbeHandle);

    /// Temporarily remove the traps of an enabled probe.
    fn suspend(&self, probe: ProbeId, handle: ProbeHandle);

    /// Reinstall the traps of a suspended probe.
    fn resume(&self, probe: ProbeId, handle: ProbeHandle);

    /// Native type of argument `ndx` of `kind` events, `None` if unavailable.
    fn arg_desc(&self, probe: ProbeId, handle: ProbeHandle, kind: ProbeKind, ndx: usize) -> Option<String>;

    /// Release the probe's records.
    fn destroy(&self, probe: ProbeId, handle: ProbeHandle);
}

/// Services the tracing engine offers to providers.
pub trait TraceEngine: Send + Sync {
    /// Register a provider and its callbacks.
    fn register_provider(
        &self,
        name: &str,
        attr: &ProviderAttributes,
        ops: &'static dyn ProbeOps,
    ) -> Result<ProviderId, Error>;

    /// Unregister a provider. Its probes are destroyed through
    /// [`ProbeOps::destroy`] first.
    fn unregister_provider(&self, provider: ProviderId) -> Result<(), Error>;

    /// Create a probe; `handle` is passed back on every callback.
    fn create_probe(
        &self,
        provider: ProviderId,
        module: &str,
        function: &str,
        kind: ProbeKind,
        aframes: u32,
        handle: ProbeHandle,
    ) -> Option<ProbeId>;

    /// Record a probe firing.
    ///
    /// Called from trap context: must not block or allocate.
    fn fire(&self, probe: ProbeId, kind: ProbeKind, caller: usize, args: [usize; 5]);

    /// Add a trap hook to the host's dispatch table.
    fn invop_add(&self, handler: InvopHandler);

    /// Remove a previously added trap hook.
    fn invop_remove(&self, handler: InvopHandler);
}

//! The FBT provider context.
//!
//! [`FbtProvider`] owns the probe table and everything needed to act on it.
//! It turns module symbol tables into probe records here; patching lives in
//! [`crate::lifecycle`] and the trap path in [`crate::dispatch`].

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{Emulate, InsnPattern};
use crate::config::{self, FbtConfig};
use crate::dispatch::DispatchStats;
use crate::engine::{
    self, Attribute, DependencyClass, ProbeId, ProbeKind, ProbeOps, ProviderAttributes,
    ProviderId, Stability,
};
use crate::host::{HostEnv, ModuleId};
use crate::scan::{self, FunctionSites, ScanStats, Site, Skip};
use crate::symtab::SymbolEntry;
use crate::table::{self, ProbeHandle, ProbeRecord, ProbeState, ProbeTable};

/// Stability attributes of FBT probe descriptions.
pub const FBT_ATTR: ProviderAttributes = ProviderAttributes {
    provider: Attribute::new(Stability::Evolving, Stability::Evolving, DependencyClass::Isa),
    module: Attribute::new(Stability::Private, Stability::Private, DependencyClass::Unknown),
    function: Attribute::new(Stability::Private, Stability::Private, DependencyClass::Unknown),
    name: Attribute::new(Stability::Evolving, Stability::Evolving, DependencyClass::Isa),
    args: Attribute::new(Stability::Private, Stability::Private, DependencyClass::Isa),
};

/// Error types for provider operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration rejected.
    Config(config::Error),
    /// Probe table could not be allocated.
    Table(table::Error),
    /// Engine refused a registration.
    Engine(engine::Error),
    /// Provider is not registered with the engine.
    NotAttached,
    /// Provider is already registered with the engine.
    AlreadyAttached,
    /// The process-wide provider already exists.
    AlreadyInitialized,
    /// The process-wide provider does not exist.
    NotInitialized,
    /// Host does not know the module.
    UnknownModule(usize),
    /// Module is on the exclusion list.
    Excluded(String),
    /// Module already has records for its current load generation.
    AlreadyProvided(String),
    /// Owning module is not live.
    ModuleNotLive(String),
    /// Owning module was reloaded since the probe was created.
    ModuleReloaded(String),
    /// Handle no longer names a record.
    StaleProbe,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Invalid configuration: {}", e),
            Self::Table(e) => write!(f, "Probe table error: {}", e),
            Self::Engine(e) => write!(f, "Engine error: {}", e),
            Self::NotAttached => write!(f, "Provider not attached"),
            Self::AlreadyAttached => write!(f, "Provider already attached"),
            Self::AlreadyInitialized => write!(f, "FBT already initialized"),
            Self::NotInitialized => write!(f, "FBT not initialized"),
            Self::UnknownModule(id) => write!(f, "Unknown module: {}", id),
            Self::Excluded(name) => write!(f, "Module excluded: {}", name),
            Self::AlreadyProvided(name) => write!(f, "Module already provided: {}", name),
            Self::ModuleNotLive(name) => write!(f, "Module of {} is not live", name),
            Self::ModuleReloaded(name) => write!(f, "Module of {} was reloaded", name),
            Self::StaleProbe => write!(f, "Stale probe handle"),
        }
    }
}

impl core::error::Error for Error {}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Self::Config(e)
    }
}

impl From<table::Error> for Error {
    fn from(e: table::Error) -> Self {
        Self::Table(e)
    }
}

impl From<engine::Error> for Error {
    fn from(e: engine::Error) -> Self {
        Self::Engine(e)
    }
}

/// Probe record summary for display.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub module: String,
    pub function: String,
    pub kind: ProbeKind,
    pub addr: usize,
    pub roffset: usize,
    pub emulate: Emulate,
    pub state: ProbeState,
}

/// Function boundary tracing provider.
pub struct FbtProvider {
    pub(crate) config: FbtConfig,
    pub(crate) env: HostEnv,
    pub(crate) pattern: &'static dyn InsnPattern,
    pub(crate) table: ProbeTable,
    pub(crate) provider_id: Mutex<Option<ProviderId>>,
    /// Live record count per (module, load generation).
    pub(crate) module_counts: Mutex<BTreeMap<(ModuleId, u64), usize>>,
    pub(crate) stats: DispatchStats,
}

impl FbtProvider {
    /// Validate `config` and allocate the probe table.
    pub fn new(config: FbtConfig, env: HostEnv) -> Result<Self, Error> {
        config.validate()?;
        let table = ProbeTable::new(config.table_size, config.hash_shift, config.max_probes)?;
        debug!(
            "fbt: {} buckets, {} record slots, {}",
            table.bucket_count(),
            table.capacity(),
            config.arch.label()
        );

        Ok(Self {
            pattern: config.arch.pattern(),
            config,
            env,
            table,
            provider_id: Mutex::new(None),
            module_counts: Mutex::new(BTreeMap::new()),
            stats: DispatchStats::new(),
        })
    }

    pub fn config(&self) -> &FbtConfig {
        &self.config
    }

    pub fn table(&self) -> &ProbeTable {
        &self.table
    }

    /// Engine identity, once attached.
    pub fn provider_id(&self) -> Option<ProviderId> {
        *self.provider_id.lock()
    }

    /// Register with the engine.
    pub fn attach(&'static self) -> Result<ProviderId, Error> {
        let mut slot = self.provider_id.lock();
        if slot.is_some() {
            return Err(Error::AlreadyAttached);
        }
        let id = self
            .env
            .engine
            .register_provider(&self.config.provider_name, &FBT_ATTR, self)?;
        *slot = Some(id);
        info!("fbt: registered provider '{}' as {}", self.config.provider_name, id.0);
        Ok(id)
    }

    /// Unregister from the engine. The engine destroys every probe first.
    pub fn detach(&self) -> Result<(), Error> {
        let id = self.provider_id().ok_or(Error::NotAttached)?;
        self.env.engine.unregister_provider(id)?;
        *self.provider_id.lock() = None;
        info!("fbt: unregistered provider '{}'", self.config.provider_name);
        Ok(())
    }

    /// Number of live records owned by `module` at its current generation.
    pub fn module_probe_count(&self, module: ModuleId) -> usize {
        let load_gen = self.env.modules.load_generation(module);
        self.module_counts
            .lock()
            .get(&(module, load_gen))
            .copied()
            .unwrap_or(0)
    }

    /// Scan a module and create probes for every eligible function.
    pub fn provide(&self, module: ModuleId) -> Result<ScanStats, Error> {
        let provider = self.provider_id().ok_or(Error::NotAttached)?;
        let modules = &self.env.modules;
        let name = modules.name(module).ok_or(Error::UnknownModule(module.0))?;

        if self.config.is_excluded(&name) {
            debug!("fbt: skipping excluded module {}", name);
            return Err(Error::Excluded(name));
        }
        let load_gen = modules.load_generation(module);
        if self.module_counts.lock().contains_key(&(module, load_gen)) {
            debug!("fbt: module {} already provided", name);
            return Err(Error::AlreadyProvided(name));
        }

        let mut stats = ScanStats::default();
        for (symndx, sym) in modules.symbols(module).iter().enumerate() {
            stats.functions += 1;
            match self.scan_symbol(sym) {
                Ok(sites) => {
                    let binding = Binding {
                        provider,
                        module,
                        module_name: &name,
                        load_gen,
                        symndx,
                    };
                    self.install(&binding, sym, &sites, &mut stats);
                }
                Err(skip) => {
                    trace!("fbt: {}:{} skipped ({})", name, sym.name, skip.as_str());
                    stats.record_skip(skip);
                }
            }
        }

        if stats.probes() > 0 {
            *self.module_counts.lock().entry((module, load_gen)).or_insert(0) += stats.probes();
        }
        info!(
            "fbt: provided {}: {} functions, {} entry, {} return probes",
            name, stats.functions, stats.entry_probes, stats.return_probes
        );
        if stats.alloc_failures > 0 {
            warn!("fbt: {}: {} probes dropped", name, stats.alloc_failures);
        }
        Ok(stats)
    }

    fn scan_symbol(&self, sym: &SymbolEntry) -> Result<FunctionSites, Skip> {
        scan::check_eligible(sym)?;
        if sym.size > self.config.max_function_size {
            debug!("fbt: {} claims {:#x} bytes, not scanned", sym.name, sym.size);
            return Err(Skip::Oversized);
        }

        let mut code = Vec::new();
        if code.try_reserve_exact(sym.size).is_err() {
            warn!("fbt: no memory to scan {} ({:#x} bytes)", sym.name, sym.size);
            return Err(Skip::NoMemory);
        }
        code.resize(sym.size, 0u8);
        if let Err(e) = self.env.memory.read_text(sym.addr, &mut code) {
            debug!("fbt: cannot read {} at {:#x}: {:?}", sym.name, sym.addr, e);
            return Err(Skip::Unreadable);
        }
        scan::scan_function(self.pattern, &code)
    }

    /// Turn the sites of one function into a published record chain.
    fn install(&self, binding: &Binding<'_>, sym: &SymbolEntry, sites: &FunctionSites, stats: &mut ScanStats) {
        let head = match self.table.reserve() {
            Ok(head) => head,
            Err(e) => {
                debug!("fbt: no slot for {}: {}", sym.name, e);
                stats.alloc_failures += 1;
                return;
            }
        };
        let Some(id) = self.env.engine.create_probe(
            binding.provider,
            binding.module_name,
            &sym.name,
            ProbeKind::Entry,
            self.config.aframes,
            head,
        ) else {
            debug!("fbt: engine refused probe for {}", sym.name);
            self.table.release(head);
            stats.alloc_failures += 1;
            return;
        };

        let mut returns = Vec::with_capacity(sites.returns.len());
        for site in &sites.returns {
            match self.table.reserve() {
                Ok(handle) => returns.push((handle, site)),
                Err(_) => stats.alloc_failures += 1,
            }
        }

        // Publish back to front so every link points at a live record.
        let mut next = None;
        let mut published = Vec::with_capacity(returns.len());
        for (handle, site) in returns.into_iter().rev() {
            let record = self.record(binding, sym, id, ProbeKind::Return, site, next);
            match self.table.publish(handle, record) {
                Ok(()) => {
                    next = Some(handle);
                    published.push(handle);
                }
                Err(e) => {
                    debug!("fbt: {}+{:#x}: {}", sym.name, site.offset, e);
                    self.table.release(handle);
                    stats.alloc_failures += 1;
                }
            }
        }

        let entry = self.record(binding, sym, id, ProbeKind::Entry, &sites.entry, next);
        if let Err(e) = self.table.publish(head, entry) {
            debug!("fbt: {}: {}", sym.name, e);
            self.table.release(head);
            for handle in published {
                self.table.remove(handle);
            }
            stats.alloc_failures += 1;
            return;
        }

        stats.entry_probes += 1;
        stats.return_probes += published.len();
        trace!(
            "fbt: {}:{} probe {} with {} returns",
            binding.module_name,
            sym.name,
            id.0,
            published.len()
        );
    }

    fn record(
        &self,
        binding: &Binding<'_>,
        sym: &SymbolEntry,
        id: ProbeId,
        kind: ProbeKind,
        site: &Site,
        next: Option<ProbeHandle>,
    ) -> ProbeRecord {
        ProbeRecord {
            module: binding.module,
            name: sym.name.clone(),
            addr: sym.addr + site.offset,
            kind,
            saved: site.saved,
            patch_val: self.pattern.patch_value(),
            roffset: site.roffset,
            id,
            load_gen: binding.load_gen,
            symndx: binding.symndx,
            emulate: site.emulate,
            state: ProbeState::Unpatched,
            next,
        }
    }

    /// Native type name of argument `ndx` of a probe's `kind` events.
    ///
    /// For return events, argument 0 is the return offset and argument 1
    /// the return value.
    pub fn describe_arg(&self, head: ProbeHandle, kind: ProbeKind, ndx: usize) -> Option<String> {
        let record = self.table.get(head)?;
        self.check_binding(&record).ok()?;

        if kind == ProbeKind::Return && ndx == 0 {
            return Some("int".to_string());
        }
        let ftype = self
            .env
            .types
            .as_ref()?
            .function_type(record.module, record.symndx)?;
        match kind {
            ProbeKind::Entry => ftype.args.get(ndx).cloned(),
            ProbeKind::Return if ndx == 1 => Some(ftype.return_type),
            ProbeKind::Return => None,
        }
    }

    /// Every live record, ordered by address.
    pub fn list_probes(&self) -> Vec<ProbeInfo> {
        let mut names: BTreeMap<ModuleId, String> = BTreeMap::new();
        let mut out: Vec<ProbeInfo> = self
            .table
            .records()
            .into_iter()
            .map(|(_, r)| {
                let module = names
                    .entry(r.module)
                    .or_insert_with(|| self.env.modules.name(r.module).unwrap_or_default())
                    .clone();
                ProbeInfo {
                    id: r.id,
                    module,
                    function: r.name,
                    kind: r.kind,
                    addr: r.addr,
                    roffset: r.roffset,
                    emulate: r.emulate,
                    state: r.state,
                }
            })
            .collect();
        out.sort_by_key(|p| p.addr);
        out
    }
}

/// Where the records of one scan belong.
struct Binding<'a> {
    provider: ProviderId,
    module: ModuleId,
    module_name: &'a str,
    load_gen: u64,
    symndx: usize,
}

// Guard refusals and write failures are logged where they happen; the
// callbacks have no error channel back to the engine.
impl ProbeOps for FbtProvider {
    fn provide_module(&self, module: ModuleId) {
        if let Err(e) = self.provide(module) {
            debug!("fbt: provide {}: {}", module.0, e);
        }
    }

    fn enable(&self, _probe: ProbeId, handle: ProbeHandle) {
        self.enable_probe(handle).ok();
    }

    fn disable(&self, _probe: ProbeId, handle: ProbeHandle) {
        self.disable_probe(handle).ok();
    }

    fn suspend(&self, _probe: ProbeId, handle: ProbeHandle) {
        self.suspend_probe(handle).ok();
    }

    fn resume(&self, _probe: ProbeId, handle: ProbeHandle) {
        self.resume_probe(handle).ok();
    }

    fn arg_desc(&self, _probe: ProbeId, handle: ProbeHandle, kind: ProbeKind, ndx: usize) -> Option<String> {
        self.describe_arg(handle, kind, ndx)
    }

    fn destroy(&self, _probe: ProbeId, handle: ProbeHandle) {
        self.destroy_probe(handle);
    }
}

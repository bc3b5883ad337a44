//! Trace event format and the reference event-queue engine.
//!
//! [`EventQueue`] is a minimal [`TraceEngine`]: it keeps the provider and
//! probe registries, drives providers through their [`ProbeOps`] callbacks,
//! and records fired probes as fixed-size [`TraceEvent`]s in a bounded
//! queue. The queue is reserved up front so recording never allocates.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::arch::Emulate;
use crate::engine::{
    Error, InvopHandler, ProbeId, ProbeKind, ProbeOps, ProviderAttributes, ProviderId,
    TraceEngine,
};
use crate::host::ModuleId;
use crate::platform;
use crate::table::ProbeHandle;

/// Event kinds stored in `TraceEvent::kind`.
pub const EVENT_ENTRY: u8 = ProbeKind::Entry as u8;
pub const EVENT_RETURN: u8 = ProbeKind::Return as u8;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// One probe firing.
///
/// Fixed 64-byte layout keeps event parsing straightforward and cache-friendly.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Engine probe identifier.
    pub probe_id: u32,
    /// `EVENT_ENTRY` or `EVENT_RETURN`.
    pub kind: u8,
    /// Physical CPU ID.
    pub cpu_id: u8,
    /// Padding to keep 8-byte alignment.
    pub _pad: u16,
    /// Return address into the calling function, 0 if unknown.
    pub caller: u64,
    /// Entry: the first five stack arguments. Return: return offset and
    /// return value.
    pub args: [u64; 5],
}

const _: () = assert!(core::mem::size_of::<TraceEvent>() == 64);

impl TraceEvent {
    /// Create an event stamped with the current time and CPU.
    pub fn new(probe: ProbeId, kind: ProbeKind, caller: usize, args: [usize; 5]) -> Self {
        Self {
            timestamp_ns: platform::time_ns(),
            probe_id: probe.0,
            kind: kind as u8,
            cpu_id: platform::cpu_id() as u8,
            _pad: 0,
            caller: caller as u64,
            args: args.map(|a| a as u64),
        }
    }

    /// View this event as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }

    /// Parse one event from a raw byte slice.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < core::mem::size_of::<Self>() {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }

    pub fn probe_kind(&self) -> Option<ProbeKind> {
        match self.kind {
            EVENT_ENTRY => Some(ProbeKind::Entry),
            EVENT_RETURN => Some(ProbeKind::Return),
            _ => None,
        }
    }

    /// Human-readable event kind.
    pub fn kind_str(&self) -> &'static str {
        self.probe_kind().map_or("unknown", |k| k.label())
    }
}

/// Engine-side probe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Disabled,
    Enabled,
    Suspended,
}

/// A probe registered with the queue.
#[derive(Debug, Clone)]
pub struct ProbeEntry {
    pub id: ProbeId,
    pub provider: ProviderId,
    pub module: String,
    pub function: String,
    pub kind: ProbeKind,
    pub aframes: u32,
    pub handle: ProbeHandle,
    pub status: ProbeStatus,
}

impl ProbeEntry {
    /// `provider:module:function:` style description.
    pub fn full_name(&self, provider: &str) -> String {
        alloc::format!("{}:{}:{}:", provider, self.module, self.function)
    }
}

struct ProviderEntry {
    name: String,
    attr: ProviderAttributes,
    ops: &'static dyn ProbeOps,
}

/// Reference tracing engine backed by a bounded event queue.
///
/// Provider callbacks are always invoked with no registry lock held, so a
/// provider may call back into the engine.
pub struct EventQueue {
    providers: Mutex<BTreeMap<u32, ProviderEntry>>,
    probes: Mutex<BTreeMap<u32, ProbeEntry>>,
    next_provider: AtomicU32,
    next_probe: AtomicU32,
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    handlers: Mutex<Vec<InvopHandler>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue that keeps at most `capacity` unconsumed events.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            providers: Mutex::new(BTreeMap::new()),
            probes: Mutex::new(BTreeMap::new()),
            next_provider: AtomicU32::new(1),
            next_probe: AtomicU32::new(1),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Name of a registered provider.
    pub fn provider_name(&self, provider: ProviderId) -> Option<String> {
        self.providers.lock().get(&provider.0).map(|p| p.name.clone())
    }

    /// Stability attributes a provider registered with.
    pub fn provider_attributes(&self, provider: ProviderId) -> Option<ProviderAttributes> {
        self.providers.lock().get(&provider.0).map(|p| p.attr)
    }

    fn ops_of(&self, provider: ProviderId) -> Option<&'static dyn ProbeOps> {
        self.providers.lock().get(&provider.0).map(|p| p.ops)
    }

    /// Ask every provider to create probes for `module`.
    pub fn provide_module(&self, module: ModuleId) {
        let all: Vec<&'static dyn ProbeOps> =
            self.providers.lock().values().map(|p| p.ops).collect();
        for ops in all {
            ops.provide_module(module);
        }
    }

    /// Snapshot of a probe.
    pub fn probe(&self, probe: ProbeId) -> Option<ProbeEntry> {
        self.probes.lock().get(&probe.0).cloned()
    }

    /// Find a probe by module and function name.
    pub fn probe_by_name(&self, module: &str, function: &str) -> Option<ProbeId> {
        self.probes
            .lock()
            .values()
            .find(|p| p.module == module && p.function == function)
            .map(|p| p.id)
    }

    /// Every registered probe, ordered by id.
    pub fn probes(&self) -> Vec<ProbeEntry> {
        self.probes.lock().values().cloned().collect()
    }

    fn switch(
        &self,
        probe: ProbeId,
        status: ProbeStatus,
        call: fn(&dyn ProbeOps, ProbeId, ProbeHandle),
    ) -> Result<(), Error> {
        let (provider, handle) = {
            let mut probes = self.probes.lock();
            let entry = probes.get_mut(&probe.0).ok_or(Error::ProbeNotFound(probe.0))?;
            entry.status = status;
            (entry.provider, entry.handle)
        };
        let ops = self.ops_of(provider).ok_or(Error::ProviderNotFound(provider.0))?;
        call(ops, probe, handle);
        Ok(())
    }

    pub fn enable(&self, probe: ProbeId) -> Result<(), Error> {
        self.switch(probe, ProbeStatus::Enabled, |ops, id, h| ops.enable(id, h))
    }

    pub fn disable(&self, probe: ProbeId) -> Result<(), Error> {
        self.switch(probe, ProbeStatus::Disabled, |ops, id, h| ops.disable(id, h))
    }

    pub fn suspend(&self, probe: ProbeId) -> Result<(), Error> {
        self.switch(probe, ProbeStatus::Suspended, |ops, id, h| ops.suspend(id, h))
    }

    pub fn resume(&self, probe: ProbeId) -> Result<(), Error> {
        self.switch(probe, ProbeStatus::Enabled, |ops, id, h| ops.resume(id, h))
    }

    /// Argument type of a probe, as described by its provider.
    pub fn arg_desc(&self, probe: ProbeId, kind: ProbeKind, ndx: usize) -> Option<String> {
        let entry = self.probe(probe)?;
        self.ops_of(entry.provider)?.arg_desc(probe, entry.handle, kind, ndx)
    }

    /// Remove a probe and let its provider release it.
    pub fn destroy(&self, probe: ProbeId) -> Result<(), Error> {
        let entry = self
            .probes
            .lock()
            .remove(&probe.0)
            .ok_or(Error::ProbeNotFound(probe.0))?;
        if let Some(ops) = self.ops_of(entry.provider) {
            ops.destroy(probe, entry.handle);
        }
        Ok(())
    }

    /// Read and consume recorded events, oldest first.
    ///
    /// `max_events == 0` means no explicit limit.
    pub fn consume_events(&self, max_events: usize) -> Vec<TraceEvent> {
        let mut q = self.events.lock();
        let limit = if max_events == 0 { q.len() } else { max_events.min(q.len()) };
        q.drain(..limit).collect()
    }

    /// Events lost to overflow or lock contention.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver a trap to the registered hooks, as the host trap handler
    /// would. Returns the first hook's answer that claims the trap.
    pub fn dispatch_trap(&self, addr: usize, stack: usize, rval: usize) -> Option<Emulate> {
        let handlers = self.handlers.lock().clone();
        handlers.into_iter().find_map(|h| h(addr, stack, rval))
    }

    /// Number of registered trap hooks.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceEngine for EventQueue {
    fn register_provider(
        &self,
        name: &str,
        attr: &ProviderAttributes,
        ops: &'static dyn ProbeOps,
    ) -> Result<ProviderId, Error> {
        let mut providers = self.providers.lock();
        if providers.values().any(|p| p.name == name) {
            return Err(Error::ProviderExists(name.to_string()));
        }
        let id = self.next_provider.fetch_add(1, Ordering::Relaxed);
        providers.insert(
            id,
            ProviderEntry {
                name: name.to_string(),
                attr: *attr,
                ops,
            },
        );
        Ok(ProviderId(id))
    }

    fn unregister_provider(&self, provider: ProviderId) -> Result<(), Error> {
        let ops = self.ops_of(provider).ok_or(Error::ProviderNotFound(provider.0))?;

        let owned: Vec<ProbeEntry> = {
            let mut probes = self.probes.lock();
            let busy = probes
                .values()
                .any(|p| p.provider == provider && p.status != ProbeStatus::Disabled);
            if busy {
                return Err(Error::ProviderBusy(provider.0));
            }
            let ids: Vec<u32> = probes
                .values()
                .filter(|p| p.provider == provider)
                .map(|p| p.id.0)
                .collect();
            ids.iter().filter_map(|id| probes.remove(id)).collect()
        };

        for entry in owned {
            ops.destroy(entry.id, entry.handle);
        }
        self.providers.lock().remove(&provider.0);
        Ok(())
    }

    fn create_probe(
        &self,
        provider: ProviderId,
        module: &str,
        function: &str,
        kind: ProbeKind,
        aframes: u32,
        handle: ProbeHandle,
    ) -> Option<ProbeId> {
        if !self.providers.lock().contains_key(&provider.0) {
            return None;
        }
        let id = self.next_probe.fetch_add(1, Ordering::Relaxed);
        self.probes.lock().insert(
            id,
            ProbeEntry {
                id: ProbeId(id),
                provider,
                module: module.to_string(),
                function: function.to_string(),
                kind,
                aframes,
                handle,
                status: ProbeStatus::Disabled,
            },
        );
        Some(ProbeId(id))
    }

    fn fire(&self, probe: ProbeId, kind: ProbeKind, caller: usize, args: [usize; 5]) {
        let event = TraceEvent::new(probe, kind, caller, args);
        // Never spin in trap context.
        let Some(mut q) = self.events.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(event);
    }

    fn invop_add(&self, handler: InvopHandler) {
        let mut handlers = self.handlers.lock();
        if !handlers.iter().any(|h| core::ptr::fn_addr_eq(*h, handler)) {
            handlers.push(handler);
        }
    }

    fn invop_remove(&self, handler: InvopHandler) {
        self.handlers
            .lock()
            .retain(|h| !core::ptr::fn_addr_eq(*h, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_event_layout_is_stable() {
        assert_eq!(core::mem::size_of::<TraceEvent>(), 64);
    }

    #[test]
    fn event_bytes_parse_back() {
        let ev = TraceEvent::new(ProbeId(9), ProbeKind::Return, 0x1234, [7, 42, 0, 0, 0]);
        let parsed = TraceEvent::from_bytes(ev.as_bytes()).unwrap();
        assert_eq!(parsed, ev);
        assert_eq!(parsed.kind_str(), "return");
        assert!(TraceEvent::from_bytes(&[0u8; 8]).is_none());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let q = EventQueue::with_capacity(2);
        for i in 0..3 {
            q.fire(ProbeId(i), ProbeKind::Entry, 0, [0; 5]);
        }
        let events = q.consume_events(0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].probe_id, 1);
        assert_eq!(q.dropped(), 1);
    }
}

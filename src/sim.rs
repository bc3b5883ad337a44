//! In-memory host for running the provider without a kernel.
//!
//! [`SimMemory`] maps byte regions at chosen addresses and counts text
//! writes, [`SimModules`] holds module names, states, generations and
//! symbol lists, and [`SimTypes`] answers type queries from a table.
//! Together with [`crate::event::EventQueue`] they make a complete
//! [`HostEnv`](crate::host::HostEnv).

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{AxResult, ax_err};
use spin::Mutex;

use crate::arch::Arch;
use crate::host::{FunctionType, ModuleHost, ModuleId, ModuleState, TypeInfo};
use crate::symtab::{SymbolEntry, SymbolList};
use crate::text::KernelMemory;

struct Region {
    base: usize,
    bytes: Vec<u8>,
    read_only: bool,
}

impl Region {
    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.bytes.len())
    }
}

/// Simulated kernel address space.
pub struct SimMemory {
    word_size: usize,
    regions: Mutex<Vec<Region>>,
    writes: AtomicUsize,
}

impl SimMemory {
    /// Create an empty address space with `arch`'s word size.
    pub fn new(arch: Arch) -> Self {
        Self {
            word_size: arch.word_size(),
            regions: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Map a copy of `bytes` at `base`, replacing any region at that base.
    pub fn map(&self, base: usize, bytes: &[u8]) {
        let mut regions = self.regions.lock();
        regions.retain(|r| r.base != base);
        regions.push(Region {
            base,
            bytes: bytes.to_vec(),
            read_only: false,
        });
    }

    /// Map `words` little-endian at `base`, one machine word each.
    pub fn map_words(&self, base: usize, words: &[usize]) {
        let bytes: Vec<u8> = words
            .iter()
            .flat_map(|w| (*w as u64).to_le_bytes().into_iter().take(self.word_size))
            .collect();
        self.map(base, &bytes);
    }

    /// Remove the region at `base`.
    pub fn unmap(&self, base: usize) {
        self.regions.lock().retain(|r| r.base != base);
    }

    /// Refuse further text writes to the region at `base`.
    pub fn set_read_only(&self, base: usize, read_only: bool) {
        if let Some(r) = self.regions.lock().iter_mut().find(|r| r.base == base) {
            r.read_only = read_only;
        }
    }

    /// Current byte at `addr`.
    pub fn byte(&self, addr: usize) -> Option<u8> {
        self.bytes(addr, 1).map(|b| b[0])
    }

    /// Copy of `len` bytes at `addr`.
    pub fn bytes(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.lock();
        let r = regions.iter().find(|r| r.contains(addr, len))?;
        let off = addr - r.base;
        Some(r.bytes[off..off + len].to_vec())
    }

    /// Number of successful text writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl KernelMemory for SimMemory {
    fn read_text(&self, addr: usize, buf: &mut [u8]) -> AxResult<()> {
        let regions = self.regions.lock();
        let Some(r) = regions.iter().find(|r| r.contains(addr, buf.len())) else {
            return ax_err!(NotFound, "sim: text not mapped");
        };
        let off = addr - r.base;
        buf.copy_from_slice(&r.bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write_text_byte(&self, addr: usize, val: u8) -> AxResult<()> {
        let mut regions = self.regions.lock();
        let Some(r) = regions.iter_mut().find(|r| r.contains(addr, 1)) else {
            return ax_err!(NotFound, "sim: text not mapped");
        };
        if r.read_only {
            return ax_err!(Unsupported, "sim: text is read-only");
        }
        let off = addr - r.base;
        r.bytes[off] = val;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_word_nofault(&self, addr: usize) -> Option<usize> {
        let bytes = self.bytes(addr, self.word_size)?;
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(&bytes);
        Some(u64::from_le_bytes(word) as usize)
    }
}

struct SimModule {
    name: String,
    state: ModuleState,
    load_gen: u64,
    symbols: SymbolList,
}

/// Simulated module subsystem.
#[derive(Default)]
pub struct SimModules {
    modules: Mutex<BTreeMap<ModuleId, SimModule>>,
}

impl SimModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live module at generation 1.
    pub fn insert(&self, id: ModuleId, name: &str, symbols: SymbolList) {
        self.modules.lock().insert(
            id,
            SimModule {
                name: name.to_string(),
                state: ModuleState::Live,
                load_gen: 1,
                symbols,
            },
        );
    }

    pub fn set_state(&self, id: ModuleId, state: ModuleState) {
        if let Some(m) = self.modules.lock().get_mut(&id) {
            m.state = state;
        }
    }

    pub fn set_symbols(&self, id: ModuleId, symbols: SymbolList) {
        if let Some(m) = self.modules.lock().get_mut(&id) {
            m.symbols = symbols;
        }
    }

    /// Simulate an unload followed by a load: the module is live again
    /// under a new generation.
    pub fn reload(&self, id: ModuleId) {
        if let Some(m) = self.modules.lock().get_mut(&id) {
            m.load_gen += 1;
            m.state = ModuleState::Live;
        }
    }

    pub fn unload(&self, id: ModuleId) {
        self.set_state(id, ModuleState::Unloaded);
    }
}

impl ModuleHost for SimModules {
    fn name(&self, module: ModuleId) -> Option<String> {
        self.modules.lock().get(&module).map(|m| m.name.clone())
    }

    fn state(&self, module: ModuleId) -> ModuleState {
        self.modules
            .lock()
            .get(&module)
            .map_or(ModuleState::Unloaded, |m| m.state)
    }

    fn load_generation(&self, module: ModuleId) -> u64 {
        self.modules.lock().get(&module).map_or(0, |m| m.load_gen)
    }

    fn symbols(&self, module: ModuleId) -> Vec<SymbolEntry> {
        self.modules
            .lock()
            .get(&module)
            .map(|m| m.symbols.clone().into_vec())
            .unwrap_or_default()
    }
}

/// Table-driven type information.
#[derive(Default)]
pub struct SimTypes {
    types: Mutex<BTreeMap<(ModuleId, usize), FunctionType>>,
}

impl SimTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe the function at `symndx` in `module`.
    pub fn insert(&self, module: ModuleId, symndx: usize, return_type: &str, args: &[&str]) {
        self.types.lock().insert(
            (module, symndx),
            FunctionType {
                return_type: return_type.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
        );
    }
}

impl TypeInfo for SimTypes {
    fn function_type(&self, module: ModuleId, symndx: usize) -> Option<FunctionType> {
        self.types.lock().get(&(module, symndx)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_are_little_endian() {
        let mem = SimMemory::new(Arch::X86_64);
        mem.map_words(0x8000, &[0x1122, 0x3344]);
        assert_eq!(mem.read_word_nofault(0x8000), Some(0x1122));
        assert_eq!(mem.read_word_nofault(0x8008), Some(0x3344));
        assert_eq!(mem.read_word_nofault(0x8010), None);

        let mem = SimMemory::new(Arch::I386);
        mem.map_words(0x8000, &[1, 2]);
        assert_eq!(mem.read_word_nofault(0x8004), Some(2));
    }

    #[test]
    fn test_read_only_text_rejects_writes() {
        let mem = SimMemory::new(Arch::X86_64);
        mem.map(0x1000, &[0x55, 0xc3]);
        mem.set_read_only(0x1000, true);
        assert!(mem.write_text_byte(0x1000, 0xcc).is_err());
        assert_eq!(mem.byte(0x1000), Some(0x55));
        assert_eq!(mem.write_count(), 0);
        assert!(mem.write_text_byte(0x3000, 0xcc).is_err());
    }

    #[test]
    fn test_reload_bumps_generation() {
        let modules = SimModules::new();
        modules.insert(ModuleId(1), "m", SymbolList::new());
        assert_eq!(modules.load_generation(ModuleId(1)), 1);
        modules.unload(ModuleId(1));
        assert_eq!(modules.state(ModuleId(1)), ModuleState::Unloaded);
        modules.reload(ModuleId(1));
        assert_eq!(modules.load_generation(ModuleId(1)), 2);
        assert_eq!(modules.state(ModuleId(1)), ModuleState::Live);
    }
}

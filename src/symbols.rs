//! Kernel symbol table management.
//!
//! Resolves kernel function names to `{address, size, type}` through the
//! kallsyms blob, so the core kernel can be presented to the provider as a
//! module with a [`SymbolList`].

use alloc::string::String;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use ksym::KallsymsMapped;

use crate::symtab::{SymbolEntry, SymbolList};

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static READY: AtomicBool = AtomicBool::new(false);

struct GlobalSymbolTable(UnsafeCell<Option<KallsymsMapped<'static>>>);
unsafe impl Sync for GlobalSymbolTable {}
static SYMBOL_TABLE: GlobalSymbolTable = GlobalSymbolTable(UnsafeCell::new(None));

use ksym::KSYM_NAME_LEN;

/// Error types for symbol operations.
#[derive(Debug)]
pub enum Error {
    /// Symbol table has already been initialized.
    AlreadyInitialized,
    /// Failed to parse the symbol table blob.
    ParseError(&'static str),
    /// Symbol table has not been initialized yet.
    NotInitialized,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Symbol table already initialized"),
            Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
            Self::NotInitialized => write!(f, "Symbol table not initialized"),
        }
    }
}

impl core::error::Error for Error {}

/// Initialize the kernel symbol table from a kallsyms blob.
///
/// `stext`/`etext` bound the kernel text section. Only the first call can
/// succeed.
pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInitialized);
    }

    let table = match KallsymsMapped::from_blob(data, stext, etext) {
        Ok(table) => table,
        Err(e) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::ParseError(e));
        }
    };

    // SAFETY: INITIALIZED admits a single writer and readers wait for READY.
    unsafe {
        *SYMBOL_TABLE.0.get() = Some(table);
    }
    READY.store(true, Ordering::Release);
    info!("fbt: kernel symbol table loaded ({} bytes)", data.len());
    Ok(())
}

/// Check if the symbol table has been initialized.
pub fn is_initialized() -> bool {
    READY.load(Ordering::Acquire)
}

fn table() -> Option<&'static KallsymsMapped<'static>> {
    if !is_initialized() {
        return None;
    }
    // SAFETY: written once before READY was published, never again.
    unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }
}

/// Lookup a symbol by address.
///
/// Returns `(name, size, offset, type)`, where `offset` is the distance of
/// `addr` from the symbol start.
pub fn lookup_symbol(addr: u64) -> Option<(String, u64, u64, char)> {
    let table = table()?;
    let mut name_buf = [0u8; KSYM_NAME_LEN];
    table
        .lookup_address(addr, &mut name_buf)
        .map(|(name, size, offset, ty)| (String::from(name), size, offset, ty))
}

/// Lookup an address by symbol name.
pub fn lookup_addr(name: &str) -> Option<u64> {
    table()?.lookup_name(name)
}

/// Resolve one function name to a symbol entry.
pub fn resolve(name: &str) -> Option<SymbolEntry> {
    let addr = lookup_addr(name)?;
    let (_, size, offset, ty) = lookup_symbol(addr)?;
    if offset != 0 {
        return None;
    }
    Some(SymbolEntry::new(name, addr as usize, size as usize, ty))
}

/// Build a symbol list from kernel function names, in the given order.
///
/// Names that do not resolve are left out.
pub fn resolve_names(names: &[&str]) -> SymbolList {
    names
        .iter()
        .filter_map(|name| {
            let entry = resolve(name);
            if entry.is_none() {
                debug!("fbt: symbol {} not found", name);
            }
            entry
        })
        .collect()
}

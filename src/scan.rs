//! Instruction scanner.
//!
//! Decides which functions of a module may be instrumented and finds their
//! entry and return patch points. The scanner only looks at bytes; creating
//! probe records from its output is the provider's job.

use alloc::vec::Vec;

use crate::arch::{Emulate, InsnPattern};
use crate::symtab::SymbolEntry;

/// Why a function produced no probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Symbol has no name.
    NoName,
    /// Symbol is not in a text section.
    NotText,
    /// Function belongs to the tracing engine itself.
    EngineInternal,
    /// Function may run in debugger or probe-handler context.
    DebuggerContext,
    /// Symbol size cannot be trusted.
    UntrustedSize,
    /// Symbol has no address or covers no bytes.
    Empty,
    /// Function text could not be read.
    Unreadable,
    /// Symbol size exceeds the configured cap.
    Oversized,
    /// No memory to buffer the function text.
    NoMemory,
    /// No frame-pointer prologue was found.
    NoPrologue,
}

impl Skip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Skip::NoName => "no name",
            Skip::NotText => "not text",
            Skip::EngineInternal => "engine internal",
            Skip::DebuggerContext => "debugger context",
            Skip::UntrustedSize => "untrusted size",
            Skip::Empty => "empty",
            Skip::Unreadable => "unreadable",
            Skip::Oversized => "oversized",
            Skip::NoMemory => "no memory",
            Skip::NoPrologue => "no prologue",
        }
    }
}

/// Apply the name and kind filters to a symbol.
pub fn check_eligible(sym: &SymbolEntry) -> Result<(), Skip> {
    let name = sym.name.as_str();
    if name.is_empty() {
        return Err(Skip::NoName);
    }
    if !sym.is_text() {
        return Err(Skip::NotText);
    }
    // dtrace_safe_ functions are explicitly written to be probed.
    if name.starts_with("dtrace_") && !name.starts_with("dtrace_safe_") {
        return Err(Skip::EngineInternal);
    }
    if name.starts_with("kdi_") || name.starts_with("kprobe") {
        return Err(Skip::DebuggerContext);
    }
    if name == "_init" || name == "_fini" {
        return Err(Skip::UntrustedSize);
    }
    if sym.size == 0 || sym.addr == 0 {
        return Err(Skip::Empty);
    }
    Ok(())
}

/// One patch point inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    /// Offset of the patch point from function start.
    pub offset: usize,
    /// Byte currently at the patch point.
    pub saved: u8,
    /// Instruction the trap will replace.
    pub emulate: Emulate,
    /// 0 for the entry site, return offset for return sites.
    pub roffset: usize,
}

/// Patch points of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSites {
    pub entry: Site,
    pub returns: Vec<Site>,
}

/// Find the entry site and every return site in `code`.
///
/// Return sites are collected by a linear decode starting at the entry
/// point. An undecodable instruction ends the walk; sites found before it
/// are kept.
pub fn scan_function(pattern: &dyn InsnPattern, code: &[u8]) -> Result<FunctionSites, Skip> {
    let entry_off = pattern.match_entry(code).ok_or(Skip::NoPrologue)?;
    let entry = Site {
        offset: entry_off,
        saved: code[entry_off],
        emulate: Emulate::PushFramePointer,
        roffset: 0,
    };

    let mut returns = Vec::new();
    let mut off = entry_off;
    while off < code.len() {
        let rest = &code[off..];
        let Some(len) = pattern.insn_len(rest) else {
            break;
        };
        if let Some(exit) = pattern.classify_exit(rest, len) {
            returns.push(Site {
                offset: off,
                saved: code[off],
                emulate: exit.emulate,
                roffset: off + exit.roffset_bias,
            });
        }
        off += len;
    }

    Ok(FunctionSites { entry, returns })
}

/// Counters collected while providing one module.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Symbols examined.
    pub functions: usize,
    /// Symbols rejected by name, kind or size.
    pub filtered: usize,
    /// Functions whose text could not be read or was too large to buffer.
    pub unreadable: usize,
    /// Functions without a recognisable prologue.
    pub no_prologue: usize,
    /// Entry records created.
    pub entry_probes: usize,
    /// Return records created.
    pub return_probes: usize,
    /// Functions or records dropped for lack of memory, table slots or
    /// engine probes.
    pub alloc_failures: usize,
}

impl ScanStats {
    pub fn record_skip(&mut self, skip: Skip) {
        match skip {
            Skip::Unreadable | Skip::Oversized => self.unreadable += 1,
            Skip::NoMemory => self.alloc_failures += 1,
            Skip::NoPrologue => self.no_prologue += 1,
            _ => self.filtered += 1,
        }
    }

    /// Total records created.
    pub fn probes(&self) -> usize {
        self.entry_probes + self.return_probes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    #[test]
    fn test_eligibility_filters() {
        let sym = |name: &str, kind| SymbolEntry::new(name, 0x1000, 16, kind);
        assert_eq!(check_eligible(&sym("", 'T')), Err(Skip::NoName));
        assert_eq!(check_eligible(&sym("jiffies", 'D')), Err(Skip::NotText));
        assert_eq!(check_eligible(&sym("dtrace_probe", 'T')), Err(Skip::EngineInternal));
        assert_eq!(check_eligible(&sym("dtrace_safe_copy", 'T')), Ok(()));
        assert_eq!(check_eligible(&sym("kdi_enter", 't')), Err(Skip::DebuggerContext));
        assert_eq!(check_eligible(&sym("kprobe_handler", 't')), Err(Skip::DebuggerContext));
        assert_eq!(check_eligible(&sym("_init", 'T')), Err(Skip::UntrustedSize));
        assert_eq!(check_eligible(&sym("_fini", 'T')), Err(Skip::UntrustedSize));
        assert_eq!(check_eligible(&SymbolEntry::new("f", 0x1000, 0, 'T')), Err(Skip::Empty));
        assert_eq!(check_eligible(&sym("vfs_read", 'T')), Ok(()));
    }

    #[test]
    fn test_scan_stops_at_undecodable_tail() {
        // push %rbp; ret; truncated call
        let code = [0x55, 0xc3, 0xe8, 0x00];
        let sites = scan_function(Arch::X86_64.pattern(), &code).unwrap();
        assert_eq!(sites.returns.len(), 1);
        assert_eq!(sites.returns[0].offset, 1);
    }

    #[test]
    fn test_skip_counters() {
        let mut stats = ScanStats::default();
        stats.record_skip(Skip::NoPrologue);
        stats.record_skip(Skip::NoName);
        stats.record_skip(Skip::Unreadable);
        stats.record_skip(Skip::Oversized);
        stats.record_skip(Skip::NoMemory);
        assert_eq!((stats.no_prologue, stats.filtered, stats.unreadable), (1, 1, 2));
        assert_eq!(stats.alloc_failures, 1);
    }
}

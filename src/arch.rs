//! Instruction patterns for function boundary recognition.
//!
//! Each supported architecture supplies an [`InsnPattern`] that knows how to
//! find the entry patch point of a function, how to recognise a return site,
//! and which single-byte trap opcode to install.
//!
//! - i386: the function must open with `push %ebp; mov %esp,%ebp`. Returns are
//!   instrumented at the `pop %ebp` / `leave` that precedes `ret`.
//! - x86_64: the compiler may split or reorder the frame setup, so the first
//!   `push %rbp` found by a linear decode is used. Only bare `ret` is
//!   instrumented.

use iced_x86::{Decoder, DecoderOptions};

/// `push %ebp` / `push %rbp`
pub const PUSHL_EBP: u8 = 0x55;
/// First/second byte of `mov %esp,%ebp`, encoding 0 (`8b ec`).
pub const MOVL_ESP_EBP0_V0: u8 = 0x8b;
pub const MOVL_ESP_EBP1_V0: u8 = 0xec;
/// First/second byte of `mov %esp,%ebp`, encoding 1 (`89 e5`).
pub const MOVL_ESP_EBP0_V1: u8 = 0x89;
pub const MOVL_ESP_EBP1_V1: u8 = 0xe5;

pub const POPL_EBP: u8 = 0x5d;
pub const RET: u8 = 0xc3;
pub const RET_IMM16: u8 = 0xc2;
pub const LEAVE: u8 = 0xc9;

/// `int3`
pub const PATCHVAL_X86_64: u8 = 0xcc;
/// `lock` prefix; executing it alone raises #UD.
pub const PATCHVAL_I386: u8 = 0xf0;

/// Instruction the trap byte replaced.
///
/// Returned to the host trap machinery so it can emulate the original
/// instruction before resuming. The discriminants are the host's invalid
/// opcode codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulate {
    /// `push %ebp` / `push %rbp`
    PushFramePointer = 1,
    /// `pop %ebp`
    PopFramePointer = 2,
    /// `leave`
    Leave = 3,
    /// `ret`
    Ret = 5,
}

impl Emulate {
    /// Host code for this emulation.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a host code previously produced by [`Emulate::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::PushFramePointer),
            2 => Some(Self::PopFramePointer),
            3 => Some(Self::Leave),
            5 => Some(Self::Ret),
            _ => None,
        }
    }
}

/// A recognised return site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSite {
    /// Instruction the trap replaces at this site.
    pub emulate: Emulate,
    /// Added to the site's offset from function start to form the return
    /// offset reported to the tracing engine.
    pub roffset_bias: usize,
}

/// Architecture-specific prologue/epilogue recognition.
pub trait InsnPattern: Send + Sync {
    /// Architecture this pattern describes.
    fn arch(&self) -> Arch;

    /// Trap byte installed at every patch point.
    fn patch_value(&self) -> u8;

    /// Length of the instruction at the start of `code`, or `None` if it
    /// cannot be decoded.
    fn insn_len(&self, code: &[u8]) -> Option<usize>;

    /// Offset of the entry patch point within `code`, or `None` if the
    /// function does not establish a frame pointer.
    fn match_entry(&self, code: &[u8]) -> Option<usize>;

    /// Classify the instruction at the start of `code`, already known to be
    /// `len` bytes long, as a return site.
    fn classify_exit(&self, code: &[u8], len: usize) -> Option<ExitSite>;
}

/// Supported instruction set families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit x86 (narrow pointers).
    I386,
    /// x86_64 (wide pointers).
    X86_64,
}

impl Arch {
    /// Architecture of the build target.
    pub const fn host() -> Self {
        if cfg!(target_arch = "x86") {
            Arch::I386
        } else {
            Arch::X86_64
        }
    }

    /// Pattern strategy for this architecture.
    pub fn pattern(self) -> &'static dyn InsnPattern {
        match self {
            Arch::I386 => &I386Pattern,
            Arch::X86_64 => &X86_64Pattern,
        }
    }

    /// Width of a stack slot in bytes.
    pub fn word_size(self) -> usize {
        match self {
            Arch::I386 => 4,
            Arch::X86_64 => 8,
        }
    }

    fn bitness(self) -> u32 {
        match self {
            Arch::I386 => 32,
            Arch::X86_64 => 64,
        }
    }

    /// Short label for display.
    pub fn label(self) -> &'static str {
        match self {
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
        }
    }
}

fn decode_len(arch: Arch, code: &[u8]) -> Option<usize> {
    if code.is_empty() {
        return None;
    }
    let mut decoder = Decoder::new(arch.bitness(), code, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return None;
    }
    match insn.len() {
        0 => None,
        len => Some(len),
    }
}

/// i386 strategy: exact `push %ebp; mov %esp,%ebp` gate.
#[derive(Debug, Clone, Copy)]
pub struct I386Pattern;

impl InsnPattern for I386Pattern {
    fn arch(&self) -> Arch {
        Arch::I386
    }

    fn patch_value(&self) -> u8 {
        PATCHVAL_I386
    }

    fn insn_len(&self, code: &[u8]) -> Option<usize> {
        decode_len(Arch::I386, code)
    }

    fn match_entry(&self, code: &[u8]) -> Option<usize> {
        match code {
            [PUSHL_EBP, MOVL_ESP_EBP0_V0, MOVL_ESP_EBP1_V0, ..]
            | [PUSHL_EBP, MOVL_ESP_EBP0_V1, MOVL_ESP_EBP1_V1, ..] => Some(0),
            _ => None,
        }
    }

    fn classify_exit(&self, code: &[u8], len: usize) -> Option<ExitSite> {
        if len != 1 {
            return None;
        }
        let emulate = match code.first()? {
            &POPL_EBP => Emulate::PopFramePointer,
            &LEAVE => Emulate::Leave,
            _ => return None,
        };
        match code.get(1)? {
            &RET | &RET_IMM16 => Some(ExitSite {
                emulate,
                // the return address lands on the ret following the pop
                roffset_bias: 1,
            }),
            _ => None,
        }
    }
}

/// x86_64 strategy: first `push %rbp` anywhere before the end.
#[derive(Debug, Clone, Copy)]
pub struct X86_64Pattern;

impl InsnPattern for X86_64Pattern {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn patch_value(&self) -> u8 {
        PATCHVAL_X86_64
    }

    fn insn_len(&self, code: &[u8]) -> Option<usize> {
        decode_len(Arch::X86_64, code)
    }

    fn match_entry(&self, code: &[u8]) -> Option<usize> {
        let mut off = 0;
        while off < code.len() {
            if code[off] == PUSHL_EBP {
                return Some(off);
            }
            off += self.insn_len(&code[off..])?;
        }
        None
    }

    fn classify_exit(&self, code: &[u8], _len: usize) -> Option<ExitSite> {
        // ret imm16 is never emitted for kernel text, so it is not instrumented.
        match code.first()? {
            &RET => Some(ExitSite {
                emulate: Emulate::Ret,
                roffset_bias: 0,
            }),
            _ => None,
        }
    }
}

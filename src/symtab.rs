//! Module symbol lists.
//!
//! A [`SymbolList`] is the ordered `{name, address, size, kind}` sequence the
//! scanner walks. Lists can be built directly or parsed from `nm`-style text
//! (`grep foo /proc/kallsyms` output), which is how symbol information is
//! bootstrapped when the host does not expose its tables.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// One symbol of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Symbol name.
    pub name: String,
    /// Start address.
    pub addr: usize,
    /// Size in bytes.
    pub size: usize,
    /// Symbol type character (T, t, D, d, etc.)
    pub kind: char,
}

impl SymbolEntry {
    pub fn new(name: &str, addr: usize, size: usize, kind: char) -> Self {
        Self {
            name: name.to_string(),
            addr,
            size,
            kind,
        }
    }

    /// Whether this symbol lives in a text section.
    pub fn is_text(&self) -> bool {
        matches!(self.kind, 't' | 'T')
    }
}

/// Error types for symbol list parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Line does not have the `addr [size] type name` shape.
    Malformed(usize),
    /// Address or size field is not hexadecimal.
    BadNumber(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Malformed(line) => write!(f, "Malformed symbol line {}", line),
            Self::BadNumber(line) => write!(f, "Bad hexadecimal field on symbol line {}", line),
        }
    }
}

impl core::error::Error for Error {}

/// Ordered symbol table of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolList {
    entries: Vec<SymbolEntry>,
}

impl SymbolList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a symbol.
    pub fn push(&mut self, entry: SymbolEntry) {
        self.entries.push(entry);
    }

    /// Builder-style append.
    pub fn with(mut self, name: &str, addr: usize, size: usize, kind: char) -> Self {
        self.push(SymbolEntry::new(name, addr, size, kind));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, SymbolEntry> {
        self.entries.iter()
    }

    /// Look up a symbol by name.
    pub fn find(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn into_vec(self) -> Vec<SymbolEntry> {
        self.entries
    }

    /// Parse `nm`-style text.
    ///
    /// Accepted line shapes:
    /// - `addr type name [module]` (`nm -p`, `/proc/kallsyms`)
    /// - `addr size type name [module]` (`nm -S`)
    ///
    /// When the size column is absent, a symbol's size is the distance to
    /// the next higher symbol address; the highest symbol gets size 0.
    /// Blank lines are ignored.
    pub fn from_nm(text: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        let mut sized = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let mut fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            // kallsyms appends the owning module as `[name]`
            if fields.len() > 3 && fields.last().is_some_and(|f| f.starts_with('[')) {
                fields.pop();
            }

            let (addr, size, kind, name) = match fields.as_slice() {
                [addr, size, kind, name] if is_type_field(kind) && parse_hex(size).is_some() => {
                    (*addr, Some(*size), *kind, *name)
                }
                [addr, kind, name] if is_type_field(kind) => (*addr, None, *kind, *name),
                _ => return Err(Error::Malformed(line_no)),
            };

            let addr = parse_hex(addr).ok_or(Error::BadNumber(line_no))?;
            let size = match size {
                Some(s) => Some(parse_hex(s).ok_or(Error::BadNumber(line_no))?),
                None => None,
            };
            let kind = kind.chars().next().ok_or(Error::Malformed(line_no))?;

            entries.push(SymbolEntry::new(name, addr, size.unwrap_or(0), kind));
            sized.push(size.is_some());
        }

        let mut addrs: Vec<usize> = entries.iter().map(|e| e.addr).collect();
        addrs.sort_unstable();
        addrs.dedup();
        for (entry, has_size) in entries.iter_mut().zip(sized) {
            if has_size {
                continue;
            }
            let next = addrs.partition_point(|&a| a <= entry.addr);
            entry.size = addrs.get(next).map_or(0, |&n| n - entry.addr);
        }

        Ok(Self { entries })
    }
}

impl FromIterator<SymbolEntry> for SymbolList {
    fn from_iter<I: IntoIterator<Item = SymbolEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn is_type_field(field: &str) -> bool {
    let mut chars = field.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphabetic() || c == '?')
}

fn parse_hex(field: &str) -> Option<usize> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    usize::from_str_radix(digits, 16).ok()
}

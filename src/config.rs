//! Provider configuration.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::Arch;

/// Default number of probe table buckets.
pub const DEFAULT_TABLE_SIZE: usize = 0x8000;
/// Default right shift applied to an address before bucket masking.
pub const DEFAULT_HASH_SHIFT: u32 = 4;
/// Default number of probe record slots.
pub const DEFAULT_MAX_PROBES: usize = 0x10000;
/// Frames between the traced function and the engine's fire call.
pub const DEFAULT_AFRAMES: u32 = 3;
/// Largest function body the scanner will buffer.
pub const DEFAULT_MAX_FUNCTION_SIZE: usize = 0x10_0000;

/// Error types for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Provider name is empty.
    EmptyName,
    /// Bucket count is zero or not a power of two.
    TableSize(usize),
    /// Shift would discard every address bit.
    HashShift(u32),
    /// Record capacity is zero or does not fit a slot index.
    Capacity(usize),
    /// Function size cap is zero.
    FunctionSize,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Provider name must not be empty"),
            Self::TableSize(n) => write!(f, "Table size must be a power of two, got {}", n),
            Self::HashShift(s) => write!(f, "Hash shift out of range: {}", s),
            Self::Capacity(n) => write!(f, "Invalid probe capacity: {}", n),
            Self::FunctionSize => write!(f, "Function size cap must be non-zero"),
        }
    }
}

impl core::error::Error for Error {}

/// FBT provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FbtConfig {
    /// Name the provider registers under.
    pub provider_name: String,
    /// Number of probe table buckets.
    pub table_size: usize,
    /// Address shift used by the bucket hash.
    pub hash_shift: u32,
    /// Maximum number of probe records.
    pub max_probes: usize,
    /// Instruction set of the instrumented text.
    pub arch: Arch,
    /// Log guard refusals at info level.
    pub verbose: bool,
    /// Modules that are never instrumented.
    pub excluded_modules: Vec<String>,
    /// Artificial frame count passed to the engine.
    pub aframes: u32,
    /// Symbols claiming a larger size are not scanned. `usize::MAX`
    /// disables the cap.
    pub max_function_size: usize,
}

impl Default for FbtConfig {
    fn default() -> Self {
        Self {
            provider_name: "fbt".to_string(),
            table_size: DEFAULT_TABLE_SIZE,
            hash_shift: DEFAULT_HASH_SHIFT,
            max_probes: DEFAULT_MAX_PROBES,
            arch: Arch::host(),
            verbose: false,
            excluded_modules: vec!["dtrace".to_string(), "kmdbmod".to_string()],
            aframes: DEFAULT_AFRAMES,
            max_function_size: DEFAULT_MAX_FUNCTION_SIZE,
        }
    }
}

impl FbtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn with_table_size(mut self, size: usize) -> Self {
        self.table_size = size;
        self
    }

    pub fn with_hash_shift(mut self, shift: u32) -> Self {
        self.hash_shift = shift;
        self
    }

    pub fn with_max_probes(mut self, max: usize) -> Self {
        self.max_probes = max;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Replace the excluded module list.
    pub fn with_excluded_modules(mut self, modules: &[&str]) -> Self {
        self.excluded_modules = modules.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_aframes(mut self, aframes: u32) -> Self {
        self.aframes = aframes;
        self
    }

    pub fn with_max_function_size(mut self, size: usize) -> Self {
        self.max_function_size = size;
        self
    }

    /// Whether `module` is on the exclusion list.
    pub fn is_excluded(&self, module: &str) -> bool {
        self.excluded_modules.iter().any(|m| m == module)
    }

    /// Check that the settings describe a usable probe table.
    pub fn validate(&self) -> Result<(), Error> {
        if self.provider_name.is_empty() {
            return Err(Error::EmptyName);
        }
        if self.table_size == 0 || !self.table_size.is_power_of_two() {
            return Err(Error::TableSize(self.table_size));
        }
        if self.hash_shift >= usize::BITS {
            return Err(Error::HashShift(self.hash_shift));
        }
        if self.max_probes == 0 || self.max_probes >= u32::MAX as usize {
            return Err(Error::Capacity(self.max_probes));
        }
        if self.max_function_size == 0 {
            return Err(Error::FunctionSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FbtConfig::default();
        assert_eq!(config.provider_name, "fbt");
        assert_eq!(config.table_size, 0x8000);
        assert_eq!(config.hash_shift, 4);
        assert!(config.is_excluded("dtrace"));
        assert!(config.is_excluded("kmdbmod"));
        assert!(!config.is_excluded("ext4"));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert_eq!(
            FbtConfig::new().with_table_size(100).validate(),
            Err(Error::TableSize(100))
        );
        assert_eq!(
            FbtConfig::new().with_max_probes(0).validate(),
            Err(Error::Capacity(0))
        );
        assert!(FbtConfig::new().with_hash_shift(usize::BITS).validate().is_err());
        assert_eq!(
            FbtConfig::new().with_provider_name("").validate(),
            Err(Error::EmptyName)
        );
        assert_eq!(
            FbtConfig::new().with_max_function_size(0).validate(),
            Err(Error::FunctionSize)
        );
    }
}

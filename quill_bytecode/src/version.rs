//! Source-language version tags.

use std::fmt;
use std::str::FromStr;

/// The bytecode dialect a code object was compiled for.
///
/// The version governs jump operand units and the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PythonVersion {
    /// CPython 3.9: jump operands are byte offsets.
    V3_9,
    /// CPython 3.10: jump operands count instructions.
    #[default]
    V3_10,
}

impl PythonVersion {
    /// Number of bytes one unit of a jump operand represents.
    #[inline]
    pub const fn jump_unit_bytes(self) -> u32 {
        match self {
            PythonVersion::V3_9 => 1,
            PythonVersion::V3_10 => 2,
        }
    }

    /// Convert a jump operand to code units; `None` if it does not fit.
    #[inline]
    pub const fn jump_arg_to_units(self, arg: u32) -> Option<u32> {
        match arg.checked_mul(self.jump_unit_bytes()) {
            Some(bytes) => Some(bytes / 2),
            None => None,
        }
    }

    /// Convert a distance in code units to a jump operand; `None` if it does
    /// not fit.
    #[inline]
    pub const fn units_to_jump_arg(self, units: u32) -> Option<u32> {
        match units.checked_mul(2) {
            Some(bytes) => Some(bytes / self.jump_unit_bytes()),
            None => None,
        }
    }

    /// `(major, minor)` pair.
    pub const fn as_tuple(self) -> (u8, u8) {
        match self {
            PythonVersion::V3_9 => (3, 9),
            PythonVersion::V3_10 => (3, 10),
        }
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.as_tuple();
        write!(f, "{}.{}", major, minor)
    }
}

impl FromStr for PythonVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3.9" => Ok(PythonVersion::V3_9),
            "3.10" => Ok(PythonVersion::V3_10),
            other => Err(format!("unsupported python version `{}`", other)),
        }
    }
}

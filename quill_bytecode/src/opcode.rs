//! CPython opcode tables for the supported bytecode dialects.
//!
//! Opcode numbers are shared between 3.9 and 3.10 except where noted; a few
//! opcodes exist in only one of them. [`Opcode::from_byte`] consults the
//! version so that a 3.9 stream containing a 3.10-only byte is rejected.
//!
//! # Operand encoding
//!
//! Every instruction is one 16-bit code unit: opcode byte, then argument
//! byte. Arguments wider than 8 bits are built up by `EXTENDED_ARG` prefixes.
//! Opcodes below [`HAVE_ARGUMENT`] ignore their argument byte.

use crate::PythonVersion;
use std::fmt;

/// First opcode number whose argument byte is meaningful.
pub const HAVE_ARGUMENT: u8 = 90;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $variant:ident = $byte:literal => $name:literal,)*) => {
        /// A CPython opcode.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $variant = $byte,)*
        }

        impl Opcode {
            /// Every opcode known to any supported dialect.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// The CPython mnemonic.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            fn from_raw(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1 => "POP_TOP",
    RotTwo = 2 => "ROT_TWO",
    RotThree = 3 => "ROT_THREE",
    DupTop = 4 => "DUP_TOP",
    DupTopTwo = 5 => "DUP_TOP_TWO",
    RotFour = 6 => "ROT_FOUR",
    Nop = 9 => "NOP",
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    UnaryInvert = 15 => "UNARY_INVERT",
    BinaryMatrixMultiply = 16 => "BINARY_MATRIX_MULTIPLY",
    InplaceMatrixMultiply = 17 => "INPLACE_MATRIX_MULTIPLY",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",
    /// 3.10 only.
    GetLen = 30 => "GET_LEN",
    /// 3.10 only.
    MatchMapping = 31 => "MATCH_MAPPING",
    /// 3.10 only.
    MatchSequence = 32 => "MATCH_SEQUENCE",
    /// 3.10 only.
    MatchKeys = 33 => "MATCH_KEYS",
    /// 3.10 only.
    CopyDictWithoutKeys = 34 => "COPY_DICT_WITHOUT_KEYS",
    /// 3.9 encoding of `RERAISE` (no argument).
    Reraise39 = 48 => "RERAISE",
    WithExceptStart = 49 => "WITH_EXCEPT_START",
    GetAiter = 50 => "GET_AITER",
    GetAnext = 51 => "GET_ANEXT",
    BeforeAsyncWith = 52 => "BEFORE_ASYNC_WITH",
    EndAsyncFor = 54 => "END_ASYNC_FOR",
    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    BinaryLshift = 62 => "BINARY_LSHIFT",
    BinaryRshift = 63 => "BINARY_RSHIFT",
    BinaryAnd = 64 => "BINARY_AND",
    BinaryXor = 65 => "BINARY_XOR",
    BinaryOr = 66 => "BINARY_OR",
    InplacePower = 67 => "INPLACE_POWER",
    GetIter = 68 => "GET_ITER",
    GetYieldFromIter = 69 => "GET_YIELD_FROM_ITER",
    PrintExpr = 70 => "PRINT_EXPR",
    LoadBuildClass = 71 => "LOAD_BUILD_CLASS",
    YieldFrom = 72 => "YIELD_FROM",
    GetAwaitable = 73 => "GET_AWAITABLE",
    LoadAssertionError = 74 => "LOAD_ASSERTION_ERROR",
    InplaceLshift = 75 => "INPLACE_LSHIFT",
    InplaceRshift = 76 => "INPLACE_RSHIFT",
    InplaceAnd = 77 => "INPLACE_AND",
    InplaceXor = 78 => "INPLACE_XOR",
    InplaceOr = 79 => "INPLACE_OR",
    ListToTuple = 82 => "LIST_TO_TUPLE",
    ReturnValue = 83 => "RETURN_VALUE",
    ImportStar = 84 => "IMPORT_STAR",
    SetupAnnotations = 85 => "SETUP_ANNOTATIONS",
    YieldValue = 86 => "YIELD_VALUE",
    PopBlock = 87 => "POP_BLOCK",
    PopExcept = 89 => "POP_EXCEPT",
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    ForIter = 93 => "FOR_ITER",
    UnpackEx = 94 => "UNPACK_EX",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    /// 3.10 only.
    RotN = 99 => "ROT_N",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildSet = 104 => "BUILD_SET",
    BuildMap = 105 => "BUILD_MAP",
    LoadAttr = 106 => "LOAD_ATTR",
    CompareOp = 107 => "COMPARE_OP",
    ImportName = 108 => "IMPORT_NAME",
    ImportFrom = 109 => "IMPORT_FROM",
    JumpForward = 110 => "JUMP_FORWARD",
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    IsOp = 117 => "IS_OP",
    ContainsOp = 118 => "CONTAINS_OP",
    /// 3.10 encoding of `RERAISE` (argument: restore `f_lasti`).
    Reraise = 119 => "RERAISE",
    JumpIfNotExcMatch = 121 => "JUMP_IF_NOT_EXC_MATCH",
    SetupFinally = 122 => "SETUP_FINALLY",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    /// 3.10 only.
    GenStart = 129 => "GEN_START",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    LoadClosure = 135 => "LOAD_CLOSURE",
    LoadDeref = 136 => "LOAD_DEREF",
    StoreDeref = 137 => "STORE_DEREF",
    DeleteDeref = 138 => "DELETE_DEREF",
    CallFunctionKw = 141 => "CALL_FUNCTION_KW",
    CallFunctionEx = 142 => "CALL_FUNCTION_EX",
    SetupWith = 143 => "SETUP_WITH",
    ExtendedArg = 144 => "EXTENDED_ARG",
    ListAppend = 145 => "LIST_APPEND",
    SetAdd = 146 => "SET_ADD",
    MapAdd = 147 => "MAP_ADD",
    LoadClassderef = 148 => "LOAD_CLASSDEREF",
    /// 3.10 only.
    MatchClass = 152 => "MATCH_CLASS",
    SetupAsyncWith = 154 => "SETUP_ASYNC_WITH",
    FormatValue = 155 => "FORMAT_VALUE",
    BuildConstKeyMap = 156 => "BUILD_CONST_KEY_MAP",
    BuildString = 157 => "BUILD_STRING",
    LoadMethod = 160 => "LOAD_METHOD",
    CallMethod = 161 => "CALL_METHOD",
    ListExtend = 162 => "LIST_EXTEND",
    SetUpdate = 163 => "SET_UPDATE",
    DictMerge = 164 => "DICT_MERGE",
    DictUpdate = 165 => "DICT_UPDATE",
}

/// How a jump opcode's argument names its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Target is relative to the following instruction.
    Relative,
    /// Target is an absolute position.
    Absolute,
}

impl Opcode {
    /// Decode an opcode byte for the given dialect.
    ///
    /// Returns `None` when the byte names no opcode of that dialect.
    pub fn from_byte(byte: u8, version: PythonVersion) -> Option<Opcode> {
        let op = Opcode::from_raw(byte)?;
        op.exists_in(version).then_some(op)
    }

    /// The opcode byte.
    #[inline]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Whether this opcode exists in the given dialect.
    pub fn exists_in(self, version: PythonVersion) -> bool {
        use Opcode::*;
        match self {
            GetLen | MatchMapping | MatchSequence | MatchKeys | CopyDictWithoutKeys | RotN
            | Reraise | GenStart | MatchClass => version >= PythonVersion::V3_10,
            Reraise39 => version == PythonVersion::V3_9,
            _ => true,
        }
    }

    /// Whether the argument byte is meaningful.
    #[inline]
    pub const fn has_arg(self) -> bool {
        self.byte() >= HAVE_ARGUMENT
    }

    /// How the argument encodes a jump target, for jump opcodes.
    pub const fn jump_kind(self) -> Option<JumpKind> {
        use Opcode::*;
        match self {
            ForIter | JumpForward | SetupFinally | SetupWith | SetupAsyncWith => {
                Some(JumpKind::Relative)
            }
            JumpIfFalseOrPop | JumpIfTrueOrPop | JumpAbsolute | PopJumpIfFalse
            | PopJumpIfTrue | JumpIfNotExcMatch => Some(JumpKind::Absolute),
            _ => None,
        }
    }

    /// Whether the translator handles this opcode.
    ///
    /// Coroutine and structural pattern matching opcodes are recognised but
    /// not translated. `EXTENDED_ARG` is consumed by the decoder and never
    /// reaches the translator.
    pub const fn is_supported(self) -> bool {
        use Opcode::*;
        !matches!(
            self,
            GetAiter
                | GetAnext
                | BeforeAsyncWith
                | EndAsyncFor
                | GetAwaitable
                | SetupAsyncWith
                | GetLen
                | MatchMapping
                | MatchSequence
                | MatchKeys
                | MatchClass
                | CopyDictWithoutKeys
                | ExtendedArg
        )
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Operand Enums
// =============================================================================

/// `COMPARE_OP` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareOp {
    /// Decode a `COMPARE_OP` argument.
    pub const fn from_arg(arg: u32) -> Option<CompareOp> {
        match arg {
            0 => Some(CompareOp::Lt),
            1 => Some(CompareOp::Le),
            2 => Some(CompareOp::Eq),
            3 => Some(CompareOp::Ne),
            4 => Some(CompareOp::Gt),
            5 => Some(CompareOp::Ge),
            _ => None,
        }
    }

    /// The rich-comparison method implementing this comparison.
    pub const fn dunder(self) -> &'static str {
        match self {
            CompareOp::Lt => "__lt__",
            CompareOp::Le => "__le__",
            CompareOp::Eq => "__eq__",
            CompareOp::Ne => "__ne__",
            CompareOp::Gt => "__gt__",
            CompareOp::Ge => "__ge__",
        }
    }

    /// The reflected comparison (`a < b` is `b > a`).
    pub const fn swapped(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }

    /// The operator symbol.
    pub const fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// `MAKE_FUNCTION` argument flags.
pub mod make_function {
    pub const DEFAULTS: u32 = 0x01;
    pub const KW_DEFAULTS: u32 = 0x02;
    pub const ANNOTATIONS: u32 = 0x04;
    pub const CLOSURE: u32 = 0x08;
}

/// `FORMAT_VALUE` argument bits.
pub mod format_value {
    pub const CONVERSION_MASK: u32 = 0x03;
    pub const NONE: u32 = 0x00;
    pub const STR: u32 = 0x01;
    pub const REPR: u32 = 0x02;
    pub const ASCII: u32 = 0x03;
    pub const HAS_SPEC: u32 = 0x04;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_cpython() {
        assert_eq!(Opcode::LoadConst.name(), "LOAD_CONST");
        assert_eq!(Opcode::LoadConst.byte(), 100);
        assert_eq!(Opcode::Reraise39.name(), Opcode::Reraise.name());
    }

    #[test]
    fn test_version_specific_bytes() {
        assert_eq!(Opcode::from_byte(48, PythonVersion::V3_9), Some(Opcode::Reraise39));
        assert_eq!(Opcode::from_byte(48, PythonVersion::V3_10), None);
        assert_eq!(Opcode::from_byte(119, PythonVersion::V3_10), Some(Opcode::Reraise));
        assert_eq!(Opcode::from_byte(119, PythonVersion::V3_9), None);
        assert_eq!(Opcode::from_byte(129, PythonVersion::V3_9), None);
        assert_eq!(Opcode::from_byte(0, PythonVersion::V3_10), None);
    }

    #[test]
    fn test_jump_kinds() {
        assert_eq!(Opcode::ForIter.jump_kind(), Some(JumpKind::Relative));
        assert_eq!(Opcode::PopJumpIfFalse.jump_kind(), Some(JumpKind::Absolute));
        assert_eq!(Opcode::LoadFast.jump_kind(), None);
    }

    #[test]
    fn test_has_arg_threshold() {
        assert!(!Opcode::PopExcept.has_arg());
        assert!(Opcode::StoreName.has_arg());
        // RERAISE moved above HAVE_ARGUMENT in 3.10
        assert!(Opcode::Reraise.has_arg());
        assert!(!Opcode::Reraise39.has_arg());
    }

    #[test]
    fn test_unsupported_families() {
        assert!(!Opcode::GetAwaitable.is_supported());
        assert!(!Opcode::MatchClass.is_supported());
        assert!(Opcode::YieldFrom.is_supported());
    }

    #[test]
    fn test_compare_op() {
        let op = CompareOp::from_arg(0).unwrap();
        assert_eq!(op, CompareOp::Lt);
        assert_eq!(op.dunder(), "__lt__");
        assert_eq!(op.swapped(), CompareOp::Gt);
        assert!(CompareOp::from_arg(6).is_none());
    }
}

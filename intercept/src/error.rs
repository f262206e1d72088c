use thiserror::Error;

/// Failure to turn a byte window into one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction truncated: needs {needed} bytes, window has {available}")]
    Truncated { needed: usize, available: usize },
    #[error("opcode {opcode:#04x} at {pc:#x} is not valid in 64-bit mode")]
    InvalidOpcode { pc: u64, opcode: u32 },
    #[error("instruction address {pc:#x} is not 4-byte aligned")]
    Misaligned { pc: u64 },
}

/// Why a block of code could not be moved to a new address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocationError {
    #[error("branch at offset {source_offset:#x} targets offset {target_offset:#x} inside the patched region")]
    BranchIntoPatchedRegion { source_offset: usize, target_offset: usize },
    #[error("branch targets offset {target_offset:#x}, which is not an instruction boundary")]
    MidInstructionTarget { target_offset: usize },
    #[error("pc-relative operand at {pc:#x} cannot reach {target:#x} from the new location")]
    DisplacementOverflow { pc: u64, target: u64 },
    #[error("short branch at {pc:#x} has no wide form")]
    NoWideForm { pc: u64 },
    #[error("B/BL at {pc:#x} cannot reach {target:#x}")]
    BranchOutOfRange { pc: u64, target: u64 },
    #[error("B.cond at {pc:#x} cannot reach {target:#x}")]
    CondBranchOutOfRange { pc: u64, target: u64 },
    #[error("CBZ/CBNZ at {pc:#x} cannot reach {target:#x}")]
    CompareBranchOutOfRange { pc: u64, target: u64 },
    #[error("TBZ/TBNZ at {pc:#x} cannot reach {target:#x}")]
    TestBranchOutOfRange { pc: u64, target: u64 },
    #[error("ADR at {pc:#x} cannot reach {target:#x}")]
    AdrOutOfRange { pc: u64, target: u64 },
    #[error("ADRP at {pc:#x} cannot reach page {target:#x}")]
    AdrpOutOfRange { pc: u64, target: u64 },
    #[error("literal load at {pc:#x} cannot reach {target:#x}")]
    LiteralOutOfRange { pc: u64, target: u64 },
    #[error("relocation layout did not settle after {passes} passes")]
    DidNotConverge { passes: usize },
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("symbol not found: {name}{}", format_suggestions(.suggestions))]
    SymbolNotFound { name: String, suggestions: Vec<String> },
    #[error("{target:#x} is patched by a newer guard")]
    AlreadyPatched { target: usize },
    #[error("executable space exhausted: {needed} bytes needed, {available} available")]
    SpaceOverflow { needed: usize, available: usize },
    #[error("relocation unsupported: {0}")]
    RelocationUnsupported(#[from] RelocationError),
    #[error("signature mismatch: target is {expected}, got {found}")]
    SignatureMismatch { expected: String, found: String },
    #[error("function at {target:#x} is {len} bytes, the redirect needs {needed}")]
    FunctionTooShort { target: usize, len: usize, needed: usize },
    #[error("decode failed at {pc:#x}: {source}")]
    Decode {
        pc: u64,
        #[source]
        source: DecodeError,
    },
    #[error("changing protection at {addr:#x} failed (errno {errno})")]
    Protection { addr: usize, errno: i32 },
    #[error("executable memory allocation failed: {0}")]
    Allocation(String),
    #[error("method index {index} is outside a {methods}-slot table")]
    MethodIndexOutOfRange { index: usize, methods: usize },
    #[error("a {size}-byte reference is not a trait object")]
    NotATraitObject { size: usize },
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

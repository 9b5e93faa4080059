//! Diagnostic taxonomy shared by the compiler and the assembler.
//!
//! Every failure belongs to one of four broad [`Kind`]s, each carrying a
//! numeric sub-code, a source location, and an exit code for the owning
//! phase. The sub-codes mirror the `A1_T_ERROR`/`C1_T_ERROR` enumerations
//! of the original implementation so existing diagnostic text stays
//! recognizable.

use std::fmt;

/// Position of a diagnostic: an index into the run's source-file table
/// plus a 1-based line number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Location {
    pub file_id: u32,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "file#{}:{}", self.file_id, self.line)
    }
}

/// The four broad failure kinds. Each sub-code below belongs to exactly
/// one kind; the kind determines the phase exit code returned by
/// [`Diagnostic::exit_code`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Kind {
    #[error("syntax or semantic error")]
    Syntax,
    #[error("resource error")]
    Resource,
    #[error("range error")]
    Range,
    #[error("internal error")]
    Internal,
}

/// Error sub-codes, grounded on `a1errors.h`'s `A1_T_ERROR` and
/// `c1errors.h`'s `C1_T_ERROR`. Resource codes are shared between both
/// tools; syntax/range codes are split by the phase that can raise them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Code {
    // resource (shared)
    #[error("failed to open file")]
    EFOpen,
    #[error("failed to read file")]
    EFRead,
    #[error("failed to write file")]
    EFWrite,
    #[error("failed to close file")]
    EFClose,

    // assembler syntax/range (a1errors.h)
    #[error("unexpected end of file")]
    EEof,
    #[error("syntax error")]
    ESyntax,
    #[error("invalid numeric literal")]
    EInvNum,
    #[error("address out of range")]
    EWAddr,
    #[error("numeric overflow")]
    ENumOvf,
    #[error("unresolved symbol")]
    EUnresSymb,
    #[error("section size exceeds target limits")]
    EWSecSize,
    #[error("unknown section name")]
    EWSecName,
    #[error("statement size out of range")]
    EWStmtSize,
    #[error("duplicate symbol definition")]
    EDupSym,
    #[error("relative offset out of range")]
    ERelOutRange,
    #[error("invalid argument reference type")]
    EInvRefType,
    #[error("no matching instruction encoding")]
    EInvInst,
    #[error("data block size out of range")]
    EWBlkSize,
    #[error(".error directive")]
    EErrDir,

    // compiler semantic (c1errors.h)
    #[error("source file is empty")]
    EIfEmpty,
    #[error("invalid label name")]
    EInvLbName,
    #[error("invalid command name")]
    EInvCmdName,
    #[error("invalid type name")]
    EInvTypName,
    #[error("variable type mismatch")]
    EVarTypMis,
    #[error("variable dimension mismatch")]
    EVarDimMis,
    #[error("local variable redefinition")]
    ELclRedef,
    #[error("user function redefinition")]
    EUfnRedef,
    #[error("stack overflow")]
    EStckOvf,
    #[error("stack operation failed")]
    EStkFail,
    #[error("no data left to read")]
    ENoData,
    #[error("variable redefinition")]
    EVarRedef,
    #[error("unknown instruction")]
    EUnkInst,
    #[error("comparison operator with no active comparison")]
    ENoCmpOp,
    #[error("out of memory")]
    ENoMem,
    #[error("recursive inline include")]
    ERecurInl,
    #[error("no default I/O device")]
    ENoDefIoDev,
    #[error("unknown I/O device")]
    EUnkIoDev,
    #[error("unknown interrupt")]
    EUnkInt,
    #[error("multiple handlers bound to the same interrupt")]
    EMultIntHnd,
    #[error("wrong device type for this operation")]
    EWDevType,
    #[error("no immediate offset available")]
    ENoImmOff,
    #[error("malformed optimizer log file")]
    EWOptLogFmt,
    #[error("subscript out of range")]
    ESubscriptOutOfRange,

    // internal (shared)
    #[error("internal error")]
    EIntErr,
}

impl Code {
    pub fn kind(&self) -> Kind {
        use Code::*;
        match self {
            EFOpen | EFRead | EFWrite | EFClose => Kind::Resource,
            EEof | ESyntax | EInvNum | EUnresSymb | EDupSym | EInvRefType | EInvInst
            | EErrDir | EIfEmpty | EInvLbName | EInvCmdName | EInvTypName | EVarTypMis
            | EVarDimMis | ELclRedef | EUfnRedef | EUnkInst | ENoCmpOp | ERecurInl
            | ENoDefIoDev | EUnkIoDev | EUnkInt | EMultIntHnd | EWDevType | ENoImmOff
            | EWOptLogFmt => Kind::Syntax,
            EWAddr | ENumOvf | EWSecSize | EWSecName | EWStmtSize | ERelOutRange
            | EWBlkSize | EStckOvf | EStkFail | ENoData | EVarRedef | ENoMem
            | ESubscriptOutOfRange => Kind::Range,
            EIntErr => Kind::Internal,
        }
    }

    /// Phase exit code returned by `main` when this code is the first
    /// fatal error of a run. Mirrors the original tools' numbered exit
    /// statuses (argument errors are 1; everything else is offset from 2).
    pub fn exit_code(&self) -> i32 {
        2 + (*self as i32)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{location}: {code}")]
pub struct Diagnostic {
    pub code: Code,
    pub location: Location,
    pub message: Option<String>,
}

impl Diagnostic {
    pub fn new(code: Code, location: Location) -> Self {
        Diagnostic {
            code,
            location,
            message: None,
        }
    }

    pub fn with_message(code: Code, location: Location, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            location,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> Kind {
        self.code.kind()
    }

    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }
}

/// Non-fatal diagnostics accumulated on a section and printed at the end
/// of a successful run. `fatal` mirrors the distinction the original
/// tools draw between warnings that still allow a build to complete
/// (e.g. truncation) and the handful that are effectively promoted to
/// errors by strict settings.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{location}: warning: {message}")]
pub struct Warning {
    pub location: Location,
    pub message: String,
}

impl Warning {
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        Warning {
            location,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resource_codes_map_to_resource_kind() {
        assert_eq!(Code::EFOpen.kind(), Kind::Resource);
        assert_eq!(Code::EFClose.kind(), Kind::Resource);
    }

    #[test]
    fn internal_error_is_its_own_kind() {
        assert_eq!(Code::EIntErr.kind(), Kind::Internal);
    }

    #[test]
    fn subscript_out_of_range_is_a_range_error() {
        assert_eq!(Code::ESubscriptOutOfRange.kind(), Kind::Range);
    }
}

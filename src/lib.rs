//! Shared types for the b1c compiler and the stasm assembler: the IR
//! opcode/type model, the variable and string-label tables, the explicit
//! settings value threaded through both pipelines, the section model, and
//! the four-kind diagnostic taxonomy.

pub mod error;
pub mod ir;
pub mod section;
pub mod settings;
pub mod symbol;

pub use error::{Diagnostic, Kind, Warning};
pub use ir::{BinOp, CmpOp, Expr, Opcode, UnOp};
pub use section::{SectionId, SectionLayout};
pub use settings::{MemoryModel, OptLevel, Settings, TargetProfile};
pub use symbol::{B1Type, StorageKind, StringLabel, Variable};

pub type Endian = util::Endian;

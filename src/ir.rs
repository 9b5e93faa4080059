//! IR command and expression model (spec §3 "IR command").
//!
//! An IR program is a flat list of [`Record`]s: labels and opcodes. Every
//! opcode argument is an [`Expr`] tree rooted at a named reference with an
//! optional type annotation, matching the `name<TYPE>(arg<TYPE>, ...)`
//! surface syntax the loader accepts.

use util::{EnumFromStr, ParseEnumError};

/// IR opcode set (spec §3 "IR command").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Opcode {
    Ns,
    Ga,
    Ma,
    Gf,
    La,
    Lf,
    Def,
    Assign,
    BinOp(BinOp),
    UnOp(UnOp),
    Cmp(CmpOp),
    Jmp,
    Jt,
    Jf,
    Call,
    Ret,
    RetVal,
    End,
    In,
    Out,
    Get,
    Put,
    Trr,
    Ioctl,
    Dat,
    Read,
    Rst,
    Int,
    Ini,
    Imp,
    Uses,
    Xarg,
    Err,
    Set,
    Asm,
    EndAsm,
    Inl,
}

impl EnumFromStr for Opcode {
    fn from_str(s: &str) -> Result<Self, ParseEnumError> {
        use Opcode::*;
        Ok(match s {
            "NS" => Ns,
            "GA" => Ga,
            "MA" => Ma,
            "GF" => Gf,
            "LA" => La,
            "LF" => Lf,
            "DEF" => Def,
            "=" => Assign,
            "+" => BinOp(self::BinOp::Add),
            "-" => BinOp(self::BinOp::Sub),
            "*" => BinOp(self::BinOp::Mul),
            "/" => BinOp(self::BinOp::Div),
            "%" => BinOp(self::BinOp::Mod),
            "^" => BinOp(self::BinOp::Xor),
            "&" => BinOp(self::BinOp::And),
            "|" => BinOp(self::BinOp::Or),
            "<<" => BinOp(self::BinOp::Shl),
            ">>" => BinOp(self::BinOp::Shr),
            "NEG" => UnOp(self::UnOp::Neg),
            "NOT" => UnOp(self::UnOp::Not),
            "==" => Cmp(self::CmpOp::Eq),
            "<>" => Cmp(self::CmpOp::Ne),
            "<" => Cmp(self::CmpOp::Lt),
            "<=" => Cmp(self::CmpOp::Le),
            ">" => Cmp(self::CmpOp::Gt),
            ">=" => Cmp(self::CmpOp::Ge),
            "JMP" => Jmp,
            "JT" => Jt,
            "JF" => Jf,
            "CALL" => Call,
            "RET" => Ret,
            "RETVAL" => RetVal,
            "END" => End,
            "IN" => In,
            "OUT" => Out,
            "GET" => Get,
            "PUT" => Put,
            "TRR" => Trr,
            "IOCTL" => Ioctl,
            "DAT" => Dat,
            "READ" => Read,
            "RST" => Rst,
            "INT" => Int,
            "INI" => Ini,
            "IMP" => Imp,
            "USES" => Uses,
            "XARG" => Xarg,
            "ERR" => Err,
            "SET" => Set,
            "ASM" => Asm,
            "ENDASM" => EndAsm,
            "INL" => Inl,
            _ => {
                return std::result::Result::Err(ParseEnumError {
                    value: s.to_string(),
                    enum_name: "Opcode",
                })
            }
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Xor,
    And,
    Or,
    Shl,
    Shr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The operator to use if the operand order is swapped, needed when
    /// the lowering engine has to materialize the left operand into the
    /// accumulator and the right operand is already resident there.
    pub fn swapped(self) -> CmpOp {
        use CmpOp::*;
        match self {
            Eq => Eq,
            Ne => Ne,
            Lt => Gt,
            Le => Ge,
            Gt => Lt,
            Ge => Le,
        }
    }
}

/// One element of an IR program: either a label definition or an opcode
/// with its argument list, tagged with source location for diagnostics.
#[derive(Clone, Debug)]
pub enum Record {
    Label { name: String, line: u32 },
    Op {
        opcode: Opcode,
        args: Vec<Expr>,
        line: u32,
    },
}

/// An argument expression tree. Leaves are named references (variables,
/// constants, user functions) or immediate literals; `Call` nests
/// argument lists for user-function invocations and array subscripting.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    IntLit(i64),
    StrLit(String),
    Ref {
        name: String,
        ty: Option<crate::symbol::B1Type>,
    },
    Subscript {
        base: Box<Expr>,
        indices: Vec<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// The root name of a reference/call expression, used to look the
    /// argument up in the variable or user-function table.
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Ref { name, .. } => Some(name),
            Expr::Subscript { base, .. } => base.root_name(),
            Expr::Call { name, .. } => Some(name),
            _ => None,
        }
    }
}

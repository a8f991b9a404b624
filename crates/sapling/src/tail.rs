//! Tail form: the flat, first-order program shape handed to the code
//! generator. Every intermediate value is named, every operand is trivial,
//! and control flow is explicit switches and calls.

use serde::{Deserialize, Serialize};

/// A trivial operand: a variable or a literal. Booleans are represented as
/// the integers 0 and 1 from here on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Triv {
    Var { name: String },
    Int { value: i64 },
    Sym { text: String },
}

impl Triv {
    pub fn var(name: impl Into<String>) -> Triv {
        Triv::Var { name: name.into() }
    }
}

/// Types that survive to tail form. Packed references have become cursors and
/// booleans have become integers by this point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum TailTy {
    Int,
    Sym,
    Cursor,
    Prod { fields: Vec<TailTy> },
    Dict { value: Box<TailTy> },
}

/// Primitive operations in tail form. Buffer traffic is explicit: tags and
/// scalars are read and written through cursor-valued operands.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum TailPrim {
    AddI,
    SubI,
    MulI,
    DivI,
    EqI,
    LtI,
    GtI,
    EqSym,
    EqB,
    DictEmpty { value: TailTy },
    DictInsert { value: TailTy },
    DictLookup { value: TailTy },
    /// Reads the tag byte at a cursor; binds the tag and the advanced cursor.
    ReadTag,
    /// Reads a fixed-width scalar at a cursor; binds the value and the
    /// advanced cursor.
    ReadScalar { ty: TailTy },
    /// Writes a tag byte at a cursor; binds the advanced cursor.
    WriteTag { tag: u8 },
    /// Writes a fixed-width scalar at a cursor; binds the advanced cursor.
    WriteScalar { ty: TailTy },
    NewBuffer,
    ScopedBuffer,
    AddCursor { offset: usize },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SwitchAlt {
    pub tag: i64,
    pub body: Tail,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Tail {
    /// Function (or program) exit with zero or more trivial results.
    Return { trivs: Vec<Triv> },
    LetPrim {
        binds: Vec<(String, TailTy)>,
        prim: TailPrim,
        args: Vec<Triv>,
        body: Box<Tail>,
    },
    LetCall {
        binds: Vec<(String, TailTy)>,
        func: String,
        args: Vec<Triv>,
        /// `true` for a call that may run concurrently with the continuation.
        spawn: bool,
        body: Box<Tail>,
    },
    TailCall {
        func: String,
        args: Vec<Triv>,
    },
    /// Integer dispatch with an explicit default arm. The arm list never
    /// carries the final alternative; that one is the default.
    Switch {
        scrut: Triv,
        alts: Vec<SwitchAlt>,
        default: Box<Tail>,
    },
    /// Barrier completing every spawn issued so far in this activation.
    Sync { body: Box<Tail> },
    StartTimer {
        name: String,
        iterate: bool,
        body: Box<Tail>,
    },
    EndTimer {
        name: String,
        body: Box<Tail>,
    },
    /// Runtime error terminal carried over from the source program.
    Err { msg: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TailFun {
    pub name: String,
    pub params: Vec<(String, TailTy)>,
    pub ret: TailTy,
    pub body: Tail,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TailProg {
    pub funs: Vec<TailFun>,
    pub main: Option<Tail>,
}

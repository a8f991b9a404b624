use serde::{Deserialize, Serialize};

/// A location variable introduced by the (out-of-scope) location-inference
/// collaborator. After cursor insertion a location variable names the cursor
/// bound at that position.
pub type LocVar = String;
/// A region variable bound by `LetRegion`.
pub type RegionVar = String;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Ty {
    Int,
    Sym,
    Bool,
    Prod { fields: Vec<Ty> },
    Packed { tycon: String, loc: LocVar },
    Dict { value: Box<Ty> },
    List { elem: Box<Ty> },
    /// An opaque read/write position inside a buffer. Never surfaced in the
    /// source syntax; introduced by `add_ran` and `cursor_direct`.
    Cursor,
}

impl Ty {
    /// `true` when the type is a packed reference or structurally contains one.
    /// This predicate selects the compilation mode of every sub-expression.
    pub fn has_packed(&self) -> bool {
        match self {
            Ty::Int | Ty::Sym | Ty::Bool | Ty::Cursor => false,
            Ty::Prod { fields } => fields.iter().any(Ty::has_packed),
            Ty::Packed { .. } => true,
            Ty::Dict { value } => value.has_packed(),
            Ty::List { elem } => elem.has_packed(),
        }
    }

    /// Number of packed components, counting through products.
    pub fn packed_count(&self) -> usize {
        match self {
            Ty::Int | Ty::Sym | Ty::Bool | Ty::Cursor => 0,
            Ty::Prod { fields } => fields.iter().map(Ty::packed_count).sum(),
            Ty::Packed { .. } => 1,
            Ty::Dict { value } => value.packed_count(),
            Ty::List { elem } => elem.packed_count(),
        }
    }

    /// Serialized width in bytes of a fixed-width scalar, `None` otherwise.
    pub fn scalar_width(&self) -> Option<usize> {
        match self {
            Ty::Int | Ty::Sym | Ty::Cursor => Some(8),
            Ty::Bool => Some(1),
            _ => None,
        }
    }
}

/// One field of a data-constructor: whether it is packed, and its type.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Field {
    pub packed: bool,
    pub ty: Ty,
}

/// A named constructor of a data type. Its tag is its position in the
/// declaration and is reused verbatim as the on-the-wire discriminant byte.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Variant {
    /// Index of the first packed field, if any.
    pub fn first_packed(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.packed)
    }

    /// Count of fields following the first packed field. This is exactly the
    /// number of auxiliary cursor fields a shadow variant carries.
    pub fn fields_after_first_packed(&self) -> usize {
        match self.first_packed() {
            Some(idx) => self.fields.len() - idx - 1,
            None => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DDef {
    pub name: String,
    pub variants: Vec<Variant>,
}

impl DDef {
    pub fn variant(&self, con: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == con)
    }

    /// Tags are positional and stable: the tag of a variant is its zero-based
    /// index in the declaration.
    pub fn tag_of(&self, con: &str) -> Option<u8> {
        self.variants
            .iter()
            .position(|v| v.name == con)
            .map(|idx| idx as u8)
    }
}

/// Marker appended to a constructor name to form its shadow (random-access)
/// variant name.
pub const RAN_MARKER: char = '^';

pub fn ran_con_name(con: &str) -> String {
    format!("{con}{RAN_MARKER}")
}

pub fn is_ran_con(con: &str) -> bool {
    con.ends_with(RAN_MARKER)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Prim {
    AddI,
    SubI,
    MulI,
    DivI,
    EqI,
    LtI,
    GtI,
    EqSym,
    EqB,
    DictEmpty { value: Ty },
    DictInsert { value: Ty },
    DictLookup { value: Ty },
}

/// A location-binding clause, as supplied by location inference.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum LocExp {
    StartOf { region: RegionVar },
    InRegion { region: RegionVar },
    AfterConst { offset: usize, loc: LocVar },
    AfterVar { var: String, loc: LocVar },
    FromEnd { loc: LocVar },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CaseArm {
    pub con: String,
    /// Pattern binders, one per constructor field, each annotated with the
    /// location variable inference assigned to it. After cursor insertion a
    /// case arm binds a single variable: the read cursor positioned just past
    /// the tag byte.
    pub binds: Vec<(String, LocVar)>,
    pub body: Exp,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Exp {
    Var {
        name: String,
    },
    LitInt {
        value: i64,
    },
    LitBool {
        value: bool,
    },
    LitSym {
        text: String,
    },
    PrimApp {
        prim: Prim,
        args: Vec<Exp>,
    },
    App {
        func: String,
        args: Vec<Exp>,
    },
    /// A call whose result may be computed concurrently with the continuation,
    /// up to the next `Sync` barrier.
    Spawn {
        func: String,
        args: Vec<Exp>,
    },
    /// Barrier: results of every spawn since the enclosing scope began are
    /// visible after this point.
    Sync,
    Let {
        var: String,
        ty: Ty,
        rhs: Box<Exp>,
        body: Box<Exp>,
    },
    If {
        cond: Box<Exp>,
        then_branch: Box<Exp>,
        else_branch: Box<Exp>,
    },
    Case {
        scrut: Box<Exp>,
        arms: Vec<CaseArm>,
    },
    MkProd {
        items: Vec<Exp>,
    },
    Proj {
        index: usize,
        tuple: Box<Exp>,
    },
    DataCon {
        con: String,
        loc: LocVar,
        args: Vec<Exp>,
    },
    TimeIt {
        inner: Box<Exp>,
        ty: Ty,
        iterate: bool,
    },
    /// Scoped-arena introduction backing the dictionary primitives.
    WithArena {
        var: String,
        body: Box<Exp>,
    },
    /// Source-level error terminal. Preserved through every pass and raised at
    /// the target program's runtime, never at compile time.
    Error {
        msg: String,
        ty: Ty,
    },
    LetRegion {
        region: RegionVar,
        scoped: bool,
        body: Box<Exp>,
    },
    LetLoc {
        loc: LocVar,
        rhs: LocExp,
        body: Box<Exp>,
    },

    // Cursor-stage forms. `EndOf` is introduced by `add_ran` and resolved by
    // `cursor_direct`; the rest are introduced by `cursor_direct` and consumed
    // by `lower`.
    /// Abstract request for the end cursor of the value bound to `var`.
    EndOf {
        var: String,
    },
    AddCursor {
        base: Box<Exp>,
        offset: usize,
    },
    NewBuffer,
    ScopedBuffer,
    /// Writes a tag byte at `cursor`, evaluating to the advanced cursor.
    WriteTag {
        tag: u8,
        cursor: Box<Exp>,
    },
    /// Writes a fixed-width scalar at `cursor`, evaluating to the advanced
    /// cursor.
    WriteScalar {
        ty: Ty,
        value: Box<Exp>,
        cursor: Box<Exp>,
    },
    /// Reads a fixed-width scalar at `cursor`, binding the value to `val` and
    /// the advanced cursor to `next` for the rest of `body`.
    LetReadScalar {
        val: String,
        next: String,
        ty: Ty,
        cursor: String,
        body: Box<Exp>,
    },
}

impl Exp {
    pub fn var(name: impl Into<String>) -> Exp {
        Exp::Var { name: name.into() }
    }
}

/// Wraps `body` in one `Let` per binding, first binding outermost.
pub fn mk_lets(binds: Vec<(String, Ty, Exp)>, body: Exp) -> Exp {
    binds
        .into_iter()
        .rev()
        .fold(body, |body, (var, ty, rhs)| Exp::Let {
            var,
            ty,
            rhs: Box::new(rhs),
            body: Box::new(body),
        })
}

/// `true` when `name` occurs free in `exp`.
pub fn occurs_free(name: &str, exp: &Exp) -> bool {
    match exp {
        Exp::Var { name: n } | Exp::EndOf { var: n } => n == name,
        Exp::LitInt { .. }
        | Exp::LitBool { .. }
        | Exp::LitSym { .. }
        | Exp::Sync
        | Exp::NewBuffer
        | Exp::ScopedBuffer
        | Exp::Error { .. } => false,
        Exp::PrimApp { args, .. } | Exp::App { args, .. } | Exp::Spawn { args, .. } => {
            args.iter().any(|a| occurs_free(name, a))
        }
        Exp::Let { var, rhs, body, .. } => {
            occurs_free(name, rhs) || (var != name && occurs_free(name, body))
        }
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => {
            occurs_free(name, cond)
                || occurs_free(name, then_branch)
                || occurs_free(name, else_branch)
        }
        Exp::Case { scrut, arms } => {
            occurs_free(name, scrut)
                || arms.iter().any(|arm| {
                    !arm.binds.iter().any(|(v, _)| v == name) && occurs_free(name, &arm.body)
                })
        }
        Exp::MkProd { items } => items.iter().any(|i| occurs_free(name, i)),
        Exp::Proj { tuple, .. } => occurs_free(name, tuple),
        Exp::DataCon { args, .. } => args.iter().any(|a| occurs_free(name, a)),
        Exp::TimeIt { inner, .. } => occurs_free(name, inner),
        Exp::WithArena { var, body } => var != name && occurs_free(name, body),
        Exp::LetRegion { body, .. } => occurs_free(name, body),
        Exp::LetLoc { rhs, body, .. } => {
            let in_rhs = match rhs {
                LocExp::AfterVar { var, .. } => var == name,
                _ => false,
            };
            in_rhs || occurs_free(name, body)
        }
        Exp::AddCursor { base, .. } => occurs_free(name, base),
        Exp::WriteTag { cursor, .. } => occurs_free(name, cursor),
        Exp::WriteScalar { value, cursor, .. } => {
            occurs_free(name, value) || occurs_free(name, cursor)
        }
        Exp::LetReadScalar {
            val,
            next,
            cursor,
            body,
            ..
        } => cursor == name || (val != name && next != name && occurs_free(name, body)),
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FunDef {
    pub name: String,
    pub params: Vec<(String, Ty)>,
    pub ret_ty: Ty,
    pub body: Exp,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MainExp {
    pub expr: Exp,
    pub ty: Ty,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Prog {
    pub ddefs: Vec<DDef>,
    pub fundefs: Vec<FunDef>,
    pub main: Option<MainExp>,
}

impl Prog {
    pub fn ddef(&self, name: &str) -> Option<&DDef> {
        self.ddefs.iter().find(|d| d.name == name)
    }

    pub fn fundef(&self, name: &str) -> Option<&FunDef> {
        self.fundefs.iter().find(|f| f.name == name)
    }

    /// The declaration a constructor belongs to.
    pub fn ddef_for_con(&self, con: &str) -> Option<&DDef> {
        self.ddefs
            .iter()
            .find(|d| d.variants.iter().any(|v| v.name == con))
    }
}

/// Fresh-name supply, threaded explicitly through each pass. Uniqueness is
/// scoped to one compilation unit.
#[derive(Debug, Default)]
pub struct Gensym {
    next: u32,
}

impl Gensym {
    pub fn fresh(&mut self, prefix: &str) -> String {
        let id = self.next;
        self.next += 1;
        format!("{prefix}_{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_packed_is_transitive() {
        let packed = Ty::Packed {
            tycon: "Tree".to_string(),
            loc: "l0".to_string(),
        };
        assert!(packed.has_packed());
        assert!(!Ty::Int.has_packed());
        assert!(Ty::Prod {
            fields: vec![Ty::Int, packed.clone()]
        }
        .has_packed());
        assert!(Ty::Dict {
            value: Box::new(packed)
        }
        .has_packed());
        assert!(!Ty::Prod {
            fields: vec![Ty::Int, Ty::Bool]
        }
        .has_packed());
    }

    #[test]
    fn tags_are_positional() {
        let ddef = DDef {
            name: "Tree".to_string(),
            variants: vec![
                Variant {
                    name: "Leaf".to_string(),
                    fields: vec![Field {
                        packed: false,
                        ty: Ty::Int,
                    }],
                },
                Variant {
                    name: "Node".to_string(),
                    fields: vec![
                        Field {
                            packed: true,
                            ty: Ty::Packed {
                                tycon: "Tree".to_string(),
                                loc: "l1".to_string(),
                            },
                        },
                        Field {
                            packed: true,
                            ty: Ty::Packed {
                                tycon: "Tree".to_string(),
                                loc: "l2".to_string(),
                            },
                        },
                    ],
                },
            ],
        };
        assert_eq!(ddef.tag_of("Leaf"), Some(0));
        assert_eq!(ddef.tag_of("Node"), Some(1));
        assert_eq!(ddef.variant("Node").unwrap().fields_after_first_packed(), 1);
    }

    #[test]
    fn gensym_names_are_unique() {
        let mut gensym = Gensym::default();
        let a = gensym.fresh("cur");
        let b = gensym.fresh("cur");
        assert_ne!(a, b);
    }

    #[test]
    fn occurs_free_respects_binders() {
        let body = Exp::Let {
            var: "x".to_string(),
            ty: Ty::Int,
            rhs: Box::new(Exp::LitInt { value: 1 }),
            body: Box::new(Exp::var("x")),
        };
        assert!(!occurs_free("x", &body));
        let open = Exp::PrimApp {
            prim: Prim::AddI,
            args: vec![Exp::var("x"), Exp::LitInt { value: 2 }],
        };
        assert!(occurs_free("x", &open));
    }
}

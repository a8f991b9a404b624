mod cursorize;
mod ir;
mod lower;
mod ran;
mod tail;

pub use cursorize::cursor_direct;
pub use ir::{
    is_ran_con, mk_lets, occurs_free, ran_con_name, CaseArm, DDef, Exp, Field, FunDef, Gensym,
    LocExp, LocVar, MainExp, Prim, Prog, RegionVar, Ty, Variant, RAN_MARKER,
};
pub use lower::lower;
pub use ran::{add_ran, needs_ran};
pub use tail::{SwitchAlt, Tail, TailFun, TailPrim, TailProg, TailTy, Triv};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SaplingError {
    /// A shape the pass recognizes but deliberately does not yet support.
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    /// A call to an undeclared function, or a variable escaping its scope.
    #[error("unbound reference: {0}")]
    Unbound(String),
    /// A defect in an earlier pass, never an expected runtime condition.
    #[error("internal consistency failure: {0}")]
    Internal(String),
}

pub(crate) fn trace_enabled() -> bool {
    std::env::var("SAPLING_TRACE_PASSES").is_ok_and(|v| v == "1")
}

/// Runs the full middle-end pipeline: random-access analysis, random-access
/// rewrite, cursor insertion, then lowering to tail form.
///
/// Location inference is assumed to have already annotated `prog`; the
/// resulting tail program is ready for the downstream code generator.
pub fn compile(prog: Prog) -> Result<TailProg, SaplingError> {
    let mut gensym = Gensym::default();
    let needed = needs_ran(&prog)?;
    if trace_enabled() {
        eprintln!(
            "[SAPLING_TRACE_PASSES] needs_ran: {} data type(s) need random access",
            needed.len()
        );
    }
    let prog = add_ran(prog, &needed, &mut gensym)?;
    if trace_enabled() {
        eprintln!(
            "[SAPLING_TRACE_PASSES] add_ran: {} data type(s), {} function(s)",
            prog.ddefs.len(),
            prog.fundefs.len()
        );
    }
    let prog = cursor_direct(prog, &mut gensym)?;
    if trace_enabled() {
        eprintln!(
            "[SAPLING_TRACE_PASSES] cursor_direct: {} function(s) in cursor form",
            prog.fundefs.len()
        );
    }
    let out = lower(prog, &mut gensym)?;
    if trace_enabled() {
        eprintln!(
            "[SAPLING_TRACE_PASSES] lower: {} tail function(s)",
            out.funs.len()
        );
    }
    Ok(out)
}

/// Pretty JSON dump of any IR stage, for tooling and snapshot tests.
pub fn dump_json<T: Serialize>(value: &T) -> String {
    let mut out = serde_json::to_string_pretty(value).unwrap_or_else(|err| {
        // Serialization of the IR types cannot fail; keep the dump total anyway.
        format!("{{\"error\": \"{err}\"}}")
    });
    out.push('\n');
    out
}

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::ir::{occurs_free, CaseArm, Exp, LocExp, LocVar, Prog, RegionVar, Ty};
use crate::SaplingError;

/// Per-body analysis state. Spawn groups accumulate between `Spawn` sites and
/// the `Sync` barrier that resolves them.
#[derive(Default)]
struct Env {
    /// Static types of bound variables.
    vars: FxHashMap<String, Ty>,
    /// Region each location resides in, built incrementally from
    /// `LetRegion`/`LetLoc` clauses.
    regions: FxHashMap<LocVar, RegionVar>,
    /// One entry per pending spawn: the (region, data type) pairs its
    /// arguments reach.
    spawn_groups: Vec<Vec<(RegionVar, String)>>,
}

/// Computes the set of data-type names that require random-access nodes.
///
/// A type is included when a case arm over it would need a linear traversal
/// of an earlier variable-length field to reach a later one, or when two
/// concurrently spawned computations reach locations in a shared region.
/// One pass over each function body and the entry expression suffices.
pub fn needs_ran(prog: &Prog) -> Result<BTreeSet<String>, SaplingError> {
    let mut needed = BTreeSet::new();
    for fun in &prog.fundefs {
        let mut env = Env::default();
        for (param, ty) in &fun.params {
            env.vars.insert(param.clone(), ty.clone());
            if let Ty::Packed { loc, .. } = ty {
                // Input locations live in caller-supplied regions; give each
                // its own nominal region so sibling inputs never falsely share.
                env.regions.insert(loc.clone(), format!("input_{param}"));
            }
        }
        if let Ty::Packed { loc, .. } = &fun.ret_ty {
            // The output location anchors the body's location chain.
            env.regions
                .insert(loc.clone(), format!("output_{}", fun.name));
        }
        walk(&fun.body, prog, &mut env, &mut needed)?;
    }
    if let Some(main) = &prog.main {
        let mut env = Env::default();
        walk(&main.expr, prog, &mut env, &mut needed)?;
    }
    Ok(needed)
}

fn walk(
    exp: &Exp,
    prog: &Prog,
    env: &mut Env,
    needed: &mut BTreeSet<String>,
) -> Result<(), SaplingError> {
    match exp {
        Exp::Var { .. }
        | Exp::LitInt { .. }
        | Exp::LitBool { .. }
        | Exp::LitSym { .. }
        | Exp::Error { .. }
        | Exp::EndOf { .. }
        | Exp::NewBuffer
        | Exp::ScopedBuffer => Ok(()),
        Exp::PrimApp { args, .. } | Exp::App { args, .. } => {
            for arg in args {
                walk(arg, prog, env, needed)?;
            }
            Ok(())
        }
        Exp::Spawn { args, .. } => {
            record_spawn(args, None, prog, env, needed)?;
            Ok(())
        }
        Exp::Sync => {
            resolve_spawn_groups(env, needed);
            Ok(())
        }
        Exp::Let { var, ty, rhs, body } => {
            if let Exp::Spawn { args, .. } = rhs.as_ref() {
                // The spawn's own output location counts as reached too.
                record_spawn(args, Some(ty), prog, env, needed)?;
            } else {
                walk(rhs, prog, env, needed)?;
            }
            env.vars.insert(var.clone(), ty.clone());
            walk(body, prog, env, needed)
        }
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk(cond, prog, env, needed)?;
            walk(then_branch, prog, env, needed)?;
            walk(else_branch, prog, env, needed)
        }
        Exp::Case { scrut, arms } => {
            walk(scrut, prog, env, needed)?;
            let (tycon, scrut_region) = scrutinee_info(scrut, prog, env)?;
            for arm in arms {
                analyze_arm(arm, &tycon, scrut_region.as_deref(), prog, env, needed)?;
            }
            Ok(())
        }
        Exp::MkProd { items } => {
            for item in items {
                walk(item, prog, env, needed)?;
            }
            Ok(())
        }
        Exp::Proj { tuple, .. } => walk(tuple, prog, env, needed),
        Exp::DataCon { args, .. } => {
            for arg in args {
                walk(arg, prog, env, needed)?;
            }
            Ok(())
        }
        Exp::TimeIt { inner, .. } => walk(inner, prog, env, needed),
        Exp::WithArena { body, .. } => walk(body, prog, env, needed),
        Exp::LetRegion { body, .. } => walk(body, prog, env, needed),
        Exp::LetLoc { loc, rhs, body } => {
            let region = match rhs {
                LocExp::StartOf { region } | LocExp::InRegion { region } => region.clone(),
                LocExp::AfterConst { loc: parent, .. }
                | LocExp::AfterVar { loc: parent, .. }
                | LocExp::FromEnd { loc: parent } => env
                    .regions
                    .get(parent)
                    .cloned()
                    .ok_or_else(|| SaplingError::Unbound(format!("location {parent}")))?,
            };
            env.regions.insert(loc.clone(), region);
            walk(body, prog, env, needed)
        }
        Exp::AddCursor { base, .. } => walk(base, prog, env, needed),
        Exp::WriteTag { cursor, .. } => walk(cursor, prog, env, needed),
        Exp::WriteScalar { value, cursor, .. } => {
            walk(value, prog, env, needed)?;
            walk(cursor, prog, env, needed)
        }
        Exp::LetReadScalar { val, next, ty, body, .. } => {
            env.vars.insert(val.clone(), ty.clone());
            env.vars.insert(next.clone(), Ty::Cursor);
            walk(body, prog, env, needed)
        }
    }
}

/// Adds the scrutinee's type to `needed` when any arm binds a field past the
/// first packed field and actually uses it, then recurses into arm bodies.
fn analyze_arm(
    arm: &CaseArm,
    tycon: &str,
    scrut_region: Option<&str>,
    prog: &Prog,
    env: &mut Env,
    needed: &mut BTreeSet<String>,
) -> Result<(), SaplingError> {
    let ddef = prog
        .ddef_for_con(&arm.con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {}", arm.con)))?;
    let variant = ddef
        .variant(&arm.con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {}", arm.con)))?;
    if arm.binds.len() != variant.fields.len() {
        return Err(SaplingError::Internal(format!(
            "arm for {} binds {} fields, declaration has {}",
            arm.con,
            arm.binds.len(),
            variant.fields.len()
        )));
    }
    if let Some(first) = variant.first_packed() {
        let uses_late_field = arm
            .binds
            .iter()
            .skip(first + 1)
            .any(|(var, _)| occurs_free(var, &arm.body));
        if uses_late_field {
            needed.insert(tycon.to_string());
        }
    }
    for ((var, loc), field) in arm.binds.iter().zip(&variant.fields) {
        env.vars.insert(var.clone(), field.ty.clone());
        if field.packed {
            // Fields unpack in place: they share the scrutinee's region.
            if let Some(region) = scrut_region {
                env.regions.insert(loc.clone(), region.to_string());
            }
        }
    }
    walk(&arm.body, prog, env, needed)
}

/// Records one spawned computation: the location and declared type of every
/// packed value its arguments (and its own result, if packed) reach.
fn record_spawn(
    args: &[Exp],
    result_ty: Option<&Ty>,
    prog: &Prog,
    env: &mut Env,
    needed: &mut BTreeSet<String>,
) -> Result<(), SaplingError> {
    let mut reached = Vec::new();
    for arg in args {
        walk(arg, prog, env, needed)?;
        collect_packed(arg, prog, env, &mut reached);
    }
    if let Some(Ty::Packed { tycon, loc }) = result_ty {
        if let Some(region) = env.regions.get(loc) {
            reached.push((region.clone(), tycon.clone()));
        }
    }
    env.spawn_groups.push(reached);
    Ok(())
}

/// Concurrent access to sibling fields inside one region is only safe when
/// their boundaries are known without traversal: when two or more pending
/// spawns touch the same region, every data type along those locations needs
/// random access.
fn resolve_spawn_groups(env: &mut Env, needed: &mut BTreeSet<String>) {
    let mut region_groups: FxHashMap<RegionVar, usize> = FxHashMap::default();
    let mut region_tycons: FxHashMap<RegionVar, Vec<String>> = FxHashMap::default();
    for group in &env.spawn_groups {
        let mut seen: Vec<&RegionVar> = Vec::new();
        for (region, tycon) in group {
            if !seen.contains(&region) {
                seen.push(region);
                *region_groups.entry(region.clone()).or_default() += 1;
            }
            region_tycons
                .entry(region.clone())
                .or_default()
                .push(tycon.clone());
        }
    }
    for (region, count) in region_groups {
        if count >= 2 {
            if let Some(tycons) = region_tycons.get(&region) {
                needed.extend(tycons.iter().cloned());
            }
        }
    }
    env.spawn_groups.clear();
}

fn collect_packed(exp: &Exp, prog: &Prog, env: &Env, out: &mut Vec<(RegionVar, String)>) {
    match exp {
        Exp::Var { name } => {
            if let Some(Ty::Packed { tycon, loc }) = env.vars.get(name) {
                if let Some(region) = env.regions.get(loc) {
                    out.push((region.clone(), tycon.clone()));
                }
            }
        }
        Exp::DataCon { con, loc, args } => {
            if let (Some(region), Some(ddef)) = (env.regions.get(loc), prog.ddef_for_con(con)) {
                out.push((region.clone(), ddef.name.clone()));
            }
            for arg in args {
                collect_packed(arg, prog, env, out);
            }
        }
        Exp::MkProd { items } => {
            for item in items {
                collect_packed(item, prog, env, out);
            }
        }
        _ => {}
    }
}

/// The scrutinee's data-type name and, when known, the region of its
/// location. Pattern matches over non-packed types are unsupported.
fn scrutinee_info(
    exp: &Exp,
    prog: &Prog,
    env: &Env,
) -> Result<(String, Option<String>), SaplingError> {
    match exp {
        Exp::Var { name } => match env.vars.get(name) {
            Some(Ty::Packed { tycon, loc }) => {
                Ok((tycon.clone(), env.regions.get(loc).cloned()))
            }
            Some(_) => Err(SaplingError::Unsupported(format!(
                "case over non-packed value {name}"
            ))),
            None => Err(SaplingError::Unbound(format!("variable {name}"))),
        },
        Exp::DataCon { con, loc, .. } => {
            let ddef = prog
                .ddef_for_con(con)
                .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
            Ok((ddef.name.clone(), env.regions.get(loc).cloned()))
        }
        Exp::Let { body, .. }
        | Exp::LetRegion { body, .. }
        | Exp::LetLoc { body, .. }
        | Exp::WithArena { body, .. } => scrutinee_info(body, prog, env),
        Exp::If { then_branch, .. } => scrutinee_info(then_branch, prog, env),
        Exp::App { func, .. } => {
            let fun = prog
                .fundef(func)
                .ok_or_else(|| SaplingError::Unbound(format!("function {func}")))?;
            match &fun.ret_ty {
                Ty::Packed { tycon, loc } => {
                    Ok((tycon.clone(), env.regions.get(loc).cloned()))
                }
                _ => Err(SaplingError::Unsupported(format!(
                    "case over non-packed call result of {func}"
                ))),
            }
        }
        _ => Err(SaplingError::Unsupported(
            "cannot determine the scrutinee's data type".to_string(),
        )),
    }
}

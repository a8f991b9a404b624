//! Cursor insertion: packed values stop being abstract references and become
//! positions in byte buffers. Expressions of packed type compile in "packed
//! mode" against an explicit destination cursor and evaluate to a dilated
//! pair `(start, end)`; everything else compiles in "value mode".

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::ir::{
    is_ran_con, mk_lets, ran_con_name, CaseArm, DDef, Exp, FunDef, Gensym, LocExp, MainExp, Prog,
    Ty,
};
use crate::SaplingError;

struct FunSig {
    params: Vec<Ty>,
    ret: Ty,
}

struct Cx<'a> {
    ddefs: &'a [DDef],
    funs: FxHashMap<String, FunSig>,
}

impl Cx<'_> {
    fn ddef_for_con(&self, con: &str) -> Option<&DDef> {
        self.ddefs
            .iter()
            .find(|d| d.variants.iter().any(|v| v.name == con))
    }

    fn sig(&self, func: &str) -> Result<&FunSig, SaplingError> {
        self.funs
            .get(func)
            .ok_or_else(|| SaplingError::Unbound(format!("function {func}")))
    }
}

/// Variable typing plus the end-witness table: `ends[v]` names a cursor
/// variable pointing one past the serialized value bound to `v`. Tuples
/// containing packed values unzip into per-component bindings; `tuples[p]`
/// names those components so projections of `p` can recover them.
#[derive(Clone, Default)]
struct Env {
    vars: FxHashMap<String, Ty>,
    ends: FxHashMap<String, String>,
    tuples: FxHashMap<String, Vec<String>>,
}

#[derive(Clone, Copy)]
enum Mode<'m> {
    /// Produce the value serialized at `dest`; evaluate to `(start, end)`.
    Packed { dest: &'m str },
    Value,
}

fn prod2() -> Ty {
    Ty::Prod {
        fields: vec![Ty::Cursor, Ty::Cursor],
    }
}

/// Rewrites every function and the entry expression into cursor-passing
/// form. Functions returning one packed value gain a leading destination
/// cursor parameter and return the end cursor instead.
pub fn cursor_direct(prog: Prog, gensym: &mut Gensym) -> Result<Prog, SaplingError> {
    let Prog {
        ddefs,
        fundefs,
        main,
    } = prog;
    let (fundefs, main) = {
        let funs = fundefs
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    FunSig {
                        params: f.params.iter().map(|(_, t)| t.clone()).collect(),
                        ret: f.ret_ty.clone(),
                    },
                )
            })
            .collect();
        let cx = Cx {
            ddefs: &ddefs,
            funs,
        };
        let fundefs = fundefs
            .into_iter()
            .map(|f| cursorize_fun(f, &cx, gensym))
            .collect::<Result<Vec<_>, _>>()?;
        let main = match main {
            Some(MainExp { expr, ty }) => Some(MainExp {
                expr: go(expr, Mode::Value, &Env::default(), &cx, gensym)?,
                ty: cursorize_ty(&ty)?,
            }),
            None => None,
        };
        (fundefs, main)
    };
    Ok(Prog {
        ddefs,
        fundefs,
        main,
    })
}

fn cursorize_fun(fun: FunDef, cx: &Cx<'_>, gensym: &mut Gensym) -> Result<FunDef, SaplingError> {
    let FunDef {
        name,
        params,
        ret_ty,
        body,
    } = fun;
    let mut env = Env::default();
    let mut new_params = Vec::with_capacity(params.len() + 1);
    let mut prelude: Vec<(String, Ty, Exp)> = Vec::new();
    for (p, ty) in &params {
        if !matches!(ty, Ty::Packed { .. }) && ty.has_packed() {
            return Err(SaplingError::Unsupported(format!(
                "function {name} takes an aggregate containing packed values"
            )));
        }
        env.vars.insert(p.clone(), ty.clone());
        if let Ty::Packed { loc, .. } = ty {
            // The parameter cursor doubles as its location.
            if loc != p {
                prelude.push((loc.clone(), Ty::Cursor, Exp::var(p.clone())));
                env.vars.insert(loc.clone(), Ty::Cursor);
            }
        }
        new_params.push((p.clone(), cursorize_ty(ty)?));
    }
    match ret_ty.packed_count() {
        0 => {
            let body = go(body, Mode::Value, &env, cx, gensym)?;
            Ok(FunDef {
                name,
                params: new_params,
                ret_ty: cursorize_ty(&ret_ty)?,
                body: mk_lets(prelude, body),
            })
        }
        1 => {
            let Ty::Packed { loc: out_loc, .. } = &ret_ty else {
                return Err(SaplingError::Unsupported(format!(
                    "function {name} returns an aggregate containing a packed value"
                )));
            };
            let out = out_loc.clone();
            new_params.insert(0, (out.clone(), Ty::Cursor));
            let pair = go(body, Mode::Packed { dest: &out }, &env, cx, gensym)?;
            let pr = gensym.fresh("dil");
            let body = Exp::Let {
                var: pr.clone(),
                ty: prod2(),
                rhs: Box::new(pair),
                body: Box::new(Exp::Proj {
                    index: 1,
                    tuple: Box::new(Exp::var(pr)),
                }),
            };
            Ok(FunDef {
                name,
                params: new_params,
                ret_ty: Ty::Cursor,
                body: mk_lets(prelude, body),
            })
        }
        _ => Err(SaplingError::Unsupported(format!(
            "function {name} returns multiple packed values"
        ))),
    }
}

fn cursorize_ty(ty: &Ty) -> Result<Ty, SaplingError> {
    match ty {
        Ty::Int | Ty::Sym | Ty::Bool | Ty::Cursor => Ok(ty.clone()),
        Ty::Packed { .. } => Ok(Ty::Cursor),
        Ty::Prod { fields } => Ok(Ty::Prod {
            fields: fields.iter().map(cursorize_ty).collect::<Result<_, _>>()?,
        }),
        Ty::Dict { value } => Ok(Ty::Dict {
            value: Box::new(cursorize_ty(value)?),
        }),
        Ty::List { .. } => Err(SaplingError::Unsupported(
            "list types in cursor insertion".to_string(),
        )),
    }
}

fn go(
    exp: Exp,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    match exp {
        Exp::Var { name } => match mode {
            Mode::Value => Ok(Exp::Var { name }),
            Mode::Packed { .. } => match env.ends.get(&name) {
                Some(end) => Ok(Exp::MkProd {
                    items: vec![Exp::var(name), Exp::var(end.clone())],
                }),
                None => Err(SaplingError::Unsupported(format!(
                    "returning packed variable {name} without an end witness"
                ))),
            },
        },
        Exp::LitInt { .. } | Exp::LitBool { .. } | Exp::LitSym { .. } | Exp::Sync => match mode {
            Mode::Value => Ok(exp),
            Mode::Packed { .. } => Err(SaplingError::Internal(
                "scalar expression compiled in packed mode".to_string(),
            )),
        },
        Exp::PrimApp { prim, args } => {
            let args = args
                .into_iter()
                .map(|a| go(a, Mode::Value, env, cx, gensym))
                .collect::<Result<_, _>>()?;
            match mode {
                Mode::Value => Ok(Exp::PrimApp { prim, args }),
                Mode::Packed { .. } => Err(SaplingError::Internal(
                    "primitive application compiled in packed mode".to_string(),
                )),
            }
        }
        Exp::App { func, args } => cursorize_call(func, args, false, mode, env, cx, gensym),
        Exp::Spawn { func, args } => cursorize_call(func, args, true, mode, env, cx, gensym),
        Exp::Let { var, ty, rhs, body } => cursorize_let(var, ty, *rhs, *body, mode, env, cx, gensym),
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => Ok(Exp::If {
            cond: Box::new(go(*cond, Mode::Value, env, cx, gensym)?),
            then_branch: Box::new(go(*then_branch, mode, env, cx, gensym)?),
            else_branch: Box::new(go(*else_branch, mode, env, cx, gensym)?),
        }),
        Exp::Case { scrut, arms } => cursorize_case(*scrut, arms, mode, env, cx, gensym),
        Exp::MkProd { items } => match mode {
            Mode::Value => Ok(Exp::MkProd {
                items: items
                    .into_iter()
                    .map(|i| go(i, Mode::Value, env, cx, gensym))
                    .collect::<Result<_, _>>()?,
            }),
            Mode::Packed { .. } => Err(SaplingError::Unsupported(
                "tuple of packed results".to_string(),
            )),
        },
        Exp::Proj { index, tuple } => match mode {
            Mode::Value => Ok(Exp::Proj {
                index,
                tuple: Box::new(go(*tuple, Mode::Value, env, cx, gensym)?),
            }),
            Mode::Packed { .. } => {
                // The component was unzipped when the tuple was bound; its
                // pair is the component cursor and its recorded end.
                let c = resolve_tuple_comp(&tuple, index, env)?;
                match env.ends.get(&c) {
                    Some(end) => Ok(Exp::MkProd {
                        items: vec![Exp::var(c.clone()), Exp::var(end.clone())],
                    }),
                    None => Err(SaplingError::Unsupported(format!(
                        "projected packed component {c} has no end witness"
                    ))),
                }
            }
        },
        Exp::DataCon { con, loc, args } => match mode {
            Mode::Packed { dest } => write_datacon(con, args, dest, env, cx, gensym),
            Mode::Value => {
                // Value context: write at the annotated location, keep the
                // start cursor as the value.
                let pair = write_datacon(con, args, &loc, env, cx, gensym)?;
                let pr = gensym.fresh("dil");
                Ok(Exp::Let {
                    var: pr.clone(),
                    ty: prod2(),
                    rhs: Box::new(pair),
                    body: Box::new(Exp::Proj {
                        index: 0,
                        tuple: Box::new(Exp::var(pr)),
                    }),
                })
            }
        },
        Exp::TimeIt { inner, ty, iterate } => {
            let wrapped_ty = match mode {
                Mode::Packed { .. } => prod2(),
                Mode::Value => cursorize_ty(&ty)?,
            };
            Ok(Exp::TimeIt {
                inner: Box::new(go(*inner, mode, env, cx, gensym)?),
                ty: wrapped_ty,
                iterate,
            })
        }
        Exp::WithArena { var, body } => Ok(Exp::WithArena {
            var,
            body: Box::new(go(*body, mode, env, cx, gensym)?),
        }),
        Exp::Error { msg, ty } => {
            let ty = match mode {
                Mode::Packed { .. } => prod2(),
                Mode::Value => cursorize_ty(&ty)?,
            };
            Ok(Exp::Error { msg, ty })
        }
        Exp::LetRegion {
            region,
            scoped,
            body,
        } => {
            let mut env2 = env.clone();
            env2.vars.insert(region.clone(), Ty::Cursor);
            Ok(Exp::Let {
                var: region,
                ty: Ty::Cursor,
                rhs: Box::new(if scoped {
                    Exp::ScopedBuffer
                } else {
                    Exp::NewBuffer
                }),
                body: Box::new(go(*body, mode, &env2, cx, gensym)?),
            })
        }
        Exp::LetLoc { loc, rhs, body } => {
            let rhs = match rhs {
                LocExp::StartOf { region } | LocExp::InRegion { region } => Exp::var(region),
                LocExp::AfterConst { offset, loc: base } => Exp::AddCursor {
                    base: Box::new(Exp::var(base)),
                    offset,
                },
                LocExp::AfterVar { var, .. } => match env.ends.get(&var) {
                    Some(end) => Exp::var(end.clone()),
                    None => {
                        return Err(SaplingError::Unsupported(format!(
                            "location after {var} requires its end cursor"
                        )))
                    }
                },
                LocExp::FromEnd { .. } => {
                    return Err(SaplingError::Unsupported(
                        "end-anchored locations".to_string(),
                    ))
                }
            };
            let mut env2 = env.clone();
            env2.vars.insert(loc.clone(), Ty::Cursor);
            Ok(Exp::Let {
                var: loc,
                ty: Ty::Cursor,
                rhs: Box::new(rhs),
                body: Box::new(go(*body, mode, &env2, cx, gensym)?),
            })
        }
        Exp::EndOf { var } => match env.ends.get(&var) {
            Some(end) => Ok(Exp::var(end.clone())),
            None => Err(SaplingError::Unsupported(format!(
                "the end of {var} is not witnessed here"
            ))),
        },
        Exp::AddCursor { base, offset } => Ok(Exp::AddCursor {
            base: Box::new(go(*base, Mode::Value, env, cx, gensym)?),
            offset,
        }),
        Exp::NewBuffer
        | Exp::ScopedBuffer
        | Exp::WriteTag { .. }
        | Exp::WriteScalar { .. }
        | Exp::LetReadScalar { .. } => Err(SaplingError::Internal(
            "cursor form encountered before cursor insertion".to_string(),
        )),
    }
}

/// Calls pass packed arguments as bare cursor variables; a call producing one
/// packed value takes the destination first and returns the end cursor.
#[allow(clippy::too_many_arguments)]
fn cursorize_call(
    func: String,
    args: Vec<Exp>,
    spawn: bool,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let sig = cx.sig(&func)?;
    if args.len() != sig.params.len() {
        return Err(SaplingError::Internal(format!(
            "call to {func} with {} arguments, declaration has {}",
            args.len(),
            sig.params.len()
        )));
    }
    let mut new_args = Vec::with_capacity(args.len() + 1);
    for (arg, pty) in args.into_iter().zip(&sig.params) {
        if pty.has_packed() {
            if !matches!(pty, Ty::Packed { .. }) {
                return Err(SaplingError::Unsupported(format!(
                    "call to {func} passes an aggregate containing packed values"
                )));
            }
            match arg {
                Exp::Var { .. } => new_args.push(arg),
                _ => {
                    return Err(SaplingError::Unsupported(format!(
                        "packed argument of {func} must be a variable"
                    )))
                }
            }
        } else {
            new_args.push(go(arg, Mode::Value, env, cx, gensym)?);
        }
    }
    let ret_packed = sig.ret.packed_count();
    let mk = |func: String, args: Vec<Exp>| {
        if spawn {
            Exp::Spawn { func, args }
        } else {
            Exp::App { func, args }
        }
    };
    match mode {
        Mode::Packed { dest } => {
            if ret_packed != 1 || !matches!(sig.ret, Ty::Packed { .. }) {
                return Err(SaplingError::Unsupported(format!(
                    "call to {func} in packed context without a single packed result"
                )));
            }
            let mut args = vec![Exp::var(dest)];
            args.append(&mut new_args);
            let end = gensym.fresh("end");
            Ok(Exp::Let {
                var: end.clone(),
                ty: Ty::Cursor,
                rhs: Box::new(mk(func, args)),
                body: Box::new(Exp::MkProd {
                    items: vec![Exp::var(dest), Exp::var(end)],
                }),
            })
        }
        Mode::Value => {
            if ret_packed != 0 {
                return Err(SaplingError::Unsupported(format!(
                    "packed result of {func} must be let-bound at a location"
                )));
            }
            Ok(mk(func, new_args))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cursorize_let(
    var: String,
    ty: Ty,
    rhs: Exp,
    body: Exp,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    match &ty {
        Ty::Packed { loc, .. } => {
            // The destination is the annotated location, except a constructor
            // right-hand side carries its own (more precise) annotation.
            let dest = match &rhs {
                Exp::DataCon { loc: dl, .. } => dl.clone(),
                _ => loc.clone(),
            };
            let pair = go(rhs, Mode::Packed { dest: &dest }, env, cx, gensym)?;
            let pr = gensym.fresh("dil");
            let end = gensym.fresh("end");
            let mut env2 = env.clone();
            env2.vars.insert(var.clone(), ty.clone());
            env2.ends.insert(var.clone(), end.clone());
            let body = go(body, mode, &env2, cx, gensym)?;
            Ok(mk_lets(
                vec![
                    (pr.clone(), prod2(), pair),
                    (
                        var,
                        Ty::Cursor,
                        Exp::Proj {
                            index: 0,
                            tuple: Box::new(Exp::var(pr.clone())),
                        },
                    ),
                    (
                        end,
                        Ty::Cursor,
                        Exp::Proj {
                            index: 1,
                            tuple: Box::new(Exp::var(pr)),
                        },
                    ),
                ],
                body,
            ))
        }
        Ty::Prod { fields } if ty.has_packed() => {
            cursorize_dilated_let(var, fields.clone(), rhs, body, mode, env, cx, gensym)
        }
        _ if ty.has_packed() => Err(SaplingError::Unsupported(format!(
            "binding {var} to a dictionary or list containing packed values"
        ))),
        _ => {
            let rhs = go(rhs, Mode::Value, env, cx, gensym)?;
            let mut env2 = env.clone();
            env2.vars.insert(var.clone(), ty.clone());
            let body = go(body, mode, &env2, cx, gensym)?;
            Ok(Exp::Let {
                var,
                ty: cursorize_ty(&ty)?,
                rhs: Box::new(rhs),
                body: Box::new(body),
            })
        }
    }
}

/// A tuple containing packed values unzips component by component: scalar
/// components bind as values, packed components bind their value-half cursor
/// with the end witness recorded, nested products recurse. The tuple variable
/// stays bound to the reassembled components for value-mode uses.
#[allow(clippy::too_many_arguments)]
fn cursorize_dilated_let(
    var: String,
    fields: Vec<Ty>,
    rhs: Exp,
    body: Exp,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let mut lets = Vec::new();
    let mut env2 = env.clone();
    let comps = unzip_prod(&fields, rhs, &mut lets, &mut env2, cx, gensym)?;
    lets.push((
        var.clone(),
        cursorize_ty(&Ty::Prod {
            fields: fields.clone(),
        })?,
        Exp::MkProd {
            items: comps.iter().cloned().map(Exp::var).collect(),
        },
    ));
    env2.vars.insert(var.clone(), Ty::Prod { fields });
    env2.tuples.insert(var, comps);
    let body = go(body, mode, &env2, cx, gensym)?;
    Ok(mk_lets(lets, body))
}

fn unzip_prod(
    fields: &[Ty],
    rhs: Exp,
    lets: &mut Vec<(String, Ty, Exp)>,
    env: &mut Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Vec<String>, SaplingError> {
    match rhs {
        Exp::MkProd { items } => {
            if items.len() != fields.len() {
                return Err(SaplingError::Internal(format!(
                    "tuple of {} components against a product of {} fields",
                    items.len(),
                    fields.len()
                )));
            }
            items
                .into_iter()
                .zip(fields)
                .map(|(item, fty)| unzip_component(item, fty, lets, env, cx, gensym))
                .collect()
        }
        Exp::Var { name } => env.tuples.get(&name).cloned().ok_or_else(|| {
            SaplingError::Unsupported(format!("tuple variable {name} has no known components"))
        }),
        Exp::Proj { index, tuple } => {
            let inner = resolve_tuple_comp(&tuple, index, env)?;
            env.tuples.get(&inner).cloned().ok_or_else(|| {
                SaplingError::Unsupported(format!(
                    "projected tuple {inner} has no known components"
                ))
            })
        }
        _ => Err(SaplingError::Unsupported(
            "tuple containing packed values must be a tuple literal, a tuple variable, \
             or a projection of one"
                .to_string(),
        )),
    }
}

fn unzip_component(
    item: Exp,
    fty: &Ty,
    lets: &mut Vec<(String, Ty, Exp)>,
    env: &mut Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<String, SaplingError> {
    match fty {
        Ty::Packed { loc: ty_loc, .. } => match item {
            Exp::Var { name } => {
                if env.ends.contains_key(&name) {
                    Ok(name)
                } else {
                    Err(SaplingError::Unsupported(format!(
                        "packed tuple component {name} has no end witness"
                    )))
                }
            }
            Exp::Proj { index, tuple } => {
                let c = resolve_tuple_comp(&tuple, index, env)?;
                if env.ends.contains_key(&c) {
                    Ok(c)
                } else {
                    Err(SaplingError::Unsupported(format!(
                        "projected packed component {c} has no end witness"
                    )))
                }
            }
            item => {
                let dest = match &item {
                    Exp::DataCon { loc, .. } => loc.clone(),
                    _ => ty_loc.clone(),
                };
                let pair = go(item, Mode::Packed { dest: &dest }, env, cx, gensym)?;
                let pr = gensym.fresh("dil");
                let val = gensym.fresh("fld");
                let end = gensym.fresh("end");
                lets.push((pr.clone(), prod2(), pair));
                lets.push((
                    val.clone(),
                    Ty::Cursor,
                    Exp::Proj {
                        index: 0,
                        tuple: Box::new(Exp::var(pr.clone())),
                    },
                ));
                lets.push((
                    end.clone(),
                    Ty::Cursor,
                    Exp::Proj {
                        index: 1,
                        tuple: Box::new(Exp::var(pr)),
                    },
                ));
                env.vars.insert(val.clone(), fty.clone());
                env.ends.insert(val.clone(), end);
                Ok(val)
            }
        },
        Ty::Prod { fields } if fty.has_packed() => {
            let comps = unzip_prod(fields, item, lets, env, cx, gensym)?;
            let c = gensym.fresh("tup");
            lets.push((
                c.clone(),
                cursorize_ty(fty)?,
                Exp::MkProd {
                    items: comps.iter().cloned().map(Exp::var).collect(),
                },
            ));
            env.vars.insert(c.clone(), fty.clone());
            env.tuples.insert(c.clone(), comps);
            Ok(c)
        }
        _ if fty.has_packed() => Err(SaplingError::Unsupported(
            "dictionary or list component containing packed values".to_string(),
        )),
        _ => {
            let c = gensym.fresh("fld");
            let value = go(item, Mode::Value, env, cx, gensym)?;
            lets.push((c.clone(), cursorize_ty(fty)?, value));
            env.vars.insert(c.clone(), fty.clone());
            Ok(c)
        }
    }
}

fn resolve_tuple_comp(tuple: &Exp, index: usize, env: &Env) -> Result<String, SaplingError> {
    let Exp::Var { name } = tuple else {
        return Err(SaplingError::Unsupported(
            "projection from a non-variable tuple".to_string(),
        ));
    };
    env.tuples
        .get(name)
        .and_then(|comps| comps.get(index))
        .cloned()
        .ok_or_else(|| SaplingError::Unsupported(format!("projection from opaque tuple {name}")))
}

/// Serializes one constructor application at `dest`: the tag byte first, then
/// each field left to right, threading the write cursor through.
fn write_datacon(
    con: String,
    args: Vec<Exp>,
    dest: &str,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let ddef = cx
        .ddef_for_con(&con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
    let variant = ddef
        .variant(&con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
    let tag = ddef
        .tag_of(&con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
    if args.len() != variant.fields.len() {
        return Err(SaplingError::Internal(format!(
            "constructor {con} applied to {} arguments, declaration has {} fields",
            args.len(),
            variant.fields.len()
        )));
    }
    let mut lets: Vec<(String, Ty, Exp)> = Vec::new();
    let mut cur = gensym.fresh("cur");
    lets.push((
        cur.clone(),
        Ty::Cursor,
        Exp::WriteTag {
            tag,
            cursor: Box::new(Exp::var(dest)),
        },
    ));
    for (field, arg) in variant.fields.iter().zip(args) {
        if field.packed {
            let pair = go(arg, Mode::Packed { dest: &cur }, env, cx, gensym)?;
            let pr = gensym.fresh("dil");
            lets.push((pr.clone(), prod2(), pair));
            let nxt = gensym.fresh("cur");
            lets.push((
                nxt.clone(),
                Ty::Cursor,
                Exp::Proj {
                    index: 1,
                    tuple: Box::new(Exp::var(pr)),
                },
            ));
            cur = nxt;
        } else {
            if field.ty.has_packed() {
                return Err(SaplingError::Unsupported(format!(
                    "non-packed field of {con} contains packed values"
                )));
            }
            let value = go(arg, Mode::Value, env, cx, gensym)?;
            let nxt = gensym.fresh("cur");
            lets.push((
                nxt.clone(),
                Ty::Cursor,
                Exp::WriteScalar {
                    ty: cursorize_ty(&field.ty)?,
                    value: Box::new(value),
                    cursor: Box::new(Exp::var(cur)),
                },
            ));
            cur = nxt;
        }
    }
    Ok(mk_lets(
        lets,
        Exp::MkProd {
            items: vec![Exp::var(dest), Exp::var(cur)],
        },
    ))
}

fn cursorize_case(
    scrut: Exp,
    arms: Vec<CaseArm>,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let sty = scrut_ty(&scrut, cx, env)?;
    let Ty::Packed { tycon, .. } = sty else {
        return Err(SaplingError::Unsupported(
            "case over a non-packed value".to_string(),
        ));
    };
    let ddef = cx
        .ddefs
        .iter()
        .find(|d| d.name == tycon)
        .ok_or_else(|| SaplingError::Unbound(format!("data type {tycon}")))?;

    let mut lets: Vec<(String, Ty, Exp)> = Vec::new();
    let cursor_var = match scrut {
        Exp::Var { name } => name,
        s if is_alloc_free(&s) => {
            // No allocation anywhere in the scrutinee: its cursor value can be
            // computed in place without a scratch buffer.
            let v = gensym.fresh("scr");
            lets.push((v.clone(), Ty::Cursor, go(s, Mode::Value, env, cx, gensym)?));
            v
        }
        s => {
            // Allocating scrutinee: materialize it into a scoped scratch
            // buffer whose lifetime is this case expression.
            let buf = gensym.fresh("scoped");
            lets.push((buf.clone(), Ty::Cursor, Exp::ScopedBuffer));
            let pair = go(s, Mode::Packed { dest: &buf }, env, cx, gensym)?;
            let pr = gensym.fresh("dil");
            lets.push((pr.clone(), prod2(), pair));
            let v = gensym.fresh("scr");
            lets.push((
                v.clone(),
                Ty::Cursor,
                Exp::Proj {
                    index: 0,
                    tuple: Box::new(Exp::var(pr)),
                },
            ));
            v
        }
    };

    let cons_present: BTreeSet<String> = arms.iter().map(|a| a.con.clone()).collect();
    let mut new_arms = Vec::with_capacity(arms.len());
    for arm in arms {
        new_arms.push(unpack_arm(arm, ddef, &cons_present, mode, env, cx, gensym)?);
    }
    Ok(mk_lets(
        lets,
        Exp::Case {
            scrut: Box::new(Exp::var(cursor_var)),
            arms: new_arms,
        },
    ))
}

enum Step {
    Bind(String, Ty, Exp),
    Read {
        val: String,
        next: String,
        ty: Ty,
        cursor: String,
    },
}

fn wrap_steps(steps: Vec<Step>, body: Exp) -> Exp {
    steps.into_iter().rev().fold(body, |body, step| match step {
        Step::Bind(var, ty, rhs) => Exp::Let {
            var,
            ty,
            rhs: Box::new(rhs),
            body: Box::new(body),
        },
        Step::Read {
            val,
            next,
            ty,
            cursor,
        } => Exp::LetReadScalar {
            val,
            next,
            ty,
            cursor,
            body: Box::new(body),
        },
    })
}

/// One case arm after cursor insertion binds a single variable: the read
/// cursor just past the tag byte. Fields re-materialize as scalar reads and
/// cursor witnesses; shadow arms read their auxiliary cursors first and can
/// therefore reach every field.
#[allow(clippy::too_many_arguments)]
fn unpack_arm(
    arm: CaseArm,
    ddef: &DDef,
    cons_present: &BTreeSet<String>,
    mode: Mode<'_>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<CaseArm, SaplingError> {
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
    let shadow = is_ran_con(&arm.con);
    let post_tag = gensym.fresh("cur");
    let mut env2 = env.clone();
    let mut steps: Vec<Step> = Vec::new();
    let mut cur = post_tag.clone();

    // Shadow variants open with their auxiliary cursor fields.
    let aux_count = if shadow {
        variant
            .fields
            .iter()
            .take_while(|f| !f.packed && f.ty == Ty::Cursor)
            .count()
    } else {
        0
    };
    for (aux_var, _) in &arm.binds[..aux_count] {
        let nxt = gensym.fresh("cur");
        steps.push(Step::Read {
            val: aux_var.clone(),
            next: nxt.clone(),
            ty: Ty::Cursor,
            cursor: cur.clone(),
        });
        env2.vars.insert(aux_var.clone(), Ty::Cursor);
        cur = nxt;
    }
    let aux_names: Vec<String> = arm.binds[..aux_count]
        .iter()
        .map(|(v, _)| v.clone())
        .collect();
    let fields = &variant.fields[aux_count..];
    let binds = &arm.binds[aux_count..];
    let first_packed = fields.iter().position(|f| f.packed);

    let mut cursor: Option<String> = Some(cur);
    let mut blocked = false;
    for (idx, (field, (var, _))) in fields.iter().zip(binds).enumerate() {
        if shadow {
            if let Some(first) = first_packed {
                if idx > first {
                    // Every late field starts at a known auxiliary cursor.
                    cursor = Some(aux_names[idx - first - 1].clone());
                }
            }
        }
        let Some(c) = cursor.clone() else {
            if crate::ir::occurs_free(var, &arm.body) {
                if cons_present.contains(&ran_con_name(&arm.con)) {
                    // A shadow sibling handles random-access values; reaching
                    // this arm with one means the value was built without
                    // auxiliary cursors, which the program cannot navigate.
                    blocked = true;
                    break;
                }
                return Err(SaplingError::Unsupported(format!(
                    "arm for {} reads {} behind a variable-length field",
                    arm.con, var
                )));
            }
            continue;
        };
        if field.packed {
            steps.push(Step::Bind(var.clone(), Ty::Cursor, Exp::var(c)));
            env2.vars.insert(var.clone(), field.ty.clone());
            if shadow {
                if let Some(first) = first_packed {
                    if idx >= first && idx - first < aux_names.len() {
                        env2.ends.insert(var.clone(), aux_names[idx - first].clone());
                    }
                }
            }
            cursor = None;
        } else {
            let nxt = gensym.fresh("cur");
            steps.push(Step::Read {
                val: var.clone(),
                next: nxt.clone(),
                ty: field.ty.clone(),
                cursor: c,
            });
            env2.vars.insert(var.clone(), field.ty.clone());
            env2.ends.insert(var.clone(), nxt.clone());
            cursor = Some(nxt);
        }
    }

    let body = if blocked {
        let ty = match mode {
            Mode::Packed { .. } => prod2(),
            Mode::Value => Ty::Prod { fields: vec![] },
        };
        Exp::Error {
            msg: format!("{} value lacks random-access cursors", arm.con),
            ty,
        }
    } else {
        go(arm.body, mode, &env2, cx, gensym)?
    };
    Ok(CaseArm {
        con: arm.con,
        binds: vec![(post_tag, gensym.fresh("loc"))],
        body: wrap_steps(steps, body),
    })
}

/// Static type of a case scrutinee, resolved without full inference.
fn scrut_ty(exp: &Exp, cx: &Cx<'_>, env: &Env) -> Result<Ty, SaplingError> {
    match exp {
        Exp::Var { name } => env
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| SaplingError::Unbound(format!("variable {name}"))),
        Exp::DataCon { con, loc, .. } => {
            let ddef = cx
                .ddef_for_con(con)
                .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
            Ok(Ty::Packed {
                tycon: ddef.name.clone(),
                loc: loc.clone(),
            })
        }
        Exp::Let { var, ty, body, .. } => match body.as_ref() {
            Exp::Var { name } if name == var => Ok(ty.clone()),
            _ => scrut_ty(body, cx, env),
        },
        Exp::LetRegion { body, .. }
        | Exp::LetLoc { body, .. }
        | Exp::WithArena { body, .. } => scrut_ty(body, cx, env),
        Exp::If { then_branch, .. } => scrut_ty(then_branch, cx, env),
        Exp::App { func, .. } | Exp::Spawn { func, .. } => Ok(cx.sig(func)?.ret.clone()),
        Exp::Proj { index, tuple } => match scrut_ty(tuple, cx, env)? {
            Ty::Prod { fields } => fields.get(*index).cloned().ok_or_else(|| {
                SaplingError::Internal("projection index out of range".to_string())
            }),
            _ => Err(SaplingError::Unsupported(
                "projection from a non-product value".to_string(),
            )),
        },
        Exp::TimeIt { ty, .. } | Exp::Error { ty, .. } => Ok(ty.clone()),
        _ => Err(SaplingError::Unsupported(
            "cannot determine the scrutinee's type".to_string(),
        )),
    }
}

/// Conservative check for the scoped-buffer decision: `true` only when
/// evaluating the expression cannot allocate. Constructor applications and
/// calls always count as allocating.
fn is_alloc_free(exp: &Exp) -> bool {
    match exp {
        Exp::Var { .. }
        | Exp::LitInt { .. }
        | Exp::LitBool { .. }
        | Exp::LitSym { .. }
        | Exp::EndOf { .. }
        | Exp::Sync => true,
        Exp::PrimApp { args, .. } => args.iter().all(is_alloc_free),
        Exp::Proj { tuple, .. } => is_alloc_free(tuple),
        Exp::MkProd { items } => items.iter().all(is_alloc_free),
        Exp::Let { rhs, body, .. } => is_alloc_free(rhs) && is_alloc_free(body),
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => is_alloc_free(cond) && is_alloc_free(then_branch) && is_alloc_free(else_branch),
        Exp::AddCursor { base, .. } => is_alloc_free(base),
        Exp::TimeIt { inner, .. } => is_alloc_free(inner),
        Exp::WithArena { body, .. } => is_alloc_free(body),
        _ => false,
    }
}

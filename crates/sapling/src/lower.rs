//! Lowering to tail form. Every intermediate value gets a name, control
//! flow becomes explicit switches and calls, and the buffer operations left
//! by cursor insertion become primitives the code generator emits directly.

use rustc_hash::FxHashMap;

use crate::ir::{CaseArm, DDef, Exp, Gensym, Prim, Prog, Ty};
use crate::tail::{SwitchAlt, Tail, TailFun, TailPrim, TailProg, TailTy, Triv};
use crate::SaplingError;

struct Cx<'a> {
    ddefs: &'a [DDef],
    /// Return types of every function, for naming call results on demand.
    rets: FxHashMap<String, TailTy>,
}

impl Cx<'_> {
    fn tag_of(&self, con: &str) -> Result<i64, SaplingError> {
        self.ddefs
            .iter()
            .find_map(|d| d.tag_of(con))
            .map(i64::from)
            .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))
    }
}

/// Substitutions accumulated while flattening: direct aliases for copy
/// bindings, and per-component operands for tuple bindings.
#[derive(Clone, Default)]
struct Env {
    aliases: FxHashMap<String, Triv>,
    tuples: FxHashMap<String, Vec<Triv>>,
}

/// A binding queued while flattening a non-trivial operand.
enum Pending {
    Prim {
        name: String,
        ty: TailTy,
        prim: TailPrim,
        args: Vec<Triv>,
    },
    Call {
        name: String,
        ty: TailTy,
        func: String,
        args: Vec<Triv>,
        spawn: bool,
    },
}

pub fn lower(prog: Prog, gensym: &mut Gensym) -> Result<TailProg, SaplingError> {
    let Prog {
        ddefs,
        fundefs,
        main,
    } = prog;
    let rets = fundefs
        .iter()
        .map(|f| Ok((f.name.clone(), ty_to_tail(&f.ret_ty)?)))
        .collect::<Result<FxHashMap<_, _>, SaplingError>>()?;
    let cx = Cx {
        ddefs: &ddefs,
        rets,
    };
    let funs = fundefs
        .into_iter()
        .map(|f| {
            let params = f
                .params
                .iter()
                .map(|(p, t)| Ok((p.clone(), ty_to_tail(t)?)))
                .collect::<Result<Vec<_>, SaplingError>>()?;
            let body = tail(f.body, &Env::default(), &cx, gensym)?;
            Ok(TailFun {
                name: f.name,
                params,
                ret: ty_to_tail(&f.ret_ty)?,
                body,
            })
        })
        .collect::<Result<Vec<_>, SaplingError>>()?;
    let main = main
        .map(|m| tail(m.expr, &Env::default(), &cx, gensym))
        .transpose()?;
    Ok(TailProg { funs, main })
}

fn ty_to_tail(ty: &Ty) -> Result<TailTy, SaplingError> {
    match ty {
        Ty::Int => Ok(TailTy::Int),
        // Booleans are integers from here on.
        Ty::Bool => Ok(TailTy::Int),
        Ty::Sym => Ok(TailTy::Sym),
        Ty::Cursor => Ok(TailTy::Cursor),
        Ty::Prod { fields } => Ok(TailTy::Prod {
            fields: fields.iter().map(ty_to_tail).collect::<Result<_, _>>()?,
        }),
        Ty::Dict { value } => Ok(TailTy::Dict {
            value: Box::new(ty_to_tail(value)?),
        }),
        Ty::Packed { tycon, .. } => Err(SaplingError::Internal(format!(
            "packed type {tycon} survived cursor insertion"
        ))),
        Ty::List { .. } => Err(SaplingError::Unsupported("list types".to_string())),
    }
}

fn prim_to_tail(prim: Prim) -> Result<(TailPrim, TailTy), SaplingError> {
    Ok(match prim {
        Prim::AddI => (TailPrim::AddI, TailTy::Int),
        Prim::SubI => (TailPrim::SubI, TailTy::Int),
        Prim::MulI => (TailPrim::MulI, TailTy::Int),
        Prim::DivI => (TailPrim::DivI, TailTy::Int),
        Prim::EqI => (TailPrim::EqI, TailTy::Int),
        Prim::LtI => (TailPrim::LtI, TailTy::Int),
        Prim::GtI => (TailPrim::GtI, TailTy::Int),
        Prim::EqSym => (TailPrim::EqSym, TailTy::Int),
        Prim::EqB => (TailPrim::EqB, TailTy::Int),
        Prim::DictEmpty { value } => {
            let value = ty_to_tail(&value)?;
            (
                TailPrim::DictEmpty {
                    value: value.clone(),
                },
                TailTy::Dict {
                    value: Box::new(value),
                },
            )
        }
        Prim::DictInsert { value } => {
            let value = ty_to_tail(&value)?;
            (
                TailPrim::DictInsert {
                    value: value.clone(),
                },
                TailTy::Dict {
                    value: Box::new(value),
                },
            )
        }
        Prim::DictLookup { value } => {
            let value = ty_to_tail(&value)?;
            (TailPrim::DictLookup { value: value.clone() }, value)
        }
    })
}

/// A trivial operand, after alias and tuple-component resolution.
fn triv(exp: &Exp, env: &Env) -> Result<Triv, SaplingError> {
    match exp {
        Exp::Var { name } => Ok(env
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| Triv::var(name.clone()))),
        Exp::LitInt { value } => Ok(Triv::Int { value: *value }),
        Exp::LitBool { value } => Ok(Triv::Int {
            value: i64::from(*value),
        }),
        Exp::LitSym { text } => Ok(Triv::Sym { text: text.clone() }),
        Exp::Proj { index, tuple } => {
            let Exp::Var { name } = tuple.as_ref() else {
                return Err(SaplingError::Internal(
                    "projection from a non-variable tuple".to_string(),
                ));
            };
            let base = match env.aliases.get(name) {
                Some(Triv::Var { name }) => name.clone(),
                Some(_) => {
                    return Err(SaplingError::Internal(format!(
                        "tuple variable {name} aliased to a literal"
                    )))
                }
                None => name.clone(),
            };
            env.tuples
                .get(&base)
                .and_then(|comps| comps.get(*index))
                .cloned()
                .ok_or_else(|| {
                    SaplingError::Unsupported(format!("projection from opaque tuple {base}"))
                })
        }
        _ => Err(SaplingError::Internal(
            "expected a trivial operand".to_string(),
        )),
    }
}

/// Flattens an operand, queuing primitive and call bindings for anything
/// non-trivial.
fn operand(
    exp: &Exp,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
    pending: &mut Vec<Pending>,
) -> Result<Triv, SaplingError> {
    if let Ok(t) = triv(exp, env) {
        return Ok(t);
    }
    match exp {
        Exp::PrimApp { prim, args } => {
            let args = args
                .iter()
                .map(|a| operand(a, env, cx, gensym, pending))
                .collect::<Result<Vec<_>, _>>()?;
            let (prim, ty) = prim_to_tail(prim.clone())?;
            let name = gensym.fresh("flt");
            pending.push(Pending::Prim {
                name: name.clone(),
                ty,
                prim,
                args,
            });
            Ok(Triv::var(name))
        }
        Exp::App { func, args } | Exp::Spawn { func, args } => {
            let spawn = matches!(exp, Exp::Spawn { .. });
            let args = args
                .iter()
                .map(|a| operand(a, env, cx, gensym, pending))
                .collect::<Result<Vec<_>, _>>()?;
            let ty = cx
                .rets
                .get(func)
                .cloned()
                .ok_or_else(|| SaplingError::Unbound(format!("function {func}")))?;
            let name = gensym.fresh("flt");
            pending.push(Pending::Call {
                name: name.clone(),
                ty,
                func: func.clone(),
                args,
                spawn,
            });
            Ok(Triv::var(name))
        }
        _ => Err(SaplingError::Internal(
            "operand is neither trivial, a primitive, nor a call".to_string(),
        )),
    }
}

fn wrap_pending(pending: Vec<Pending>, body: Tail) -> Tail {
    pending.into_iter().rev().fold(body, |body, p| match p {
        Pending::Prim {
            name,
            ty,
            prim,
            args,
        } => Tail::LetPrim {
            binds: vec![(name, ty)],
            prim,
            args,
            body: Box::new(body),
        },
        Pending::Call {
            name,
            ty,
            func,
            args,
            spawn,
        } => Tail::LetCall {
            binds: vec![(name, ty)],
            func,
            args,
            spawn,
            body: Box::new(body),
        },
    })
}

fn tail(exp: Exp, env: &Env, cx: &Cx<'_>, gensym: &mut Gensym) -> Result<Tail, SaplingError> {
    match exp {
        Exp::Error { msg, .. } => Ok(Tail::Err { msg }),
        Exp::Var { ref name } if env.tuples.contains_key(name) => Ok(Tail::Return {
            trivs: env.tuples[name].clone(),
        }),
        Exp::Var { .. } | Exp::LitInt { .. } | Exp::LitBool { .. } | Exp::LitSym { .. }
        | Exp::Proj { .. } => Ok(Tail::Return {
            trivs: vec![triv(&exp, env)?],
        }),
        Exp::MkProd { items } => {
            let mut pending = Vec::new();
            let trivs = items
                .iter()
                .map(|i| operand(i, env, cx, gensym, &mut pending))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(wrap_pending(pending, Tail::Return { trivs }))
        }
        Exp::Sync => Ok(Tail::Sync {
            body: Box::new(Tail::Return { trivs: vec![] }),
        }),
        Exp::PrimApp { .. } => {
            let mut pending = Vec::new();
            let t = operand(&exp, env, cx, gensym, &mut pending)?;
            Ok(wrap_pending(pending, Tail::Return { trivs: vec![t] }))
        }
        Exp::App { func, args } => {
            let mut pending = Vec::new();
            let args = args
                .iter()
                .map(|a| operand(a, env, cx, gensym, &mut pending))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(wrap_pending(pending, Tail::TailCall { func, args }))
        }
        Exp::Spawn { .. } => Err(SaplingError::Internal(
            "spawn outside a binding".to_string(),
        )),
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let mut pending = Vec::new();
            let scrut = operand(&cond, env, cx, gensym, &mut pending)?;
            // False is zero; everything else falls through to the default,
            // which is the then branch.
            let alts = vec![SwitchAlt {
                tag: 0,
                body: tail(*else_branch, env, cx, gensym)?,
            }];
            let default = Box::new(tail(*then_branch, env, cx, gensym)?);
            Ok(wrap_pending(
                pending,
                Tail::Switch {
                    scrut,
                    alts,
                    default,
                },
            ))
        }
        Exp::Case { scrut, arms } => lower_case(*scrut, arms, env, cx, gensym),
        Exp::Let { var, ty, rhs, body } => lower_let(var, ty, *rhs, *body, env, cx, gensym),
        Exp::LetReadScalar {
            val,
            next,
            ty,
            cursor,
            body,
        } => {
            let ty = ty_to_tail(&ty)?;
            let cursor = triv(&Exp::var(cursor), env)?;
            Ok(Tail::LetPrim {
                binds: vec![(val, ty.clone()), (next, TailTy::Cursor)],
                prim: TailPrim::ReadScalar { ty },
                args: vec![cursor],
                body: Box::new(tail(*body, env, cx, gensym)?),
            })
        }
        Exp::TimeIt { ref ty, .. } => {
            let tmp = gensym.fresh("tmr");
            let ty = ty.clone();
            let rebuilt = Exp::Let {
                var: tmp.clone(),
                ty,
                rhs: Box::new(exp),
                body: Box::new(Exp::var(tmp)),
            };
            tail(rebuilt, env, cx, gensym)
        }
        Exp::WithArena { body, .. } => tail(*body, env, cx, gensym),
        Exp::AddCursor { .. }
        | Exp::WriteTag { .. }
        | Exp::WriteScalar { .. }
        | Exp::NewBuffer
        | Exp::ScopedBuffer => {
            let tmp = gensym.fresh("cur");
            let rebuilt = Exp::Let {
                var: tmp.clone(),
                ty: Ty::Cursor,
                rhs: Box::new(exp),
                body: Box::new(Exp::var(tmp)),
            };
            tail(rebuilt, env, cx, gensym)
        }
        Exp::EndOf { .. } | Exp::DataCon { .. } | Exp::LetRegion { .. } | Exp::LetLoc { .. } => {
            Err(SaplingError::Internal(
                "pre-cursor form reached lowering".to_string(),
            ))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn lower_let(
    var: String,
    ty: Ty,
    rhs: Exp,
    body: Exp,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Tail, SaplingError> {
    match rhs {
        // Left-nested lets re-associate before anything else.
        Exp::Let {
            var: inner_var,
            ty: inner_ty,
            rhs: inner_rhs,
            body: inner_body,
        } => tail(
            Exp::Let {
                var: inner_var,
                ty: inner_ty,
                rhs: inner_rhs,
                body: Box::new(Exp::Let {
                    var,
                    ty,
                    rhs: inner_body,
                    body: Box::new(body),
                }),
            },
            env,
            cx,
            gensym,
        ),
        Exp::LetReadScalar {
            val,
            next,
            ty: read_ty,
            cursor,
            body: inner_body,
        } => tail(
            Exp::LetReadScalar {
                val,
                next,
                ty: read_ty,
                cursor,
                body: Box::new(Exp::Let {
                    var,
                    ty,
                    rhs: inner_body,
                    body: Box::new(body),
                }),
            },
            env,
            cx,
            gensym,
        ),
        Exp::WithArena { body: inner, .. } => lower_let(var, ty, *inner, body, env, cx, gensym),
        // Branching right-hand sides distribute the continuation into the
        // branches.
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => tail(
            Exp::If {
                cond,
                then_branch: Box::new(Exp::Let {
                    var: var.clone(),
                    ty: ty.clone(),
                    rhs: then_branch,
                    body: Box::new(body.clone()),
                }),
                else_branch: Box::new(Exp::Let {
                    var,
                    ty,
                    rhs: else_branch,
                    body: Box::new(body),
                }),
            },
            env,
            cx,
            gensym,
        ),
        Exp::Case { scrut, arms } => {
            let arms = arms
                .into_iter()
                .map(|arm| CaseArm {
                    con: arm.con,
                    binds: arm.binds,
                    body: Exp::Let {
                        var: var.clone(),
                        ty: ty.clone(),
                        rhs: Box::new(arm.body),
                        body: Box::new(body.clone()),
                    },
                })
                .collect();
            tail(
                Exp::Case { scrut, arms },
                env,
                cx,
                gensym,
            )
        }
        Exp::TimeIt { inner, iterate, .. } => {
            let name = gensym.fresh("timer");
            let lowered = lower_let(var.clone(), ty, *inner, body, env, cx, gensym)?;
            Ok(Tail::StartTimer {
                name: name.clone(),
                iterate,
                body: Box::new(splice_end_timer(lowered, &var, &name)),
            })
        }
        Exp::Error { msg, .. } => Ok(Tail::Err { msg }),
        Exp::PrimApp { prim, args } => {
            let mut pending = Vec::new();
            let args = args
                .iter()
                .map(|a| operand(a, env, cx, gensym, &mut pending))
                .collect::<Result<Vec<_>, _>>()?;
            let (prim, _) = prim_to_tail(prim)?;
            let body = tail(body, env, cx, gensym)?;
            Ok(wrap_pending(
                pending,
                Tail::LetPrim {
                    binds: vec![(var, ty_to_tail(&ty)?)],
                    prim,
                    args,
                    body: Box::new(body),
                },
            ))
        }
        Exp::App { func, args } => {
            lower_call_let(var, ty, func, args, false, body, env, cx, gensym)
        }
        Exp::Spawn { func, args } => {
            lower_call_let(var, ty, func, args, true, body, env, cx, gensym)
        }
        Exp::Sync => {
            let mut env2 = env.clone();
            // A sync binding carries no value; stand in with zero.
            env2.aliases.insert(var, Triv::Int { value: 0 });
            Ok(Tail::Sync {
                body: Box::new(tail(body, &env2, cx, gensym)?),
            })
        }
        Exp::MkProd { items } => lower_tuple_let(var, ty, items, body, env, cx, gensym),
        Exp::Proj { .. } | Exp::Var { .. } | Exp::LitInt { .. } | Exp::LitBool { .. }
        | Exp::LitSym { .. } => {
            let t = triv(&rhs, env)?;
            let mut env2 = env.clone();
            env2.aliases.insert(var, t);
            tail(body, &env2, cx, gensym)
        }
        Exp::AddCursor { base, offset } => {
            let mut pending = Vec::new();
            let base = operand(&base, env, cx, gensym, &mut pending)?;
            let body = tail(body, env, cx, gensym)?;
            Ok(wrap_pending(
                pending,
                Tail::LetPrim {
                    binds: vec![(var, TailTy::Cursor)],
                    prim: TailPrim::AddCursor { offset },
                    args: vec![base],
                    body: Box::new(body),
                },
            ))
        }
        Exp::WriteTag { tag, cursor } => {
            let cursor = triv(&cursor, env)?;
            let body = tail(body, env, cx, gensym)?;
            Ok(Tail::LetPrim {
                binds: vec![(var, TailTy::Cursor)],
                prim: TailPrim::WriteTag { tag },
                args: vec![cursor],
                body: Box::new(body),
            })
        }
        Exp::WriteScalar {
            ty: scalar_ty,
            value,
            cursor,
        } => {
            let mut pending = Vec::new();
            let value = operand(&value, env, cx, gensym, &mut pending)?;
            let cursor = triv(&cursor, env)?;
            let body = tail(body, env, cx, gensym)?;
            Ok(wrap_pending(
                pending,
                Tail::LetPrim {
                    binds: vec![(var, TailTy::Cursor)],
                    prim: TailPrim::WriteScalar {
                        ty: ty_to_tail(&scalar_ty)?,
                    },
                    args: vec![value, cursor],
                    body: Box::new(body),
                },
            ))
        }
        Exp::NewBuffer | Exp::ScopedBuffer => {
            let prim = if matches!(rhs, Exp::NewBuffer) {
                TailPrim::NewBuffer
            } else {
                TailPrim::ScopedBuffer
            };
            let body = tail(body, env, cx, gensym)?;
            Ok(Tail::LetPrim {
                binds: vec![(var, TailTy::Cursor)],
                prim,
                args: vec![],
                body: Box::new(body),
            })
        }
        Exp::EndOf { .. } | Exp::DataCon { .. } | Exp::LetRegion { .. } | Exp::LetLoc { .. } => {
            Err(SaplingError::Internal(
                "pre-cursor form reached lowering".to_string(),
            ))
        }
    }
}

/// Call results of product type split into one binder per component, so
/// projections of the result resolve without a runtime tuple.
#[allow(clippy::too_many_arguments)]
fn lower_call_let(
    var: String,
    ty: Ty,
    func: String,
    args: Vec<Exp>,
    spawn: bool,
    body: Exp,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Tail, SaplingError> {
    let mut pending = Vec::new();
    let args = args
        .iter()
        .map(|a| operand(a, env, cx, gensym, &mut pending))
        .collect::<Result<Vec<_>, _>>()?;
    let mut env2 = env.clone();
    let binds = match &ty {
        Ty::Prod { fields } => {
            let mut binds = Vec::with_capacity(fields.len());
            let mut comps = Vec::with_capacity(fields.len());
            for field in fields {
                let c = gensym.fresh("ret");
                comps.push(Triv::var(c.clone()));
                binds.push((c, ty_to_tail(field)?));
            }
            env2.tuples.insert(var, comps);
            binds
        }
        _ => vec![(var, ty_to_tail(&ty)?)],
    };
    let body = tail(body, &env2, cx, gensym)?;
    Ok(wrap_pending(
        pending,
        Tail::LetCall {
            binds,
            func,
            args,
            spawn,
            body: Box::new(body),
        },
    ))
}

/// Tuple bindings dissolve into per-component operands; projections of the
/// bound variable resolve to those operands with no tuple at runtime.
#[allow(clippy::too_many_arguments)]
fn lower_tuple_let(
    var: String,
    ty: Ty,
    items: Vec<Exp>,
    body: Exp,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Tail, SaplingError> {
    if let Some(idx) = items.iter().position(|i| triv(i, env).is_err()) {
        // Name the first non-trivial component, then retry.
        let Ty::Prod { fields } = &ty else {
            return Err(SaplingError::Internal(format!(
                "tuple binding {var} without a product type"
            )));
        };
        let comp_ty = fields
            .get(idx)
            .cloned()
            .ok_or_else(|| SaplingError::Internal(format!("tuple binding {var} arity")))?;
        let tmp = gensym.fresh("prj");
        let mut items = items;
        let named = std::mem::replace(&mut items[idx], Exp::var(tmp.clone()));
        return tail(
            Exp::Let {
                var: tmp,
                ty: comp_ty,
                rhs: Box::new(named),
                body: Box::new(Exp::Let {
                    var,
                    ty,
                    rhs: Box::new(Exp::MkProd { items }),
                    body: Box::new(body),
                }),
            },
            env,
            cx,
            gensym,
        );
    }
    let comps = items
        .iter()
        .map(|i| triv(i, env))
        .collect::<Result<Vec<_>, _>>()?;
    let mut env2 = env.clone();
    env2.tuples.insert(var, comps);
    tail(body, &env2, cx, gensym)
}

/// `case` on a packed value: read the tag byte, then dispatch. The final arm
/// becomes the switch default; earlier arms keep their tags. Every arm's
/// single binder is the cursor just past the tag, which is exactly the second
/// result of the tag read.
fn lower_case(
    scrut: Exp,
    arms: Vec<CaseArm>,
    env: &Env,
    cx: &Cx<'_>,
    gensym: &mut Gensym,
) -> Result<Tail, SaplingError> {
    if arms.is_empty() {
        return Err(SaplingError::Internal("case with no arms".to_string()));
    }
    let scrut = triv(&scrut, env)?;
    let tag_var = gensym.fresh("tag");
    let next_var = gensym.fresh("cur");
    let mut lowered = Vec::with_capacity(arms.len());
    for arm in arms {
        if arm.binds.len() != 1 {
            return Err(SaplingError::Internal(format!(
                "arm for {} binds {} variables after cursor insertion",
                arm.con,
                arm.binds.len()
            )));
        }
        let tag = cx.tag_of(&arm.con)?;
        let mut env2 = env.clone();
        env2.aliases
            .insert(arm.binds[0].0.clone(), Triv::var(next_var.clone()));
        lowered.push((tag, tail(arm.body, &env2, cx, gensym)?));
    }
    let default = Box::new(lowered.pop().map(|(_, b)| b).ok_or_else(|| {
        SaplingError::Internal("case with no arms".to_string())
    })?);
    let alts = lowered
        .into_iter()
        .map(|(tag, body)| SwitchAlt { tag, body })
        .collect();
    Ok(Tail::LetPrim {
        binds: vec![(tag_var.clone(), TailTy::Int), (next_var, TailTy::Cursor)],
        prim: TailPrim::ReadTag,
        args: vec![scrut],
        body: Box::new(Tail::Switch {
            scrut: Triv::var(tag_var),
            alts,
            default,
        }),
    })
}

/// Closes the timer right after the measured binding lands. When the binding
/// dissolved into an alias, the timer closes around the terminal instead.
fn splice_end_timer(t: Tail, var: &str, name: &str) -> Tail {
    match t {
        Tail::LetPrim {
            binds,
            prim,
            args,
            body,
        } => {
            let done = binds.iter().any(|(v, _)| v == var);
            let body = if done {
                Tail::EndTimer {
                    name: name.to_string(),
                    body,
                }
            } else {
                splice_end_timer(*body, var, name)
            };
            Tail::LetPrim {
                binds,
                prim,
                args,
                body: Box::new(body),
            }
        }
        Tail::LetCall {
            binds,
            func,
            args,
            spawn,
            body,
        } => {
            let done = binds.iter().any(|(v, _)| v == var);
            let body = if done {
                Tail::EndTimer {
                    name: name.to_string(),
                    body,
                }
            } else {
                splice_end_timer(*body, var, name)
            };
            Tail::LetCall {
                binds,
                func,
                args,
                spawn,
                body: Box::new(body),
            }
        }
        Tail::Switch {
            scrut,
            alts,
            default,
        } => Tail::Switch {
            scrut,
            alts: alts
                .into_iter()
                .map(|a| SwitchAlt {
                    tag: a.tag,
                    body: splice_end_timer(a.body, var, name),
                })
                .collect(),
            default: Box::new(splice_end_timer(*default, var, name)),
        },
        Tail::Sync { body } => Tail::Sync {
            body: Box::new(splice_end_timer(*body, var, name)),
        },
        Tail::StartTimer {
            name: inner,
            iterate,
            body,
        } => Tail::StartTimer {
            name: inner,
            iterate,
            body: Box::new(splice_end_timer(*body, var, name)),
        },
        Tail::EndTimer { name: inner, body } => Tail::EndTimer {
            name: inner,
            body: Box::new(splice_end_timer(*body, var, name)),
        },
        done @ (Tail::Return { .. } | Tail::TailCall { .. }) => Tail::EndTimer {
            name: name.to_string(),
            body: Box::new(done),
        },
        err @ Tail::Err { .. } => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Field, FunDef, MainExp, Variant};

    fn lower_main(ddefs: Vec<DDef>, expr: Exp, ty: Ty) -> Tail {
        let prog = Prog {
            ddefs,
            fundefs: vec![],
            main: Some(MainExp { expr, ty }),
        };
        let mut gensym = Gensym::default();
        lower(prog, &mut gensym).unwrap().main.unwrap()
    }

    fn tree_ddef() -> DDef {
        DDef {
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
                            ty: Ty::Cursor,
                        },
                        Field {
                            packed: true,
                            ty: Ty::Cursor,
                        },
                    ],
                },
            ],
        }
    }

    /// `if c then 1 else 2` becomes a switch whose only listed alternative is
    /// zero (false) and whose default is the then branch.
    #[test]
    fn if_lowers_to_switch_with_zero_alternative() {
        let expr = Exp::Let {
            var: "c".to_string(),
            ty: Ty::Bool,
            rhs: Box::new(Exp::LitBool { value: true }),
            body: Box::new(Exp::If {
                cond: Box::new(Exp::var("c")),
                then_branch: Box::new(Exp::LitInt { value: 1 }),
                else_branch: Box::new(Exp::LitInt { value: 2 }),
            }),
        };
        let got = lower_main(vec![], expr, Ty::Int);
        let Tail::Switch {
            scrut,
            alts,
            default,
        } = got
        else {
            panic!("expected a switch, got {got:?}");
        };
        assert_eq!(scrut, Triv::Int { value: 1 });
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].tag, 0);
        assert_eq!(
            alts[0].body,
            Tail::Return {
                trivs: vec![Triv::Int { value: 2 }]
            }
        );
        assert_eq!(
            *default,
            Tail::Return {
                trivs: vec![Triv::Int { value: 1 }]
            }
        );
    }

    /// The final case arm carries no tag in the switch: it is the default.
    #[test]
    fn last_case_arm_becomes_switch_default() {
        let expr = Exp::Let {
            var: "t".to_string(),
            ty: Ty::Cursor,
            rhs: Box::new(Exp::NewBuffer),
            body: Box::new(Exp::Case {
                scrut: Box::new(Exp::var("t")),
                arms: vec![
                    CaseArm {
                        con: "Leaf".to_string(),
                        binds: vec![("c1".to_string(), "l1".to_string())],
                        body: Exp::LitInt { value: 1 },
                    },
                    CaseArm {
                        con: "Node".to_string(),
                        binds: vec![("c2".to_string(), "l2".to_string())],
                        body: Exp::LitInt { value: 2 },
                    },
                ],
            }),
        };
        let got = lower_main(vec![tree_ddef()], expr, Ty::Int);
        let Tail::LetPrim { prim, body, .. } = got else {
            panic!("expected the buffer binding");
        };
        assert_eq!(prim, TailPrim::NewBuffer);
        let Tail::LetPrim { prim, binds, body, .. } = *body else {
            panic!("expected the tag read");
        };
        assert_eq!(prim, TailPrim::ReadTag);
        assert_eq!(binds.len(), 2);
        let Tail::Switch { alts, default, .. } = *body else {
            panic!("expected a switch");
        };
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].tag, 0);
        assert_eq!(
            *default,
            Tail::Return {
                trivs: vec![Triv::Int { value: 2 }]
            }
        );
    }

    /// A tuple binding leaves no tuple behind: its projections resolve to the
    /// component operands directly.
    #[test]
    fn tuple_bindings_dissolve_into_components() {
        let expr = Exp::Let {
            var: "p".to_string(),
            ty: Ty::Prod {
                fields: vec![Ty::Int, Ty::Int],
            },
            rhs: Box::new(Exp::MkProd {
                items: vec![Exp::LitInt { value: 1 }, Exp::LitInt { value: 2 }],
            }),
            body: Box::new(Exp::Proj {
                index: 1,
                tuple: Box::new(Exp::var("p")),
            }),
        };
        let got = lower_main(vec![], expr, Ty::Int);
        assert_eq!(
            got,
            Tail::Return {
                trivs: vec![Triv::Int { value: 2 }]
            }
        );
    }

    /// Non-trivial tuple components get named before the tuple dissolves.
    #[test]
    fn tuple_components_are_named_when_non_trivial() {
        let expr = Exp::Let {
            var: "p".to_string(),
            ty: Ty::Prod {
                fields: vec![Ty::Int, Ty::Int],
            },
            rhs: Box::new(Exp::MkProd {
                items: vec![
                    Exp::PrimApp {
                        prim: Prim::AddI,
                        args: vec![Exp::LitInt { value: 1 }, Exp::LitInt { value: 2 }],
                    },
                    Exp::LitInt { value: 9 },
                ],
            }),
            body: Box::new(Exp::Proj {
                index: 0,
                tuple: Box::new(Exp::var("p")),
            }),
        };
        let got = lower_main(vec![], expr, Ty::Int);
        let Tail::LetPrim { prim, binds, body, .. } = got else {
            panic!("expected the component binding");
        };
        assert_eq!(prim, TailPrim::AddI);
        assert_eq!(
            *body,
            Tail::Return {
                trivs: vec![Triv::var(binds[0].0.clone())]
            }
        );
    }

    #[test]
    fn booleans_lower_as_integers() {
        let expr = Exp::Let {
            var: "b".to_string(),
            ty: Ty::Bool,
            rhs: Box::new(Exp::LitBool { value: false }),
            body: Box::new(Exp::var("b")),
        };
        let got = lower_main(vec![], expr, Ty::Bool);
        assert_eq!(
            got,
            Tail::Return {
                trivs: vec![Triv::Int { value: 0 }]
            }
        );
    }

    /// A timed binding opens the timer before the work and closes it right
    /// after the measured value lands.
    #[test]
    fn timed_binding_opens_and_closes_timer() {
        let expr = Exp::Let {
            var: "x".to_string(),
            ty: Ty::Int,
            rhs: Box::new(Exp::TimeIt {
                inner: Box::new(Exp::PrimApp {
                    prim: Prim::AddI,
                    args: vec![Exp::LitInt { value: 1 }, Exp::LitInt { value: 2 }],
                }),
                ty: Ty::Int,
                iterate: false,
            }),
            body: Box::new(Exp::var("x")),
        };
        let got = lower_main(vec![], expr, Ty::Int);
        let Tail::StartTimer { body, iterate, .. } = got else {
            panic!("expected a timer open, got {got:?}");
        };
        assert!(!iterate);
        let Tail::LetPrim { prim, body, .. } = *body else {
            panic!("expected the measured binding");
        };
        assert_eq!(prim, TailPrim::AddI);
        assert!(matches!(*body, Tail::EndTimer { .. }));
    }

    /// Spawned calls carry the spawn flag; the sync barrier wraps the rest of
    /// the body.
    #[test]
    fn spawn_and_sync_lower_to_flagged_call_and_barrier() {
        let expr = Exp::Let {
            var: "x".to_string(),
            ty: Ty::Int,
            rhs: Box::new(Exp::Spawn {
                func: "work".to_string(),
                args: vec![Exp::LitInt { value: 4 }],
            }),
            body: Box::new(Exp::Let {
                var: "u".to_string(),
                ty: Ty::Int,
                rhs: Box::new(Exp::Sync),
                body: Box::new(Exp::var("x")),
            }),
        };
        let got = lower_main(vec![], expr, Ty::Int);
        let Tail::LetCall { spawn, body, .. } = got else {
            panic!("expected a call binding, got {got:?}");
        };
        assert!(spawn);
        let Tail::Sync { body } = *body else {
            panic!("expected the barrier");
        };
        assert_eq!(
            *body,
            Tail::Return {
                trivs: vec![Triv::var("x")]
            }
        );
    }

    /// A call in condition position gets named on demand, like a primitive
    /// operand, and the switch dispatches on the named result.
    #[test]
    fn call_in_condition_position_is_named() {
        let prog = Prog {
            ddefs: vec![],
            fundefs: vec![FunDef {
                name: "f".to_string(),
                params: vec![("n".to_string(), Ty::Int)],
                ret_ty: Ty::Bool,
                body: Exp::LitBool { value: true },
            }],
            main: Some(MainExp {
                expr: Exp::If {
                    cond: Box::new(Exp::App {
                        func: "f".to_string(),
                        args: vec![Exp::LitInt { value: 1 }],
                    }),
                    then_branch: Box::new(Exp::LitInt { value: 2 }),
                    else_branch: Box::new(Exp::LitInt { value: 3 }),
                },
                ty: Ty::Int,
            }),
        };
        let mut gensym = Gensym::default();
        let got = lower(prog, &mut gensym).unwrap().main.unwrap();
        let Tail::LetCall {
            binds,
            func,
            spawn,
            body,
            ..
        } = got
        else {
            panic!("expected the named call, got {got:?}");
        };
        assert_eq!(func, "f");
        assert!(!spawn);
        let Tail::Switch { scrut, .. } = *body else {
            panic!("expected a switch");
        };
        assert_eq!(scrut, Triv::var(binds[0].0.clone()));
    }

    /// A tail-position application is a tail call, not a binding.
    #[test]
    fn tail_position_application_becomes_tail_call() {
        let expr = Exp::App {
            func: "loop_step".to_string(),
            args: vec![Exp::LitInt { value: 3 }],
        };
        let got = lower_main(vec![], expr, Ty::Int);
        assert_eq!(
            got,
            Tail::TailCall {
                func: "loop_step".to_string(),
                args: vec![Triv::Int { value: 3 }]
            }
        );
    }

    /// Source-level errors survive as runtime terminals.
    #[test]
    fn error_terminals_survive_lowering() {
        let got = lower_main(
            vec![],
            Exp::Error {
                msg: "boom".to_string(),
                ty: Ty::Int,
            },
            Ty::Int,
        );
        assert_eq!(
            got,
            Tail::Err {
                msg: "boom".to_string()
            }
        );
    }
}

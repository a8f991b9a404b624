use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::ir::{
    is_ran_con, mk_lets, ran_con_name, CaseArm, DDef, Exp, Field, FunDef, Gensym, MainExp, Prog,
    Ty, Variant,
};
use crate::SaplingError;

struct Cx<'a> {
    ddefs: &'a [DDef],
    needed: &'a BTreeSet<String>,
}

impl Cx<'_> {
    fn ddef_for_con(&self, con: &str) -> Option<&DDef> {
        self.ddefs
            .iter()
            .find(|d| d.variants.iter().any(|v| v.name == con))
    }
}

/// Adds shadow (random-access) variants to every data type in `needed` and
/// rewrites constructor applications and case expressions to use them.
///
/// Shadow variants append after all original variants, so existing tags stay
/// stable. Running the rewrite on its own output is a no-op.
pub fn add_ran(
    prog: Prog,
    needed: &BTreeSet<String>,
    gensym: &mut Gensym,
) -> Result<Prog, SaplingError> {
    let Prog {
        mut ddefs,
        fundefs,
        main,
    } = prog;

    for ddef in &mut ddefs {
        if !needed.contains(&ddef.name) {
            continue;
        }
        let shadows: Vec<Variant> = ddef
            .variants
            .iter()
            .filter(|v| !is_ran_con(&v.name))
            .filter(|v| v.fields_after_first_packed() > 0)
            .filter(|v| ddef.variant(&ran_con_name(&v.name)).is_none())
            .map(|v| {
                let mut fields: Vec<Field> = (0..v.fields_after_first_packed())
                    .map(|_| Field {
                        packed: false,
                        ty: Ty::Cursor,
                    })
                    .collect();
                fields.extend(v.fields.iter().cloned());
                Variant {
                    name: ran_con_name(&v.name),
                    fields,
                }
            })
            .collect();
        ddef.variants.extend(shadows);
    }

    let cx = Cx {
        ddefs: &ddefs,
        needed,
    };
    let no_ends = FxHashMap::default();
    let fundefs = fundefs
        .into_iter()
        .map(|fun| {
            let FunDef {
                name,
                params,
                ret_ty,
                body,
            } = fun;
            Ok(FunDef {
                name,
                params,
                ret_ty,
                body: rewrite(body, &cx, &no_ends, gensym)?,
            })
        })
        .collect::<Result<Vec<_>, SaplingError>>()?;
    let main = match main {
        Some(MainExp { expr, ty }) => Some(MainExp {
            expr: rewrite(expr, &cx, &no_ends, gensym)?,
            ty,
        }),
        None => None,
    };

    Ok(Prog {
        ddefs,
        fundefs,
        main,
    })
}

/// One expression rewritten under an end-witness table: `ends[v]` names a
/// cursor variable already known to point one past the value bound to `v`.
fn rewrite(
    exp: Exp,
    cx: &Cx<'_>,
    ends: &FxHashMap<String, String>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    match exp {
        Exp::Var { .. }
        | Exp::LitInt { .. }
        | Exp::LitBool { .. }
        | Exp::LitSym { .. }
        | Exp::Sync
        | Exp::Error { .. }
        | Exp::EndOf { .. }
        | Exp::NewBuffer
        | Exp::ScopedBuffer => Ok(exp),
        Exp::PrimApp { prim, args } => Ok(Exp::PrimApp {
            prim,
            args: rewrite_all(args, cx, ends, gensym)?,
        }),
        Exp::App { func, args } => Ok(Exp::App {
            func,
            args: rewrite_all(args, cx, ends, gensym)?,
        }),
        Exp::Spawn { func, args } => Ok(Exp::Spawn {
            func,
            args: rewrite_all(args, cx, ends, gensym)?,
        }),
        Exp::Let { var, ty, rhs, body } => Ok(Exp::Let {
            var,
            ty,
            rhs: Box::new(rewrite(*rhs, cx, ends, gensym)?),
            body: Box::new(rewrite(*body, cx, ends, gensym)?),
        }),
        Exp::If {
            cond,
            then_branch,
            else_branch,
        } => Ok(Exp::If {
            cond: Box::new(rewrite(*cond, cx, ends, gensym)?),
            then_branch: Box::new(rewrite(*then_branch, cx, ends, gensym)?),
            else_branch: Box::new(rewrite(*else_branch, cx, ends, gensym)?),
        }),
        Exp::Case { scrut, arms } => rewrite_case(*scrut, arms, cx, ends, gensym),
        Exp::MkProd { items } => Ok(Exp::MkProd {
            items: rewrite_all(items, cx, ends, gensym)?,
        }),
        Exp::Proj { index, tuple } => Ok(Exp::Proj {
            index,
            tuple: Box::new(rewrite(*tuple, cx, ends, gensym)?),
        }),
        Exp::DataCon { con, loc, args } => rewrite_datacon(con, loc, args, cx, ends, gensym),
        Exp::TimeIt { inner, ty, iterate } => Ok(Exp::TimeIt {
            inner: Box::new(rewrite(*inner, cx, ends, gensym)?),
            ty,
            iterate,
        }),
        Exp::WithArena { var, body } => Ok(Exp::WithArena {
            var,
            body: Box::new(rewrite(*body, cx, ends, gensym)?),
        }),
        Exp::LetRegion {
            region,
            scoped,
            body,
        } => Ok(Exp::LetRegion {
            region,
            scoped,
            body: Box::new(rewrite(*body, cx, ends, gensym)?),
        }),
        Exp::LetLoc { loc, rhs, body } => Ok(Exp::LetLoc {
            loc,
            rhs,
            body: Box::new(rewrite(*body, cx, ends, gensym)?),
        }),
        Exp::AddCursor { base, offset } => Ok(Exp::AddCursor {
            base: Box::new(rewrite(*base, cx, ends, gensym)?),
            offset,
        }),
        Exp::WriteTag { tag, cursor } => Ok(Exp::WriteTag {
            tag,
            cursor: Box::new(rewrite(*cursor, cx, ends, gensym)?),
        }),
        Exp::WriteScalar { ty, value, cursor } => Ok(Exp::WriteScalar {
            ty,
            value: Box::new(rewrite(*value, cx, ends, gensym)?),
            cursor: Box::new(rewrite(*cursor, cx, ends, gensym)?),
        }),
        Exp::LetReadScalar {
            val,
            next,
            ty,
            cursor,
            body,
        } => Ok(Exp::LetReadScalar {
            val,
            next,
            ty,
            cursor,
            body: Box::new(rewrite(*body, cx, ends, gensym)?),
        }),
    }
}

fn rewrite_all(
    exps: Vec<Exp>,
    cx: &Cx<'_>,
    ends: &FxHashMap<String, String>,
    gensym: &mut Gensym,
) -> Result<Vec<Exp>, SaplingError> {
    exps.into_iter()
        .map(|e| rewrite(e, cx, ends, gensym))
        .collect()
}

/// A constructor application of a type that needs random access becomes the
/// shadow constructor, with one auxiliary cursor let-bound per field past the
/// first packed field. Each auxiliary cursor is the end of the field right
/// before it: a known end witness, an `EndOf` request the cursor pass will
/// resolve, or a constant bump past a fixed-width scalar.
fn rewrite_datacon(
    con: String,
    loc: String,
    args: Vec<Exp>,
    cx: &Cx<'_>,
    ends: &FxHashMap<String, String>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let mut args = rewrite_all(args, cx, ends, gensym)?;
    if is_ran_con(&con) {
        return Ok(Exp::DataCon { con, loc, args });
    }
    let ddef = cx
        .ddef_for_con(&con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
    if !cx.needed.contains(&ddef.name) {
        return Ok(Exp::DataCon { con, loc, args });
    }
    let variant = ddef
        .variant(&con)
        .ok_or_else(|| SaplingError::Unbound(format!("constructor {con}")))?;
    let n = variant.fields_after_first_packed();
    if n == 0 {
        return Ok(Exp::DataCon { con, loc, args });
    }
    if args.len() != variant.fields.len() {
        return Err(SaplingError::Internal(format!(
            "constructor {con} applied to {} arguments, declaration has {} fields",
            args.len(),
            variant.fields.len()
        )));
    }
    let first = variant
        .first_packed()
        .ok_or_else(|| SaplingError::Internal(format!("no packed field in {con}")))?;

    let mut lets: Vec<(String, Ty, Exp)> = Vec::new();
    let mut aux_names: Vec<String> = Vec::new();
    for j in 1..=n {
        let prev_idx = first + j - 1;
        let prev_field = variant.fields[prev_idx].clone();
        let rhs = if prev_field.packed {
            match &args[prev_idx] {
                Exp::Var { name } => match ends.get(name) {
                    Some(end) => Exp::var(end.clone()),
                    None => Exp::EndOf { var: name.clone() },
                },
                _ => {
                    // Name the sub-construction so its end can be asked for.
                    let tmp = gensym.fresh("fld");
                    let arg = std::mem::replace(&mut args[prev_idx], Exp::var(tmp.clone()));
                    lets.push((tmp.clone(), prev_field.ty.clone(), arg));
                    Exp::EndOf { var: tmp }
                }
            }
        } else {
            let width = prev_field.ty.scalar_width().ok_or_else(|| {
                SaplingError::Unsupported(format!(
                    "variable-width non-packed field in constructor {con}"
                ))
            })?;
            // prev_idx > first here, so the previous auxiliary cursor exists.
            let base = aux_names[j - 2].clone();
            Exp::AddCursor {
                base: Box::new(Exp::var(base)),
                offset: width,
            }
        };
        let aux = gensym.fresh("ran");
        lets.push((aux.clone(), Ty::Cursor, rhs));
        aux_names.push(aux);
    }

    let mut new_args: Vec<Exp> = aux_names.into_iter().map(Exp::var).collect();
    new_args.append(&mut args);
    Ok(mk_lets(
        lets,
        Exp::DataCon {
            con: ran_con_name(&con),
            loc,
            args: new_args,
        },
    ))
}

/// Every arm over a constructor that gained a shadow variant is duplicated:
/// the original arm stays, and a shadow arm binds the auxiliary cursors ahead
/// of the original binders. Inside the shadow arm each auxiliary cursor is
/// recorded as the end witness of the field right before it.
fn rewrite_case(
    scrut: Exp,
    arms: Vec<CaseArm>,
    cx: &Cx<'_>,
    ends: &FxHashMap<String, String>,
    gensym: &mut Gensym,
) -> Result<Exp, SaplingError> {
    let scrut = rewrite(scrut, cx, ends, gensym)?;
    let existing: BTreeSet<String> = arms
        .iter()
        .filter(|a| is_ran_con(&a.con))
        .map(|a| a.con.clone())
        .collect();
    let mut new_arms = Vec::with_capacity(arms.len());
    for arm in arms {
        if is_ran_con(&arm.con) {
            new_arms.push(CaseArm {
                con: arm.con,
                binds: arm.binds,
                body: rewrite(arm.body, cx, ends, gensym)?,
            });
            continue;
        }
        let ddef = cx
            .ddef_for_con(&arm.con)
            .ok_or_else(|| SaplingError::Unbound(format!("constructor {}", arm.con)))?;
        let shadowed = cx.needed.contains(&ddef.name);
        let variant = ddef
            .variant(&arm.con)
            .ok_or_else(|| SaplingError::Unbound(format!("constructor {}", arm.con)))?;
        let n = variant.fields_after_first_packed();
        let original = CaseArm {
            con: arm.con.clone(),
            binds: arm.binds.clone(),
            body: rewrite(arm.body.clone(), cx, ends, gensym)?,
        };
        if !shadowed || n == 0 || existing.contains(&ran_con_name(&arm.con)) {
            new_arms.push(original);
            continue;
        }
        let first = variant
            .first_packed()
            .ok_or_else(|| SaplingError::Internal(format!("no packed field in {}", arm.con)))?;
        let mut ends_shadow = ends.clone();
        let mut binds: Vec<(String, String)> = Vec::with_capacity(n + arm.binds.len());
        for j in 1..=n {
            let aux = gensym.fresh("ran");
            let aux_loc = gensym.fresh("ran_loc");
            let (prev_var, _) = &arm.binds[first + j - 1];
            ends_shadow.insert(prev_var.clone(), aux.clone());
            binds.push((aux, aux_loc));
        }
        binds.extend(arm.binds.iter().cloned());
        let shadow = CaseArm {
            con: ran_con_name(&arm.con),
            binds,
            body: rewrite(arm.body, cx, &ends_shadow, gensym)?,
        };
        new_arms.push(original);
        new_arms.push(shadow);
    }
    Ok(Exp::Case {
        scrut: Box::new(scrut),
        arms: new_arms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::occurs_free;

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
        }
    }

    fn needed_tree() -> BTreeSet<String> {
        let mut s = BTreeSet::new();
        s.insert("Tree".to_string());
        s
    }

    fn leaf(value: i64, loc: &str) -> Exp {
        Exp::DataCon {
            con: "Leaf".to_string(),
            loc: loc.to_string(),
            args: vec![Exp::LitInt { value }],
        }
    }

    #[test]
    fn shadow_variants_append_after_originals() {
        let prog = Prog {
            ddefs: vec![tree_ddef()],
            fundefs: vec![],
            main: None,
        };
        let mut gensym = Gensym::default();
        let out = add_ran(prog, &needed_tree(), &mut gensym).unwrap();
        let ddef = out.ddef("Tree").unwrap();
        // Original tags must not move.
        assert_eq!(ddef.tag_of("Leaf"), Some(0));
        assert_eq!(ddef.tag_of("Node"), Some(1));
        assert_eq!(ddef.tag_of("Node^"), Some(2));
        let shadow = ddef.variant("Node^").unwrap();
        assert_eq!(shadow.fields.len(), 3);
        assert_eq!(shadow.fields[0].ty, Ty::Cursor);
        assert!(!shadow.fields[0].packed);
    }

    #[test]
    fn constructor_sites_switch_to_shadow_with_aux_lets() {
        let node = Exp::DataCon {
            con: "Node".to_string(),
            loc: "l0".to_string(),
            args: vec![leaf(1, "l1"), leaf(2, "l2")],
        };
        let prog = Prog {
            ddefs: vec![tree_ddef()],
            fundefs: vec![FunDef {
                name: "two".to_string(),
                params: vec![],
                ret_ty: Ty::Packed {
                    tycon: "Tree".to_string(),
                    loc: "l0".to_string(),
                },
                body: node,
            }],
            main: None,
        };
        let mut gensym = Gensym::default();
        let out = add_ran(prog, &needed_tree(), &mut gensym).unwrap();
        // Expect: let fld = Leaf 1 in let ran = end-of fld in Node^ ran fld (Leaf 2)
        let mut body = &out.fundefs[0].body;
        let mut saw_end_of = false;
        loop {
            match body {
                Exp::Let { rhs, body: b, .. } => {
                    if matches!(rhs.as_ref(), Exp::EndOf { .. }) {
                        saw_end_of = true;
                    }
                    body = b;
                }
                Exp::DataCon { con, args, .. } => {
                    assert_eq!(con, "Node^");
                    assert_eq!(args.len(), 3);
                    assert!(matches!(args[0], Exp::Var { .. }));
                    break;
                }
                other => panic!("unexpected shape: {other:?}"),
            }
        }
        assert!(saw_end_of);
    }

    #[test]
    fn case_arms_are_duplicated_and_shadow_arm_uses_end_witness() {
        // case t { Leaf n -> Leaf n; Node a b -> Node a b }
        let body = Exp::Case {
            scrut: Box::new(Exp::var("t")),
            arms: vec![
                CaseArm {
                    con: "Leaf".to_string(),
                    binds: vec![("n".to_string(), "ln".to_string())],
                    body: Exp::DataCon {
                        con: "Leaf".to_string(),
                        loc: "o0".to_string(),
                        args: vec![Exp::var("n")],
                    },
                },
                CaseArm {
                    con: "Node".to_string(),
                    binds: vec![
                        ("a".to_string(), "la".to_string()),
                        ("b".to_string(), "lb".to_string()),
                    ],
                    body: Exp::DataCon {
                        con: "Node".to_string(),
                        loc: "o0".to_string(),
                        args: vec![Exp::var("a"), Exp::var("b")],
                    },
                },
            ],
        };
        let prog = Prog {
            ddefs: vec![tree_ddef()],
            fundefs: vec![FunDef {
                name: "copy".to_string(),
                params: vec![(
                    "t".to_string(),
                    Ty::Packed {
                        tycon: "Tree".to_string(),
                        loc: "lt".to_string(),
                    },
                )],
                ret_ty: Ty::Packed {
                    tycon: "Tree".to_string(),
                    loc: "o0".to_string(),
                },
                body,
            }],
            main: None,
        };
        let mut gensym = Gensym::default();
        let out = add_ran(prog, &needed_tree(), &mut gensym).unwrap();
        let Exp::Case { arms, .. } = &out.fundefs[0].body else {
            panic!("expected a case");
        };
        assert_eq!(arms.len(), 3);
        assert_eq!(arms[1].con, "Node");
        assert_eq!(arms[2].con, "Node^");
        assert_eq!(arms[2].binds.len(), 3);
        // The original arm must fall back to an end-of request; the shadow arm
        // has the witness in scope and must not ask.
        let aux = &arms[2].binds[0].0;
        assert!(occurs_free(aux, &arms[2].body));
        fn has_end_of(exp: &Exp) -> bool {
            match exp {
                Exp::EndOf { .. } => true,
                Exp::Let { rhs, body, .. } => has_end_of(rhs) || has_end_of(body),
                Exp::DataCon { args, .. } => args.iter().any(has_end_of),
                _ => false,
            }
        }
        assert!(has_end_of(&arms[1].body));
        assert!(!has_end_of(&arms[2].body));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let node = Exp::DataCon {
            con: "Node".to_string(),
            loc: "l0".to_string(),
            args: vec![leaf(1, "l1"), leaf(2, "l2")],
        };
        let prog = Prog {
            ddefs: vec![tree_ddef()],
            fundefs: vec![FunDef {
                name: "two".to_string(),
                params: vec![],
                ret_ty: Ty::Packed {
                    tycon: "Tree".to_string(),
                    loc: "l0".to_string(),
                },
                body: node,
            }],
            main: None,
        };
        let mut gensym = Gensym::default();
        let once = add_ran(prog, &needed_tree(), &mut gensym).unwrap();
        let twice = add_ran(once.clone(), &needed_tree(), &mut gensym).unwrap();
        assert_eq!(once, twice);
    }
}

#![cfg(feature = "insta")]

use sapling::{
    compile, dump_json, CaseArm, DDef, Exp, Field, FunDef, LocExp, MainExp, Prim, Prog, Ty,
    Variant,
};

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

fn packed_tree(loc: &str) -> Ty {
    Ty::Packed {
        tycon: "Tree".to_string(),
        loc: loc.to_string(),
    }
}

/// A left-spine fold plus a two-leaf entry expression: small enough that the
/// snapshot stays reviewable, rich enough to exercise constructor writes,
/// tag dispatch, and the call convention.
fn leftmost_prog() -> Prog {
    let leftmost = FunDef {
        name: "leftmost".to_string(),
        params: vec![("t".to_string(), packed_tree("lt"))],
        ret_ty: Ty::Int,
        body: Exp::Case {
            scrut: Box::new(Exp::var("t")),
            arms: vec![
                CaseArm {
                    con: "Leaf".to_string(),
                    binds: vec![("n".to_string(), "ln".to_string())],
                    body: Exp::var("n"),
                },
                CaseArm {
                    con: "Node".to_string(),
                    binds: vec![
                        ("a".to_string(), "la".to_string()),
                        ("b".to_string(), "lb".to_string()),
                    ],
                    body: Exp::App {
                        func: "leftmost".to_string(),
                        args: vec![Exp::var("a")],
                    },
                },
            ],
        },
    };
    let main = Exp::LetRegion {
        region: "r".to_string(),
        scoped: false,
        body: Box::new(Exp::LetLoc {
            loc: "l0".to_string(),
            rhs: LocExp::StartOf {
                region: "r".to_string(),
            },
            body: Box::new(Exp::Let {
                var: "t".to_string(),
                ty: packed_tree("l0"),
                rhs: Box::new(Exp::LetLoc {
                    loc: "la".to_string(),
                    rhs: LocExp::AfterConst {
                        offset: 1,
                        loc: "l0".to_string(),
                    },
                    body: Box::new(Exp::Let {
                        var: "lf".to_string(),
                        ty: packed_tree("la"),
                        rhs: Box::new(Exp::DataCon {
                            con: "Leaf".to_string(),
                            loc: "la".to_string(),
                            args: vec![Exp::LitInt { value: 3 }],
                        }),
                        body: Box::new(Exp::LetLoc {
                            loc: "lb".to_string(),
                            rhs: LocExp::AfterVar {
                                var: "lf".to_string(),
                                loc: "la".to_string(),
                            },
                            body: Box::new(Exp::Let {
                                var: "rt".to_string(),
                                ty: packed_tree("lb"),
                                rhs: Box::new(Exp::DataCon {
                                    con: "Leaf".to_string(),
                                    loc: "lb".to_string(),
                                    args: vec![Exp::LitInt { value: 4 }],
                                }),
                                body: Box::new(Exp::DataCon {
                                    con: "Node".to_string(),
                                    loc: "l0".to_string(),
                                    args: vec![Exp::var("lf"), Exp::var("rt")],
                                }),
                            }),
                        }),
                    }),
                }),
                body: Box::new(Exp::Let {
                    var: "out".to_string(),
                    ty: Ty::Int,
                    rhs: Box::new(Exp::App {
                        func: "leftmost".to_string(),
                        args: vec![Exp::var("t")],
                    }),
                    body: Box::new(Exp::PrimApp {
                        prim: Prim::AddI,
                        args: vec![Exp::var("out"), Exp::LitInt { value: 0 }],
                    }),
                }),
            }),
        }),
    };
    Prog {
        ddefs: vec![tree_ddef()],
        fundefs: vec![leftmost],
        main: Some(MainExp {
            expr: main,
            ty: Ty::Int,
        }),
    }
}

#[test]
fn tail_form_of_leftmost_program() {
    let tail_prog = compile(leftmost_prog()).unwrap();
    insta::assert_snapshot!(dump_json(&tail_prog));
}

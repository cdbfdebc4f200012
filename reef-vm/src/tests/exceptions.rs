//! Exception handling: throw, try_table dispatch, uncaught propagation.

use crate::error::VmError;
use crate::util::{ty, Expr, ModuleBuilder};

use super::test_helpers::invoke1;

const CATCH: u8 = 0x00;
const CATCH_ALL: u8 = 0x02;

/// Throw a one-i32 payload and catch it in the same function.
#[test]
fn local_catch_receives_the_payload() {
    let mut b = ModuleBuilder::new();
    let tag_sig = b.ty(&[ty::I32], &[]);
    let main_sig = b.ty(&[], &[ty::I32]);
    b.tag(tag_sig);
    let body = Expr::new()
        .block(Some(ty::I32))
        .try_table(None, &[(CATCH, 0, 0)])
        .i32_const(42)
        .throw(0)
        .end()
        .i32_const(7) // only reached when nothing threw
        .end()
        .finish();
    let f = b.func(main_sig, &[], body);
    b.export_func("go", f);
    assert_eq!(invoke1(&b.build(), "go", &[]).unwrap(), vec![42]);
}

/// The exception unwinds through a callee into the caller's handler.
#[test]
fn unwind_through_a_frame() {
    let mut b = ModuleBuilder::new();
    let tag_sig = b.ty(&[ty::I32], &[]);
    let thrower_sig = b.ty(&[], &[]);
    let main_sig = b.ty(&[], &[ty::I32]);
    b.tag(tag_sig);
    let thrower = b.func(
        thrower_sig,
        &[],
        Expr::new().i32_const(13).throw(0).finish(),
    );
    let body = Expr::new()
        .block(Some(ty::I32))
        .try_table(None, &[(CATCH, 0, 0)])
        .call(thrower)
        .end()
        .i32_const(0)
        .end()
        .finish();
    let f = b.func(main_sig, &[], body);
    b.export_func("go", f);
    assert_eq!(invoke1(&b.build(), "go", &[]).unwrap(), vec![13]);
}

#[test]
fn catch_all_matches_any_tag() {
    let mut b = ModuleBuilder::new();
    let tag_sig = b.ty(&[ty::I32], &[]);
    let main_sig = b.ty(&[], &[ty::I32]);
    b.tag(tag_sig);
    let body = Expr::new()
        .block(None)
        .try_table(None, &[(CATCH_ALL, 0, 0)])
        .i32_const(5)
        .throw(0)
        .end()
        .end()
        .i32_const(99)
        .finish();
    let f = b.func(main_sig, &[], body);
    b.export_func("go", f);
    assert_eq!(invoke1(&b.build(), "go", &[]).unwrap(), vec![99]);
}

#[test]
fn uncaught_exception_reaches_the_embedder() {
    let mut b = ModuleBuilder::new();
    let tag_sig = b.ty(&[ty::I32], &[]);
    let main_sig = b.ty(&[], &[]);
    b.tag(tag_sig);
    let f = b.func(main_sig, &[], Expr::new().i32_const(1).throw(0).finish());
    b.export_func("go", f);
    assert_eq!(invoke1(&b.build(), "go", &[]), Err(VmError::Uncaught));
}

#[test]
fn no_throw_takes_the_fallthrough() {
    let mut b = ModuleBuilder::new();
    let tag_sig = b.ty(&[ty::I32], &[]);
    let main_sig = b.ty(&[ty::I32], &[ty::I32]);
    b.tag(tag_sig);
    // Throws only when the argument is nonzero.
    let body = Expr::new()
        .block(Some(ty::I32))
        .try_table(None, &[(CATCH, 0, 0)])
        .local_get(0)
        .if_(None)
        .i32_const(-1)
        .throw(0)
        .end()
        .end()
        .i32_const(7)
        .end()
        .finish();
    let f = b.func(main_sig, &[], body);
    b.export_func("go", f);
    let image = b.build();
    assert_eq!(invoke1(&image, "go", &[0]).unwrap(), vec![7]);
    assert_eq!(
        invoke1(&image, "go", &[1]).unwrap(),
        vec![(-1i32) as u32 as u64]
    );
}

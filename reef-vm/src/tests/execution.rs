//! End-to-end execution across the tier pipeline.

use reef_asm::TrapReason;

use crate::error::VmError;
use crate::util::{ty, Expr, ModuleBuilder};

use super::test_helpers::*;

#[test]
fn fib_35() {
    let image = fib_module();
    assert_eq!(invoke1(&image, "fib", &[35]).unwrap(), vec![9_227_465]);
}

#[test_case::test_case(0, 0)]
#[test_case::test_case(1, 1)]
#[test_case::test_case(10, 55)]
#[test_case::test_case(20, 6_765)]
fn fib_small(n: u64, expected: u64) {
    let image = fib_module();
    assert_eq!(invoke1(&image, "fib", &[n]).unwrap(), vec![expected]);
}

#[test]
fn sieve_counts_primes_below_a_million() {
    let image = sieve_module();
    assert_eq!(invoke1(&image, "sieve", &[1_000_000]).unwrap(), vec![78_498]);
}

#[test]
fn nqueens_8() {
    let image = nqueens_module();
    assert_eq!(invoke1(&image, "nqueens", &[8]).unwrap(), vec![92]);
}

#[test]
fn tak_24_16_8() {
    let image = tak_module();
    assert_eq!(invoke1(&image, "tak", &[24, 16, 8]).unwrap(), vec![9]);
}

#[test]
fn division_traps() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let body = Expr::new()
        .local_get(0)
        .local_get(1)
        .op(0x6D) // i32.div_s
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("div", f);
    let image = b.build();

    assert_eq!(invoke1(&image, "div", &[7, 2]).unwrap(), vec![3]);
    assert_eq!(
        invoke1(&image, "div", &[7, 0]),
        Err(VmError::Trap(TrapReason::IntegerDivideByZero))
    );
    assert_eq!(
        invoke1(&image, "div", &[i32::MIN as u32 as u64, (-1i32) as u32 as u64]),
        Err(VmError::Trap(TrapReason::IntegerOverflow))
    );
}

#[test]
fn unreachable_traps() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[], &[]);
    let f = b.func(sig, &[], Expr::new().op(0x00).finish());
    b.export_func("boom", f);
    assert_eq!(
        invoke1(&b.build(), "boom", &[]),
        Err(VmError::Trap(TrapReason::Unreachable))
    );
}

#[test]
fn globals_persist_across_invocations() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[], &[ty::I32]);
    b.global_i32(10);
    let body = Expr::new()
        .global_get(0)
        .i32_const(1)
        .op(0x6A)
        .global_set(0)
        .global_get(0)
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("bump", f);
    let image = b.build();

    let mut module = crate::runtime::WasmModule::load(&image).unwrap();
    assert_eq!(module.invoke("bump", &[]).unwrap(), vec![11]);
    assert_eq!(module.invoke("bump", &[]).unwrap(), vec![12]);
    assert_eq!(module.invoke("bump", &[]).unwrap(), vec![13]);
}

#[test]
fn tail_call_does_not_grow_the_stack() {
    // count(n): n == 0 ? 0 : return_call count(n - 1), far past the call
    // depth ceiling.
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    let body = Expr::new()
        .local_get(0)
        .op(0x45) // i32.eqz
        .if_(None)
        .i32_const(0)
        .ret()
        .end()
        .local_get(0)
        .i32_const(1)
        .op(0x6B)
        .return_call(0)
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("count", f);
    assert_eq!(invoke1(&b.build(), "count", &[1_000_000]).unwrap(), vec![0]);
}

#[test]
fn deep_recursion_exhausts_the_call_stack() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    let body = Expr::new()
        .local_get(0)
        .op(0x45)
        .if_(Some(ty::I32))
        .i32_const(0)
        .else_()
        .local_get(0)
        .i32_const(1)
        .op(0x6B)
        .call(0)
        .end()
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("down", f);
    assert_eq!(
        invoke1(&b.build(), "down", &[1_000_000]),
        Err(VmError::Trap(TrapReason::CallStackExhausted))
    );
}

#[test]
fn unknown_export_is_reported() {
    let image = fib_module();
    assert!(matches!(
        invoke1(&image, "nope", &[]),
        Err(VmError::ExportNotFound(_))
    ));
}

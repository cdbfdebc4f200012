//! Differential checks between the execution tiers.
//!
//! The observable result of an invocation must not depend on which tier
//! executed it. Forcing promotion thresholds to zero makes the JIT kick in
//! on the first call; disabling the JIT pins everything to the
//! interpreters.

use crate::params::VmParams;

use super::test_helpers::*;

fn interpreter_params() -> VmParams {
    VmParams { jit: false, ..VmParams::default() }
}

fn eager_jit_params() -> VmParams {
    VmParams {
        jit_call_threshold: 0,
        jit_backedge_threshold: 0,
        ..VmParams::default()
    }
}

#[test]
fn fib_matches_across_tiers() {
    let image = fib_module();
    let expected = vec![832_040u64]; // fib(30)
    assert_eq!(
        invoke_with(&image, interpreter_params(), "fib", &[30]).unwrap(),
        expected
    );
    assert_eq!(
        invoke_with(&image, eager_jit_params(), "fib", &[30]).unwrap(),
        expected
    );
    assert_eq!(invoke1(&image, "fib", &[30]).unwrap(), expected);
}

#[test]
fn sieve_matches_across_tiers() {
    let image = sieve_module();
    let expected = vec![9_592u64]; // primes below 100_000
    assert_eq!(
        invoke_with(&image, interpreter_params(), "sieve", &[100_000]).unwrap(),
        expected
    );
    assert_eq!(
        invoke_with(&image, eager_jit_params(), "sieve", &[100_000]).unwrap(),
        expected
    );
}

#[test]
fn nqueens_matches_across_tiers() {
    let image = nqueens_module();
    for n in [4u64, 5, 6, 7] {
        let interpreted =
            invoke_with(&image, interpreter_params(), "nqueens", &[n]).unwrap();
        let jitted = invoke_with(&image, eager_jit_params(), "nqueens", &[n]).unwrap();
        assert_eq!(interpreted, jitted, "n = {n}");
    }
}

#[test]
fn promotion_happens_within_the_call_threshold() {
    // Repeated invocations cross the default call threshold; the run must
    // stay correct through the restart.
    let image = fib_module();
    let mut module = crate::runtime::WasmModule::load(&image).unwrap();
    for _ in 0..crate::consts::JIT_CALL_THRESHOLD + 5 {
        assert_eq!(module.invoke("fib", &[12]).unwrap(), vec![144]);
    }
}

#[test]
fn traps_match_across_tiers() {
    use crate::error::VmError;
    use reef_asm::TrapReason;
    use crate::util::{ty, Expr, ModuleBuilder};

    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    let body = Expr::new()
        .i32_const(1)
        .local_get(0)
        .op(0x6D) // i32.div_s
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("inv", f);
    let image = b.build();

    for params in [interpreter_params(), eager_jit_params()] {
        assert_eq!(
            invoke_with(&image, params.clone(), "inv", &[0]),
            Err(VmError::Trap(TrapReason::IntegerDivideByZero))
        );
        assert_eq!(invoke_with(&image, params, "inv", &[1]).unwrap(), vec![1]);
    }
}

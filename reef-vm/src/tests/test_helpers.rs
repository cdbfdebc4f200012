//! Shared module images and invocation shorthand for the suite.

use reef_types::Word;

use crate::error::VmError;
use crate::params::VmParams;
use crate::runtime::WasmModule;
use crate::util::{ty, Expr, ModuleBuilder};

/// Load with default parameters and invoke one export.
pub(crate) fn invoke1(
    image: &[u8],
    export: &str,
    args: &[Word],
) -> Result<Vec<Word>, VmError> {
    let mut module = WasmModule::load(image)?;
    module.invoke(export, args)
}

/// Load with explicit parameters and invoke one export.
pub(crate) fn invoke_with(
    image: &[u8],
    params: VmParams,
    export: &str,
    args: &[Word],
) -> Result<Vec<Word>, VmError> {
    let mut module = WasmModule::load_with_params(image, params)?;
    module.invoke(export, args)
}

/// `fib: (i32) -> i32`, the classic doubly recursive form.
pub(crate) fn fib_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    let body = Expr::new()
        .local_get(0)
        .i32_const(2)
        .op(0x48) // i32.lt_s
        .if_(Some(ty::I32))
        .local_get(0)
        .else_()
        .local_get(0)
        .i32_const(1)
        .op(0x6B) // i32.sub
        .call(0)
        .local_get(0)
        .i32_const(2)
        .op(0x6B)
        .call(0)
        .op(0x6A) // i32.add
        .end()
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("fib", f);
    b.build()
}

/// `sieve: (i32) -> i32`, prime counting over byte flags in memory 0.
pub(crate) fn sieve_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    b.memory(16, Some(16));
    // locals: 1 = candidate, 2 = multiple, 3 = count
    let body = Expr::new()
        .i32_const(0)
        .i32_const(0)
        .local_get(0)
        .memory_fill()
        .i32_const(2)
        .local_set(1)
        .block(None)
        .loop_(None)
        .local_get(1)
        .local_get(0)
        .op(0x4E) // i32.ge_s
        .br_if(1)
        .local_get(1)
        .i32_load8_u(0)
        .op(0x45) // i32.eqz
        .if_(None)
        .local_get(3)
        .i32_const(1)
        .op(0x6A)
        .local_set(3)
        .local_get(1)
        .local_get(1)
        .op(0x6A)
        .local_set(2)
        .block(None)
        .loop_(None)
        .local_get(2)
        .local_get(0)
        .op(0x4E)
        .br_if(1)
        .local_get(2)
        .i32_const(1)
        .i32_store8(0)
        .local_get(2)
        .local_get(1)
        .op(0x6A)
        .local_set(2)
        .br(0)
        .end()
        .end()
        .end()
        .local_get(1)
        .i32_const(1)
        .op(0x6A)
        .local_set(1)
        .br(0)
        .end()
        .end()
        .local_get(3)
        .finish();
    let f = b.func(sig, &[(3, ty::I32)], body);
    b.export_func("sieve", f);
    b.build()
}

/// `nqueens: (i32) -> i32`, bitmask backtracking.
pub(crate) fn nqueens_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let solve_sig = b.ty(&[ty::I32, ty::I32, ty::I32, ty::I32], &[ty::I32]);
    let entry_sig = b.ty(&[ty::I32], &[ty::I32]);

    // params: 0 = left diagonals, 1 = columns, 2 = right diagonals, 3 = all
    // locals: 4 = possible, 5 = bit, 6 = count
    let solve = Expr::new()
        .local_get(1)
        .local_get(3)
        .op(0x46) // i32.eq
        .if_(None)
        .i32_const(1)
        .ret()
        .end()
        .local_get(0)
        .local_get(1)
        .op(0x72) // i32.or
        .local_get(2)
        .op(0x72)
        .i32_const(-1)
        .op(0x73) // i32.xor
        .local_get(3)
        .op(0x71) // i32.and
        .local_set(4)
        .block(None)
        .loop_(None)
        .local_get(4)
        .op(0x45)
        .br_if(1)
        .local_get(4)
        .i32_const(0)
        .local_get(4)
        .op(0x6B)
        .op(0x71)
        .local_set(5)
        .local_get(4)
        .local_get(5)
        .op(0x73)
        .local_set(4)
        .local_get(6)
        .local_get(0)
        .local_get(5)
        .op(0x72)
        .i32_const(1)
        .op(0x74) // i32.shl
        .local_get(3)
        .op(0x71)
        .local_get(1)
        .local_get(5)
        .op(0x72)
        .local_get(2)
        .local_get(5)
        .op(0x72)
        .i32_const(1)
        .op(0x76) // i32.shr_u
        .local_get(3)
        .call(0)
        .op(0x6A)
        .local_set(6)
        .br(0)
        .end()
        .end()
        .local_get(6)
        .finish();
    b.func(solve_sig, &[(3, ty::I32)], solve);

    let entry = Expr::new()
        .i32_const(0)
        .i32_const(0)
        .i32_const(0)
        .i32_const(1)
        .local_get(0)
        .op(0x74)
        .i32_const(1)
        .op(0x6B)
        .call(0)
        .finish();
    let f = b.func(entry_sig, &[], entry);
    b.export_func("nqueens", f);
    b.build()
}

/// `tak: (i32, i32, i32) -> i32`, the Takeuchi function.
pub(crate) fn tak_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32, ty::I32, ty::I32], &[ty::I32]);
    let body = Expr::new()
        .local_get(1)
        .local_get(0)
        .op(0x48) // i32.lt_s
        .if_(Some(ty::I32))
        .local_get(0)
        .i32_const(1)
        .op(0x6B)
        .local_get(1)
        .local_get(2)
        .call(0)
        .local_get(1)
        .i32_const(1)
        .op(0x6B)
        .local_get(2)
        .local_get(0)
        .call(0)
        .local_get(2)
        .i32_const(1)
        .op(0x6B)
        .local_get(0)
        .local_get(1)
        .call(0)
        .call(0)
        .else_()
        .local_get(2)
        .end()
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("tak", f);
    b.build()
}

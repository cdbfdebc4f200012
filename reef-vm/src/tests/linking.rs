//! Cross-module linking and the type-registry invariants.

use reef_asm::TrapReason;

use crate::error::VmError;
use crate::params::VmParams;
use crate::runtime::WasmModule;
use crate::util::{ty, Expr, ModuleBuilder};

/// Side module exporting `add: (i32, i32) -> i32`.
fn side_add() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let f = b.func(
        sig,
        &[],
        Expr::new().local_get(0).local_get(1).op(0x6A).finish(),
    );
    b.export_func("add", f);
    b.build()
}

/// Side module exporting `add: (i64) -> i64` under the same name.
fn side_wrong_type() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I64], &[ty::I64]);
    let f = b.func(sig, &[], Expr::new().local_get(0).finish());
    b.export_func("add", f);
    b.build()
}

/// Main module: imports `side.add`, seeds it into a table, and calls it
/// through `call_indirect` with a `(i32, i32) -> i32` annotation.
fn table_caller() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let bin = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let use_sig = b.ty(&[ty::I32, ty::I32, ty::I32], &[ty::I32]);
    let imported = b.import_func("side", "add", bin);
    b.table(4, Some(4));
    b.elem_active(0, &[imported]);
    let body = Expr::new()
        .local_get(1)
        .local_get(2)
        .local_get(0)
        .call_indirect(bin)
        .finish();
    let f = b.func(use_sig, &[], body);
    b.export_func("use_table", f);
    b.export_table("table", 0);
    b.build()
}

fn load_linked(main: &[u8], side: &[u8]) -> Result<WasmModule, VmError> {
    WasmModule::load_with(
        main,
        VmParams::default(),
        Default::default(),
        None,
        &[("side".to_string(), side.to_vec())],
    )
}

#[test]
fn cross_module_indirect_call() {
    let mut module = load_linked(&table_caller(), &side_add()).unwrap();
    assert_eq!(module.invoke("use_table", &[0, 3, 4]).unwrap(), vec![7]);
}

#[test]
fn declared_import_type_mismatch_fails_the_link() {
    let module = load_linked(&table_caller(), &side_wrong_type());
    match module {
        Err(VmError::LinkError(_)) => {}
        other => panic!("expected a link error, got {:?}", other.err()),
    }
}

#[test]
fn wrong_typed_table_entry_traps_as_indirect_call_type_mismatch() {
    // The table holds a `(i64) -> i64` funcref while the call site expects
    // `(i32, i32) -> i32`; resolution succeeds, the type id check fails.
    let mut b = ModuleBuilder::new();
    let bin = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let unary = b.ty(&[ty::I64], &[ty::I64]);
    let use_sig = b.ty(&[ty::I32, ty::I32, ty::I32], &[ty::I32]);
    let wrong = b.func(unary, &[], Expr::new().local_get(0).finish());
    b.table(4, Some(4));
    b.elem_active(0, &[wrong]);
    let body = Expr::new()
        .local_get(1)
        .local_get(2)
        .local_get(0)
        .call_indirect(bin)
        .finish();
    let f = b.func(use_sig, &[], body);
    b.export_func("use_table", f);
    let mut module = WasmModule::load(&b.build()).unwrap();
    assert_eq!(
        module.invoke("use_table", &[0, 3, 4]),
        Err(VmError::Trap(TrapReason::IndirectCallTypeMismatch))
    );
}

#[test]
fn null_table_entry_is_uninitialized() {
    let mut module = load_linked(&table_caller(), &side_add()).unwrap();
    assert_eq!(
        module.invoke("use_table", &[1, 3, 4]),
        Err(VmError::Trap(TrapReason::UninitializedElement))
    );
}

#[test]
fn out_of_range_table_index_is_undefined() {
    let mut module = load_linked(&table_caller(), &side_add()).unwrap();
    assert_eq!(
        module.invoke("use_table", &[99, 3, 4]),
        Err(VmError::Trap(TrapReason::UndefinedElement))
    );
}

#[test]
fn missing_import_is_reported_by_name() {
    let module = WasmModule::load(&table_caller());
    match module {
        Err(VmError::ImportNotFound(name)) => assert_eq!(name, "side.add"),
        other => panic!("expected ImportNotFound, got {other:?}"),
    }
}

#[test]
fn structurally_equal_types_share_call_indirect_identity() {
    // The same `(i32, i32) -> i32` declared independently in two modules
    // must canonicalize to one id, or the cross-module call above could
    // never pass the type check. Exercised end to end here: the callee's
    // type comes from the side module, the annotation from the main one.
    let mut module = load_linked(&table_caller(), &side_add()).unwrap();
    for (a, b, sum) in [(1u64, 2u64, 3u64), (40, 2, 42), (7, -3i32 as u32 as u64, 4)] {
        assert_eq!(module.invoke("use_table", &[0, a, b]).unwrap(), vec![sum]);
    }
}

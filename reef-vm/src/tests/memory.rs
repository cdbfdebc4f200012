//! Linear-memory behavior: bounds, growth, the guard-page trap path.

use reef_asm::TrapReason;

use crate::error::VmError;
use crate::params::VmParams;
use crate::runtime::WasmModule;
use crate::util::{ty, Expr, ModuleBuilder};

use super::test_helpers::*;

/// A 1-page memory and a load at the far end of the 32-bit index space.
fn oob_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[], &[ty::I32]);
    b.memory(1, Some(1));
    let body = Expr::new()
        .i32_const(-16) // 0xFFFF_FFF0
        .i32_load(2, 0)
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("peek", f);
    b.build()
}

#[test]
fn oob_load_traps_without_crashing() {
    let image = oob_module();
    assert_eq!(
        invoke1(&image, "peek", &[]),
        Err(VmError::Trap(TrapReason::OutOfBoundsMemoryAccess))
    );
}

#[test]
fn oob_trap_recovers_through_the_jit_signal_path() {
    // Force promotion so the access runs as native code against the guard
    // pages; every invocation must report the same trap with no crash and
    // no state corruption across repeats.
    let image = oob_module();
    let params = VmParams {
        jit_call_threshold: 0,
        jit_backedge_threshold: 0,
        ..VmParams::default()
    };
    let mut module = WasmModule::load_with_params(&image, params).unwrap();
    for _ in 0..32 {
        assert_eq!(
            module.invoke("peek", &[]),
            Err(VmError::Trap(TrapReason::OutOfBoundsMemoryAccess))
        );
    }
}

#[test]
fn loads_and_stores_round_trip() {
    let mut b = ModuleBuilder::new();
    let store_sig = b.ty(&[ty::I32, ty::I32], &[]);
    let load_sig = b.ty(&[ty::I32], &[ty::I32]);
    b.memory(1, None);
    let store = b.func(
        store_sig,
        &[],
        Expr::new().local_get(0).local_get(1).i32_store(2, 0).finish(),
    );
    let load = b.func(
        load_sig,
        &[],
        Expr::new().local_get(0).i32_load(2, 0).finish(),
    );
    b.export_func("poke", store);
    b.export_func("peek", load);
    let image = b.build();

    let mut module = WasmModule::load(&image).unwrap();
    module.invoke("poke", &[64, 0xDEAD]).unwrap();
    assert_eq!(module.invoke("peek", &[64]).unwrap(), vec![0xDEAD]);
    // Straddling the end of the page is out of bounds.
    assert_eq!(
        module.invoke("peek", &[65_533]),
        Err(VmError::Trap(TrapReason::OutOfBoundsMemoryAccess))
    );
}

#[test]
fn memory_grow_respects_declared_maximum() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    b.memory(1, Some(3));
    let body = Expr::new()
        .local_get(0)
        .raw(&[0x40, 0x00]) // memory.grow
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("grow", f);
    let image = b.build();

    let mut module = WasmModule::load(&image).unwrap();
    assert_eq!(module.invoke("grow", &[1]).unwrap(), vec![1]);
    assert_eq!(module.invoke("grow", &[1]).unwrap(), vec![2]);
    assert_eq!(
        module.invoke("grow", &[1]).unwrap(),
        vec![(-1i32) as u32 as u64]
    );
}

#[test]
fn memory_ceiling_blocks_growth_before_the_declared_maximum() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[ty::I32], &[ty::I32]);
    b.memory(1, Some(64));
    let body = Expr::new()
        .local_get(0)
        .raw(&[0x40, 0x00])
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("grow", f);
    let image = b.build();

    let params = VmParams {
        max_memory_bytes: Some(2 * 65_536),
        ..VmParams::default()
    };
    let mut module = WasmModule::load_with_params(&image, params).unwrap();
    assert_eq!(module.invoke("grow", &[1]).unwrap(), vec![1]);
    assert_eq!(
        module.invoke("grow", &[1]).unwrap(),
        vec![(-1i32) as u32 as u64]
    );
}

#[test]
fn embedder_memory_access_is_bounds_checked() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    b.export_memory("memory", 0);
    let image = b.build();
    let mut module = WasmModule::load(&image).unwrap();

    module.memory_write(100, b"reef").unwrap();
    assert_eq!(module.memory_read(100, 4).unwrap(), b"reef");
    assert!(module.memory_read(65_534, 4).is_err());
    assert!(module.memory_write(65_534, &[0; 4]).is_err());
}

#[test]
fn active_data_segments_initialize_memory() {
    let mut b = ModuleBuilder::new();
    let sig = b.ty(&[], &[ty::I32]);
    b.memory(1, None);
    b.data_active(32, b"\x2A\x00\x00\x00");
    let f = b.func(sig, &[], Expr::new().i32_const(32).i32_load(2, 0).finish());
    b.export_func("read", f);
    assert_eq!(invoke1(&b.build(), "read", &[]).unwrap(), vec![42]);
}

#[test]
fn oversized_active_segment_fails_instantiation() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None);
    b.data_active(65_534, b"overflow");
    assert!(matches!(
        WasmModule::load(&b.build()),
        Err(VmError::Trap(TrapReason::OutOfBoundsMemoryAccess))
    ));
}

//! WASI surface: capability gating and the syscall plumbing.

use reef_asm::TrapReason;

use crate::error::VmError;
use crate::params::VmParams;
use crate::runtime::{WasiOptions, WasmModule};
use crate::util::{ty, Expr, ModuleBuilder};
use crate::wasi::Capabilities;

/// A module whose `say` export writes "Hi!\n" to stdout via fd_write and
/// returns the errno; the byte count lands at address 8.
fn hello_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let fd_write = b.ty(&[ty::I32, ty::I32, ty::I32, ty::I32], &[ty::I32]);
    let say_sig = b.ty(&[], &[ty::I32]);
    let imported = b.import_func("wasi_snapshot_preview1", "fd_write", fd_write);
    b.memory(1, None);
    // iovec at 0: base 16, len 4; message at 16.
    b.data_active(0, &[16, 0, 0, 0, 4, 0, 0, 0]);
    b.data_active(16, b"Hi!\n");
    let body = Expr::new()
        .i32_const(1) // stdout
        .i32_const(0) // iovs
        .i32_const(1) // iovs_len
        .i32_const(8) // nwritten
        .call(imported)
        .finish();
    let f = b.func(say_sig, &[], body);
    b.export_func("say", f);
    b.export_memory("memory", 0);
    b.build()
}

fn load_with_caps(image: &[u8], caps: Capabilities) -> WasmModule {
    WasmModule::load_wasi_with(
        image,
        VmParams::default(),
        WasiOptions { caps: Some(caps), ..WasiOptions::default() },
        &[],
    )
    .unwrap()
}

#[test]
fn fd_write_reaches_stdout_with_stdio_allowed() {
    let image = hello_module();
    let mut module = load_with_caps(&image, Capabilities::default_set());
    assert_eq!(module.invoke("say", &[]).unwrap(), vec![0]);
    // Four bytes written, as recorded through nwritten.
    assert_eq!(module.memory_read(8, 4).unwrap(), vec![4, 0, 0, 0]);
}

#[test]
fn fd_write_without_stdio_is_denied() {
    let image = hello_module();
    let mut module = load_with_caps(&image, Capabilities::empty());
    assert_eq!(
        module.invoke("say", &[]),
        Err(VmError::Trap(TrapReason::WasiCapabilityDenied))
    );
    // Nothing was written through the syscall.
    assert_eq!(module.memory_read(8, 4).unwrap(), vec![0, 0, 0, 0]);
}

#[test]
fn proc_exit_surfaces_the_exit_code() {
    let mut b = ModuleBuilder::new();
    let proc_exit = b.ty(&[ty::I32], &[]);
    let start_sig = b.ty(&[], &[]);
    let imported = b.import_func("wasi_snapshot_preview1", "proc_exit", proc_exit);
    let f = b.func(
        start_sig,
        &[],
        Expr::new().i32_const(3).call(imported).finish(),
    );
    b.export_func("_start", f);
    let image = b.build();

    let mut module = load_with_caps(&image, Capabilities::default_set());
    assert_eq!(module.invoke("_start", &[]).unwrap(), Vec::<u64>::new());
    assert_eq!(module.get_wasi_exit_code(), Some(3));
}

#[test]
fn random_get_fills_memory() {
    let mut b = ModuleBuilder::new();
    let random_get = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let sig = b.ty(&[], &[ty::I32]);
    let imported = b.import_func("wasi_snapshot_preview1", "random_get", random_get);
    b.memory(1, None);
    let body = Expr::new()
        .i32_const(0)
        .i32_const(16)
        .call(imported)
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("roll", f);
    b.export_memory("memory", 0);
    let image = b.build();

    let mut module = load_with_caps(&image, Capabilities::default_set());
    assert_eq!(module.invoke("roll", &[]).unwrap(), vec![0]);
    // Sixteen zero bytes would mean the buffer was never touched; the odds
    // of that from real entropy are ignorable.
    assert_ne!(module.memory_read(0, 16).unwrap(), vec![0u8; 16]);
}

#[test]
fn args_round_trip() {
    let mut b = ModuleBuilder::new();
    let sizes = b.ty(&[ty::I32, ty::I32], &[ty::I32]);
    let sig = b.ty(&[], &[ty::I32]);
    let imported = b.import_func("wasi_snapshot_preview1", "args_sizes_get", sizes);
    b.memory(1, None);
    let body = Expr::new()
        .i32_const(0)
        .i32_const(4)
        .call(imported)
        .drop_()
        .i32_const(0)
        .i32_load(2, 0)
        .finish();
    let f = b.func(sig, &[], body);
    b.export_func("argc", f);
    b.export_memory("memory", 0);
    let image = b.build();

    let mut module = WasmModule::load_wasi_with(
        &image,
        VmParams::default(),
        WasiOptions {
            caps: Some(Capabilities::default_set()),
            args: vec!["prog".into(), "x".into(), "y".into()],
            ..WasiOptions::default()
        },
        &[],
    )
    .unwrap();
    assert_eq!(module.invoke("argc", &[]).unwrap(), vec![3]);
}

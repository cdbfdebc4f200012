//! Fuel metering and decode-time resource ceilings.

use reef_asm::TrapReason;

use crate::error::VmError;
use crate::params::VmParams;
use crate::runtime::WasmModule;

use super::test_helpers::*;

#[test]
fn fib_exhausts_a_small_fuel_budget() {
    let image = fib_module();
    let params = VmParams { fuel: Some(1_000), ..VmParams::default() };
    assert_eq!(
        invoke_with(&image, params, "fib", &[35]),
        Err(VmError::Trap(TrapReason::FuelExhausted))
    );
}

#[test]
fn fib_completes_under_a_generous_budget() {
    let image = fib_module();
    let params = VmParams { fuel: Some(1_000_000_000), ..VmParams::default() };
    assert_eq!(
        invoke_with(&image, params, "fib", &[35]).unwrap(),
        vec![9_227_465]
    );
}

#[test]
fn fuel_is_restored_between_invocations() {
    let image = fib_module();
    let params = VmParams { fuel: Some(100_000), ..VmParams::default() };
    let mut module = WasmModule::load_with_params(&image, params).unwrap();
    // Each invoke gets the full budget; repeated small calls never starve.
    for _ in 0..10 {
        assert_eq!(module.invoke("fib", &[15]).unwrap(), vec![610]);
    }
}

#[rstest::rstest]
#[case(0)]
#[case(4)]
#[case(7)]
#[case(20)]
fn truncated_images_are_invalid(#[case] cut: usize) {
    let image = fib_module();
    assert!(
        matches!(WasmModule::load(&image[..cut]), Err(VmError::InvalidWasm(_))),
        "cut at {cut}"
    );
}

#[test]
fn truncation_anywhere_is_invalid() {
    let image = fib_module();
    for cut in [image.len() / 2, image.len() - 1] {
        assert!(
            matches!(WasmModule::load(&image[..cut]), Err(VmError::InvalidWasm(_))),
            "cut at {cut}"
        );
    }
}

#[test]
fn bad_magic_is_invalid() {
    let mut image = fib_module();
    image[0] = b'X';
    assert!(matches!(
        WasmModule::load(&image),
        Err(VmError::InvalidWasm(_))
    ));
}

#[test]
fn trailing_section_bytes_are_invalid() {
    let mut image = fib_module();
    image.push(0x00);
    assert!(matches!(
        WasmModule::load(&image),
        Err(VmError::InvalidWasm(_))
    ));
}

#[test]
fn validation_is_idempotent() {
    let image = fib_module();
    assert!(crate::runtime::validate_bytes(&image).is_ok());
    assert!(crate::runtime::validate_bytes(&image).is_ok());

    let mut broken = fib_module();
    // Flip the body's add into an f64 op: the type simulator must reject it
    // the same way every time.
    let position = broken.len() - 3;
    broken[position] = 0xA0;
    let first = crate::runtime::validate_bytes(&broken);
    let second = crate::runtime::validate_bytes(&broken);
    assert!(first.is_err());
    assert_eq!(first, second);
}

mod common;

use nvmflash::flashing::{erase_all, erase_range, DownloadOptions, EraseAllTimeout, FlashError, Routine};
use pretty_assertions::assert_eq;

use common::{registry, target, transport_for};

#[test]
fn erase_all_clears_the_whole_flash() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.set_flash(0x10, &[0x00; 4]);
    fake.set_flash(0xfff0, &[0x12; 0x10]);

    erase_all(&registry, "SIM_SINGLE", "main", &mut fake, &DownloadOptions::default()).unwrap();

    assert_eq!(fake.flash_contents(0x0, 0x10000), vec![0xff; 0x10000]);
    assert_eq!(
        fake.routines(),
        vec![Routine::Init, Routine::EraseAll, Routine::Uninit]
    );
    assert_eq!(fake.routine_calls()[0].arguments[2], 1);
}

#[test]
fn erase_all_needs_the_routine_on_every_algorithm() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_ARM"), "main");

    let error =
        erase_all(&registry, "SIM_ARM", "main", &mut fake, &DownloadOptions::default()).unwrap_err();

    assert!(matches!(
        error,
        FlashError::UnsupportedOperation {
            ref algorithm,
            operation: "erase_all"
        } if algorithm == "sim_data"
    ));
    assert!(fake.calls().is_empty());
}

#[test]
fn erase_all_uses_its_own_timeout() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.hang_routine(Routine::EraseAll);

    let options = DownloadOptions {
        erase_all_timeout: EraseAllTimeout::Fixed(20),
        ..DownloadOptions::default()
    };
    let error = erase_all(&registry, "SIM_SINGLE", "main", &mut fake, &options).unwrap_err();

    assert!(matches!(error, FlashError::OperationTimeout(Routine::EraseAll)));
    assert_eq!(
        fake.routines(),
        vec![Routine::Init, Routine::EraseAll, Routine::Uninit]
    );
}

#[test]
fn erase_range_across_algorithms() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_ARM"), "main");
    fake.set_flash(0xe000, &[0x00; 0x10]);
    fake.set_flash(0xf000, &[0x00; 0x10]);
    fake.set_flash(0x1_0000, &[0x00; 0x10]);
    fake.set_flash(0x1_0400, &[0x00; 0x10]);

    erase_range(
        &registry,
        "SIM_ARM",
        "main",
        &mut fake,
        0xf800..0x1_0400,
        &DownloadOptions::default(),
    )
    .unwrap();

    let erased: Vec<u32> = fake
        .routine_calls()
        .iter()
        .filter(|call| call.routine == Routine::EraseSector)
        .map(|call| call.arguments[0])
        .collect();
    assert_eq!(erased, vec![0xf000, 0x1_0000]);
    assert_eq!(
        fake.routines(),
        vec![
            Routine::Init,
            Routine::EraseSector,
            Routine::Uninit,
            Routine::Init,
            Routine::EraseSector,
            Routine::Uninit,
        ]
    );

    // Neighbouring sectors are untouched.
    assert_eq!(fake.flash_contents(0xe000, 0x10), vec![0x00; 0x10]);
    assert_eq!(fake.flash_contents(0x1_0400, 0x10), vec![0x00; 0x10]);
    assert_eq!(fake.flash_contents(0xf000, 0x10), vec![0xff; 0x10]);
    assert_eq!(fake.flash_contents(0x1_0000, 0x10), vec![0xff; 0x10]);
}

#[test]
fn empty_range_touches_nothing() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_ARM"), "main");

    erase_range(
        &registry,
        "SIM_ARM",
        "main",
        &mut fake,
        0x100..0x100,
        &DownloadOptions::default(),
    )
    .unwrap();

    assert!(fake.calls().is_empty());
}

#[test]
fn range_beyond_flash_is_rejected_before_any_call() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_ARM"), "main");

    let error = erase_range(
        &registry,
        "SIM_ARM",
        "main",
        &mut fake,
        0x1_1f00..0x1_2100,
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::RangeOutOfBounds { address: 0x1_2000 }));
    assert!(fake.calls().is_empty());
}

#[test]
fn erase_range_switches_to_the_preferred_algorithm() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_BANKED"), "main");

    erase_range(
        &registry,
        "SIM_BANKED",
        "main",
        &mut fake,
        0x3000..0x5000,
        &DownloadOptions::default(),
    )
    .unwrap();

    let calls = |routine: Routine| -> Vec<u32> {
        fake.routine_calls()
            .iter()
            .filter(|call| call.routine == routine)
            .map(|call| call.arguments[0])
            .collect()
    };
    assert_eq!(calls(Routine::EraseSector), vec![0x3000, 0x4000]);
    // Init receives the base of the flash handled by the loaded algorithm.
    assert_eq!(calls(Routine::Init), vec![0x0, 0x4000]);
}

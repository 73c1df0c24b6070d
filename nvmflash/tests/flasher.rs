mod common;

use std::time::{Duration, Instant};

use nvmflash::flashing::{
    erase_and_program, AbortHandle, DownloadOptions, FlashBuilder, FlashError, FlashProgress,
    Flasher, FlasherState, ProgressEvent, Routine,
};
use nvmflash::transport::fake::TransportCall;
use nvmflash::transport::{RegisterId, TransportError};
use pretty_assertions::assert_eq;

use common::{assemble, pattern, recording_progress, registry, target, transport_for};

fn builder(address: u64, data: &[u8]) -> FlashBuilder {
    let mut builder = FlashBuilder::new();
    builder.add_data(address, data).unwrap();
    builder
}

fn image_loads(calls: &[TransportCall]) -> usize {
    calls
        .iter()
        .filter(|call| {
            matches!(
                call,
                TransportCall::WriteMemory {
                    address: 0x2000_0000,
                    ..
                }
            )
        })
        .count()
}

#[test]
fn init_failure_faults_and_still_uninits() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");
    fake.fail_routine(Routine::Init, 0x55);

    let options = DownloadOptions::default();
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    let error = flasher
        .program(&builder(0x0, &pattern(0x100)), false, false, false)
        .unwrap_err();

    assert!(matches!(error, FlashError::InitFailed(0x55)));
    assert_eq!(flasher.state(), FlasherState::Faulted);
    assert!(flasher.cleanup_error().is_none());
    drop(flasher);

    assert_eq!(fake.routines(), vec![Routine::Init, Routine::Uninit]);
    assert_eq!(fake.routine_calls()[1].arguments[0], 1);
}

#[test]
fn load_is_a_no_op_when_resident() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");

    let options = DownloadOptions::default();
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    assert_eq!(flasher.state(), FlasherState::Unloaded);

    flasher.load().unwrap();
    flasher.load().unwrap();
    assert_eq!(flasher.state(), FlasherState::Loaded);
    drop(flasher);

    assert_eq!(image_loads(fake.calls()), 1);
    assert!(fake.routines().is_empty());
}

#[test]
fn sessions_reinitialize_a_resident_algorithm() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");
    let builder = builder(0x40, &pattern(0x80));

    let options = DownloadOptions::default();
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    let layout = flasher.program(&builder, false, false, false).unwrap();
    flasher.verify(&builder).unwrap();

    assert_eq!(layout.pages().len(), 1);
    assert_eq!(layout.sectors().len(), 1);
    assert_eq!(flasher.state(), FlasherState::Uninitialized);
    drop(flasher);

    assert_eq!(image_loads(fake.calls()), 1);
    let operations: Vec<u32> = fake
        .routine_calls()
        .iter()
        .filter(|call| call.routine == Routine::Init)
        .map(|call| call.arguments[2])
        .collect();
    assert_eq!(operations, vec![1, 2, 3]);
}

#[test]
fn arm_registers() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");

    let options = DownloadOptions {
        clock: Some(8_000_000),
        ..DownloadOptions::default()
    };
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    flasher
        .program(&builder(0x0, &pattern(0x100)), false, false, false)
        .unwrap();
    drop(flasher);

    let writes = |register: u16, value: u32| {
        fake.calls()
            .iter()
            .filter(|call| **call == TransportCall::WriteRegister(RegisterId(register), value))
            .count()
    };

    // Stack and static base are only set up by init.
    assert_eq!(writes(13, 0x2000_0440), 2);
    assert_eq!(writes(9, 0x2000_0040), 2);
    // Thumb code returns to the odd address of the breakpoint.
    assert_eq!(writes(14, 0x2000_0001), fake.routines().len());
    // The init entry point lies right behind the header.
    assert_eq!(writes(15, 0x2000_0021), 2);

    let init = fake.routine_calls()[0];
    assert_eq!(init.routine, Routine::Init);
    assert_eq!(init.arguments[..3].to_vec(), vec![0x0, 8_000_000, 1]);
}

#[test]
fn riscv_registers() {
    let registry = registry();
    let target = target(&registry, "SIM_RV");
    let mut fake = transport_for(&target, "hart0");
    let data = pattern(0x100);

    erase_and_program(
        &registry,
        "SIM_RV",
        "hart0",
        &mut fake,
        0x0,
        &data,
        &DownloadOptions::default(),
    )
    .unwrap();

    assert_eq!(fake.flash_contents(0x0, 0x100), data);

    let return_addresses: Vec<u32> = fake
        .calls()
        .iter()
        .filter_map(|call| match call {
            TransportCall::WriteRegister(RegisterId(0x1001), value) => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(return_addresses.len(), fake.routines().len());
    assert!(return_addresses.iter().all(|address| *address == 0x8000_0000));

    assert!(fake
        .calls()
        .contains(&TransportCall::WriteRegister(RegisterId(0x7b1), 0x8000_0008)));
    assert!(fake
        .calls()
        .contains(&TransportCall::WriteRegister(RegisterId(0x1002), 0x8000_0428)));
}

#[test]
fn program_failure_reports_the_page() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.fail_routine(Routine::ProgramPage, 7);

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x100,
        &pattern(0x200),
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(
        error,
        FlashError::ProgramFailed {
            code: 7,
            address: 0x100
        }
    ));
    assert_eq!(
        fake.routines(),
        vec![
            Routine::Init,
            Routine::EraseSector,
            Routine::Uninit,
            Routine::Init,
            Routine::ProgramPage,
            Routine::Uninit,
        ]
    );
}

#[test]
fn erase_failure_reports_the_sector() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.fail_routine(Routine::EraseSector, 3);

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x1010,
        &pattern(0x10),
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(
        error,
        FlashError::EraseFailed {
            code: 3,
            sector: Some(0x1000)
        }
    ));
    assert_eq!(
        fake.routines(),
        vec![Routine::Init, Routine::EraseSector, Routine::Uninit]
    );
}

#[test]
fn hung_erase_times_out() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.hang_routine(Routine::EraseSector);

    let start = Instant::now();
    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x10),
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::OperationTimeout(Routine::EraseSector)));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(fake.is_halted());
    assert_eq!(
        fake.routines(),
        vec![Routine::Init, Routine::EraseSector, Routine::Uninit]
    );
}

#[test]
fn hung_init_times_out() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.hang_routine(Routine::Init);

    let options = DownloadOptions {
        init_timeout_ms: 20,
        ..DownloadOptions::default()
    };
    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x10),
        &options,
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::OperationTimeout(Routine::Init)));
    assert_eq!(fake.routines(), vec![Routine::Init, Routine::Uninit]);
}

#[test]
fn lockup_is_not_masked_by_the_failed_uninit() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");
    fake.lock_up_on(Routine::ProgramPage);
    let (progress, events) = recording_progress();

    let options = DownloadOptions {
        progress,
        ..DownloadOptions::default()
    };
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    let error = flasher
        .program(&builder(0x0, &pattern(0x100)), false, false, false)
        .unwrap_err();

    assert!(matches!(error, FlashError::CoreLockedUp(Routine::ProgramPage)));
    assert!(matches!(
        flasher.cleanup_error(),
        Some(FlashError::Transport(TransportError::Other(_)))
    ));
    assert_eq!(flasher.state(), FlasherState::Faulted);
    drop(flasher);

    assert!(events.lock().unwrap().contains(&"UninitFailed".to_string()));
    assert_eq!(
        fake.routines(),
        vec![
            Routine::Init,
            Routine::EraseSector,
            Routine::Uninit,
            Routine::Init,
            Routine::ProgramPage,
        ]
    );
}

#[test]
fn failed_uninit_is_not_fatal() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");
    fake.fail_routine(Routine::Uninit, 9);
    let data = pattern(0x100);

    let options = DownloadOptions::default();
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    flasher
        .program(&builder(0x0, &data), false, false, false)
        .unwrap();

    assert!(matches!(
        flasher.cleanup_error(),
        Some(FlashError::UninitFailed(9))
    ));
    assert_eq!(flasher.state(), FlasherState::Faulted);
    drop(flasher);

    assert_eq!(fake.flash_contents(0x0, 0x100), data);
    // The faulted algorithm is loaded again for the program session.
    assert_eq!(image_loads(fake.calls()), 2);
}

#[test]
fn failed_buffer_write_halts_the_core_before_uninit() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    // The image, the first page buffer, then the second one while the first page is programmed.
    fake.fail_memory_write(3);

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x300),
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::Transport(TransportError::Timeout)));
    assert!(fake.is_halted());
    assert_eq!(
        fake.routines(),
        vec![
            Routine::Init,
            Routine::EraseSector,
            Routine::Uninit,
            Routine::Init,
            Routine::ProgramPage,
            Routine::Uninit,
        ]
    );
}

#[test]
fn first_cleanup_error_of_an_operation_is_kept() {
    let registry = registry();
    let target = target(&registry, "SIM_SINGLE");
    let mut fake = transport_for(&target, "main");
    // Only the uninit of the erase session fails.
    fake.fail_routine_once(Routine::Uninit, 5);
    let data = pattern(0x100);

    let options = DownloadOptions::default();
    let mut flasher = Flasher::new(&mut fake, assemble(&target, "main", "sim_flash"), &options);
    flasher
        .program(&builder(0x0, &data), false, false, false)
        .unwrap();

    assert!(matches!(
        flasher.cleanup_error(),
        Some(FlashError::UninitFailed(5))
    ));
    assert_eq!(flasher.state(), FlasherState::Uninitialized);

    // A new operation starts without a cleanup error.
    flasher.verify(&builder(0x0, &data)).unwrap();
    assert!(flasher.cleanup_error().is_none());
    drop(flasher);

    assert_eq!(fake.flash_contents(0x0, 0x100), data);
}

#[test]
fn abort_from_progress_still_uninits() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");

    let abort = AbortHandle::new();
    let handle = abort.clone();
    let options = DownloadOptions {
        progress: FlashProgress::new(move |event| {
            if matches!(event, ProgressEvent::SectorErased { .. }) {
                handle.abort();
            }
        }),
        abort: Some(abort.clone()),
        ..DownloadOptions::default()
    };

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0xf00,
        &pattern(0x1100),
        &options,
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::Aborted));
    assert!(abort.is_aborted());
    assert!(fake.is_halted());
    assert_eq!(
        fake.routines(),
        vec![Routine::Init, Routine::EraseSector, Routine::Uninit]
    );
}

#[test]
fn abort_before_init_calls_no_routine() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");

    let abort = AbortHandle::new();
    abort.abort();
    let options = DownloadOptions {
        abort: Some(abort),
        ..DownloadOptions::default()
    };

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x10),
        &options,
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::Aborted));
    assert!(fake.routines().is_empty());
}

#[test]
fn corrupted_algorithm_load_is_detected() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.corrupt_reads();

    let error = erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x10),
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(error, FlashError::FlashAlgorithmNotLoaded));
    assert!(fake.routines().is_empty());
}

#[test]
fn algorithm_load_check_can_be_skipped() {
    let registry = registry();
    let mut fake = transport_for(&target(&registry, "SIM_SINGLE"), "main");
    fake.corrupt_reads();

    let options = DownloadOptions {
        verify_algorithm_load: false,
        ..DownloadOptions::default()
    };
    erase_and_program(
        &registry,
        "SIM_SINGLE",
        "main",
        &mut fake,
        0x0,
        &pattern(0x10),
        &options,
    )
    .unwrap();

    assert_eq!(fake.flash_contents(0x0, 0x10), pattern(0x10));
}

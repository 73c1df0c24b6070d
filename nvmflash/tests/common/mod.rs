#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use nvmflash::config::{Registry, Target};
use nvmflash::flashing::{FlashAlgorithm, FlashProgress, ProgressEvent};
use nvmflash::transport::fake::FakeTransport;

/// A family of simulated chips.
///
/// * `SIM_ARM`: one Cortex-M core with a main flash (`sim_flash`, 4 KiB sectors with
///   256 byte pages) and a data flash behind it (`sim_data`, no `erase_all`).
/// * `SIM_SINGLE`: only the main flash.
/// * `SIM_TINY`: the main flash, but far too little RAM for the algorithm.
/// * `SIM_RV`: a RISC-V core.
/// * `SIM_DUAL`: two cores with their own flash and RAM.
/// * `SIM_BANKED`: the main flash, plus a preferred algorithm (`sim_bank`) for
///   0x4000..0x8000 only.
pub const FAMILY: &str = r#"
name: Sim
variants:
  - name: SIM_ARM
    cores:
      - name: main
        type: armv7em
        core_access_options: !Arm
          ap: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [main]
        access:
          boot: true
      - !Nvm
        range:
          start: 0x10000
          end: 0x12000
        cores: [main]
      - !Ram
        range:
          start: 0x20000000
          end: 0x20001000
        cores: [main]
    flash_algorithms: [sim_flash, sim_data]
  - name: SIM_SINGLE
    cores:
      - name: main
        type: armv7em
        core_access_options: !Arm
          ap: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [main]
        access:
          boot: true
      - !Ram
        range:
          start: 0x20000000
          end: 0x20001000
        cores: [main]
    flash_algorithms: [sim_flash]
  - name: SIM_TINY
    cores:
      - name: main
        type: armv6m
        core_access_options: !Arm
          ap: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [main]
        access:
          boot: true
      - !Ram
        range:
          start: 0x20000000
          end: 0x20000100
        cores: [main]
    flash_algorithms: [sim_flash]
  - name: SIM_RV
    cores:
      - name: hart0
        type: riscv
        core_access_options: !Riscv
          hart_id: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x8000
        cores: [hart0]
        access:
          boot: true
      - !Ram
        range:
          start: 0x80000000
          end: 0x80000800
        cores: [hart0]
    flash_algorithms: [rv_flash]
  - name: SIM_DUAL
    cores:
      - name: app
        type: armv8m
        core_access_options: !Arm
          ap: 0
      - name: net
        type: armv8m
        core_access_options: !Arm
          ap: 1
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [app]
        access:
          boot: true
      - !Nvm
        range:
          start: 0x1000000
          end: 0x1008000
        cores: [net]
        access:
          boot: true
      - !Ram
        range:
          start: 0x20000000
          end: 0x20001000
        cores: [app]
      - !Ram
        range:
          start: 0x21000000
          end: 0x21001000
        cores: [net]
    flash_algorithms: [sim_flash, net_flash]
  - name: SIM_BANKED
    cores:
      - name: main
        type: armv7em
        core_access_options: !Arm
          ap: 0
    memory_map:
      - !Nvm
        range:
          start: 0x0
          end: 0x10000
        cores: [main]
        access:
          boot: true
      - !Ram
        range:
          start: 0x20000000
          end: 0x20001000
        cores: [main]
    flash_algorithms: [sim_flash, sim_bank]
flash_algorithms:
  - name: sim_flash
    instructions: EBESExQVFhcYGRobHB0eHyAhIiMkJSYnKCkqKywtLi8=
    pc_init: 0x1
    pc_uninit: 0x5
    pc_program_page: 0x9
    pc_erase_sector: 0xd
    pc_erase_all: 0x11
    data_section_offset: 0x20
    flash_properties:
      address_range:
        start: 0x0
        end: 0x10000
      page_size: 0x100
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 100
      sectors:
        - size: 0x1000
          address: 0x0
  - name: sim_data
    instructions: QEFCQ0RFRkdISUpLTE1OT1BRUlNUVVZXWFlaW1xdXl8=
    pc_init: 0x1
    pc_uninit: 0x5
    pc_program_page: 0x9
    pc_erase_sector: 0xd
    data_section_offset: 0x20
    flash_properties:
      address_range:
        start: 0x10000
        end: 0x12000
      page_size: 0x40
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 100
      sectors:
        - size: 0x400
          address: 0x0
  - name: sim_bank
    default: true
    instructions: sLGys7S1tre4ubq7vL2+v8DBwsPExcbHyMnKy8zNzs8=
    pc_init: 0x1
    pc_uninit: 0x5
    pc_program_page: 0x9
    pc_erase_sector: 0xd
    data_section_offset: 0x20
    flash_properties:
      address_range:
        start: 0x4000
        end: 0x8000
      page_size: 0x100
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 100
      sectors:
        - size: 0x1000
          address: 0x0
  - name: rv_flash
    instructions: cHFyc3R1dnd4eXp7fH1+f4CBgoOEhYaHiImKi4yNjo8=
    pc_init: 0x0
    pc_uninit: 0x4
    pc_program_page: 0x8
    pc_erase_sector: 0xc
    pc_erase_all: 0x10
    data_section_offset: 0x20
    flash_properties:
      address_range:
        start: 0x0
        end: 0x8000
      page_size: 0x100
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 100
      sectors:
        - size: 0x1000
          address: 0x0
  - name: net_flash
    cores: [net]
    instructions: kJGSk5SVlpeYmZqbnJ2en6ChoqOkpaanqKmqq6ytrq8=
    pc_init: 0x1
    pc_uninit: 0x5
    pc_program_page: 0x9
    pc_erase_sector: 0xd
    data_section_offset: 0x20
    flash_properties:
      address_range:
        start: 0x1000000
        end: 0x1008000
      page_size: 0x200
      erased_byte_value: 0xff
      program_page_timeout: 100
      erase_sector_timeout: 100
      sectors:
        - size: 0x800
          address: 0x0
"#;

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .add_target_family_from_yaml(FAMILY.as_bytes())
        .unwrap();
    registry
}

pub fn target(registry: &Registry, variant: &str) -> Target {
    registry.get_target_by_name(variant).unwrap()
}

/// A fake core which knows all algorithms of `target`.
pub fn transport_for(target: &Target, core: &str) -> FakeTransport {
    let architecture = target.architecture(core).unwrap();
    target
        .flash_algorithms
        .iter()
        .fold(FakeTransport::new(architecture), |fake, algorithm| {
            fake.with_algorithm(algorithm)
        })
}

/// Assembles the algorithm `name` of `target` for `core`.
pub fn assemble(target: &Target, core: &str, name: &str) -> FlashAlgorithm {
    let raw = target
        .flash_algorithms
        .iter()
        .find(|algorithm| algorithm.name == name)
        .unwrap()
        .clone();
    FlashAlgorithm::assemble_from_raw(
        raw,
        target.ram_region_for(core).unwrap(),
        target.architecture(core).unwrap(),
    )
    .unwrap()
}

/// Test data which has no bytes equal to the erased value.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A progress reporter which records the debug names of all events.
pub fn recording_progress() -> (FlashProgress, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let progress = FlashProgress::new(move |event: ProgressEvent| {
        let name = format!("{event:?}");
        let name = name
            .split([' ', '{', '('])
            .next()
            .unwrap_or_default()
            .to_string();
        sink.lock().unwrap().push(name);
    });
    (progress, events)
}

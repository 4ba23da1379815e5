//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use vm_core::{MemDisk, PhysAddr, RamRange, SoftMmu, Vm, VmConfig, PAGE_SIZE};

pub struct Machine {
    pub vm: Vm,
    pub mmu: Arc<SoftMmu>,
    pub disk: Arc<MemDisk>,
}

/// A VM over `frames` frames of RAM (one of which holds the coremap) with
/// `swap_slots` pages of swap
pub fn machine(frames: usize, swap_slots: usize) -> Machine {
    machine_with_cpus(frames, swap_slots, 1)
}

pub fn machine_with_cpus(frames: usize, swap_slots: usize, cpus: usize) -> Machine {
    let mmu = Arc::new(SoftMmu::new(cpus));
    let disk = Arc::new(MemDisk::new(swap_slots * PAGE_SIZE));
    let config = VmConfig::new().with_swap_slots(swap_slots);
    let ram = RamRange::with_frames(PhysAddr::new(0x40_0000), frames);

    let vm = Vm::bootstrap(config, ram, mmu.clone());
    vm.swap_bootstrap(disk.clone()).unwrap();
    Machine { vm, mmu, disk }
}

/// Page-sized pattern derived from `seed`
pub fn pattern(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| seed ^ (i % 253) as u8).collect()
}

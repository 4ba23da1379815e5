//! Address space copy and teardown

mod common;

use common::{machine, pattern};
use vm_core::{FaultType, Permissions, VirtAddr, PAGE_SIZE};

fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

const BASE: u64 = 0x40_0000;
const PAGES: u64 = 6;

fn page(i: u64) -> VirtAddr {
    va(BASE + i * PAGE_SIZE as u64)
}

#[test]
fn test_copy_is_faithful_with_mixed_residency() {
    // Five usable frames for six pages: some of the parent is on swap.
    let m = machine(6, 32);
    let vm = &m.vm;
    let mut parent = vm.as_create();
    vm.as_define_region(&mut parent, page(0), PAGES * PAGE_SIZE as u64, Permissions::READ_WRITE, false)
        .unwrap();
    vm.as_define_stack(&mut parent).unwrap();

    for i in 0..PAGES {
        vm.copyout(&parent, page(i), &pattern(i as u8)).unwrap();
    }
    assert!(!vm.swap_slots_owned_by(parent.id()).is_empty());

    let child = vm.as_copy(&parent).unwrap();
    assert_ne!(child.id(), parent.id());
    assert_eq!(child.segments(), parent.segments());

    for i in 0..PAGES {
        let mut theirs = vec![0u8; PAGE_SIZE];
        let mut ours = vec![0u8; PAGE_SIZE];
        vm.copyin(&child, page(i), &mut theirs).unwrap();
        vm.copyin(&parent, page(i), &mut ours).unwrap();
        assert_eq!(theirs, pattern(i as u8), "child page {}", i);
        assert_eq!(ours, pattern(i as u8), "parent page {}", i);
    }

    vm.as_destroy(child);
    vm.as_destroy(parent);
}

#[test]
fn test_copy_does_not_alias() {
    let m = machine(8, 8);
    let vm = &m.vm;
    let mut parent = vm.as_create();
    vm.as_define_region(&mut parent, page(0), 2 * PAGE_SIZE as u64, Permissions::READ_WRITE, false)
        .unwrap();
    vm.copyout(&parent, page(0), b"parent").unwrap();

    let child = vm.as_copy(&parent).unwrap();
    vm.copyout(&child, page(0), b"child!").unwrap();

    let mut buf = [0u8; 6];
    vm.copyin(&parent, page(0), &mut buf).unwrap();
    assert_eq!(&buf, b"parent");
    vm.copyin(&child, page(0), &mut buf).unwrap();
    assert_eq!(&buf, b"child!");

    let parent_frames = vm.frames_owned_by(parent.id());
    let child_frames = vm.frames_owned_by(child.id());
    assert!(parent_frames.iter().all(|f| !child_frames.contains(f)));

    vm.as_destroy(parent);
    vm.as_destroy(child);
}

#[test]
fn test_destroy_purges_frames_and_swap() {
    let m = machine(4, 16);
    let vm = &m.vm;
    let mut a = vm.as_create();
    vm.as_define_region(&mut a, page(0), PAGES * PAGE_SIZE as u64, Permissions::READ_WRITE, false)
        .unwrap();
    let mut b = vm.as_create();
    vm.as_define_region(&mut b, page(0), PAGE_SIZE as u64, Permissions::READ_WRITE, false)
        .unwrap();

    vm.vm_fault(Some(&b), FaultType::Write, page(0)).unwrap();
    for i in 0..PAGES {
        vm.vm_fault(Some(&a), FaultType::Write, page(i)).unwrap();
    }

    let a_id = a.id();
    assert!(!vm.frames_owned_by(a_id).is_empty());
    assert!(!vm.swap_slots_owned_by(a_id).is_empty());

    vm.as_destroy(a);
    assert!(vm.frames_owned_by(a_id).is_empty());
    assert!(vm.swap_slots_owned_by(a_id).is_empty());

    // The other address space is untouched: its page is either resident or on swap.
    let b_frames = vm.frames_owned_by(b.id()).len();
    let b_slots = vm.swap_slots_owned_by(b.id()).len();
    assert_eq!(b_frames + b_slots, 1);

    vm.as_destroy(b);
    assert_eq!(vm.frame_stats().free, 3);
}

#[test]
fn test_fork_exec_lifecycle() {
    let m = machine(16, 16);
    let vm = &m.vm;

    let mut init = vm.as_create();
    vm.as_define_region(&mut init, va(0x40_0000), 0x2345, Permissions::from_flags(true, false, true), false)
        .unwrap();
    vm.as_define_region(&mut init, va(0x50_0000), 0x1000, Permissions::READ_WRITE, false)
        .unwrap();
    vm.as_prepare_load(&mut init).unwrap();
    vm.copyout(&init, va(0x40_0000), b"\x7fELF").unwrap();
    vm.as_complete_load(&mut init).unwrap();
    let sp = vm.as_define_stack(&mut init).unwrap();
    assert_eq!(sp, vm.config().user_stack_top);
    assert_eq!(init.heap_break(), va(0x50_1000));

    vm.as_activate(Some(&init));
    vm.vm_fault(Some(&init), FaultType::Write, va(sp.as_u64() - 8)).unwrap();

    let child = vm.as_copy(&init).unwrap();
    let mut magic = [0u8; 4];
    vm.copyin(&child, va(0x40_0000), &mut magic).unwrap();
    assert_eq!(&magic, b"\x7fELF");
    assert!(vm.vm_fault(Some(&child), FaultType::Write, va(0x40_0000)).is_err());

    vm.as_destroy(child);
    vm.as_destroy(init);
    assert_eq!(vm.frame_stats().free, 15);
}

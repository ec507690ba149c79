//! Whole-subsystem scenarios: faults, eviction and swap working together.

use super::address_space::AddressSpace;
use super::error::FaultError;
use super::page::PageState;
use super::{Vm, VmStats};
use crate::fixtures::{file_with, Machine, TestMapper};
use crate::mem::PhysicalMemory;
use alloc::{format, sync::Arc, vec, vec::Vec};
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};
use proptest::prelude::*;

const CODE: VirtAddr = VirtAddr::new(0x0804_8000);
const HEAP: VirtAddr = VirtAddr::new(0x1000_0000);

fn heap(i: usize) -> VirtAddr {
    HEAP + i * PAGE_FRAME_SIZE
}

struct World {
    machine: Machine,
    vm: Vm,
}

impl World {
    fn new(frames: usize, slots: usize) -> Self {
        let machine = Machine::new(frames, slots);
        let vm = Vm::new(machine.pool.clone(), machine.ram.clone(), &machine.blocks);
        Self { machine, vm }
    }

    fn space(&self) -> (Arc<AddressSpace>, TestMapper) {
        let mapper = TestMapper::new();
        (self.vm.create_space(mapper.boxed()), mapper)
    }

    fn state(&self, space: &AddressSpace, page: VirtAddr) -> Option<PageState> {
        space.pages().lock().lookup(page).map(|e| e.state())
    }

    fn frame(&self, space: &AddressSpace, page: VirtAddr) -> PhysAddr {
        match self.state(space, page) {
            Some(PageState::Resident(frame)) => frame,
            other => panic!("{page} not resident: {other:?}"),
        }
    }

    fn content(&self, space: &AddressSpace, page: VirtAddr) -> [u8; PAGE_FRAME_SIZE] {
        self.machine.read_frame(self.frame(space, page))
    }

    /// Fills the resident `page` with `fill` and marks it written.
    fn write(&self, space: &AddressSpace, mapper: &TestMapper, page: VirtAddr, fill: u8) {
        self.machine
            .ram
            .write_page(self.frame(space, page), &[fill; PAGE_FRAME_SIZE]);
        assert!(mapper.touch(page, true));
    }

    /// Faults `page` in if needed and returns its first byte.
    fn access(&self, space: &Arc<AddressSpace>, mapper: &TestMapper, page: VirtAddr) -> u8 {
        if !matches!(self.state(space, page), Some(PageState::Resident(_))) {
            self.vm
                .handle_page_fault(space, page, false)
                .expect("fault resolves");
        }
        assert!(mapper.touch(page, false));
        self.content(space, page)[0]
    }

    fn register_heap(&self, space: &AddressSpace, pages: usize) {
        let mut table = space.pages().lock();
        for i in 0..pages {
            table.register_zeroed(heap(i), true).expect("register");
        }
    }
}

#[test]
fn read_only_file_page_is_loaded_then_write_rejected() {
    let world = World::new(4, 4);
    let (space, mapper) = world.space();
    let file = file_with(b"0123456789 trailing bytes not in the page");
    space
        .pages()
        .lock()
        .register(Some(file), 0, CODE, 10, 4086, true)
        .expect("register");

    world
        .vm
        .handle_page_fault(&space, CODE + 3, false)
        .expect("first fault");

    let content = world.content(&space, CODE);
    assert_eq!(&content[..10], b"0123456789");
    assert!(content[10..].iter().all(|&b| b == 0));
    assert_eq!(mapper.is_writable(CODE), Some(false));
    assert!(!mapper.touch(CODE, true));

    assert_eq!(
        world.vm.handle_page_fault(&space, CODE, true),
        Err(FaultError::WriteToReadOnly)
    );
    assert_eq!(world.vm.frames().len(), 1);
}

#[test]
fn file_page_honours_offset() {
    let world = World::new(2, 2);
    let (space, _) = world.space();
    let mut data = vec![0u8; 2 * PAGE_FRAME_SIZE];
    data[PAGE_FRAME_SIZE..PAGE_FRAME_SIZE + 4].copy_from_slice(b"page");
    space
        .pages()
        .lock()
        .register(Some(file_with(&data)), PAGE_FRAME_SIZE, CODE, 4, PAGE_FRAME_SIZE - 4, false)
        .expect("register");

    world.vm.handle_page_fault(&space, CODE, true).expect("fault");
    assert_eq!(&world.content(&space, CODE)[..5], b"page\0");
}

#[test]
fn anonymous_page_is_zeroed() {
    let world = World::new(1, 1);
    let (space, mapper) = world.space();
    world.machine.ram.write_page(world.machine.frame(0), &[0xee; PAGE_FRAME_SIZE]);
    world.register_heap(&space, 1);

    world.vm.handle_page_fault(&space, heap(0), true).expect("fault");
    assert!(world.content(&space, heap(0)).iter().all(|&b| b == 0));
    assert_eq!(mapper.is_writable(heap(0)), Some(true));
}

#[test]
fn unhandleable_faults() {
    let world = World::new(2, 2);
    let (space, _) = world.space();
    world.register_heap(&space, 1);

    assert_eq!(
        world.vm.handle_page_fault(&space, VirtAddr::new(0xc010_0000), false),
        Err(FaultError::KernelAddress)
    );
    assert_eq!(
        world.vm.handle_page_fault(&space, heap(1), false),
        Err(FaultError::NotPresent)
    );
    world.vm.handle_page_fault(&space, heap(0), false).expect("fault");
    assert_eq!(
        world.vm.handle_page_fault(&space, heap(0) + 8, true),
        Err(FaultError::AlreadyResident)
    );

    assert_eq!(world.vm.frames().len(), 1);
    assert_eq!(world.machine.pool.allocated(), 1);
    let stats = world.vm.stats();
    assert_eq!((stats.faults_handled, stats.faults_rejected), (1, 3));
}

#[test]
fn short_read_releases_the_frame() {
    let world = World::new(2, 2);
    let (space, mapper) = world.space();
    space
        .pages()
        .lock()
        .register(Some(file_with(b"tiny")), 0, CODE, 100, PAGE_FRAME_SIZE - 100, true)
        .expect("register");

    assert_eq!(
        world.vm.handle_page_fault(&space, CODE, false),
        Err(FaultError::ShortRead {
            expected: 100,
            read: 4
        })
    );
    assert!(world.vm.frames().is_empty());
    assert_eq!(world.machine.pool.allocated(), 0);
    assert_eq!(world.state(&space, CODE), Some(PageState::Unloaded));
    assert_eq!(mapper.mapped_count(), 0);
}

#[test]
fn failed_install_releases_the_frame() {
    let world = World::new(2, 2);
    let (space, mapper) = world.space();
    world.register_heap(&space, 1);

    mapper.refuse_installs(true);
    assert_eq!(
        world.vm.handle_page_fault(&space, heap(0), false),
        Err(FaultError::MappingFailed)
    );
    assert!(world.vm.frames().is_empty());
    assert_eq!(world.machine.pool.allocated(), 0);
    assert_eq!(world.state(&space, heap(0)), Some(PageState::Unloaded));

    mapper.refuse_installs(false);
    world.vm.handle_page_fault(&space, heap(0), false).expect("retry");
}

#[test]
fn failed_install_after_swap_in_drops_the_content() {
    let world = World::new(1, 2);
    let (space, mapper) = world.space();
    world.register_heap(&space, 2);

    world.vm.handle_page_fault(&space, heap(0), true).expect("fault");
    world.write(&space, &mapper, heap(0), 0x5a);
    world.vm.handle_page_fault(&space, heap(1), true).expect("fault");
    assert!(matches!(world.state(&space, heap(0)), Some(PageState::Swapped(_))));
    assert_eq!(world.vm.swap().used_slots(), 1);

    // Page 1 is evicted to make room, then the install fails.
    mapper.refuse_installs(true);
    assert_eq!(
        world.vm.handle_page_fault(&space, heap(0), false),
        Err(FaultError::MappingFailed)
    );
    assert_eq!(world.state(&space, heap(0)), Some(PageState::Unloaded));
    assert_eq!(world.vm.swap().used_slots(), 1);
    assert_eq!(world.vm.frames().len(), 0);

    mapper.refuse_installs(false);
    world.vm.handle_page_fault(&space, heap(0), false).expect("reload");
    assert!(world.content(&space, heap(0)).iter().all(|&b| b == 0));
}

#[test]
fn evicted_pages_come_back_intact() {
    let world = World::new(2, 8);
    let (space, mapper) = world.space();
    world.register_heap(&space, 5);

    for i in 0..5 {
        world.vm.handle_page_fault(&space, heap(i), true).expect("fault");
        world.write(&space, &mapper, heap(i), 0x10 + i as u8);
    }
    assert_eq!(world.vm.frames().len(), 2);
    assert_eq!(world.vm.frames().evictions(), 3);
    assert_eq!(world.vm.swap().used_slots(), 3);

    for i in 0..5 {
        assert_eq!(world.access(&space, &mapper, heap(i)), 0x10 + i as u8);
        assert!(world
            .content(&space, heap(i))
            .iter()
            .all(|&b| b == 0x10 + i as u8));
    }

    let pages = space.pages().lock();
    assert_eq!(pages.resident_count(), 2);
    assert_eq!(world.vm.swap().used_slots(), pages.swapped_count());
}

#[test]
fn last_free_slot_absorbs_an_eviction() {
    let world = World::new(2, 2);
    let (space, mapper) = world.space();
    world.register_heap(&space, 4);

    for i in 0..3 {
        world.vm.handle_page_fault(&space, heap(i), true).expect("fault");
        world.write(&space, &mapper, heap(i), 1);
    }
    assert_eq!(world.vm.swap().free_slots(), 1);

    world.vm.handle_page_fault(&space, heap(3), true).expect("fault");
    assert_eq!(world.vm.swap().free_slots(), 0);
    assert_eq!(world.vm.frames().evictions(), 2);
}

#[test]
#[should_panic(expected = "swap space exhausted")]
fn eviction_with_no_free_slot_is_fatal() {
    let world = World::new(2, 2);
    let (space, mapper) = world.space();
    world.register_heap(&space, 5);

    for i in 0..4 {
        world.vm.handle_page_fault(&space, heap(i), true).expect("fault");
        world.write(&space, &mapper, heap(i), 1);
    }
    assert_eq!(world.vm.swap().free_slots(), 0);
    let _ = world.vm.handle_page_fault(&space, heap(4), true);
}

#[test]
fn duplicate_shares_no_residency_or_slots() {
    let world = World::new(2, 4);
    let (parent, parent_mapper) = world.space();
    let file = file_with(b"shared text");
    parent
        .pages()
        .lock()
        .register(Some(file), 0, CODE, 11, PAGE_FRAME_SIZE - 11, true)
        .expect("register");
    world.register_heap(&parent, 2);

    world.vm.handle_page_fault(&parent, CODE, false).expect("fault");
    world.vm.handle_page_fault(&parent, heap(0), true).expect("fault");
    world.write(&parent, &parent_mapper, heap(0), 0x77);
    world.vm.handle_page_fault(&parent, heap(1), true).expect("fault");
    assert_eq!(world.vm.swap().used_slots(), 1);

    let (child_mapper, child) = {
        let mapper = TestMapper::new();
        let child = world.vm.duplicate_space(&parent, mapper.boxed());
        (mapper, child)
    };
    assert_ne!(child.id(), parent.id());
    {
        let pages = child.pages().lock();
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|e| e.state() == PageState::Unloaded));
        let code = pages.lookup(CODE).expect("code page");
        assert_eq!((code.read_bytes(), code.read_only()), (11, true));
    }
    assert_eq!(child_mapper.mapped_count(), 0);

    // The child re-reads its content instead of inheriting the parent's.
    assert_eq!(world.access(&child, &child_mapper, heap(0)), 0);
    assert_eq!(world.access(&child, &child_mapper, CODE), b's');

    world.vm.teardown(&parent);
    assert!(child.pages().lock().iter().any(|e| e.state().is_loaded()));
    assert_eq!(child.pages().lock().len(), 3);
    world.vm.teardown(&child);
    assert_eq!(world.vm.swap().used_slots(), 0);
    assert!(world.vm.frames().is_empty());
}

#[test]
fn duplicate_into_releases_destination_first() {
    let world = World::new(3, 4);
    let (source, _) = world.space();
    world.register_heap(&source, 1);
    let (dest, dest_mapper) = world.space();
    dest.pages()
        .lock()
        .register_zeroed(HEAP + 64 * PAGE_FRAME_SIZE, true)
        .expect("register");
    world
        .vm
        .handle_page_fault(&dest, HEAP + 64 * PAGE_FRAME_SIZE, true)
        .expect("fault");
    assert_eq!(world.vm.frames().len(), 1);

    world.vm.duplicate_into(&source, &dest);
    assert!(world.vm.frames().is_empty());
    assert_eq!(dest_mapper.mapped_count(), 0);
    let pages = dest.pages().lock();
    assert_eq!(pages.len(), 1);
    assert!(pages.lookup(heap(0)).is_some());
}

#[test]
fn teardown_returns_frames_and_slots() {
    let world = World::new(2, 4);
    let (space, mapper) = world.space();
    world.register_heap(&space, 4);
    for i in 0..4 {
        world.vm.handle_page_fault(&space, heap(i), true).expect("fault");
        world.write(&space, &mapper, heap(i), 3);
    }
    assert_eq!(
        world.vm.stats(),
        VmStats {
            resident_frames: 2,
            evictions: 2,
            swap_used: 2,
            swap_total: 4,
            faults_handled: 4,
            faults_rejected: 0,
        }
    );

    world.vm.teardown(&space);
    assert!(space.pages().lock().is_empty());
    assert_eq!(world.machine.pool.allocated(), 0);
    assert_eq!(world.vm.swap().used_slots(), 0);
    assert_eq!(mapper.mapped_count(), 0);
}

#[test]
fn frames_of_dropped_space_are_reused() {
    let world = World::new(1, 2);
    let (gone, _) = world.space();
    world.register_heap(&gone, 1);
    world.vm.handle_page_fault(&gone, heap(0), true).expect("fault");
    drop(gone);

    let (space, _) = world.space();
    world.register_heap(&space, 1);
    world.vm.handle_page_fault(&space, heap(0), false).expect("fault");
    assert_eq!(world.vm.swap().used_slots(), 0);
    assert_eq!(world.vm.frames().len(), 1);
}

#[test]
fn swap_slots_of_dropped_space_are_released() {
    let world = World::new(1, 2);
    let (gone, gone_mapper) = world.space();
    world.register_heap(&gone, 2);
    world.vm.handle_page_fault(&gone, heap(0), true).expect("fault");
    world.write(&gone, &gone_mapper, heap(0), 0x33);
    world.vm.handle_page_fault(&gone, heap(1), true).expect("fault");
    assert_eq!(world.vm.swap().used_slots(), 1);
    drop(gone);
    assert_eq!(world.vm.swap().used_slots(), 0);

    let (space, _) = world.space();
    world.register_heap(&space, 1);
    world.vm.handle_page_fault(&space, heap(0), false).expect("fault");
    assert_eq!(world.vm.swap().used_slots(), 0);
    assert_eq!(world.vm.frames().len(), 1);
    assert!(world.content(&space, heap(0)).iter().all(|&b| b == 0));
}

#[test]
fn concurrent_faults_outnumbering_frames_all_resolve() {
    const THREADS: usize = 4;
    const PAGES: usize = 6;

    let world = World::new(3, 64);
    let spaces: Vec<_> = (0..THREADS).map(|_| world.space()).collect();
    for (t, (space, _)) in spaces.iter().enumerate() {
        let data: Vec<u8> = (0..PAGES)
            .flat_map(|p| vec![(t * 16 + p + 1) as u8; PAGE_FRAME_SIZE])
            .collect();
        space
            .pages()
            .lock()
            .register_segment(&file_with(&data), 0, HEAP, data.len(), 0, false)
            .expect("segment");
    }

    std::thread::scope(|scope| {
        for (space, _) in spaces.iter() {
            let vm = &world.vm;
            scope.spawn(move || {
                for round in 0..3 {
                    for p in 0..PAGES {
                        match vm.handle_page_fault(space, heap((p + round) % PAGES), false) {
                            Ok(()) | Err(FaultError::AlreadyResident) => {}
                            Err(err) => panic!("fault failed: {err}"),
                        }
                    }
                }
            });
        }
    });

    check_accounting(&world, &spaces);
    assert_eq!(world.vm.frames().len(), 3);
    for (t, (space, mapper)) in spaces.iter().enumerate() {
        for p in 0..PAGES {
            let expected = (t * 16 + p + 1) as u8;
            assert_eq!(world.access(space, mapper, heap(p)), expected);
            assert!(world.content(space, heap(p)).iter().all(|&b| b == expected));
        }
    }
}

#[test]
fn user_range_checks() {
    let world = World::new(1, 1);
    let (space, _) = world.space();
    world.register_heap(&space, 2);
    space
        .pages()
        .lock()
        .register(None, 0, CODE, 0, PAGE_FRAME_SIZE, true)
        .expect("register");

    let vm = &world.vm;
    assert!(vm.check_user_range(&space, heap(0) + 100, 2 * PAGE_FRAME_SIZE - 100, true));
    assert!(!vm.check_user_range(&space, heap(0) + 100, 2 * PAGE_FRAME_SIZE, false));
    assert!(vm.check_user_range(&space, CODE, 16, false));
    assert!(!vm.check_user_range(&space, CODE, 16, true));
    assert!(vm.check_user_range(&space, heap(7), 0, true));
    assert!(!vm.check_user_range(&space, VirtAddr::new(0x8000_0000), 0, false));
    assert!(!vm.check_user_range(&space, VirtAddr::new(0x7fff_fff0), 0x20, false));
}

#[test]
fn display_summarizes_state() {
    let world = World::new(1, 2);
    let (space, _) = world.space();
    world.register_heap(&space, 1);
    world.vm.handle_page_fault(&space, heap(0), false).expect("fault");
    let dump = format!("{}", world.vm);
    assert!(dump.starts_with(
        "VM: 1 frames resident, 0 evictions, swap 0/2, faults 1 handled / 0 rejected\n"
    ));
    assert!(dump.contains("Frames: 1 in use"));
    assert!(dump.ends_with("Swap: \"swap\", 0/2 slots in use\n"));
}

/// Checks that the frame table, page tables and swap bitmap agree.
fn check_accounting(world: &World, spaces: &[(Arc<AddressSpace>, TestMapper)]) {
    let mut resident = 0;
    let mut swapped = 0;
    for (space, mapper) in spaces {
        let pages = space.pages().lock();
        for entry in pages.iter() {
            match entry.state() {
                PageState::Resident(frame) => {
                    resident += 1;
                    let info = world.vm.frames().lookup(frame).expect("frame entry");
                    assert_eq!((info.space_id, info.page), (space.id(), entry.page()));
                    assert!(!info.pinned);
                    assert_eq!(mapper.get(entry.page()), Some(frame));
                }
                PageState::Swapped(_) => {
                    swapped += 1;
                    assert_eq!(mapper.get(entry.page()), None);
                }
                PageState::Unloaded => assert_eq!(mapper.get(entry.page()), None),
            }
        }
    }
    assert_eq!(world.vm.frames().len(), resident);
    assert_eq!(world.vm.swap().used_slots(), swapped);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_accesses_keep_content_and_accounting(
        ops in prop::collection::vec((0usize..2, 0usize..6, any::<bool>()), 1..80)
    ) {
        let world = World::new(3, 16);
        let spaces: Vec<_> = (0..2).map(|_| world.space()).collect();
        for (space, _) in spaces.iter() {
            world.register_heap(space, 6);
        }
        let mut expected = [[0u8; 6]; 2];

        for (step, &(s, p, write)) in ops.iter().enumerate() {
            let (space, mapper) = &spaces[s];
            let seen = world.access(space, mapper, heap(p));
            prop_assert_eq!(seen, expected[s][p]);
            if write {
                let fill = (step % 250) as u8 + 1;
                world.write(space, mapper, heap(p), fill);
                expected[s][p] = fill;
            }
            check_accounting(&world, &spaces);
        }

        for (space, _) in spaces.iter() {
            world.vm.teardown(space);
        }
        prop_assert_eq!(world.machine.pool.allocated(), 0);
        prop_assert_eq!(world.vm.swap().used_slots(), 0);
    }
}

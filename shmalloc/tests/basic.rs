use std::{process, ptr};

use serial_test::serial;

use shmalloc::{
    memory_manager, AllocatorId, AllocatorKind, BackendId, BackendKind, Error, FullPtr, Platform, PowerOf2,
};

const MB: usize = 1024 * 1024;

#[serial]
#[test]
fn memory_manager_singleton() {
    init_logger();

    let manager = memory_manager();

    assert!(ptr::eq(manager, shmalloc::init()));
    assert_eq!(None, manager.device());
    assert_eq!(AllocatorId::ROOT, manager.root_allocator().id());
    assert!(manager.get_backend(BackendId::ROOT).is_some());
}

#[serial]
#[test]
fn fixed_page_single_process() {
    init_logger();

    let manager = memory_manager();
    let backend_id = BackendId::new(1);
    let alloc_id = AllocatorId::new(1, 0);

    manager.create_backend(backend_id, 16 * MB, BackendKind::Local, None).expect("Backend");

    let allocator = manager
        .create_allocator(backend_id, alloc_id, 0, AllocatorKind::FixedPage)
        .expect("No error")
        .expect("Allocator");

    assert_eq!(alloc_id, manager.default_allocator().id());

    let blocks: Vec<FullPtr<u8>> = (0..4).map(|_| allocator.allocate_ptr(256).expect("Allocation")).collect();

    for (index, block) in blocks.iter().enumerate() {
        //  Safety:
        //  -   Each block is 256 bytes.
        unsafe { ptr::write_bytes(block.as_ptr(), index as u8, 256) };

        let resolved: FullPtr<u8> = FullPtr::new(manager, block.shm());
        assert_eq!(*block, resolved);

        let derived: FullPtr<u8> = FullPtr::from_raw(manager, block.as_ptr());
        assert_eq!(*block, derived);
    }

    for (index, block) in blocks.iter().enumerate() {
        //  Safety:
        //  -   Each block is 256 bytes, and was filled above.
        assert_eq!(index as u8, unsafe { block.as_ptr().add(255).read() });
    }

    assert_eq!(4 * 256, allocator.currently_allocated_size());

    for block in &blocks {
        allocator.free_offset(block.shm().offset()).expect("Free");
    }

    assert_eq!(0, allocator.currently_allocated_size());
    assert!(matches!(allocator.free_offset(blocks[0].shm().offset()), Err(Error::DoubleFree(_))));

    //  Freed blocks of the exact size are reused.
    let reused = allocator.allocate_offset(256).expect("Allocation");
    assert!(blocks.iter().any(|block| block.shm().offset() == reused));

    manager.destroy_allocator(alloc_id);
    manager.destroy_backend(backend_id);

    assert!(manager.get_allocator(alloc_id).is_none());
    assert!(manager.get_backend(backend_id).is_none());
}

#[serial]
#[test]
fn every_allocator_kind() {
    init_logger();

    let manager = memory_manager();
    let kinds = [AllocatorKind::Stack, AllocatorKind::FixedPage, AllocatorKind::Scalable, AllocatorKind::Malloc];

    for (index, &kind) in kinds.iter().enumerate() {
        let backend_id = BackendId::new(10 + index as u32);
        let alloc_id = AllocatorId::new(10 + index as u32, 0);

        manager.create_backend(backend_id, MB, BackendKind::Local, None).expect("Backend");

        let allocator = manager
            .create_allocator(backend_id, alloc_id, 32, kind)
            .expect("No error")
            .expect("Allocator");

        assert_eq!(kind, allocator.kind());
        assert_eq!(32, allocator.custom_header_size());
        assert!(allocator.custom_header::<[u8; 32]>().is_some());

        let block: FullPtr<u64> = allocator.allocate_ptr(64).expect("Allocation");
        //  Safety:
        //  -   The block is 64 bytes, and suitably aligned.
        unsafe { block.as_ptr().write(index as u64) };

        assert_eq!(Some(block.shm()), manager.convert_raw(block.as_ptr() as *const u8));
        assert_eq!(64, allocator.currently_allocated_size());

        match allocator.reallocate_offset(block.shm().offset(), 512) {
            Ok(moved) => {
                let moved: FullPtr<u64> = allocator.full_ptr(moved);
                //  Safety:
                //  -   Reallocation preserves the content.
                assert_eq!(index as u64, unsafe { moved.as_ptr().read() });
                assert_eq!(512, allocator.currently_allocated_size());

                allocator.free_offset(moved.shm().offset()).expect("Free");
            },
            Err(Error::NotSupported { .. }) => {
                assert_eq!(AllocatorKind::FixedPage, kind);
                allocator.free_offset(block.shm().offset()).expect("Free");
            },
            Err(error) => panic!("Unexpected error: {}", error),
        }

        assert_eq!(0, allocator.currently_allocated_size());

        if kind != AllocatorKind::FixedPage {
            let alignment = PowerOf2::new(256).expect("Power of 2");
            let aligned = allocator.aligned_allocate_offset(100, alignment).expect("Aligned");
            let address = allocator.convert_offset(aligned) as usize;

            assert_eq!(0, address % 256);
            allocator.free_offset(aligned).expect("Free");
        }

        manager.destroy_allocator(alloc_id);
        manager.destroy_backend(backend_id);
    }
}

#[serial]
#[test]
fn create_allocator_errors() {
    init_logger();

    let manager = memory_manager();

    let missing = manager.create_allocator(BackendId::new(99), AllocatorId::new(99, 0), 0, AllocatorKind::Stack);
    assert!(matches!(missing, Ok(None)));

    let backend_id = BackendId::new(20);
    manager.create_backend(backend_id, 4096, BackendKind::Local, None).expect("Backend");

    let allocator = manager
        .create_allocator(backend_id, AllocatorId::new(20, 0), 0, AllocatorKind::Stack)
        .expect("No error")
        .expect("Allocator");

    assert!(matches!(allocator.allocate_offset(MB), Err(Error::OutOfMemory { .. })));

    manager.destroy_allocator(allocator.id());
    manager.destroy_backend(backend_id);
}

#[serial]
#[test]
fn posix_shm_backend() {
    init_logger();

    let manager = memory_manager();
    let backend_id = BackendId::new(30);
    let name = format!("shmalloc-basic-{}", process::id());

    let backend = manager.create_backend(backend_id, MB, BackendKind::PosixShm, Some(&name)).expect("Backend");

    assert!(backend.is_owned());
    assert_eq!(Some(format!("/{}", name)), backend.locator());
    assert_eq!(BackendKind::PosixShm, backend.kind());

    drop(backend);
    manager.destroy_backend(backend_id);

    let platform = manager.platform();
    assert!(platform.open_region(BackendKind::PosixShm, &name).is_err());
}

fn init_logger() { let _ = env_logger::builder().is_test(true).try_init(); }

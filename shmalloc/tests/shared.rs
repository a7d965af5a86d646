//  Participants sharing POSIX shared memory segments.
//
//  Each participant is a distinct MemoryManager with its own mappings, hence its own addresses, as distinct processes
//  would be.

use std::{process, ptr, sync::Arc};

use shmalloc::{
    AllocatorId, AllocatorKind, BackendId, BackendKind, Error, FullPtr, MemoryManager, ShmConfiguration, ShmPlatform,
};

type Manager = MemoryManager<ShmConfiguration>;

const MB: usize = 1024 * 1024;

#[test]
fn producer_consumer() {
    init_logger();

    let name = segment("producer-consumer");
    let backend_id = BackendId::new(1);
    let alloc_id = AllocatorId::new(1, 0);

    let producer = participant();
    let consumer = participant();

    producer.create_backend(backend_id, 4 * MB, BackendKind::PosixShm, Some(&name)).expect("Backend");

    let allocator = producer
        .create_allocator(backend_id, alloc_id, 0, AllocatorKind::Scalable)
        .expect("No error")
        .expect("Allocator");

    let message = b"Hello, shared world!";
    let written: FullPtr<u8> = allocator.allocate_ptr(message.len()).expect("Allocation");

    //  Safety:
    //  -   The block is `message.len()` bytes.
    unsafe { ptr::copy_nonoverlapping(message.as_ptr(), written.as_ptr(), message.len()) };

    let backend = consumer.attach_backend(BackendKind::PosixShm, &name).expect("Attach");

    assert!(!backend.is_owned());
    assert_eq!(backend_id, backend.id());

    let discovered = consumer.get_allocator(alloc_id).expect("Discovered");
    assert_eq!(AllocatorKind::Scalable, discovered.kind());
    assert_eq!(message.len(), discovered.currently_allocated_size());

    let read: FullPtr<u8> = FullPtr::new(&consumer, written.shm());

    assert!(!read.is_null());
    assert_ne!(written.as_ptr(), read.as_ptr());

    //  Safety:
    //  -   The block is `message.len()` bytes, written above.
    let content = unsafe { std::slice::from_raw_parts(read.as_ptr(), message.len()) };
    assert_eq!(&message[..], content);

    //  The consumer frees what the producer allocated.
    discovered.free_offset(read.shm().offset()).expect("Free");
    assert_eq!(0, allocator.currently_allocated_size());
    assert!(matches!(allocator.free_offset(written.shm().offset()), Err(Error::DoubleFree(_))));
}

#[test]
fn consumer_scans_late_allocators() {
    init_logger();

    let name = segment("late");
    let backend_id = BackendId::new(2);
    let alloc_id = AllocatorId::new(2, 3);

    let producer = participant();
    let consumer = participant();

    producer.create_backend(backend_id, MB, BackendKind::PosixShm, Some(&name)).expect("Backend");

    let backend = consumer.attach_backend(BackendKind::PosixShm, &name).expect("Attach");

    assert!(!backend.has_allocator());
    assert!(consumer.get_allocator(alloc_id).is_none());

    producer.create_allocator(backend_id, alloc_id, 128, AllocatorKind::FixedPage).expect("No error");

    consumer.scan_backends();

    let discovered = consumer.get_allocator(alloc_id).expect("Discovered");
    assert_eq!(128, discovered.custom_header_size());

    consumer.scan_backends();
    assert!(Arc::ptr_eq(&discovered, &consumer.get_allocator(alloc_id).expect("Still registered")));
}

#[test]
fn destroyed_segments_cannot_be_attached() {
    init_logger();

    let name = segment("destroyed");
    let backend_id = BackendId::new(3);

    let owner = participant();
    let late = participant();

    owner.create_backend(backend_id, MB, BackendKind::PosixShm, Some(&name)).expect("Backend");
    owner.destroy_backend(backend_id);

    assert!(matches!(late.attach_backend(BackendKind::PosixShm, &name), Err(Error::Io(_))));
}

#[test]
fn consumers_do_not_release_segments() {
    init_logger();

    let name = segment("borrowed");
    let backend_id = BackendId::new(4);

    let owner = participant();

    owner.create_backend(backend_id, MB, BackendKind::PosixShm, Some(&name)).expect("Backend");

    {
        let consumer = participant();
        consumer.attach_backend(BackendKind::PosixShm, &name).expect("Attach");
    }

    let other = participant();
    other.attach_backend(BackendKind::PosixShm, &name).expect("Still attachable");

    //  Destroying takes ownership, whoever created the backend.
    other.destroy_backend(backend_id);

    assert!(participant().attach_backend(BackendKind::PosixShm, &name).is_err());
    assert!(owner.get_backend(backend_id).is_some());
}

fn participant() -> Manager { Manager::new(Arc::new(ShmPlatform::new())).expect("Manager") }

fn segment(name: &str) -> String { format!("shmalloc-{}-{}", name, process::id()) }

fn init_logger() { let _ = env_logger::builder().is_test(true).try_init(); }

use std::{
    collections::BTreeSet,
    process,
    sync::{self, atomic, Arc},
    thread,
};

use shmalloc::{
    AllocatorId, AllocatorKind, Backend, BackendId, BackendKind, MemoryManager, OffsetPointer, Platform,
    ShmConfiguration, ShmPlatform,
};

type Manager = MemoryManager<ShmConfiguration>;

const MB: usize = 1024 * 1024;

//
//  Tests
//

#[test]
fn concurrent_fixed_page() {
    //  Test that blocks can be concurrently allocated and freed, including freed on a separate thread.
    //
    //  1.  Concurrently (synchronized) each thread allocates blocks of various sizes, and fills them with its index.
    //  2.  Once all threads are done, each thread checks its blocks were not overwritten by another thread.
    //  3.  The blocks are handed to the next thread, which frees them.
    //  4.  The counter of allocated bytes is back to 0.
    init_logger();

    let number_iterations = number_iterations();
    let number_threads = number_threads();

    let manager = Arc::new(participant());
    let backend_id = BackendId::new(1);
    let alloc_id = AllocatorId::new(1, 0);

    manager.create_backend(backend_id, 64 * MB, BackendKind::Local, None).expect("Backend");

    let allocator = manager
        .create_allocator(backend_id, alloc_id, 0, AllocatorKind::FixedPage)
        .expect("No error")
        .expect("Allocator");

    let ring: Arc<Vec<sync::Mutex<Vec<OffsetPointer>>>> =
        Arc::new((0..number_threads).map(|_| sync::Mutex::new(Vec::new())).collect());

    for _ in 0..number_iterations {
        let allocated = RendezVous::new("allocated", number_threads);
        let checked = RendezVous::new("checked", number_threads);

        let pool = Pool::new(number_threads, |index| {
            let allocated = allocated.clone();
            let checked = checked.clone();
            let manager = manager.clone();
            let ring = ring.clone();

            move || {
                let allocator = manager.get_allocator(alloc_id).expect("Registered");

                let blocks: Vec<_> = (0..64)
                    .map(|i| {
                        let size = block_size(i);
                        let block = allocator.allocate_offset(size).expect("Allocation");

                        //  Safety:
                        //  -   The block is `size` bytes.
                        unsafe { std::ptr::write_bytes(allocator.convert_offset(block), index as u8, size) };

                        (block, size)
                    })
                    .collect();

                allocated.wait_until_all_ready();

                for &(block, size) in &blocks {
                    //  Safety:
                    //  -   The block is `size` bytes, filled above.
                    let content = unsafe { std::slice::from_raw_parts(allocator.convert_offset(block), size) };
                    assert!(content.iter().all(|&byte| byte == index as u8), "Block {} overwritten", block);
                }

                *ring[index].lock().expect("Not poisoned") = blocks.iter().map(|&(block, _)| block).collect();

                checked.wait_until_all_ready();

                let next = (index + 1) % ring.len();
                let stolen = std::mem::take(&mut *ring[next].lock().expect("Not poisoned"));

                for block in stolen {
                    allocator.free_offset(block).expect("Free");
                }

                blocks.len()
            }
        });

        let results = pool.join();

        assert_eq!(vec![64; number_threads], results);
        assert_eq!(0, allocator.currently_allocated_size());
    }
}

#[test]
fn racing_scanners_register_once() {
    //  Test that concurrent scans of a freshly registered backend discover its allocator exactly once.
    init_logger();

    let number_threads = number_threads();
    let name = format!("shmalloc-multi-{}", process::id());
    let backend_id = BackendId::new(2);
    let alloc_id = AllocatorId::new(2, 0);

    let producer = participant();
    producer.create_backend(backend_id, MB, BackendKind::PosixShm, Some(&name)).expect("Backend");
    producer.create_allocator(backend_id, alloc_id, 0, AllocatorKind::Scalable).expect("No error");

    let consumer = Arc::new(participant());

    let region = consumer.platform().open_region(BackendKind::PosixShm, &name).expect("Region");
    let backend = Arc::new(Backend::shm_deserialize(region).expect("Backend"));
    consumer.register_backend(backend.clone()).expect("Registered");

    let start = RendezVous::new("start", number_threads);
    let scanned = RendezVous::new("scanned", number_threads);

    let pool = Pool::new(number_threads, |_| {
        let start = start.clone();
        let scanned = scanned.clone();
        let consumer = consumer.clone();

        move || {
            start.wait_until_all_ready();

            consumer.scan_backends();

            scanned.wait_until_all_ready();

            let allocator = consumer.get_allocator(alloc_id).expect("Discovered");
            Arc::as_ptr(&allocator) as usize
        }
    });

    let instances: BTreeSet<_> = pool.join().into_iter().collect();

    assert_eq!(1, instances.len());
    assert!(backend.is_scanned());

    consumer.scan_backends();

    let allocator = consumer.get_allocator(alloc_id).expect("Still registered");
    assert!(instances.contains(&(Arc::as_ptr(&allocator) as usize)));
}

//
//  Harness
//

struct Pool<T>(Vec<thread::JoinHandle<T>>);

impl<T> Pool<T> {
    fn new<F, G>(count: usize, mut factory: F) -> Self
        where
            F: FnMut(usize) -> G,
            G: FnOnce() -> T + Send + 'static,
            T: Send + 'static
    {
        let threads : Vec<_> = (0..count)
            .map(|i| {
                thread::spawn(factory(i))
            })
            .collect();

        Self(threads)
    }

    fn join(mut self) -> Vec<T> {
        let thread_handles = std::mem::take(&mut self.0);
        Self::join_handles(thread_handles)
    }

    fn join_handles(thread_handles: Vec<thread::JoinHandle<T>>) -> Vec<T> {
        //  First join _all_ threads.
        let results: Vec<_> = thread_handles.into_iter()
            .map(|handle| handle.join())
            .collect();
        //  Then collect the results.
        results.into_iter()
            .map(|value| value.expect("Thread completed"))
            .collect()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let thread_handles = std::mem::take(&mut self.0);
        Self::join_handles(thread_handles);
    }
}

//  A one-shot barrier: every participant waits until all have arrived.
#[derive(Clone, Debug)]
struct RendezVous(&'static str, sync::Arc<atomic::AtomicUsize>);

impl RendezVous {
    fn new(name: &'static str, count: usize) -> Self {
        Self(name, sync::Arc::new(atomic::AtomicUsize::new(count)))
    }

    fn wait_until_all_ready(&self) {
        self.1.fetch_sub(1, atomic::Ordering::AcqRel);

        while !self.is_ready() {
            thread::yield_now();
        }
    }

    fn is_ready(&self) -> bool { self.1.load(atomic::Ordering::Acquire) == 0 }
}

//
//  Implementation Details
//

fn block_size(i: usize) -> usize { [16, 48, 200, 1000][i % 4] }

fn number_iterations() -> usize { read_number_from_environment("SHMALLOC_MULTI_NUMBER_ITERATIONS", 10) }

fn number_threads() -> usize {
    read_number_from_environment("SHMALLOC_MULTI_NUMBER_THREADS", num_cpus::get().clamp(2, 8))
}

fn read_number_from_environment(name: &str, default: usize) -> usize {
    match std::env::var(name).ok().and_then(|value| value.parse().ok()) {
        Some(result) => {
            println!("read_number_from_environment - {}: {}", name, result);
            result
        },
        None => {
            println!("read_number_from_environment - {}: {} (default)", name, default);
            default
        },
    }
}

fn participant() -> Manager { Manager::new(Arc::new(ShmPlatform::new())).expect("Manager") }

fn init_logger() { let _ = env_logger::builder().is_test(true).try_init(); }

use std::sync::Arc;

use proptest::prelude::*;

use shmalloc::{AllocatorId, AllocatorKind, BackendId, BackendKind, MemoryManager, ShmConfiguration, ShmPlatform};

type Manager = MemoryManager<ShmConfiguration>;

fn kind() -> impl Strategy<Value = AllocatorKind> {
    prop_oneof![
        Just(AllocatorKind::Stack),
        Just(AllocatorKind::FixedPage),
        Just(AllocatorKind::Scalable),
        Just(AllocatorKind::Malloc),
    ]
}

proptest! {
    #[test]
    fn allocators_count_live_bytes(
        kind in kind(),
        operations in prop::collection::vec((1usize..2048, any::<bool>()), 1..64),
    ) {
        let manager = Manager::new(Arc::new(ShmPlatform::new())).expect("Manager");
        let backend_id = BackendId::new(1);

        manager.create_backend(backend_id, 4 * 1024 * 1024, BackendKind::Local, None).expect("Backend");

        let allocator = manager
            .create_allocator(backend_id, AllocatorId::new(1, 0), 0, kind)
            .expect("No error")
            .expect("Allocator");

        let mut live = Vec::new();

        for (size, free) in operations {
            let block = allocator.allocate_offset(size).expect("Allocation");
            live.push((block, size));

            if free {
                let (block, _) = live.remove(0);
                allocator.free_offset(block).expect("Free");
            }

            let expected: usize = live.iter().map(|&(_, size)| size).sum();
            prop_assert_eq!(expected, allocator.currently_allocated_size());
        }

        for (block, _) in live {
            allocator.free_offset(block).expect("Free");
        }

        prop_assert_eq!(0, allocator.currently_allocated_size());
    }
}

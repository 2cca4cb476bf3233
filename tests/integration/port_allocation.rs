use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use testbed::docker::ports::PortAllocator;
use testbed::TbError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_get_distinct_ports() {
    let allocator = Arc::new(PortAllocator::new());

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let allocator = Arc::clone(&allocator);
            tokio::task::spawn_blocking(move || {
                allocator
                    .allocate_for(&format!("env-{}", i), 21000, 21999)
                    .unwrap()
                    .port
            })
        })
        .collect();

    let mut ports = HashSet::new();
    for handle in handles {
        assert!(ports.insert(handle.await.unwrap()));
    }
    assert_eq!(ports.len(), 32);
    assert_eq!(allocator.list_all().len(), 32);
}

#[test]
fn test_externally_bound_port_is_skipped() {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let busy = listener.local_addr().unwrap().port();
    let allocator = PortAllocator::new();

    let err = allocator.allocate(busy, busy).unwrap_err();
    assert!(matches!(
        err,
        TbError::ResourceExhausted { start, end } if start == busy && end == busy
    ));
    assert!(!allocator.is_allocated(busy));
}

#[test]
fn test_allocated_port_is_never_reissued() {
    let allocator = PortAllocator::new();

    let first = allocator.allocate(22000, 22010).unwrap();
    let second = allocator.allocate(first, first);

    assert!(matches!(second, Err(TbError::ResourceExhausted { .. })));
    assert!(allocator.is_allocated(first));
}

#[test]
fn test_leases_are_listed_by_holder() {
    let allocator = PortAllocator::new();
    let a = allocator.allocate_for("tmpdb", 23000, 23100).unwrap();
    let b = allocator.allocate_for("tmpdb", 23000, 23100).unwrap();
    allocator.allocate_for("tmpsvc", 23000, 23100).unwrap();

    assert_eq!(allocator.get_ports("tmpdb"), vec![a.port, b.port]);
    assert_eq!(allocator.get_ports("missing"), Vec::<u16>::new());
}

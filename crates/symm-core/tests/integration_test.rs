//! Cross-process integration tests
//!
//! fork() real processes to verify that an OS-backed heap segment
//! created by one process is mappable and coherent in another.

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::thread;
    use std::time::Duration;

    use symm_core::config::HeapBacking;
    use symm_core::segment::HeapSegment;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("symm_test_{tag}_{ts}")
    }

    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    fn open_with_retry(name: &str) -> HeapSegment {
        let mut attempts = 0;
        loop {
            match HeapSegment::open_shared(name) {
                Ok(s) => return s,
                Err(e) => {
                    attempts += 1;
                    assert!(attempts <= 20, "open '{name}' failed: {e}");
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    #[test]
    fn os_segment_cross_process_rw() {
        let name = unique_name("rw");

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let seg = HeapSegment::create(HeapBacking::OsShared, &name, 4096).unwrap();
                let data = b"written by child";
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), seg.base() as *mut u8, data.len())
                };
                // Keep the mapping alive until the parent has read it.
                thread::sleep(Duration::from_millis(500));
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let seg = open_with_retry(&name);
                thread::sleep(Duration::from_millis(100));
                let expected = b"written by child";
                let got =
                    unsafe { std::slice::from_raw_parts(seg.base() as *const u8, expected.len()) };
                assert_eq!(got, expected);
                assert!(is_exit_success(waitpid(child, None).unwrap()));
            }
        }
    }

    #[test]
    fn os_segment_atomic_handshake() {
        use std::sync::atomic::{AtomicI64, Ordering};
        let name = unique_name("atomic");

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let seg = HeapSegment::create(HeapBacking::OsShared, &name, 4096).unwrap();
                let cell = unsafe { &*(seg.base() as *const AtomicI64) };
                cell.store(1, Ordering::Release);
                let mut spins = 0u32;
                while cell.load(Ordering::Acquire) != 2 {
                    spins += 1;
                    if spins > 1000 {
                        thread::sleep(Duration::from_millis(1));
                    }
                    if spins > 100_000 {
                        std::process::exit(1);
                    }
                }
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let seg = open_with_retry(&name);
                let cell = unsafe { &*(seg.base() as *const AtomicI64) };
                while cell.load(Ordering::Acquire) != 1 {
                    thread::sleep(Duration::from_millis(1));
                }
                cell.store(2, Ordering::Release);
                assert!(is_exit_success(waitpid(child, None).unwrap()));
            }
        }
    }
}

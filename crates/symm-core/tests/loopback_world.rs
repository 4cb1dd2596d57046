//! End-to-end tests over in-process loopback worlds

use symm_core::config::{AlltoallAlgo, BcastAlgo, CollectAlgo, PeerScheme, ReduceAlgo, SyncFlavor};
use symm_core::loopback::{run_world, run_world_catch, LoopbackFabric, LoopbackShared};
use symm_core::region::{PeSpan, RegionTable};
use symm_core::transport::{AmoOp, CommHandle, Fabric, TransportAdapter};
use symm_core::{Config, CtxHandle, ReduceOpKind, SymAddr, CTX_PRIVATE, TEAM_WORLD};
use std::sync::Arc;

fn test_config() -> Config {
    Config {
        symmetric_size: 4 * 1024 * 1024,
        ..Config::default()
    }
}

fn fill<T: Copy>(addr: SymAddr, vals: &[T]) {
    unsafe { std::ptr::copy(vals.as_ptr(), addr.as_ptr::<T>(), vals.len()) };
}

fn read_vec<T: Copy>(addr: SymAddr, n: usize) -> Vec<T> {
    unsafe { std::slice::from_raw_parts(addr.as_ptr::<T>(), n) }.to_vec()
}

#[test]
fn two_pe_put_get_round_trip() {
    run_world(2, test_config(), |rt| {
        let buf = rt.calloc(4, 8).unwrap();
        let me = rt.my_pe();
        let peer = 1 - me;
        rt.put(buf, &[me as i64 + 100], peer).unwrap();
        rt.barrier_all().unwrap();
        assert_eq!(rt.g::<i64>(buf, rt.my_pe()).unwrap(), peer as i64 + 100);
        let fetched: i64 = rt.g(buf, peer).unwrap();
        assert_eq!(fetched, me as i64 + 100);
        rt.free(buf).unwrap();
    });
}

#[test]
fn put_signal_delivers_payload_before_flag() {
    run_world(2, test_config(), |rt| {
        let data = rt.calloc(8, 8).unwrap();
        let flag = rt.calloc(1, 8).unwrap();
        if rt.my_pe() == 0 {
            rt.put_signal(data, &[7i64, 8, 9], flag, 1, 1).unwrap();
        } else {
            rt.wait_until(flag, |v| v >= 1);
            assert_eq!(read_vec::<i64>(data, 3), vec![7, 8, 9]);
        }
        rt.barrier_all().unwrap();
        rt.free(flag).unwrap();
        rt.free(data).unwrap();
    });
}

#[test]
fn barrier_drains_atomic_sum() {
    run_world(4, test_config(), |rt| {
        let cell = rt.calloc(1, 8).unwrap();
        rt.atomic_add(cell, 0, rt.my_pe() as i64).unwrap();
        rt.barrier_all().unwrap();
        let total: i64 = rt.g(cell, 0).unwrap();
        rt.free(cell).unwrap();
        assert_eq!(total, 6);
    });
}

fn check_alltoall(algo: AlltoallAlgo) {
    let mut cfg = test_config();
    cfg.algos.alltoall = algo;
    run_world(4, cfg, |rt| {
        let n = rt.n_pes();
        let src = rt.calloc(n * 2, 4).unwrap();
        let dest = rt.calloc(n * 2, 4).unwrap();
        let me = rt.my_pe() as i32;
        fill(src, &(0..2 * n as i32).map(|i| me * 10 + i).collect::<Vec<_>>());
        rt.alltoall::<i32>(TEAM_WORLD, dest, src, 2).unwrap();
        let got = read_vec::<i32>(dest, n * 2);
        let want: Vec<i32> = (0..n as i32).flat_map(|p| [p * 10 + me * 2, p * 10 + me * 2 + 1]).collect();
        assert_eq!(got, want, "pe {me}");
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn alltoall_shift_exchange_barrier() {
    check_alltoall(AlltoallAlgo::new(PeerScheme::ShiftExchange, SyncFlavor::Barrier));
}

#[test]
fn alltoall_xor_pairwise_signal() {
    check_alltoall(AlltoallAlgo::new(PeerScheme::XorPairwise, SyncFlavor::Signal));
}

#[test]
fn alltoall_color_pairwise_counter() {
    check_alltoall(AlltoallAlgo::new(PeerScheme::ColorPairwise, SyncFlavor::Counter));
}

#[test]
fn alltoall_expected_pe2_slice() {
    // The canonical 4x2 case: PE 2 ends with [2,3,12,13,22,23,32,33].
    let mut cfg = test_config();
    cfg.algos.alltoall = AlltoallAlgo::new(PeerScheme::ShiftExchange, SyncFlavor::Signal);
    let slices = run_world(4, cfg, |rt| {
        let src = rt.calloc(8, 4).unwrap();
        let dest = rt.calloc(8, 4).unwrap();
        let me = rt.my_pe() as i32;
        fill(src, &(0..8).map(|i| me * 10 + i).collect::<Vec<_>>());
        rt.alltoall::<i32>(TEAM_WORLD, dest, src, 2).unwrap();
        let out = read_vec::<i32>(dest, 8);
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
        out
    });
    assert_eq!(slices[2], vec![2, 3, 12, 13, 22, 23, 32, 33]);
}

#[test]
fn alltoalls_strided_blocks() {
    run_world(2, test_config(), |rt| {
        let n = rt.n_pes();
        // Stride 2: elements land at even offsets.
        let src = rt.calloc(n * 2 * 2, 4).unwrap();
        let dest = rt.calloc(n * 2 * 2, 4).unwrap();
        let me = rt.my_pe() as i32;
        for j in 0..n * 2 {
            unsafe { *src.as_ptr::<i32>().add(j * 2) = me * 100 + j as i32 };
        }
        rt.alltoalls::<i32>(TEAM_WORLD, dest, src, 2, 2, 2).unwrap();
        for p in 0..n as i32 {
            for j in 0..2 {
                let v = unsafe { *dest.as_ptr::<i32>().add(((p as usize * 2) + j) * 2) };
                assert_eq!(v, p * 100 + (me * 2) + j as i32);
            }
        }
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn alltoall_zero_size_completes_under_signal() {
    let signal = AlltoallAlgo::new(PeerScheme::ShiftExchange, SyncFlavor::Signal);
    let mut cfg = test_config();
    cfg.algos.alltoall = signal;
    cfg.algos.alltoalls = signal;
    run_world(2, cfg, |rt| {
        let src = rt.calloc(4, 4).unwrap();
        let dest = rt.calloc(4, 4).unwrap();
        rt.alltoall::<i32>(TEAM_WORLD, dest, src, 0).unwrap();
        rt.alltoalls::<i32>(TEAM_WORLD, dest, src, 1, 1, 0).unwrap();
        rt.barrier_all().unwrap();
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn alltoall_slot_returns_after_every_call() {
    // More consecutive exchanges than general pSync slots per team.
    let mut cfg = test_config();
    cfg.algos.alltoall = AlltoallAlgo::new(PeerScheme::ShiftExchange, SyncFlavor::Signal);
    run_world(2, cfg, |rt| {
        let n = rt.n_pes();
        let src = rt.calloc(n, 8).unwrap();
        let dest = rt.calloc(n, 8).unwrap();
        let me = rt.my_pe() as i64;
        for round in 0..6 {
            fill(src, &[me * 100 + round, me * 100 + round]);
            rt.alltoall::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
            assert_eq!(read_vec::<i64>(dest, n), vec![round, 100 + round]);
        }
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

fn check_broadcast(algo: BcastAlgo) {
    let mut cfg = test_config();
    cfg.algos.broadcast = algo;
    run_world(5, cfg, |rt| {
        let buf = rt.calloc(4, 8).unwrap();
        if rt.my_pe() == 2 {
            fill(buf, &[11i64, 22, 33, 44]);
        }
        rt.broadcast::<i64>(TEAM_WORLD, buf, buf, 4, 2).unwrap();
        assert_eq!(read_vec::<i64>(buf, 4), vec![11, 22, 33, 44], "pe {}", rt.my_pe());
        rt.free(buf).unwrap();
    });
}

#[test]
fn broadcast_linear() {
    check_broadcast(BcastAlgo::Linear);
}

#[test]
fn broadcast_binomial_tree() {
    check_broadcast(BcastAlgo::Tree);
}

fn check_fcollect(algo: CollectAlgo) {
    let mut cfg = test_config();
    cfg.algos.fcollect = algo;
    run_world(4, cfg, |rt| {
        let n = rt.n_pes();
        let src = rt.calloc(3, 4).unwrap();
        let dest = rt.calloc(n * 3, 4).unwrap();
        let me = rt.my_pe() as i32;
        fill(src, &[me * 10, me * 10 + 1, me * 10 + 2]);
        rt.fcollect::<i32>(TEAM_WORLD, dest, src, 3).unwrap();
        let want: Vec<i32> = (0..n as i32).flat_map(|p| [p * 10, p * 10 + 1, p * 10 + 2]).collect();
        assert_eq!(read_vec::<i32>(dest, n * 3), want, "pe {me}");
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn fcollect_bruck() {
    check_fcollect(CollectAlgo::Bruck);
}

#[test]
fn fcollect_bruck_inplace() {
    check_fcollect(CollectAlgo::BruckInplace);
}

#[test]
fn collect_variable_contributions() {
    run_world(4, test_config(), |rt| {
        let me = rt.my_pe();
        // PE p contributes p+1 elements.
        let mine = me + 1;
        let src = rt.calloc(8, 4).unwrap();
        let dest = rt.calloc(16, 4).unwrap();
        fill(src, &(0..mine as i32).map(|i| me as i32 * 10 + i).collect::<Vec<_>>());
        rt.collect::<i32>(TEAM_WORLD, dest, src, mine).unwrap();
        let mut want = Vec::new();
        for p in 0..4i32 {
            want.extend((0..=p).map(|i| p * 10 + i));
        }
        assert_eq!(read_vec::<i32>(dest, 10), want, "pe {me}");
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

fn check_sum_reduce(npes: usize, algo: ReduceAlgo) {
    let mut cfg = test_config();
    cfg.algos.reduce = [algo; ReduceOpKind::COUNT];
    run_world(npes, cfg, move |rt| {
        let src = rt.calloc(4, 8).unwrap();
        let dest = rt.calloc(4, 8).unwrap();
        let me = rt.my_pe() as i64 + 1;
        fill(src, &[me, me * 2, 0, -me]);
        rt.sum_reduce::<i64>(TEAM_WORLD, dest, src, 4).unwrap();
        let s: i64 = (1..=npes as i64).sum();
        assert_eq!(read_vec::<i64>(dest, 4), vec![s, s * 2, 0, -s], "pe {} n {npes}", rt.my_pe());
        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn sum_reduce_rec_dbl_eight_pes() {
    check_sum_reduce(8, ReduceAlgo::RecDbl);
}

#[test]
fn sum_reduce_rec_dbl_non_power_of_two() {
    check_sum_reduce(6, ReduceAlgo::RecDbl);
    check_sum_reduce(3, ReduceAlgo::RecDbl);
}

#[test]
fn sum_reduce_linear() {
    check_sum_reduce(4, ReduceAlgo::Linear);
}

#[test]
fn sum_reduce_binomial_tree() {
    check_sum_reduce(5, ReduceAlgo::Tree);
}

#[test]
fn reduce_operator_results() {
    run_world(4, test_config(), |rt| {
        let src = rt.calloc(1, 8).unwrap();
        let dest = rt.calloc(1, 8).unwrap();
        let me = rt.my_pe() as i64;

        fill(src, &[me + 1]);
        rt.prod_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![24]);

        fill(src, &[10 - me]);
        rt.min_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![7]);
        rt.max_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![10]);

        fill(src, &[1i64 << me]);
        rt.or_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![0b1111]);
        rt.xor_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![0b1111]);
        rt.and_reduce::<i64>(TEAM_WORLD, dest, src, 1).unwrap();
        assert_eq!(read_vec::<i64>(dest, 1), vec![0]);

        rt.free(dest).unwrap();
        rt.free(src).unwrap();
    });
}

#[test]
fn sum_reduce_in_place() {
    run_world(4, test_config(), |rt| {
        let buf = rt.calloc(2, 8).unwrap();
        fill(buf, &[rt.my_pe() as i64, 1i64]);
        rt.sum_reduce::<i64>(TEAM_WORLD, buf, buf, 2).unwrap();
        assert_eq!(read_vec::<i64>(buf, 2), vec![6, 4]);
        rt.free(buf).unwrap();
    });
}

#[test]
fn reduce_over_active_subset() {
    use symm_core::psync::REDUCE_SYNC_SIZE;
    run_world(4, test_config(), |rt| {
        let set = symm_core::ActiveSet { start: 0, stride: 2, size: 2 };
        let psync = rt.calloc(REDUCE_SYNC_SIZE, 8).unwrap();
        let pwrk = rt.calloc(32, 8).unwrap();
        let src = rt.calloc(1, 8).unwrap();
        let dest = rt.calloc(1, 8).unwrap();
        fill(src, &[(rt.my_pe() as i64 + 1) * 100]);
        if rt.my_pe() % 2 == 0 {
            rt.reduce_to_all::<i64, _>(
                ReduceOpKind::Sum,
                set,
                dest,
                src,
                1,
                |a, b| a + b,
                psync,
                pwrk,
                32,
            )
            .unwrap();
            assert_eq!(read_vec::<i64>(dest, 1), vec![400]);
        }
        rt.barrier_all().unwrap();
        for b in [dest, src, pwrk, psync] {
            rt.free(b).unwrap();
        }
    });
}

#[test]
fn context_slots_are_reused() {
    run_world(1, test_config(), |rt| {
        let a = rt.ctx_create(0).unwrap();
        let CtxHandle::Id(_, first) = a else { panic!("expected created handle") };
        assert_eq!(first, 0);
        rt.ctx_destroy(a).unwrap();
        let b = rt.ctx_create(0).unwrap();
        assert_eq!(b, a, "destroyed slot comes back first");
        let c = rt.ctx_create(0).unwrap();
        let CtxHandle::Id(_, third) = c else { panic!() };
        assert_eq!(third, 1);
        assert_eq!(rt.ctx_count(TEAM_WORLD), 2);
        let buf = rt.calloc(1, 8).unwrap();
        rt.ctx_put(b, buf, &[5i64], 0).unwrap();
        rt.ctx_quiet(b).unwrap();
        assert_eq!(rt.g::<i64>(buf, 0).unwrap(), 5);
        rt.free(buf).unwrap();
        rt.ctx_destroy(b).unwrap();
        rt.ctx_destroy(c).unwrap();
    });
}

#[test]
fn private_context_from_foreign_thread_aborts() {
    run_world(1, test_config(), |rt| {
        let c = rt.ctx_create(CTX_PRIVATE).unwrap();
        std::thread::scope(|s| {
            let h = s.spawn(|| rt.ctx_quiet(c));
            assert!(h.join().is_err(), "foreign-thread use must abend");
        });
        rt.ctx_destroy(c).unwrap();
    });
}

#[test]
fn allocator_footprint_restores_after_free() {
    run_world(2, test_config(), |rt| {
        let before = rt.heap_bytes_in_use().unwrap();
        let a = rt.malloc(4096).unwrap();
        let b = rt.memalign(256, 512).unwrap();
        assert_eq!(b.addr() % 256, 0);
        assert!(rt.heap_bytes_in_use().unwrap() > before);
        rt.free(b).unwrap();
        rt.free(a).unwrap();
        assert_eq!(rt.heap_bytes_in_use().unwrap(), before);
    });
}

#[test]
fn double_free_is_fatal_with_memerr_fatal() {
    let mut cfg = test_config();
    cfg.memerr_fatal = true;
    let results = run_world_catch(1, cfg, |rt| {
        let p = rt.malloc(64).unwrap();
        rt.free(p).unwrap();
        rt.free(p).unwrap();
    });
    assert!(results[0].is_err(), "second free must abend the PE");
}

#[test]
fn symmetric_addresses_resolve_for_peers() {
    run_world(2, test_config(), |rt| {
        let buf = rt.malloc(64).unwrap();
        assert!(rt.addr_accessible(buf, 0));
        assert!(rt.addr_accessible(buf, 1));
        assert!(!rt.addr_accessible(SymAddr(0x10), 1));
        rt.free(buf).unwrap();
    });
}

#[test]
fn bitwise_emulation_matches_native() {
    // Transport-level rig: flip the fabric's native-bitwise capability
    // and check the cswap emulation computes the same results.
    let mut mem = vec![0u8; 64];
    let base = (mem.as_mut_ptr() as usize + 7) & !7;
    let regions = Arc::new(RegionTable::new(0));
    regions.register(vec![PeSpan { base, end: base + 32, rkey: 0 }]);
    let shared = LoopbackShared::new(1);
    let fabric = Arc::new(LoopbackFabric::new(Arc::clone(&shared), 0));
    let worker = fabric.create_worker().unwrap();
    let ta = TransportAdapter::new(fabric, regions);
    let h = CommHandle { worker, no_store: false };
    let cell = SymAddr(base);

    for native in [true, false] {
        shared.set_native_bitwise(native);
        ta.write_i64(cell, 0b1100);
        let old = ta.amo::<i64>(h, AmoOp::FetchOr, cell, 0, 0b0011, 0).unwrap();
        assert_eq!(old, 0b1100);
        let old = ta.amo::<i64>(h, AmoOp::FetchAnd, cell, 0, 0b0110, 0).unwrap();
        assert_eq!(old, 0b1111);
        let old = ta.amo::<i64>(h, AmoOp::FetchXor, cell, 0, 0b0101, 0).unwrap();
        assert_eq!(old, 0b0110);
        assert_eq!(ta.read_i64(cell), 0b0011);
    }
}

#[test]
fn world_identity_and_teams() {
    run_world(3, test_config(), |rt| {
        assert_eq!(rt.n_pes(), 3);
        assert_eq!(rt.team_n_pes(TEAM_WORLD).unwrap(), 3);
        assert_eq!(rt.team_my_pe(TEAM_WORLD).unwrap(), rt.my_pe());
        // Loopback worlds are one node, so shared == world membership.
        assert_eq!(rt.team_n_pes(symm_core::TEAM_SHARED).unwrap(), 3);
        assert_eq!(
            rt.team_translate(symm_core::TEAM_SHARED, 1, TEAM_WORLD).unwrap(),
            Some(1)
        );
    });
}

#[test]
fn atomic_fetch_variants() {
    use symm_core::ThreadLevel;
    let results = run_world_catch(1, test_config(), |rt| {
        assert_eq!(rt.thread_level(), ThreadLevel::Single);
        let buf = rt.calloc(1, 8).unwrap();
        rt.atomic_add(buf, 0, 41).unwrap();
        rt.atomic_fetch_add(buf, 0, 1).unwrap();
        let v: i64 = rt.atomic_fetch(buf, 0).unwrap();
        rt.free(buf).unwrap();
        v
    });
    assert!(matches!(results[0], Ok(42)));
}

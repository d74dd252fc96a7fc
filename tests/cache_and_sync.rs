//! Code-page cache sharing, invalidation and shadow-memory sync through
//! the public driver surface.

mod common;

use common::{boring_block, test_state, ScriptedBlock, TestEngine, TestLifter};
use concolic_taint::engine::{AccessKind, EngineContext, EngineHooks, PagePerms};
use concolic_taint::stop::StopReason;
use concolic_taint::{State, PAGE_SIZE};
use vex_ir::{IrExpr, IrStmt};

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

fn plain_state(cache_key: u64) -> State {
    let mut state = State::new(Box::new(TestEngine::new()), cache_key);
    state.hook();
    state
}

#[test]
fn cache_round_trip() {
    let mut state = plain_state(0x1001);

    assert!(state.cache_page(0x4000, &page_of(0x90), PagePerms::READ | PagePerms::EXEC));
    assert!(state.in_cache(0x4000));
    assert!(state.in_cache(0x4abc));

    state.uncache_pages_touching_region(0x4000, 1);
    assert!(!state.in_cache(0x4000));
}

#[test]
fn cache_is_shared_between_states_with_one_key() {
    let mut first = plain_state(0x1002);
    let second = plain_state(0x1002);

    assert!(first.cache_page(0x8000, &page_of(0xcc), PagePerms::default()));
    assert!(second.in_cache(0x8000));

    drop(first);
    // The cache key stays alive while any state references it.
    assert!(second.in_cache(0x8000));
}

#[test]
fn states_with_different_keys_do_not_share() {
    let mut first = plain_state(0x1003);
    let second = plain_state(0x1004);

    assert!(first.cache_page(0x8000, &page_of(0xcc), PagePerms::default()));
    assert!(!second.in_cache(0x8000));
}

#[test]
fn double_clear_page_cache_is_a_no_op() {
    let mut state = plain_state(0x1005);
    state.cache_page(0x4000, &page_of(1), PagePerms::default());

    state.clear_page_cache();
    assert!(!state.in_cache(0x4000));
    state.clear_page_cache();
    assert!(!state.in_cache(0x4000));
}

#[test]
fn unmapped_fetch_is_repaired_from_the_cache() {
    let mut state = plain_state(0x1006);
    state.cache_page(0x4000, &page_of(0x90), PagePerms::READ | PagePerms::EXEC);

    let mut ctx = TestEngine::new();
    let repaired = state.on_unmapped(&mut ctx, AccessKind::Fetch, 0x4100, 4);
    assert!(repaired);
    assert_eq!(ctx.mapped, vec![(0x4000, PAGE_SIZE)]);

    let mut byte = [0u8; 1];
    ctx.mem_read(0x4100, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);
}

#[test]
fn unmapped_access_without_cache_classifies_the_fault() {
    let mut state = plain_state(0x1007);
    let mut ctx = TestEngine::new();

    assert!(!state.on_unmapped(&mut ctx, AccessKind::Read, 0x10, 1));
    assert_eq!(state.stop_details().reason, StopReason::Zeropage);

    let mut state = plain_state(0x1008);
    assert!(!state.on_unmapped(&mut ctx, AccessKind::Fetch, 0x9000, 4));
    assert_eq!(state.stop_details().reason, StopReason::Execnone);

    let mut state = plain_state(0x1009);
    assert!(!state.on_unmapped(&mut ctx, AccessKind::Write, 0x9000, 4));
    assert_eq!(state.stop_details().reason, StopReason::Segfault);
}

#[test]
fn uncaching_a_region_forces_reanalysis_after_code_changes() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    // First run sees a block that taints nothing.
    lifter.insert(
        0x1000,
        boring_block(vec![IrStmt::Imark { addr: 0x1000, len: 4 }], 0x1004),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();
    assert!(state.blocks_with_symbolic_instrs().is_empty());

    // The block's bytes change: the new code copies a symbolic register.
    // Without invalidation the stale analysis would still be served.
    state.uncache_pages_touching_region(0x1000, 4);

    // A fresh lifter result stands in for the rewritten code.
    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                IrStmt::Imark { addr: 0x1000, len: 4 },
                IrStmt::Put {
                    offset: 16,
                    data: IrExpr::get(24, 8),
                },
            ],
            0x1004,
        ),
    );
    state.enable_symbolic_tracking(
        vex_ir::GuestArch::Amd64,
        vex_ir::ArchInfo::new(64, vex_ir::Endianness::Little),
        Box::new(lifter),
    );

    state.start(0x1000, 4).unwrap();
    assert_eq!(
        state.blocks_with_symbolic_instrs().len(),
        1,
        "re-lifted block must be re-analyzed, not served from cache"
    );
}

#[test]
fn activation_seeds_taint_reported_by_sync() {
    let mut state = plain_state(0x100a);

    let mut taint = vec![0u8; 16];
    taint[4] = 1;
    taint[5] = 1;
    state.activate_page(0x2000, 16, Some(&taint));

    let updates = state.sync();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].address, 0x2004);
    assert_eq!(updates[0].length, 2);

    assert_eq!(state.find_tainted(0x2000, 16), Some(0x2004));
    assert_eq!(state.find_tainted(0x2006, 8), None);
}

#[test]
fn executed_pages_drain_one_per_call() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4), ScriptedBlock::new(0x3000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(0x1000, boring_block(vec![IrStmt::Imark { addr: 0x1000, len: 4 }], 0x3000));
    lifter.insert(0x3000, boring_block(vec![IrStmt::Imark { addr: 0x3000, len: 4 }], 0x3004));

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 8).unwrap();

    assert_eq!(state.next_executed_page(), Some(0x1000));
    assert_eq!(state.next_executed_page(), Some(0x3000));
    assert_eq!(state.next_executed_page(), None);
}

//! End-to-end taint propagation scenarios over the scripted engine and
//! table lifter.

mod common;

use common::{boring_block, test_state, Event, ScriptedBlock, TestEngine, TestLifter, PC_OFFSET};
use concolic_taint::engine::EngineContext;
use concolic_taint::stop::StopReason;
use vex_ir::{BinOp, IrExpr, IrStmt, JumpKind};

fn imark(addr: u64) -> IrStmt {
    IrStmt::Imark { addr, len: 4 }
}

fn put(offset: u64, data: IrExpr) -> IrStmt {
    IrStmt::Put { offset, data }
}

fn wrtmp(tmp: u64, data: IrExpr) -> IrStmt {
    IrStmt::WrTmp { tmp, data }
}

fn constant(value: u64) -> IrExpr {
    IrExpr::Const { value, size: 8 }
}

#[test]
fn purely_concrete_block_flags_nothing() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 8)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                put(16, IrExpr::binop(BinOp::Add, IrExpr::get(24, 8), constant(1))),
                imark(0x1004),
                put(32, IrExpr::binop(BinOp::Multiply, IrExpr::get(16, 8), constant(2))),
            ],
            0x1008,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);
    assert!(state.blocks_with_symbolic_instrs().is_empty());
    assert!(state.get_symbolic_registers().is_empty());
}

#[test]
fn taint_flows_through_a_temporary() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                wrtmp(0, IrExpr::get(24, 8)),
                put(16, IrExpr::binop(BinOp::Add, IrExpr::RdTmp(0), constant(4))),
            ],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);

    let blocks = state.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].block_addr, 0x1000);
    assert_eq!(blocks[0].symbolic_instrs.len(), 1);
    assert_eq!(blocks[0].symbolic_instrs[0].instr_addr, 0x1000);
    assert!(!blocks[0].symbolic_instrs[0].has_memory_dep);
    assert!(
        blocks[0].register_values.is_empty(),
        "no concrete register values feed the flagged instruction"
    );

    let symbolic = state.get_symbolic_registers();
    assert!(symbolic.contains(&16), "the put's destination became symbolic");
    assert!(symbolic.contains(&24));
}

#[test]
fn read_through_symbolic_address_stops() {
    let mut engine = TestEngine::new();
    engine.write_memory(0x5000, &[0x11; 8]);
    engine.script = vec![ScriptedBlock::with_events(
        0x1000,
        4,
        vec![Event::Read { addr: 0x5000, size: 8 }],
    )];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![imark(0x1000), wrtmp(0, IrExpr::load(IrExpr::get(40, 8), 8))],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([40]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::SymbolicReadAddr);
    assert!(
        state.blocks_with_symbolic_instrs().is_empty(),
        "the aborted block must not reach the re-execution list"
    );
    assert!(state.sync().is_empty(), "shadow memory rolled back clean");
}

#[test]
fn symbolic_write_then_read_back_flags_both_instructions() {
    let mut engine = TestEngine::new();
    engine.write_memory(0x6000, &[0u8; 8]);
    engine.script = vec![ScriptedBlock::with_events(
        0x1000,
        8,
        vec![
            Event::Write { addr: 0x6000, bytes: vec![0xab; 8] },
            Event::Read { addr: 0x6000, size: 8 },
        ],
    )];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                IrStmt::Store {
                    addr: constant(0x6000),
                    data: IrExpr::get(24, 8),
                },
                imark(0x1004),
                wrtmp(0, IrExpr::load(constant(0x6000), 8)),
                put(16, IrExpr::RdTmp(0)),
            ],
            0x1008,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);

    let blocks = state.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);
    let addrs: Vec<u64> = blocks[0]
        .symbolic_instrs
        .iter()
        .map(|instr| instr.instr_addr)
        .collect();
    assert_eq!(addrs, vec![0x1000, 0x1004]);

    let load = &blocks[0].symbolic_instrs[1];
    assert!(load.has_memory_dep);
    assert_eq!(load.memory_value.address, 0x6000);
    assert_eq!(load.memory_value.size, 8);
    assert_eq!(load.memory_value.bytes(), &[0xab; 8]);

    // After commit the written range is symbolic and reported by sync.
    let updates = state.sync();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].address, 0x6000);
    assert_eq!(updates[0].length, 8);
}

#[test]
fn symbolic_exit_guard_stops_before_the_branch() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                put(16, constant(7)),
                IrStmt::Exit {
                    guard: IrExpr::get(40, 1),
                    dst: 0x3000,
                    jump_kind: JumpKind::Boring,
                },
            ],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([40]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::SymbolicBlockExitStmt);
    assert!(state.blocks_with_symbolic_instrs().is_empty());
    assert!(state.sync().is_empty());
}

#[test]
fn unsupported_statement_stops_at_its_instruction() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 8)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                put(16, IrExpr::get(24, 8)),
                imark(0x1004),
                IrStmt::Cas {
                    addr: IrExpr::get(32, 8),
                    expected: IrExpr::RdTmp(0),
                    data: IrExpr::RdTmp(1),
                    old: 2,
                },
            ],
            0x1008,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::UnsupportedStmtCas);
    assert_eq!(state.stop_details().block_addr, 0x1000);
    assert!(state.blocks_with_symbolic_instrs().is_empty());
}

#[test]
fn step_budget_stops_normally() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4), ScriptedBlock::new(0x2000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(0x1000, boring_block(vec![imark(0x1000)], 0x2000));
    lifter.insert(0x2000, boring_block(vec![imark(0x2000)], 0x3000));

    let mut state = test_state(engine, lifter);
    state.set_tracking(true, false);
    state.start(0x1000, 1).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);
    assert_eq!(state.stop_details().block_addr, 0x2000);
    assert_eq!(state.bbl_addrs(), &[0x1000]);
}

#[test]
fn stop_points_halt_the_run() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4), ScriptedBlock::new(0x2000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(0x1000, boring_block(vec![imark(0x1000)], 0x2000));
    lifter.insert(0x2000, boring_block(vec![imark(0x2000)], 0x3000));

    let mut state = test_state(engine, lifter);
    state.set_stops([0x2000]);
    state.start(0x1000, 16).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Stoppoint);
    assert_eq!(state.stop_details().block_addr, 0x2000);
}

#[test]
fn lift_failure_stops_without_details() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.fail_at(
        0x1000,
        vex_ir::Error::LiftFailed {
            addr: 0x1000,
            message: std::borrow::Cow::Borrowed("unhandled encoding"),
        },
    );

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::VexLiftFailed);
    assert!(state.blocks_with_symbolic_instrs().is_empty());
}

#[test]
fn undecodable_block_stops_with_nodecode() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.fail_at(0x1000, vex_ir::Error::NoDecode(0x1000));

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Nodecode);
}

#[test]
fn symbolic_value_written_to_pc_stops() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(vec![imark(0x1000), put(PC_OFFSET, IrExpr::get(24, 8))], 0x1004),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::SymbolicPc);
}

#[test]
fn store_through_symbolic_address_stops() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                IrStmt::Store {
                    addr: IrExpr::get(24, 8),
                    data: constant(1),
                },
            ],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::SymbolicWriteAddr);
}

#[test]
fn second_read_for_one_instruction_stops() {
    let mut engine = TestEngine::new();
    engine.write_memory(0x5000, &[0x22; 8]);
    engine.script = vec![ScriptedBlock::with_events(
        0x1000,
        4,
        vec![
            Event::Read { addr: 0x5000, size: 8 },
            Event::Read { addr: 0x5000, size: 8 },
        ],
    )];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![imark(0x1000), wrtmp(0, IrExpr::load(constant(0x5000), 8))],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::MultipleMemoryReads);
}

#[test]
fn blacklisted_registers_carry_no_taint() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(vec![imark(0x1000), put(16, IrExpr::get(48, 8))], 0x1004),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([48]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);
    assert!(state.blocks_with_symbolic_instrs().is_empty());
}

#[test]
fn sub_register_reads_fold_to_their_full_register() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        // Offset 17 is a sub-register of 16.
        boring_block(vec![imark(0x1000), put(32, IrExpr::get(17, 1))], 0x1004),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([16]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);
    assert_eq!(state.blocks_with_symbolic_instrs().len(), 1);
    assert!(state.get_symbolic_registers().contains(&32));
}

#[test]
fn slice_pulls_in_concrete_producers_and_snapshots() {
    let mut engine = TestEngine::new();
    // Engine register 7 backs lifter offset 64.
    engine.set_reg_u64(7, 0xdead);
    engine.script = vec![ScriptedBlock::new(0x1000, 8)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                put(32, IrExpr::binop(BinOp::Add, IrExpr::get(64, 8), constant(1))),
                imark(0x1004),
                put(16, IrExpr::binop(BinOp::Add, IrExpr::get(24, 8), IrExpr::get(32, 8))),
            ],
            0x1008,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);

    let blocks = state.blocks_with_symbolic_instrs();
    assert_eq!(blocks.len(), 1);

    // The flagged instruction drags its concrete producer along.
    let addrs: Vec<u64> = blocks[0]
        .symbolic_instrs
        .iter()
        .map(|instr| instr.instr_addr)
        .collect();
    assert_eq!(addrs, vec![0x1000, 0x1004]);

    // The producer's input has no in-block producer of its own, so its
    // block-entry value is snapshotted exactly once.
    assert_eq!(blocks[0].register_values.len(), 1);
    assert_eq!(blocks[0].register_values[0].offset, 64);
    assert_eq!(blocks[0].register_values[0].value[..8], 0xdeadu64.to_le_bytes());
}

#[test]
fn guard_turned_symbolic_by_parked_block_stops_at_next_boundary() {
    let mut engine = TestEngine::new();
    engine.script = vec![ScriptedBlock::new(0x1000, 8), ScriptedBlock::new(0x2000, 4)];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                put(40, IrExpr::get(24, 8)),
                IrStmt::Exit {
                    guard: IrExpr::get(40, 1),
                    dst: 0x3000,
                    jump_kind: JumpKind::Boring,
                },
                // A load the engine never performs keeps propagation
                // parked, so the guard is only judged at the next block.
                imark(0x1004),
                wrtmp(0, IrExpr::load(IrExpr::get(16, 8), 8)),
            ],
            0x2000,
        ),
    );
    lifter.insert(0x2000, boring_block(vec![imark(0x2000)], 0x2004));

    let mut state = test_state(engine, lifter);
    state.symbolic_register_data([24]);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::SymbolicCondition);
    assert_eq!(state.stop_details().block_addr, 0x2000);
}

#[test]
fn unmatched_syscall_stops_and_rolls_back() {
    let mut engine = TestEngine::new();
    engine.write_memory(0x6000, &[1, 2, 3, 4, 5, 6, 7, 8]);
    engine.script = vec![ScriptedBlock::with_events(
        0x1000,
        4,
        vec![
            Event::Write { addr: 0x6000, bytes: vec![0xff; 8] },
            Event::Interrupt { intno: 0x80 },
        ],
    )];

    let mut lifter = TestLifter::new();
    lifter.insert(
        0x1000,
        boring_block(
            vec![
                imark(0x1000),
                IrStmt::Store {
                    addr: constant(0x6000),
                    data: constant(0x0102030405060708),
                },
            ],
            0x1004,
        ),
    );

    let mut state = test_state(engine, lifter);
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Syscall);
    assert_eq!(state.syscall_count(), 1);
    assert!(state.sync().is_empty(), "in-flight writes rolled back");

    // The engine memory was restored to its pre-block contents.
    let mut restored = [0u8; 8];
    state.engine_mut().mem_read(0x6000, &mut restored).unwrap();
    assert_eq!(restored, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn bound_transmit_syscall_is_captured_and_handled() {
    use concolic_taint::state::TransmitDescriptor;

    let mut engine = TestEngine::new();
    engine.set_reg_u64(5, 2); // syscall number
    engine.set_reg_u64(6, 0x7000); // buffer
    engine.set_reg_u64(7, 4); // count
    engine.write_memory(0x7000, b"ping");
    engine.script = vec![ScriptedBlock::with_events(
        0x1000,
        4,
        vec![Event::Interrupt { intno: 0x80 }],
    )];

    let mut lifter = TestLifter::new();
    lifter.insert(0x1000, boring_block(vec![imark(0x1000)], 0x1004));

    let mut state = test_state(engine, lifter);
    state.set_transmit_descriptor(Some(TransmitDescriptor {
        sysno: 2,
        bbl_addr: 0x1000,
        num_reg: 5,
        buf_reg: 6,
        count_reg: 7,
    }));
    state.start(0x1000, 4).unwrap();

    assert_eq!(state.stop_details().reason, StopReason::Normal);
    assert!(state.is_interrupt_handled());
    assert_eq!(state.syscall_count(), 1);

    let records = state.process_transmit(4);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, b"ping");
    assert_eq!(records[0].count, 4);
}

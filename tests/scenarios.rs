//! End to end allocation runs over small control flow graphs, checking
//! the rewritten instruction streams rather than allocator internals.

use lsra::ir::{Function, InstData, InstKind, Operand, OperandVisitor, ValueKind};
use lsra::regalloc::Context;
use lsra::reginfo::RegInfo;
use lsra::AllocError;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// All operands of all instructions left in the function, in layout
/// order.
fn all_operands(func: &mut Function) -> Vec<Operand> {
    struct Collect(Vec<Operand>);
    impl OperandVisitor for Collect {
        fn visit_input(&mut self, op: &mut Operand) {
            self.0.push(*op);
        }
        fn visit_use(&mut self, op: &mut Operand) {
            self.0.push(*op);
        }
        fn visit_temp(&mut self, op: &mut Operand) {
            self.0.push(*op);
        }
        fn visit_def(&mut self, op: &mut Operand) {
            self.0.push(*op);
        }
        fn visit_state(&mut self, op: &mut Operand) {
            self.0.push(*op);
        }
    }
    let mut collect = Collect(Vec::new());
    for bi in 0..func.layout.len() {
        let block = func.layout[bi];
        for ii in 0..func.blocks[block].insts.len() {
            let inst = func.blocks[block].insts[ii];
            func.insts[inst].visit_operands(&mut collect);
        }
    }
    collect.0
}

fn assert_fully_assigned(func: &mut Function) {
    for op in all_operands(func) {
        assert!(!op.is_virt(), "operand {} was not rewritten", op);
    }
}

/// Moves in `block` that write a spill slot.
fn stores_in(func: &Function, block: lsra::ir::Block) -> usize {
    func.blocks[block]
        .insts
        .iter()
        .filter(|&&i| matches!(&func.insts[i].kind, InstKind::Move { dst, .. } if dst.is_slot()))
        .count()
}

#[test]
fn sequential_values_share_one_register() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let v1 = func.new_value(ValueKind::Int);
    let v2 = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()]));
    func.push_inst(b0, InstData::op(&[v0.into()], &[v1.into()]));
    func.push_inst(b0, InstData::op(&[v1.into()], &[v2.into()]));
    func.push_inst(b0, InstData::ret(Some(v2.into())));

    let reginfo = RegInfo::new(1).with_int(&[0]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    assert_eq!(frame.frame_words(), 0);
    assert_fully_assigned(&mut func);
    // each value dies as its successor is defined, so one register
    // carries all of them
    let regs: Vec<Operand> = all_operands(&mut func)
        .into_iter()
        .filter(|op| op.is_reg())
        .collect();
    assert!(!regs.is_empty());
    assert!(regs.iter().all(|&r| r == regs[0]));
    // no moves were inserted
    assert_eq!(func.blocks[b0].insts.len(), 4);
}

#[test]
fn pressure_is_resolved_by_splitting_not_by_failing() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let v1 = func.new_value(ValueKind::Int);
    let v2 = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
    func.push_inst(b0, InstData::op(&[], &[v1.into()])); // id 2
    func.push_inst(b0, InstData::op(&[], &[v2.into()])); // id 4
    func.push_inst(b0, InstData::op(&[v0.into()], &[])); // id 6
    func.push_inst(b0, InstData::op(&[v1.into()], &[])); // id 8
    func.push_inst(b0, InstData::op(&[v2.into()], &[])); // id 10
    func.push_inst(b0, InstData::ret(None)); // id 12

    let reginfo = RegInfo::new(2).with_int(&[0, 1]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    // three values are live across id 4 with two registers: one value
    // spends the gap between its definition and its use on the stack
    assert!(frame.frame_words() >= 1);
    assert_fully_assigned(&mut func);
    let stores = func.blocks[b0]
        .insts
        .iter()
        .filter(|&&i| matches!(&func.insts[i].kind, InstKind::Move { dst, .. } if dst.is_slot()))
        .count();
    let reloads = func.blocks[b0]
        .insts
        .iter()
        .filter(|&&i| matches!(&func.insts[i].kind, InstKind::Move { src, .. } if src.is_slot()))
        .count();
    assert_eq!(stores, 1);
    assert_eq!(reloads, 1);
}

#[test]
fn two_overlapping_values_fit_one_register() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let v1 = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
    func.push_inst(b0, InstData::op(&[], &[v1.into()])); // id 2
    func.push_inst(b0, InstData::op(&[v1.into()], &[])); // id 4
    func.push_inst(b0, InstData::op(&[v0.into()], &[])); // id 6
    func.push_inst(b0, InstData::ret(None)); // id 8

    let reginfo = RegInfo::new(1).with_int(&[0]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    // v0 and v1 overlap, but v0 has no use while v1 lives, so it waits
    // on the stack instead of exhausting the register file
    assert!(frame.frame_words() >= 1);
    assert_fully_assigned(&mut func);
    // the reload reads the same slot the store wrote
    let mut store_dst = None;
    let mut reload_src = None;
    for &i in &func.blocks[b0].insts {
        if let InstKind::Move { src, dst } = &func.insts[i].kind {
            if dst.is_slot() {
                store_dst = Some(*dst);
            }
            if src.is_slot() {
                reload_src = Some(*src);
            }
        }
    }
    let store_dst = store_dst.expect("a spill store was inserted");
    let reload_src = reload_src.expect("a reload was inserted");
    assert_eq!(store_dst, reload_src);
}

#[test]
fn loop_spill_store_stays_out_of_the_loop() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let b1 = func.create_block(); // loop header and body
    let b2 = func.create_block(); // latch
    let b3 = func.create_block(); // exit
    let v0 = func.new_value(ValueKind::Int);
    let vc = func.new_value(ValueKind::Int);
    let va = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
    func.push_inst(b0, InstData::op(&[], &[vc.into()])); // id 2
    func.push_inst(b0, InstData::jump(b1)); // id 4
    func.push_inst(b1, InstData::op(&[], &[va.into()])); // id 6
    func.push_inst(b1, InstData::op(&[va.into()], &[])); // id 8
    func.push_inst(b1, InstData::branch(vc.into(), &[b2, b3])); // id 10
    func.push_inst(b2, InstData::jump(b1)); // id 12
    func.push_inst(b3, InstData::op(&[v0.into()], &[])); // id 14
    func.push_inst(b3, InstData::ret(None)); // id 16

    let reginfo = RegInfo::new(2).with_int(&[0, 1]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    // v0 loses its register to the loop-local va and crosses the loop on
    // the stack
    assert_eq!(frame.frame_words(), 1);
    assert_fully_assigned(&mut func);
    // the store is executed once, before the loop, not per iteration
    assert_eq!(stores_in(&func, b0), 1);
    assert_eq!(stores_in(&func, b1), 0);
    assert_eq!(stores_in(&func, b2), 0);
    assert_eq!(stores_in(&func, b3), 0);
    // the loop body holds no moves at all
    assert!(func.blocks[b1]
        .insts
        .iter()
        .all(|&i| !matches!(&func.insts[i].kind, InstKind::Move { .. })));
    // the value is reloaded into a register before its use after the loop
    match &func.insts[func.blocks[b3].insts[0]].kind {
        InstKind::Move { src, dst } => {
            assert!(src.is_slot());
            assert!(dst.is_reg());
        }
        other => panic!("expected a reload at the loop exit, found {:?}", other),
    }
}

#[test]
fn value_live_across_a_call_is_spilled_on_that_path_only() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let b1 = func.create_block(); // calls
    let b2 = func.create_block(); // does not
    let b3 = func.create_block(); // join
    let v0 = func.new_value(ValueKind::Int);
    let vc = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
    func.push_inst(b0, InstData::op(&[], &[vc.into()])); // id 2
    func.push_inst(b0, InstData::branch(vc.into(), &[b1, b2])); // id 4
    func.push_inst(b1, InstData::call(&[], None)); // id 6
    func.push_inst(b1, InstData::jump(b3)); // id 8
    func.push_inst(b2, InstData::jump(b3)); // id 10
    func.push_inst(b3, InstData::op(&[v0.into()], &[])); // id 12
    func.push_inst(b3, InstData::ret(None)); // id 14

    // every allocatable register dies at a call
    let reginfo = RegInfo::new(2).with_int(&[0, 1]).with_caller_saved(&[0, 1]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    assert_eq!(frame.frame_words(), 1);
    assert_fully_assigned(&mut func);
    // the calling path parks the value around the call and reloads it
    // before the join
    assert_eq!(stores_in(&func, b1), 1);
    assert!(func.blocks[b1]
        .insts
        .iter()
        .any(|&i| matches!(&func.insts[i].kind, InstKind::Move { src, .. } if src.is_slot())));
    // the call-free path is left alone
    assert_eq!(func.blocks[b2].insts.len(), 1);
    assert_eq!(stores_in(&func, b2), 0);
}

#[test]
fn rematerializable_constant_needs_no_stack_slot() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let va = func.new_value(ValueKind::Int);
    let vb = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::load_const(v0.into(), 7)); // id 0
    func.push_inst(b0, InstData::op(&[], &[va.into()])); // id 2
    func.push_inst(b0, InstData::op(&[], &[vb.into()])); // id 4
    func.push_inst(
        b0,
        InstData::op(&[va.into(), vb.into()], &[]).with_state(&[v0.into()]),
    ); // id 6
    func.push_inst(b0, InstData::ret(None)); // id 8

    let reginfo = RegInfo::new(2).with_int(&[0, 1]);
    let frame = Context::new().run(&mut func, &reginfo).unwrap();

    // the constant is evicted under pressure but reconstructed from its
    // value, so nothing touches the stack
    assert_eq!(frame.frame_words(), 0);
    assert_fully_assigned(&mut func);
    assert_eq!(func.blocks[b0].insts.len(), 5);
    let state_op = func.insts[func.blocks[b0].insts[3]].state[0];
    assert_eq!(state_op, Operand::Const(7));
}

#[test]
fn use_without_definition_is_reported_by_name() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::ret(Some(v0.into())));

    let reginfo = RegInfo::new(2).with_int(&[0, 1]);
    let err = Context::new().run(&mut func, &reginfo).unwrap_err();
    assert!(matches!(err, AllocError::UseBeforeDef { .. }));
    assert!(err.to_string().contains("v0"));
}

#[test]
fn impossible_pressure_is_a_clean_error() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let v1 = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()]));
    func.push_inst(b0, InstData::op(&[], &[v1.into()]));
    // both values are forced into registers at the same instruction
    func.push_inst(b0, InstData::op(&[v0.into(), v1.into()], &[]));
    func.push_inst(b0, InstData::ret(None));

    let reginfo = RegInfo::new(1).with_int(&[0]);
    let err = Context::new().run(&mut func, &reginfo).unwrap_err();
    assert!(matches!(err, AllocError::OutOfRegisters { .. }));
}

#[test]
fn optimizing_walk_produces_a_complete_assignment() {
    init_logging();
    let mut func = Function::new();
    let b0 = func.create_block();
    let b1 = func.create_block();
    let b2 = func.create_block();
    let b3 = func.create_block();
    let v0 = func.new_value(ValueKind::Int);
    let vc = func.new_value(ValueKind::Int);
    func.push_inst(b0, InstData::op(&[], &[v0.into()]));
    func.push_inst(b0, InstData::op(&[], &[vc.into()]));
    func.push_inst(b0, InstData::branch(vc.into(), &[b1, b2]));
    func.push_inst(b1, InstData::call(&[], None));
    func.push_inst(b1, InstData::jump(b3));
    func.push_inst(b2, InstData::jump(b3));
    func.push_inst(b3, InstData::op(&[v0.into()], &[]));
    func.push_inst(b3, InstData::ret(None));

    let reginfo = RegInfo::new(2).with_int(&[0, 1]).with_caller_saved(&[0, 1]);
    let frame = Context::new().run_optimizing(&mut func, &reginfo).unwrap();
    assert!(frame.frame_words() >= 1);
    assert_fully_assigned(&mut func);
}

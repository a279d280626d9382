//! 빌더 테스트

use super::*;
use crate::vm::bytecode::{Opcode as O, instructions};
use crate::vm::status::BuildErrorKind;

fn optimized() -> EngineConfig {
    EngineConfig::default()
}

fn unoptimized() -> EngineConfig {
    EngineConfig {
        optimize_bytecode: false,
        ..EngineConfig::default()
    }
}

fn ops(code: &[u32]) -> Vec<O> {
    instructions(code).map(|r| r.unwrap().1).collect()
}

// ========== PostProcess ==========

#[test]
fn test_unreachable_instructions_are_dropped() {
    let mut bc = ByteCode::new();
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.ret(0);
    bc.instr_w_dw(O::SetV4, 1, 2);
    bc.ret(0);

    let out = bc.finalize(&unoptimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::SetV4, O::CpyVtoR4, O::Ret]);
}

#[test]
fn test_largest_stack_is_tracked() {
    let mut bc = ByteCode::new();
    bc.instr_dw(O::PshC4, 1);
    bc.instr_dw(O::PshC4, 2);
    bc.instr_dw(O::PshC4, 3);
    bc.pop(3);
    bc.ret(0);

    let out = bc.finalize(&unoptimized()).unwrap();
    assert_eq!(out.largest_stack_used, 3);
}

#[test]
fn test_inconsistent_stack_depth_is_internal_error() {
    let mut bc = ByteCode::new();
    bc.instr_w(O::CpyVtoR4, 1);
    bc.jump(O::Jz, 1);
    bc.instr_dw(O::PshC4, 1);
    bc.label(1);
    bc.ret(0);

    let err = bc.finalize(&unoptimized()).unwrap_err();
    assert_eq!(err.kind, BuildErrorKind::Internal);
}

#[test]
fn test_unresolved_label_is_internal_error() {
    let mut bc = ByteCode::new();
    bc.jump(O::Jmp, 42);
    bc.ret(0);

    let err = bc.finalize(&optimized()).unwrap_err();
    assert_eq!(err.kind, BuildErrorKind::Internal);
    assert!(err.message.contains("42"));
}

// ========== ResolveJumpAddresses ==========

#[test]
fn test_jump_offsets_land_on_labels() {
    let mut bc = ByteCode::new();
    bc.label(0);
    bc.instr_w_dw(O::SetV4, 1, 0);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.jump(O::Jz, 1);
    bc.jump(O::Jmp, 0);
    bc.label(1);
    bc.ret(0);

    let out = bc.finalize(&unoptimized()).unwrap();
    assert_eq!(out.label_positions, vec![0, 7]);

    let jumps: Vec<_> = instructions(&out.code)
        .map(|r| r.unwrap())
        .filter(|(_, op, _)| op.is_jump())
        .collect();
    assert_eq!(jumps.len(), 2);
    assert_eq!(jumps[0].2.int(), 2);
    assert_eq!(jumps[1].2.int(), -7);
    for (ip, op, args) in jumps {
        let target = ip as i64 + op.size() as i64 + args.int() as i64;
        assert!(out.label_positions.contains(&(target as u32)));
    }
}

#[test]
fn test_append_keeps_labels_apart() {
    let mut a = ByteCode::new();
    a.instr_w(O::CpyVtoR4, 1);
    a.jump(O::Jz, 0);
    a.instr_w_dw(O::SetV4, 1, 1);
    a.label(0);

    let mut b = ByteCode::new();
    b.instr_w(O::CpyVtoR4, 2);
    b.jump(O::Jz, 0);
    b.instr_w_dw(O::SetV4, 2, 1);
    b.label(0);
    b.ret(0);

    a.append(b);
    let out = a.finalize(&unoptimized()).unwrap();
    assert_eq!(out.label_positions, vec![5, 10]);
}

// ========== ExtractLineNumbers ==========

#[test]
fn test_line_markers_become_suspend_points() {
    let mut bc = ByteCode::new();
    bc.line(3, 1);
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.line(4, 2);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::Suspend, O::SetV4, O::Suspend, O::Ret]);
    assert_eq!(
        out.line_numbers,
        vec![
            LineEntry {
                offset: 0,
                packed: pack_line(3, 1)
            },
            LineEntry {
                offset: 3,
                packed: pack_line(4, 2)
            },
        ]
    );
}

#[test]
fn test_line_markers_are_stripped_without_line_cues() {
    let mut bc = ByteCode::new();
    bc.line(3, 1);
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.line(4, 2);
    bc.ret(0);

    let config = EngineConfig {
        build_without_line_cues: true,
        ..EngineConfig::default()
    };
    let out = bc.finalize(&config).unwrap();
    assert_eq!(ops(&out.code), vec![O::SetV4, O::Ret]);
    let offsets: Vec<u32> = out.line_numbers.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![0, 2]);
}

// ========== Optimize ==========

#[test]
fn test_dead_temporary_write_is_removed() {
    let mut bc = ByteCode::new();
    bc.define_temporary(2);
    bc.instr_w_dw(O::SetV4, 2, 7);
    bc.instr_w_dw(O::SetV4, 1, 5);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::SetV4, O::CpyVtoR4, O::Ret]);
}

#[test]
fn test_non_temporary_write_is_kept() {
    let mut bc = ByteCode::new();
    bc.instr_w_dw(O::SetV4, 2, 7);
    bc.instr_w_dw(O::SetV4, 1, 5);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::SetV4, O::SetV4, O::CpyVtoR4, O::Ret]);
}

#[test]
fn test_write_read_on_one_branch_is_kept() {
    let mut bc = ByteCode::new();
    bc.define_temporary(2);
    bc.instr_w_dw(O::SetV4, 2, 7);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.jump(O::Jz, 10);
    bc.instr_w(O::CpyVtoR4, 2);
    bc.label(10);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(
        ops(&out.code),
        vec![O::SetV4, O::CpyVtoR4, O::Jz, O::CpyVtoR4, O::Ret]
    );
}

#[test]
fn test_constant_is_folded_into_arithmetic() {
    let mut bc = ByteCode::new();
    bc.define_temporary(3);
    bc.instr_w_int(O::SetV4, 3, 10);
    bc.instr_www(O::AddI, 1, 1, 3);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    let decoded: Vec<_> = instructions(&out.code).map(|r| r.unwrap()).collect();
    assert_eq!(decoded[0].1, O::AddIi);
    assert_eq!(decoded[0].2.w[0], 1);
    assert_eq!(decoded[0].2.w[1], 1);
    assert_eq!(decoded[0].2.int(), 10);
    assert_eq!(decoded.len(), 3);
}

#[test]
fn test_constant_is_forwarded_into_push() {
    let mut bc = ByteCode::new();
    bc.define_temporary(3);
    bc.instr_w_int(O::SetV4, 3, 99);
    bc.instr_w(O::PshV4, 3);
    bc.call(O::CallSys, 0, 1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::PshC4, O::CallSys, O::Ret]);
}

#[test]
fn test_test_and_branch_are_fused() {
    let mut bc = ByteCode::new();
    bc.instr_w(O::CpyVtoR4, 1);
    bc.instr(O::Tz);
    bc.jump(O::Jnz, 5);
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.label(5);
    bc.instr_w(O::CpyVtoR4, 1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(
        ops(&out.code),
        vec![O::CpyVtoR4, O::Jz, O::SetV4, O::CpyVtoR4, O::Ret]
    );
}

#[test]
fn test_test_is_kept_when_register_is_returned() {
    let mut bc = ByteCode::new();
    bc.instr_w(O::CpyVtoR4, 1);
    bc.instr(O::Tz);
    bc.jump(O::Jnz, 5);
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.label(5);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(
        ops(&out.code),
        vec![O::CpyVtoR4, O::Tz, O::Jnz, O::SetV4, O::Ret]
    );
}

#[test]
fn test_push_and_pop_are_merged() {
    let mut bc = ByteCode::new();
    bc.push(2);
    bc.push(3);
    bc.pop(1);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    let decoded: Vec<_> = instructions(&out.code).map(|r| r.unwrap()).collect();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].1, O::Push);
    assert_eq!(decoded[0].2.w[0], 4);
}

#[test]
fn test_pop_then_push_is_kept() {
    let mut bc = ByteCode::new();
    bc.instr_dw(O::PshC4, 5);
    bc.pop(1);
    bc.push(1);
    bc.instr(O::PopRPtr);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(
        ops(&out.code),
        vec![O::PshC4, O::Pop, O::Push, O::PopRPtr, O::Ret]
    );
}

#[test]
fn test_swap_of_simple_pushes_is_reordered() {
    let mut bc = ByteCode::new();
    bc.instr_dw(O::PshC4, 1);
    bc.instr_w(O::PshV4, 1);
    bc.instr(O::Swap);
    bc.call(O::CallSys, 0, 2);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::PshV4, O::PshC4, O::CallSys, O::Ret]);
}

#[test]
fn test_jump_to_next_label_is_removed() {
    let mut bc = ByteCode::new();
    bc.instr_w_dw(O::SetV4, 1, 1);
    bc.jump(O::Jmp, 3);
    bc.label(3);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::SetV4, O::Ret]);
}

#[test]
fn test_duplicate_suspends_are_merged() {
    let mut bc = ByteCode::new();
    bc.instr(O::Suspend);
    bc.instr(O::Suspend);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    assert_eq!(ops(&out.code), vec![O::Suspend, O::Ret]);
}

#[test]
fn test_jump_table_survives_optimization() {
    let mut bc = ByteCode::new();
    bc.jump_table(1, &[0, 1]);
    bc.label(0);
    bc.instr_w_dw(O::SetV4, 2, 10);
    bc.jump(O::Jmp, 2);
    bc.label(1);
    bc.instr_w_dw(O::SetV4, 2, 20);
    bc.label(2);
    bc.instr_w(O::CpyVtoR4, 2);
    bc.ret(0);

    let out = bc.finalize(&optimized()).unwrap();
    let listing = ops(&out.code);
    assert_eq!(&listing[..3], &[O::JmpP, O::Jmp, O::Jmp]);
}

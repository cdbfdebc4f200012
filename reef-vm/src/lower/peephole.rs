//! Mandatory post-lowering peephole passes.
//!
//! Two rewrites run over every lowered function, then a compaction pass
//! squeezes out the tombstones and rewrites branch targets so that every
//! target lands on a surviving instruction exactly.

use reef_asm::{RegInstr, RegOp};

/// `CONST32 t, imm; OP t', a, t` collapses into the immediate-operand form
/// of the operation, deleting the constant. Only stack temporaries fuse;
/// a local's register may be read again on other paths.
pub(super) fn fuse_const_binops(code: &mut [RegInstr], local_count: usize) {
    for i in 1..code.len() {
        let prev = code[i - 1];
        if prev.op != RegOp::Const32 || (prev.rd as usize) < local_count {
            continue;
        }
        let cur = code[i];
        let Some(imm_form) = cur.op.imm_form() else { continue };
        if cur.rs2() != prev.rd || cur.rs1 == prev.rd {
            continue;
        }
        code[i] = RegInstr { op: imm_form, rd: cur.rd, rs1: cur.rs1, operand: prev.operand };
        code[i - 1] = RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 };
    }
}

/// `OP t, …; MOV l, t` where `t` is a temporary and `l` a local rewrites the
/// producer to target `l` directly and deletes the move. Skipped when the
/// move is a branch target, and for producers whose `rd` is not a plain
/// data result (stores, branches, returns, moves, memory ops, calls).
pub(super) fn propagate_copies(code: &mut [RegInstr], local_count: usize) {
    let targets = branch_targets(code);
    for i in 1..code.len() {
        let mov = code[i];
        if mov.op != RegOp::Mov
            || (mov.rd as usize) >= local_count
            || (mov.rs1 as usize) < local_count
            || targets.contains(&(i as u32))
        {
            continue;
        }
        let producer = code[i - 1];
        if producer.rd != mov.rs1 || !writes_plain_result(producer.op) {
            continue;
        }
        code[i - 1].rd = mov.rd;
        code[i] = RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 };
    }
}

/// Remove tombstones and rewrite every branch-target operand by the count
/// of deleted instructions before it.
pub(super) fn compact(code: &mut Vec<RegInstr>) {
    let mut deleted_before = Vec::with_capacity(code.len() + 1);
    let mut deleted = 0u32;
    for instr in code.iter() {
        deleted_before.push(deleted);
        if instr.op == RegOp::Nop {
            deleted += 1;
        }
    }
    deleted_before.push(deleted);

    let remap = |target: u32| -> u32 {
        let t = target as usize;
        target - deleted_before[t.min(deleted_before.len() - 1)]
    };

    // Rewrite targets in place, walking aux words with a cursor so call
    // argument maps are left alone.
    let mut i = 0;
    while i < code.len() {
        match code[i].op {
            RegOp::Br | RegOp::BrIf | RegOp::BrIfNot => {
                code[i].operand = remap(code[i].operand);
                i += 1;
            }
            RegOp::BrTable => {
                let count = code[i].operand as usize;
                for entry in 1..=count {
                    code[i + entry].operand = remap(code[i + entry].operand);
                }
                i += 1 + count;
            }
            RegOp::Call | RegOp::ReturnCall | RegOp::CallIndirect => {
                // Skip the argument map (and table-index) aux words.
                i += 1;
                while i < code.len() && code[i].op == RegOp::Aux {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    code.retain(|instr| instr.op != RegOp::Nop);
}

/// Branch-target PCs of the function, aux-aware.
fn branch_targets(code: &[RegInstr]) -> std::collections::HashSet<u32> {
    let mut targets = std::collections::HashSet::new();
    let mut i = 0;
    while i < code.len() {
        match code[i].op {
            RegOp::Br | RegOp::BrIf | RegOp::BrIfNot => {
                targets.insert(code[i].operand);
                i += 1;
            }
            RegOp::BrTable => {
                let count = code[i].operand as usize;
                for entry in 1..=count {
                    targets.insert(code[i + entry].operand);
                }
                i += 1 + count;
            }
            RegOp::Call | RegOp::ReturnCall | RegOp::CallIndirect => {
                i += 1;
                while i < code.len() && code[i].op == RegOp::Aux {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    targets
}

fn writes_plain_result(op: RegOp) -> bool {
    matches!(
        op,
        RegOp::Const32 | RegOp::Const64 | RegOp::GlobalGet | RegOp::Select
    ) || op as u16 >= RegOp::I32Add as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn const32(rd: u8, imm: u32) -> RegInstr {
        RegInstr { op: RegOp::Const32, rd, rs1: 0, operand: imm }
    }

    #[test]
    fn const_feed_becomes_immediate_form() {
        // locals: r0; temps from r1.
        let mut code = vec![
            const32(2, 7),
            RegInstr::rrr(RegOp::I32Add, 1, 0, 2),
            RegInstr { op: RegOp::Ret, rd: 1, rs1: 1, operand: 0 },
        ];
        fuse_const_binops(&mut code, 1);
        compact(&mut code);
        assert_eq!(code.len(), 2);
        assert_eq!(code[0].op, RegOp::I32AddImm);
        assert_eq!(code[0].operand, 7);
        assert_eq!(code[0].rs1, 0);
    }

    #[test]
    fn local_sourced_const_register_does_not_fuse() {
        // rd below local_count means the "constant" landed in a local.
        let mut code = vec![
            const32(0, 7),
            RegInstr::rrr(RegOp::I32Add, 1, 2, 0),
        ];
        fuse_const_binops(&mut code, 1);
        assert_eq!(code[0].op, RegOp::Const32);
    }

    #[test]
    fn copy_into_local_rewrites_producer() {
        let mut code = vec![
            RegInstr::rrr(RegOp::I32Mul, 3, 1, 2),
            RegInstr::rr(RegOp::Mov, 0, 3),
            RegInstr { op: RegOp::Ret, rd: 0, rs1: 0, operand: 0 },
        ];
        propagate_copies(&mut code, 3);
        compact(&mut code);
        assert_eq!(code.len(), 2);
        assert_eq!(code[0].op, RegOp::I32Mul);
        assert_eq!(code[0].rd, 0);
    }

    #[test]
    fn copy_at_branch_target_is_kept() {
        let mut code = vec![
            RegInstr { op: RegOp::Br, rd: 0, rs1: 0, operand: 2 },
            RegInstr::rrr(RegOp::I32Mul, 3, 1, 2),
            RegInstr::rr(RegOp::Mov, 0, 3),
        ];
        propagate_copies(&mut code, 3);
        assert_eq!(code[2].op, RegOp::Mov);
    }

    #[test]
    fn compaction_remaps_past_deleted_slots() {
        let mut code = vec![
            RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 },
            RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 },
            RegInstr { op: RegOp::Br, rd: 0, rs1: 0, operand: 4 },
            RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 },
            RegInstr { op: RegOp::Ret, rd: 0, rs1: 0, operand: 0 },
        ];
        compact(&mut code);
        assert_eq!(code.len(), 2);
        assert_eq!(code[0].op, RegOp::Br);
        assert_eq!(code[0].operand, 1);
    }

    #[test]
    fn call_arg_words_survive_compaction_untouched() {
        let args = RegInstr::pack_args(&[1, 2, 3, 4]);
        let mut code = vec![
            RegInstr { op: RegOp::Nop, rd: 0, rs1: 0, operand: 0 },
            RegInstr { op: RegOp::Call, rd: 5, rs1: 1, operand: 0 },
            RegInstr { op: RegOp::Aux, rd: 0, rs1: 0, operand: args },
            RegInstr { op: RegOp::Ret, rd: 1, rs1: 5, operand: 0 },
        ];
        compact(&mut code);
        assert_eq!(code.len(), 3);
        assert_eq!(code[1].operand, args);
    }
}

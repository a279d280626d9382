//! Peephole 옵티마이저
//!
//! 리스트를 한 번 훑으면서 현재 명령어와 바로 앞 명령어(들)를 보고 규칙을
//! 적용합니다. 규칙이 적용되면 두 명령어 뒤로 물러나서 다시 살펴봅니다.
//!
//! 값을 지우는 규칙은 모두 "그 값이 어떤 경로에서도 다시 읽히지 않는다"를
//! 경로 추적으로 확인한 뒤에만 적용됩니다. 등록된 임시 변수만 대상입니다.

use std::collections::HashSet;

use tracing::debug;

use super::ByteCode;
use crate::vm::bytecode::{InstrArgs, Opcode};

/// 스택에 셀 하나를 부수효과 없이 올리는 명령어
fn is_simple_push(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::PshC4 | Opcode::PshC8 | Opcode::PshV4 | Opcode::PshG4 | Opcode::PshNull
    )
}

fn jump_for_test(test: Opcode) -> Option<Opcode> {
    Some(match test {
        Opcode::Tz => Opcode::Jz,
        Opcode::Tnz => Opcode::Jnz,
        Opcode::Ts => Opcode::Js,
        Opcode::Tns => Opcode::Jns,
        Opcode::Tp => Opcode::Jp,
        Opcode::Tnp => Opcode::Jnp,
        _ => return None,
    })
}

fn negated_jump(op: Opcode) -> Opcode {
    match op {
        Opcode::Jz => Opcode::Jnz,
        Opcode::Jnz => Opcode::Jz,
        Opcode::Js => Opcode::Jns,
        Opcode::Jns => Opcode::Js,
        Opcode::Jp => Opcode::Jnp,
        Opcode::Jnp => Opcode::Jp,
        other => other,
    }
}

/// `SetV4 t, C` 뒤의 정수 연산을 즉치 연산으로
fn immediate_int_op(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::AddI => Some(Opcode::AddIi),
        Opcode::SubI => Some(Opcode::SubIi),
        Opcode::MulI => Some(Opcode::MulIi),
        _ => None,
    }
}

fn immediate_double_op(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::AddD => Some(Opcode::AddId),
        Opcode::SubD => Some(Opcode::SubId),
        Opcode::MulD => Some(Opcode::MulId),
        _ => None,
    }
}

fn is_commutative(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::AddI | Opcode::MulI | Opcode::AddD | Opcode::MulD
    )
}

impl ByteCode {
    fn reads_var(&self, idx: usize, var: i16) -> bool {
        let node = &self.nodes[idx];
        node.op
            .kind()
            .read_vars()
            .iter()
            .any(|&slot| node.args.w[slot] == var)
    }

    fn writes_var(&self, idx: usize, var: i16) -> bool {
        let node = &self.nodes[idx];
        node.op
            .kind()
            .written_var()
            .is_some_and(|slot| node.args.w[slot] == var)
    }

    /// `idx` 다음에 실행될 수 있는 명령어들. 알 수 없으면 `None`
    fn successors(&self, idx: usize) -> Option<Vec<usize>> {
        let node = &self.nodes[idx];
        let mut out = Vec::new();
        match node.op {
            Opcode::Ret => {}
            Opcode::JmpP => return None,
            Opcode::Jmp => out.push(self.find_label(self.label_of(idx), idx)?.0),
            op if op.is_conditional_jump() => {
                out.push(self.find_label(self.label_of(idx), idx)?.0);
                out.extend(node.next);
            }
            _ => out.extend(node.next),
        }
        Some(out)
    }

    /// 경로 추적: 시작점들에서 출발해 `visit`이 판정을 낼 때까지 따라감
    ///
    /// `visit`은 `Some(true)`(읽힘), `Some(false)`(이 경로는 끝), `None`(계속)을 돌려줍니다.
    fn any_path(&self, starts: Vec<usize>, visit: impl Fn(usize) -> Option<bool>) -> bool {
        let mut open = starts;
        let mut closed = HashSet::new();
        while let Some(start) = open.pop() {
            if !closed.insert(start) {
                continue;
            }
            let mut cur = Some(start);
            while let Some(i) = cur {
                match visit(i) {
                    Some(true) => return true,
                    Some(false) => break,
                    None => {}
                }
                let Some(next) = self.successors(i) else {
                    return true;
                };
                match next.as_slice() {
                    [] => break,
                    [only] if self.nodes[i].next == Some(*only) => cur = Some(*only),
                    _ => {
                        open.extend(next);
                        break;
                    }
                }
            }
        }
        false
    }

    /// `from` 이후 어떤 경로에서든 `var`가 덮어써지기 전에 읽히는지
    pub(crate) fn is_temp_var_read(&self, from: usize, var: i16) -> bool {
        let Some(starts) = self.successors(from) else {
            return true;
        };
        self.any_path(starts, |i| {
            if self.reads_var(i, var) {
                Some(true)
            } else if self.writes_var(i, var) {
                Some(false)
            } else {
                None
            }
        })
    }

    /// `from` 이후 어떤 경로에서든 레지스터 값이 쓰이는지
    pub(crate) fn is_temp_reg_used(&self, from: usize) -> bool {
        let Some(starts) = self.successors(from) else {
            return true;
        };
        self.any_path(starts, |i| {
            let op = self.nodes[i].op;
            if op.reads_register() {
                Some(true)
            } else if op.overwrites_register() {
                Some(false)
            } else {
                None
            }
        })
    }

    fn is_dead_temp(&self, after: usize, var: i16) -> bool {
        self.is_temporary(var) && !self.is_temp_var_read(after, var)
    }

    fn set(&mut self, idx: usize, op: Opcode, args: InstrArgs) {
        let node = &mut self.nodes[idx];
        node.op = op;
        node.args = args;
    }

    /// 재검사 시작점: `idx`에서 두 칸 뒤로
    fn go_back(&self, idx: Option<usize>) -> Option<usize> {
        let mut cur = idx;
        for _ in 0..2 {
            match cur.and_then(|i| self.nodes[i].prev) {
                Some(p) => cur = Some(p),
                None => break,
            }
        }
        cur.or(self.first)
    }

    pub(crate) fn optimize(&mut self) {
        let before = self.len();
        let mut cur = self.first;
        while let Some(i) = cur {
            match self.optimize_at(i) {
                Some(anchor) => cur = self.go_back(anchor),
                None => cur = self.nodes[i].next,
            }
        }
        debug!(before, after = self.len(), "peephole pass finished");
    }

    /// 규칙이 적용되면 살아있는 기준 노드(없으면 `Some(None)`)를 돌려줌
    fn optimize_at(&mut self, i: usize) -> Option<Option<usize>> {
        if let Some(anchor) = self.single_rules(i) {
            return Some(anchor);
        }
        let p = self.nodes[i].prev?;
        self.pair_rules(p, i)
    }

    fn live_anchor(&self, idx: usize) -> Option<usize> {
        let mut cur = Some(idx);
        while let Some(i) = cur {
            if self.nodes[i].live {
                return Some(i);
            }
            cur = self.nodes[i].prev;
        }
        None
    }

    fn remove_and_anchor(&mut self, idx: usize) -> Option<Option<usize>> {
        let anchor = self.nodes[idx].prev;
        self.remove(idx);
        Some(anchor.and_then(|a| self.live_anchor(a)))
    }

    fn single_rules(&mut self, i: usize) -> Option<Option<usize>> {
        let node = self.nodes[i].clone();

        // 읽히지 않는 임시 변수 쓰기
        if node.op.is_pure_write()
            && let Some(slot) = node.op.kind().written_var()
            && self.is_dead_temp(i, node.args.w[slot])
        {
            return self.remove_and_anchor(i);
        }

        // 크기 0인 Push/Pop
        if matches!(node.op, Opcode::Push | Opcode::Pop) && node.args.w[0] == 0 {
            return self.remove_and_anchor(i);
        }

        // 바로 뒤 레이블로 가는 Jmp (점프 테이블 항목은 제외)
        if node.op == Opcode::Jmp {
            let in_table = node
                .prev
                .is_some_and(|p| matches!(self.nodes[p].op, Opcode::Jmp | Opcode::JmpP));
            if !in_table {
                let label = self.label_of(i);
                let mut cur = node.next;
                while let Some(n) = cur {
                    if self.nodes[n].op != Opcode::Label {
                        break;
                    }
                    if self.label_of(n) == label {
                        return self.remove_and_anchor(i);
                    }
                    cur = self.nodes[n].next;
                }
            }
        }
        None
    }

    fn pair_rules(&mut self, p: usize, i: usize) -> Option<Option<usize>> {
        let prev = self.nodes[p].clone();
        let curr = self.nodes[i].clone();
        let anchor = Some(p);

        match (prev.op, curr.op) {
            (Opcode::Suspend, Opcode::Suspend) => return self.remove_and_anchor(i),
            (Opcode::Line, Opcode::Line) => return self.remove_and_anchor(p),

            // Pop 뒤의 Push는 빈 칸을 새로 만들므로 합치지 않음
            (Opcode::Push, Opcode::Push | Opcode::Pop) | (Opcode::Pop, Opcode::Pop) => {
                let net = prev.stack_inc + curr.stack_inc;
                let Ok(cells) = i16::try_from(net.abs()) else {
                    return None;
                };
                if net == 0 {
                    self.remove(i);
                    return self.remove_and_anchor(p);
                }
                let op = if net > 0 { Opcode::Push } else { Opcode::Pop };
                self.set(
                    p,
                    op,
                    InstrArgs {
                        w: [cells, 0, 0],
                        arg: 0,
                    },
                );
                self.nodes[p].stack_inc = net;
                self.remove(i);
                return Some(anchor);
            }

            // Ret이 프레임 전체를 해제하므로 직전 Pop은 불필요
            (Opcode::Pop, Opcode::Ret) => return self.remove_and_anchor(p),

            (Opcode::CpyRtoV4, Opcode::CpyVtoR4) if prev.args.w[0] == curr.args.w[0] => {
                return self.remove_and_anchor(i);
            }

            // 테스트 + 조건 점프 결합
            (test, Opcode::Jz | Opcode::Jnz) if jump_for_test(test).is_some() => {
                if self.is_temp_reg_used(i) {
                    return None;
                }
                let jump = jump_for_test(test)?;
                let fused = if curr.op == Opcode::Jnz {
                    jump
                } else {
                    negated_jump(jump)
                };
                self.nodes[i].op = fused;
                return self.remove_and_anchor(p);
            }
            _ => {}
        }

        if let Some(result) = self.constant_rules(p, i, &prev, &curr) {
            return Some(result);
        }

        // 생산자 + CpyVtoV4 x, t → 생산자가 x에 직접 씀
        if curr.op == Opcode::CpyVtoV4
            && prev.op.is_pure_write()
            && let Some(slot) = prev.op.kind().written_var()
        {
            let t = prev.args.w[slot];
            let x = curr.args.w[0];
            if curr.args.w[1] == t && x != t && self.is_dead_temp(i, t) {
                self.nodes[p].args.w[slot] = x;
                return self.remove_and_anchor(i);
            }
        }

        // 상수/변수 push 두 개 + Swap → 순서를 바꿔서 push
        if curr.op == Opcode::Swap
            && is_simple_push(prev.op)
            && let Some(pp) = prev.prev
            && is_simple_push(self.nodes[pp].op)
        {
            let first = self.nodes[pp].clone();
            self.set(pp, prev.op, prev.args);
            self.set(p, first.op, first.args);
            self.remove(i);
            return Some(self.nodes[pp].prev.and_then(|a| self.live_anchor(a)));
        }
        None
    }

    /// `SetV4`/`SetV8`/`CpyGtoV4` 상수 전달과 즉치 접기
    fn constant_rules(
        &mut self,
        p: usize,
        i: usize,
        prev: &super::Node,
        curr: &super::Node,
    ) -> Option<Option<usize>> {
        let t = prev.args.w[0];
        let constant = prev.args.arg;

        let rewritten = match (prev.op, curr.op) {
            (Opcode::SetV4, Opcode::CpyVtoV4) if curr.args.w[1] == t => Some((
                Opcode::SetV4,
                InstrArgs {
                    w: [curr.args.w[0], 0, 0],
                    arg: constant,
                },
            )),
            (Opcode::SetV4, Opcode::PshV4) if curr.args.w[0] == t => Some((
                Opcode::PshC4,
                InstrArgs {
                    w: [0; 3],
                    arg: constant,
                },
            )),
            (Opcode::SetV8, Opcode::PshV4) if curr.args.w[0] == t => Some((
                Opcode::PshC8,
                InstrArgs {
                    w: [0; 3],
                    arg: constant,
                },
            )),
            (Opcode::SetV4, Opcode::CpyVtoG4) if curr.args.w[1] == t => Some((
                Opcode::SetG4,
                InstrArgs {
                    w: [curr.args.w[0], 0, 0],
                    arg: constant,
                },
            )),
            (Opcode::CpyGtoV4, Opcode::PshV4) if curr.args.w[0] == t => Some((
                Opcode::PshG4,
                InstrArgs {
                    w: [prev.args.w[1], 0, 0],
                    arg: 0,
                },
            )),
            (Opcode::SetV4, op) => self.fold_immediate(op, curr, t, constant, false),
            (Opcode::SetV8, op) => self.fold_immediate(op, curr, t, constant, true),
            _ => None,
        };

        let (op, args) = rewritten?;
        self.set(i, op, args);
        if self.is_dead_temp(i, t) {
            return self.remove_and_anchor(p);
        }
        Some(Some(p))
    }

    fn fold_immediate(
        &self,
        op: Opcode,
        curr: &super::Node,
        t: i16,
        constant: u64,
        double: bool,
    ) -> Option<(Opcode, InstrArgs)> {
        let w = curr.args.w;
        let immediate = if double {
            immediate_double_op(op)
        } else {
            immediate_int_op(op)
        };
        if let Some(imm) = immediate {
            // 목적지, 나머지 피연산자
            if w[2] == t && w[1] != t {
                return Some((
                    imm,
                    InstrArgs {
                        w: [w[0], w[1], 0],
                        arg: constant,
                    },
                ));
            }
            if w[1] == t && w[2] != t && is_commutative(op) {
                return Some((
                    imm,
                    InstrArgs {
                        w: [w[0], w[2], 0],
                        arg: constant,
                    },
                ));
            }
            return None;
        }
        let cmp = match (op, double) {
            (Opcode::CmpI, false) => Opcode::CmpIi,
            (Opcode::CmpD, true) => Opcode::CmpId,
            _ => return None,
        };
        if w[1] == t && w[0] != t {
            return Some((
                cmp,
                InstrArgs {
                    w: [w[0], 0, 0],
                    arg: constant,
                },
            ));
        }
        None
    }
}

//! 명령어 리스트 빌더
//!
//! 프런트엔드가 만든 pseudo 명령어 스트림을 받아 최종 워드 배열로 바꿉니다.
//! 명령어들은 arena(`Vec<Node>`)에 저장되고 `prev`/`next` 인덱스로 연결되어
//! 있어서 삽입/삭제가 포인터 없이 가능합니다.
//!
//! `finalize()` 순서:
//! 1. PostProcess - 도달 가능한 경로를 따라 스택 깊이 기록, 도달 불가 명령어 제거
//! 2. Optimize - peephole 규칙 적용 (설정으로 끌 수 있음)
//! 3. ResolveJumpAddresses - 레이블 참조를 상대 워드 오프셋으로 치환
//! 4. ExtractLineNumbers - Line 마커를 오프셋→라인 테이블로 분리

mod optimizer;
mod postprocess;

#[cfg(test)]
mod tests;

use tracing::debug;

use crate::config::EngineConfig;
use crate::vm::bytecode::{InstrArgs, Opcode, StackInc, encode, pack_line};
use crate::vm::status::BuildError;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub op: Opcode,
    pub args: InstrArgs,
    pub stack_inc: i32,
    /// PostProcess가 기록한 이 명령어 직전의 스택 깊이
    pub stack_size: Option<i32>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub live: bool,
}

/// 바이트 오프셋 → 라인 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    /// [`pack_line`]으로 묶인 line/column
    pub packed: u32,
}

/// finalize 결과
#[derive(Debug, Clone, Default)]
pub struct FinalizedCode {
    pub code: Vec<u32>,
    pub largest_stack_used: u32,
    pub line_numbers: Vec<LineEntry>,
    /// 살아남은 레이블의 워드 위치
    pub label_positions: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ByteCode {
    nodes: Vec<Node>,
    first: Option<usize>,
    last: Option<usize>,
    temporaries: Vec<i16>,
    largest_stack_used: i32,
    line_cues: bool,
}

impl ByteCode {
    pub fn new() -> Self {
        Self {
            line_cues: true,
            ..Self::default()
        }
    }

    // ========== 리스트 조작 ==========

    fn add(&mut self, op: Opcode, args: InstrArgs, stack_inc: i32) -> i32 {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            op,
            args,
            stack_inc,
            stack_size: None,
            prev: self.last,
            next: None,
            live: true,
        });
        match self.last {
            Some(last) => self.nodes[last].next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);
        stack_inc
    }

    /// 리스트에서 떼어냄. 떼어낸 노드의 prev/next는 그대로 둡니다.
    pub(crate) fn remove(&mut self, idx: usize) {
        if !self.nodes[idx].live {
            return;
        }
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.last = prev,
        }
        self.nodes[idx].live = false;
    }

    /// 살아있는 노드 인덱스를 순서대로 나열
    pub(crate) fn indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.first;
        while let Some(i) = cur {
            out.push(i);
            cur = self.nodes[i].next;
        }
        out
    }

    /// 인코딩 크기. Line은 Suspend로 바뀌거나 사라짐
    pub(crate) fn node_size(&self, idx: usize) -> u32 {
        match self.nodes[idx].op {
            Opcode::Line if self.line_cues => Opcode::Suspend.size(),
            op => op.size(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// 살아있는 명령어의 (opcode, 인자) 목록
    pub fn instructions(&self) -> Vec<(Opcode, InstrArgs)> {
        self.indices()
            .into_iter()
            .map(|i| (self.nodes[i].op, self.nodes[i].args))
            .collect()
    }

    /// 피연산자 변환용 가변 순회 (링커가 섹션 로컬 인덱스를 바꿀 때 사용)
    pub fn for_each_instr_mut(&mut self, mut f: impl FnMut(Opcode, &mut InstrArgs)) {
        let mut cur = self.first;
        while let Some(i) = cur {
            let node = &mut self.nodes[i];
            f(node.op, &mut node.args);
            cur = node.next;
        }
    }

    pub fn temporaries(&self) -> &[i16] {
        &self.temporaries
    }

    pub(crate) fn is_temporary(&self, var: i16) -> bool {
        self.temporaries.contains(&var)
    }

    // ========== 명령어 생성 ==========

    fn fixed_inc(op: Opcode, args: &InstrArgs) -> i32 {
        match op.info().stack_inc {
            StackInc::Fixed(n) => n,
            StackInc::Variable => match op {
                Opcode::Push => args.w[0] as i32,
                Opcode::Pop => -(args.w[0] as i32),
                _ => 0,
            },
        }
    }

    /// 인자를 직접 지정해서 추가
    pub fn emit(&mut self, op: Opcode, args: InstrArgs) -> i32 {
        debug_assert!(!op.is_pseudo(), "pseudo instructions have dedicated emitters");
        let inc = Self::fixed_inc(op, &args);
        self.add(op, args, inc)
    }

    pub fn instr(&mut self, op: Opcode) -> i32 {
        self.emit(op, InstrArgs::default())
    }

    pub fn instr_w(&mut self, op: Opcode, w: i16) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [w, 0, 0],
                arg: 0,
            },
        )
    }

    pub fn instr_ww(&mut self, op: Opcode, a: i16, b: i16) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [a, b, 0],
                arg: 0,
            },
        )
    }

    pub fn instr_www(&mut self, op: Opcode, a: i16, b: i16, c: i16) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [a, b, c],
                arg: 0,
            },
        )
    }

    pub fn instr_dw(&mut self, op: Opcode, dw: u32) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [0; 3],
                arg: dw as u64,
            },
        )
    }

    pub fn instr_qw(&mut self, op: Opcode, qw: u64) -> i32 {
        self.emit(op, InstrArgs { w: [0; 3], arg: qw })
    }

    pub fn instr_w_dw(&mut self, op: Opcode, w: i16, dw: u32) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [w, 0, 0],
                arg: dw as u64,
            },
        )
    }

    pub fn instr_w_int(&mut self, op: Opcode, w: i16, value: i32) -> i32 {
        self.instr_w_dw(op, w, value as u32)
    }

    pub fn instr_w_qw(&mut self, op: Opcode, w: i16, qw: u64) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [w, 0, 0],
                arg: qw,
            },
        )
    }

    pub fn instr_w_double(&mut self, op: Opcode, w: i16, value: f64) -> i32 {
        self.instr_w_qw(op, w, value.to_bits())
    }

    pub fn instr_ww_dw(&mut self, op: Opcode, a: i16, b: i16, dw: u32) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [a, b, 0],
                arg: dw as u64,
            },
        )
    }

    pub fn instr_ww_qw(&mut self, op: Opcode, a: i16, b: i16, qw: u64) -> i32 {
        self.emit(
            op,
            InstrArgs {
                w: [a, b, 0],
                arg: qw,
            },
        )
    }

    /// 타입 인자를 가지는 명령어 (`Alloc`, `FreeV`)
    pub fn instr_w_ptr(&mut self, op: Opcode, w: i16, ptr: u64) -> i32 {
        self.instr_w_qw(op, w, ptr)
    }

    pub fn push(&mut self, cells: i16) -> i32 {
        self.instr_w(Opcode::Push, cells)
    }

    pub fn pop(&mut self, cells: i16) -> i32 {
        self.instr_w(Opcode::Pop, cells)
    }

    /// 레이블로 점프. `JmpP`는 [`Self::jump_table`]을 쓰세요.
    pub fn jump(&mut self, op: Opcode, label: i32) -> i32 {
        debug_assert!(op.is_jump());
        self.add(
            op,
            InstrArgs {
                w: [0; 3],
                arg: label as u32 as u64,
            },
            0,
        )
    }

    /// `JmpP var, n` 뒤에 레이블 n개로 가는 `Jmp` 테이블
    pub fn jump_table(&mut self, var: i16, labels: &[i32]) -> i32 {
        self.add(
            Opcode::JmpP,
            InstrArgs {
                w: [var, 0, 0],
                arg: labels.len() as u64,
            },
            0,
        );
        for &label in labels {
            self.jump(Opcode::Jmp, label);
        }
        0
    }

    /// 호출. `pop`은 호출이 끝난 뒤 스택에서 사라지는 인자 셀 수
    pub fn call(&mut self, op: Opcode, id: u32, pop: i32) -> i32 {
        debug_assert!(matches!(op, Opcode::Call | Opcode::CallSys | Opcode::CallBnd));
        self.add(
            op,
            InstrArgs {
                w: [0; 3],
                arg: id as u64,
            },
            -pop,
        )
    }

    pub fn ret(&mut self, pop: i16) -> i32 {
        self.instr_w(Opcode::Ret, pop)
    }

    pub fn label(&mut self, label: i32) {
        self.add(
            Opcode::Label,
            InstrArgs {
                w: [0; 3],
                arg: label as u32 as u64,
            },
            0,
        );
    }

    pub fn line(&mut self, line: u32, column: u32) {
        self.add(
            Opcode::Line,
            InstrArgs {
                w: [0; 3],
                arg: pack_line(line, column) as u64,
            },
            0,
        );
    }

    /// 옵티마이저가 자유롭게 다룰 수 있는 임시 변수로 등록
    pub fn define_temporary(&mut self, var: i16) {
        if !self.temporaries.contains(&var) {
            self.temporaries.push(var);
        }
    }

    fn max_label(&self) -> Option<i32> {
        self.indices()
            .into_iter()
            .filter(|&i| self.nodes[i].op == Opcode::Label || self.nodes[i].op.is_jump())
            .map(|i| self.nodes[i].args.arg as u32 as i32)
            .max()
    }

    /// 다른 리스트를 뒤에 이어붙임. 레이블 번호는 겹치지 않게 옮겨집니다.
    pub fn append(&mut self, other: ByteCode) {
        let shift = self.max_label().map_or(0, |m| m + 1);
        for var in other.temporaries.iter().copied() {
            self.define_temporary(var);
        }
        let mut cur = other.first;
        while let Some(i) = cur {
            let node = &other.nodes[i];
            let mut args = node.args;
            if node.op == Opcode::Label || node.op.is_jump() {
                let label = args.arg as u32 as i32 + shift;
                args.arg = label as u32 as u64;
            }
            self.add(node.op, args, node.stack_inc);
            cur = node.next;
        }
    }

    // ========== 최종화 ==========

    pub fn finalize(mut self, config: &EngineConfig) -> Result<FinalizedCode, BuildError> {
        self.line_cues = !config.build_without_line_cues;
        let before = self.len();

        self.post_process()?;
        if config.optimize_bytecode {
            self.optimize();
        }
        let label_positions = self.resolve_jump_addresses()?;
        let line_numbers = self.extract_line_numbers();
        let code = self.output();

        debug!(
            instructions_in = before,
            words_out = code.len(),
            largest_stack = self.largest_stack_used,
            lines = line_numbers.len(),
            "finalized bytecode"
        );

        Ok(FinalizedCode {
            code,
            largest_stack_used: self.largest_stack_used.max(0) as u32,
            line_numbers,
            label_positions,
        })
    }

    /// 워드 배열로 평탄화. Label은 크기가 0이라 버려집니다.
    fn output(&self) -> Vec<u32> {
        let mut code = Vec::new();
        for i in self.indices() {
            let node = &self.nodes[i];
            if node.op.is_pseudo() {
                continue;
            }
            encode(node.op, &node.args, &mut code);
        }
        code
    }
}

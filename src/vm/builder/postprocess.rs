//! PostProcess / ResolveJumpAddresses / ExtractLineNumbers

use tracing::error;

use super::{ByteCode, LineEntry};
use crate::vm::bytecode::Opcode;
use crate::vm::status::{BuildError, BuildErrorKind};

fn internal(message: String) -> BuildError {
    error!(%message, "bytecode consistency failure");
    BuildError::new(BuildErrorKind::Internal, message)
}

impl ByteCode {
    pub(crate) fn label_of(&self, idx: usize) -> i32 {
        self.nodes[idx].args.arg as u32 as i32
    }

    /// 레이블 위치 탐색: `from`에서 앞으로 먼저, 없으면 뒤로
    ///
    /// 반환값은 (레이블 노드, `from` 명령어 끝에서 레이블까지의 워드 오프셋)
    pub(crate) fn find_label(&self, label: i32, from: usize) -> Option<(usize, i32)> {
        let mut offset = 0i32;
        let mut cur = self.nodes[from].next;
        while let Some(i) = cur {
            if self.nodes[i].op == Opcode::Label && self.label_of(i) == label {
                return Some((i, offset));
            }
            offset += self.node_size(i) as i32;
            cur = self.nodes[i].next;
        }

        let mut offset = -(self.node_size(from) as i32);
        let mut cur = self.nodes[from].prev;
        while let Some(i) = cur {
            if self.nodes[i].op == Opcode::Label && self.label_of(i) == label {
                return Some((i, offset));
            }
            offset -= self.node_size(i) as i32;
            cur = self.nodes[i].prev;
        }
        None
    }

    /// `JmpP` 뒤에 이어지는 점프 테이블 항목들
    pub(crate) fn jump_table_entries(&self, idx: usize) -> Result<Vec<usize>, BuildError> {
        let count = self.nodes[idx].args.arg as usize;
        let mut entries = Vec::with_capacity(count);
        let mut cur = self.nodes[idx].next;
        while entries.len() < count {
            let Some(i) = cur else {
                return Err(internal(format!("jump table at {idx} is cut short")));
            };
            match self.nodes[i].op {
                Opcode::Jmp => entries.push(i),
                op => {
                    return Err(internal(format!(
                        "jump table at {idx} contains {op} instead of Jmp"
                    )));
                }
            }
            cur = self.nodes[i].next;
        }
        Ok(entries)
    }

    /// 도달 가능한 모든 경로를 따라 스택 깊이를 기록하고 도달 불가 명령어를 제거
    pub(crate) fn post_process(&mut self) -> Result<(), BuildError> {
        for node in &mut self.nodes {
            node.stack_size = None;
        }
        let Some(first) = self.first else {
            self.largest_stack_used = 0;
            return Ok(());
        };

        let mut largest = 0i32;
        let mut paths = vec![(first, 0i32)];
        while let Some((start, mut depth)) = paths.pop() {
            let mut cur = Some(start);
            while let Some(i) = cur {
                match self.nodes[i].stack_size {
                    Some(seen) if seen == depth => break,
                    Some(seen) => {
                        return Err(internal(format!(
                            "inconsistent stack depth at instruction {i}: {seen} vs {depth}"
                        )));
                    }
                    None => {}
                }
                self.nodes[i].stack_size = Some(depth);
                largest = largest.max(depth);
                depth += self.nodes[i].stack_inc;
                if depth < 0 {
                    return Err(internal(format!("stack underflow after instruction {i}")));
                }
                largest = largest.max(depth);

                let op = self.nodes[i].op;
                if op.is_jump() {
                    let label = self.label_of(i);
                    let (target, _) = self
                        .find_label(label, i)
                        .ok_or_else(|| internal(format!("unresolved label {label}")))?;
                    paths.push((target, depth));
                    if op == Opcode::Jmp {
                        break;
                    }
                } else if op == Opcode::JmpP {
                    for entry in self.jump_table_entries(i)? {
                        paths.push((entry, depth));
                    }
                    break;
                } else if op == Opcode::Ret {
                    break;
                }
                cur = self.nodes[i].next;
            }
        }

        let mut removed = 0usize;
        for i in self.indices() {
            if self.nodes[i].stack_size.is_none() {
                self.remove(i);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "dropped unreachable instructions");
        }
        self.largest_stack_used = largest;
        Ok(())
    }

    /// 레이블 참조를 상대 오프셋으로 바꾸고 레이블 위치 목록을 돌려줌
    pub(crate) fn resolve_jump_addresses(&mut self) -> Result<Vec<u32>, BuildError> {
        let mut positions = Vec::new();
        let mut pos = 0u32;
        for i in self.indices() {
            let op = self.nodes[i].op;
            if op == Opcode::Label {
                positions.push(pos);
            } else if op.is_jump() {
                let label = self.label_of(i);
                let (_, offset) = self
                    .find_label(label, i)
                    .ok_or_else(|| internal(format!("unresolved label {label}")))?;
                self.nodes[i].args.arg = offset as u32 as u64;
            }
            pos += self.node_size(i);
        }
        Ok(positions)
    }

    /// Line 마커를 테이블로 옮김. 라인 큐가 켜져 있으면 마커는 Suspend가 됩니다.
    pub(crate) fn extract_line_numbers(&mut self) -> Vec<LineEntry> {
        let mut entries = Vec::new();
        let mut pos = 0u32;
        for i in self.indices() {
            if self.nodes[i].op == Opcode::Line {
                entries.push(LineEntry {
                    offset: pos,
                    packed: self.nodes[i].args.arg as u32,
                });
                if self.line_cues {
                    self.nodes[i].op = Opcode::Suspend;
                    self.nodes[i].args = Default::default();
                } else {
                    self.remove(i);
                    continue;
                }
            }
            pos += self.node_size(i);
        }
        entries
    }
}

// 스택 블록, 변수 접근, 호출/반환

use std::sync::Arc;

use tracing::debug;

use super::{Active, CallState, Context, VmErrorKind, VmResult, err};
use crate::vm::bytecode::RESERVE_STACK;
use crate::vm::function::ScriptFunction;
use crate::vm::module::{GlobalRef, Module, ModuleCode};
use crate::vm::value::Value;

impl Context {
    // ========== 셀 접근 ==========

    fn block(&self) -> VmResult<&Vec<Value>> {
        self.stack
            .get(self.stack_index)
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, "no stack block"))
    }

    fn block_mut(&mut self) -> VmResult<&mut Vec<Value>> {
        self.stack
            .get_mut(self.stack_index)
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, "no stack block"))
    }

    fn var_index(&self, var: i16) -> VmResult<usize> {
        let index = self.fp as isize - var as isize;
        if index < 0 || index as usize >= self.block()?.len() {
            return Err(err(
                VmErrorKind::InvalidOperand,
                format!("variable {var} outside the stack block"),
            ));
        }
        Ok(index as usize)
    }

    pub(super) fn var(&self, var: i16) -> VmResult<&Value> {
        let index = self.var_index(var)?;
        Ok(&self.block()?[index])
    }

    pub(super) fn var_mut(&mut self, var: i16) -> VmResult<&mut Value> {
        let index = self.var_index(var)?;
        Ok(&mut self.block_mut()?[index])
    }

    /// 변수에 값을 쓰고 이전 값을 해제
    pub(super) fn set_var(&mut self, var: i16, value: Value) -> VmResult<()> {
        let old = std::mem::replace(self.var_mut(var)?, value);
        drop(old);
        Ok(())
    }

    pub(super) fn cell(&self, index: usize) -> VmResult<&Value> {
        self.block()?
            .get(index)
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("stack cell {index} out of range")))
    }

    pub(super) fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp == 0 {
            return Err(err(VmErrorKind::StackOverflow, "evaluation stack exhausted"));
        }
        self.sp -= 1;
        let sp = self.sp;
        let old = std::mem::replace(&mut self.block_mut()?[sp], value);
        drop(old);
        Ok(())
    }

    pub(super) fn pop(&mut self) -> VmResult<Value> {
        let sp = self.sp;
        let value = self
            .block_mut()?
            .get_mut(sp)
            .map(Value::take)
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, "evaluation stack underflow"))?;
        self.sp += 1;
        Ok(value)
    }

    /// `count`개의 빈 셀 확보
    pub(super) fn reserve_cells(&mut self, count: usize) -> VmResult<()> {
        for _ in 0..count {
            self.push(Value::NULL)?;
        }
        Ok(())
    }

    /// 위에서부터 `count`개 셀을 해제
    pub(super) fn release_cells(&mut self, count: usize) -> VmResult<()> {
        for _ in 0..count {
            drop(self.pop()?);
        }
        Ok(())
    }

    pub(super) fn swap_top(&mut self) -> VmResult<()> {
        let sp = self.sp;
        let block = self.block_mut()?;
        if sp + 1 >= block.len() {
            return Err(err(VmErrorKind::InvalidOperand, "swap needs two stack cells"));
        }
        block.swap(sp, sp + 1);
        Ok(())
    }

    // ========== 전역 변수 ==========

    fn global_ref(&self, index: i16) -> VmResult<(GlobalRef, Arc<Module>)> {
        let active = self.active()?;
        let global = active
            .code
            .global_refs
            .get(index as u16 as usize)
            .copied()
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("global {index} out of range")))?;
        Ok((global, active.module.clone()))
    }

    pub(super) fn read_global(&self, index: i16) -> VmResult<Value> {
        let value = match self.global_ref(index)? {
            (GlobalRef::Module(i), module) => module.global_value(i as usize),
            (GlobalRef::Engine(i), _) => self.engine.global_property(i),
        };
        value.ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("global {index} is missing")))
    }

    pub(super) fn write_global(&self, index: i16, value: Value) -> VmResult<()> {
        let stored = match self.global_ref(index)? {
            (GlobalRef::Module(i), module) => module.set_global_value(i as usize, value),
            (GlobalRef::Engine(i), _) => self.engine.set_global_property(i, value).is_ok(),
        };
        if stored {
            Ok(())
        } else {
            Err(err(VmErrorKind::InvalidOperand, format!("global {index} is missing")))
        }
    }

    pub(super) fn active(&self) -> VmResult<&Active> {
        self.current
            .as_ref()
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, "no active function"))
    }

    // ========== 호출/반환 ==========

    /// 스크립트 함수 호출. 인자는 이미 `sp`부터 놓여 있습니다.
    ///
    /// 남은 블록이 부족하면 더 큰 블록을 만들고 인자를 옮깁니다. 최대
    /// 크기를 넘으면 아무것도 바꾸지 않고 StackOverflow를 냅니다.
    pub(super) fn call_script(
        &mut self,
        function: Arc<ScriptFunction>,
        module: Arc<Module>,
        code: Arc<ModuleCode>,
    ) -> VmResult<()> {
        let config = self.engine.config();
        let max_depth = config.max_call_depth as usize;
        if max_depth > 0 && self.call_stack.len() + 2 > max_depth {
            return Err(err(
                VmErrorKind::StackOverflow,
                format!("call depth exceeds {max_depth}"),
            ));
        }

        let params = function.param_count();
        let needed = function.stack_needed as usize + RESERVE_STACK as usize;
        let (stack_index, fp) = if self.sp >= needed {
            (self.stack_index, self.sp)
        } else {
            self.grow_stack(needed, params)?
        };

        let caller = self
            .current
            .take()
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, "no active function"))?;
        self.call_stack.push(CallState {
            active: caller,
            ip: self.ip,
            fp: self.fp,
            sp: self.sp,
            stack_index: self.stack_index,
        });

        self.stack_index = stack_index;
        self.fp = fp;
        self.sp = fp - function.variable_space as usize;
        self.ip = 0;
        for var in 1..=function.variable_space as i16 {
            self.set_var(var, Value::NULL)?;
        }
        self.current = Some(Active {
            function,
            module,
            code,
        });
        Ok(())
    }

    /// 다음 블록을 준비하고 인자를 그 끝으로 옮김. (블록 인덱스, 새 fp)
    fn grow_stack(&mut self, needed: usize, params: usize) -> VmResult<(usize, usize)> {
        let config = self.engine.config();
        let next = self.stack_index + 1;
        let reusable = self
            .stack
            .get(next)
            .is_some_and(|block| block.len() >= needed + params);

        if !reusable {
            let initial = config.initial_stack_size() as usize;
            let geometric = u32::try_from(next)
                .ok()
                .and_then(|shift| initial.checked_shl(shift))
                .unwrap_or(usize::MAX);
            let size = geometric.max(needed + params);
            let used: usize = self.stack[..next].iter().map(Vec::len).sum();
            let maximum = config.maximum_context_stack_size as usize;
            if maximum > 0 && used.saturating_add(size) > maximum {
                let fits = maximum.saturating_sub(used);
                if fits < needed + params {
                    return Err(err(
                        VmErrorKind::StackOverflow,
                        format!("stack would exceed {maximum} words"),
                    ));
                }
                self.stack.truncate(next);
                self.stack.push(vec![Value::NULL; fits]);
            } else {
                self.stack.truncate(next);
                self.stack.push(vec![Value::NULL; size]);
            }
            debug!(block = next, size = self.stack[next].len(), "stack block allocated");
        }

        let size = self.stack[next].len();
        let fp = size - params;
        for i in 0..params {
            let value = self.cell(self.sp + i)?.clone();
            let sp = self.sp;
            if let Some(cell) = self.block_mut()?.get_mut(sp + i) {
                *cell = Value::NULL;
            }
            self.stack[next][fp + i] = value;
        }
        Ok((next, fp))
    }

    /// 프레임 정리 후 호출자로 복귀. 가장 바깥 함수면 `true`
    pub(super) fn return_from(&mut self, pop: usize) -> VmResult<bool> {
        let (sp, end) = (self.sp, self.fp + pop);
        let block = self.block_mut()?;
        let end = end.min(block.len());
        for cell in block.iter_mut().take(end).skip(sp) {
            drop(cell.take());
        }

        match self.call_stack.pop() {
            None => {
                self.current = None;
                self.sp = end;
                Ok(true)
            }
            Some(frame) => {
                self.current = Some(frame.active);
                self.ip = frame.ip;
                self.fp = frame.fp;
                self.sp = frame.sp + pop;
                self.stack_index = frame.stack_index;
                Ok(false)
            }
        }
    }
}

// 예외 기록과 호출 스택 해제

use tracing::debug;

use super::{Context, ExceptionInfo, VmError};
use crate::vm::function::ScriptFunction;

impl Context {
    /// 예외 정보를 기록하고 콜백을 부른 뒤 스택을 해제
    pub(super) fn raise(&mut self, error: VmError) {
        let info = match self.current.as_ref() {
            Some(active) => {
                let (line, column) = active.function.line_number(self.instr_start);
                ExceptionInfo {
                    kind: error.kind,
                    message: error.message,
                    function: Some(active.function.id),
                    function_name: active.function.name().to_string(),
                    module: active.module.name().to_string(),
                    line,
                    column,
                }
            }
            None => ExceptionInfo {
                kind: error.kind,
                message: error.message,
                function: None,
                function_name: String::new(),
                module: String::new(),
                line: 0,
                column: 0,
            },
        };
        debug!(
            kind = %info.kind,
            function = %info.function_name,
            line = info.line,
            message = %info.message,
            "script exception"
        );

        if let Some(mut callback) = self.exception_callback.take() {
            callback(&info);
            self.exception_callback = Some(callback);
        }
        self.exception = Some(info);
        self.unwind();
    }

    /// 안쪽 프레임부터 객체 지역 변수와 by-value 객체 인자를 해제하고
    /// 남은 셀, 레지스터, 호출 스택을 비움
    pub(super) fn unwind(&mut self) {
        if let Some(active) = self.current.take() {
            self.clean_frame(&active.function, self.fp, self.stack_index);
        }
        while let Some(frame) = self.call_stack.pop() {
            self.clean_frame(&frame.active.function, frame.fp, frame.stack_index);
        }
        for block in &mut self.stack {
            for cell in block.iter_mut() {
                drop(cell.take());
            }
        }
        drop(self.register.take());
        self.register_type = None;
    }

    fn clean_frame(&mut self, function: &ScriptFunction, fp: usize, stack_index: usize) {
        let Some(block) = self.stack.get_mut(stack_index) else {
            return;
        };
        let mut release = |index: isize| {
            if index >= 0
                && let Some(cell) = block.get_mut(index as usize)
            {
                drop(cell.take());
            }
        };
        for var in &function.object_vars {
            release(fp as isize - var.offset as isize);
        }
        for (i, ty) in function.signature.params.iter().enumerate() {
            if ty.is_object() && !ty.is_reference {
                release(fp as isize + i as isize);
            }
        }
    }
}


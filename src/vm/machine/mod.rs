// machine 모듈 - 실행 컨텍스트
//
// 레지스터 하나와 아래로 자라는 스택을 가진 인터프리터입니다.
// 프레임 레이아웃 (fp 기준 변수 오프셋 v는 셀 fp - v):
//
//   fp + 1, fp + 0   인자 (오프셋 -1, 0)
//   fp - 1 ..        지역 변수 (오프셋 1..=variable_space)
//   sp               평가 스택 top (push하면 감소)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::vm::bytecode::RESERVE_STACK;
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionId, ScriptFunction};
use crate::vm::module::{Module, ModuleCode};
use crate::vm::status::{CallResult, ContextState, ExecutionState, ReturnCode};
use crate::vm::type_def::{DataType, TypeId, TypeKind};
use crate::vm::value::{ObjectHandle, Value};

mod instruction;
mod stack;
mod unwind;


pub use instruction::ExecutionFlow;

// ========== 타입 정의 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum VmErrorKind {
    DivideByZero,
    NullPointerAccess,
    StackOverflow,
    InvalidOpcode,
    InvalidOperand,
    HostException,
    UnboundFunction,
    NoStringFactory,
}

#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
}

pub type VmResult<T> = Result<T, VmError>;

/// VmError 생성 헬퍼 함수
pub fn err(kind: VmErrorKind, message: impl Into<String>) -> VmError {
    VmError {
        kind,
        message: message.into(),
    }
}

/// 다른 스레드에서 보내는 중단 요청
#[derive(Debug, Default)]
pub struct ContextControl {
    suspend: AtomicBool,
    abort: AtomicBool,
}

/// 실행 중인 컨텍스트에 suspend/abort를 요청하는 핸들 (`Send + Sync`)
#[derive(Debug, Clone)]
pub struct ContextHandle {
    control: Arc<ContextControl>,
}

impl ContextHandle {
    /// 다음 suspend 지점에서 멈춤
    pub fn suspend(&self) {
        self.control.suspend.store(true, Ordering::Release);
    }

    /// 다음 suspend 지점에서 전체 호출 스택을 해제하고 Aborted로 끝냄
    pub fn abort(&self) {
        self.control.abort.store(true, Ordering::Release);
    }
}

/// 라인 콜백 인자
#[derive(Debug, Clone, Copy)]
pub struct LineInfo<'a> {
    pub module: &'a str,
    pub function: FunctionId,
    pub function_name: &'a str,
    pub line: u32,
    pub column: u32,
}

/// 처리되지 않은 스크립트 예외
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub kind: VmErrorKind,
    pub message: String,
    pub function: Option<FunctionId>,
    pub function_name: String,
    pub module: String,
    pub line: u32,
    pub column: u32,
}

pub type LineCallback = Box<dyn FnMut(&LineInfo<'_>) + Send>;
pub type ExceptionCallback = Box<dyn FnMut(&ExceptionInfo) + Send>;

/// 실행 중인 함수
#[derive(Debug, Clone)]
pub(crate) struct Active {
    pub function: Arc<ScriptFunction>,
    pub module: Arc<Module>,
    pub code: Arc<ModuleCode>,
}

/// 호출 스택에 저장된 호출자 프레임
#[derive(Debug)]
pub(crate) struct CallState {
    pub active: Active,
    pub ip: usize,
    pub fp: usize,
    pub sp: usize,
    pub stack_index: usize,
}

pub struct Context {
    engine: Arc<Engine>,
    control: Arc<ContextControl>,
    state: ContextState,

    initial: Option<Active>,
    current: Option<Active>,
    ip: usize,
    fp: usize,
    sp: usize,
    stack_index: usize,
    /// 실행 중인 명령어의 시작 위치 (예외 라인 계산용)
    instr_start: usize,
    /// 첫 인자가 놓인 블록 0의 셀
    arg_base: usize,

    stack: Vec<Vec<Value>>,
    call_stack: Vec<CallState>,

    register: Value,
    register_type: Option<TypeId>,

    exception: Option<ExceptionInfo>,
    line_callback: Option<LineCallback>,
    exception_callback: Option<ExceptionCallback>,

    /// prepare 중인 모듈 (컨텍스트 참조 카운트를 가짐)
    module_ref: Option<Arc<Module>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("ip", &self.ip)
            .field("fp", &self.fp)
            .field("sp", &self.sp)
            .field("depth", &self.callstack_size())
            .finish()
    }
}

// ========== 컨텍스트 구현 ==========

impl Context {
    pub fn new(engine: &Arc<Engine>) -> Self {
        Self {
            engine: engine.clone(),
            control: Arc::new(ContextControl::default()),
            state: ContextState::Uninitialized,
            initial: None,
            current: None,
            ip: 0,
            fp: 0,
            sp: 0,
            stack_index: 0,
            instr_start: 0,
            arg_base: 0,
            stack: Vec::new(),
            call_stack: Vec::new(),
            register: Value::NULL,
            register_type: None,
            exception: None,
            line_callback: None,
            exception_callback: None,
            module_ref: None,
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            control: self.control.clone(),
        }
    }

    pub fn set_line_callback(&mut self, callback: impl FnMut(&LineInfo<'_>) + Send + 'static) {
        self.line_callback = Some(Box::new(callback));
    }

    pub fn clear_line_callback(&mut self) {
        self.line_callback = None;
    }

    pub fn set_exception_callback(
        &mut self,
        callback: impl FnMut(&ExceptionInfo) + Send + 'static,
    ) {
        self.exception_callback = Some(Box::new(callback));
    }

    pub fn clear_exception_callback(&mut self) {
        self.exception_callback = None;
    }

    // ========== Prepare ==========

    /// 함수를 호출할 준비. `None`이면 직전에 준비한 함수를 다시 씀
    pub fn prepare(&mut self, function: Option<FunctionId>) -> CallResult<()> {
        if matches!(self.state, ContextState::Active | ContextState::Suspended) {
            return Err(ReturnCode::ContextActive);
        }
        let (module, function) = match function {
            Some(id) => self.engine.function(id).ok_or(ReturnCode::NoFunction)?,
            None => {
                let initial = self.initial.as_ref().ok_or(ReturnCode::NoFunction)?;
                (initial.module.clone(), initial.function.clone())
            }
        };
        self.prepare_script(module, function)
    }

    pub(crate) fn prepare_script(
        &mut self,
        module: Arc<Module>,
        function: Arc<ScriptFunction>,
    ) -> CallResult<()> {
        if matches!(self.state, ContextState::Active | ContextState::Suspended) {
            return Err(ReturnCode::ContextActive);
        }

        let config = self.engine.config();
        let params = function.param_count();
        let needed = function.stack_needed as usize + RESERVE_STACK as usize + params;
        let maximum = config.maximum_context_stack_size as usize;
        if maximum > 0 && needed > maximum {
            return Err(ReturnCode::OutOfMemory);
        }
        let size = needed.max(config.initial_stack_size() as usize);

        self.reset();
        self.module_ref = Some(module.clone());
        module.add_context_ref();

        self.stack.push(vec![Value::NULL; size]);
        self.stack_index = 0;
        self.fp = size - params;
        self.sp = self.fp - function.variable_space as usize;
        self.arg_base = self.fp;
        self.ip = 0;

        let code = module.code();
        self.initial = Some(Active {
            function,
            module,
            code,
        });
        self.control.suspend.store(false, Ordering::Release);
        self.control.abort.store(false, Ordering::Release);
        self.state = ContextState::Prepared;
        Ok(())
    }

    /// 준비 상태를 버리고 모듈 참조를 놓음
    pub fn unprepare(&mut self) -> CallResult<()> {
        if matches!(self.state, ContextState::Active | ContextState::Suspended) {
            return Err(ReturnCode::ContextActive);
        }
        self.reset();
        self.initial = None;
        self.state = ContextState::Uninitialized;
        Ok(())
    }

    fn reset(&mut self) {
        self.unwind();
        self.stack.clear();
        self.exception = None;
        self.current = None;
        self.release_module_ref();
    }

    fn release_module_ref(&mut self) {
        if let Some(module) = self.module_ref.take()
            && module.release_context_ref()
            && module.is_discarded()
        {
            self.engine.garbage_collect_modules();
        }
    }

    // ========== 인자 ==========

    fn param_type(&self, index: usize) -> CallResult<DataType> {
        if self.state != ContextState::Prepared {
            return Err(ReturnCode::ContextNotPrepared);
        }
        let initial = self.initial.as_ref().ok_or(ReturnCode::ContextNotPrepared)?;
        initial
            .function
            .signature
            .params
            .get(index)
            .copied()
            .ok_or(ReturnCode::InvalidArg)
    }

    fn store_arg(&mut self, index: usize, value: Value) -> CallResult<()> {
        let slot = self
            .stack
            .first_mut()
            .and_then(|block| block.get_mut(self.arg_base + index))
            .ok_or(ReturnCode::InvalidArg)?;
        *slot = value;
        Ok(())
    }

    fn set_arg_scalar(&mut self, index: usize, bytes: usize, bits: u64) -> CallResult<()> {
        let ty = self.param_type(index)?;
        if ty.is_object() || ty.is_reference || ty.size_in_bytes() != bytes {
            return Err(ReturnCode::InvalidType);
        }
        self.store_arg(index, Value::Scalar(bits))
    }

    pub fn set_arg_byte(&mut self, index: usize, value: u8) -> CallResult<()> {
        self.set_arg_scalar(index, 1, value as u64)
    }

    pub fn set_arg_word(&mut self, index: usize, value: u16) -> CallResult<()> {
        self.set_arg_scalar(index, 2, value as u64)
    }

    pub fn set_arg_dword(&mut self, index: usize, value: u32) -> CallResult<()> {
        self.set_arg_scalar(index, 4, value as u64)
    }

    pub fn set_arg_qword(&mut self, index: usize, value: u64) -> CallResult<()> {
        self.set_arg_scalar(index, 8, value)
    }

    pub fn set_arg_float(&mut self, index: usize, value: f32) -> CallResult<()> {
        if self.param_type(index)?.kind != TypeKind::Float {
            return Err(ReturnCode::InvalidType);
        }
        self.set_arg_scalar(index, 4, value.to_bits() as u64)
    }

    pub fn set_arg_double(&mut self, index: usize, value: f64) -> CallResult<()> {
        if self.param_type(index)?.kind != TypeKind::Double {
            return Err(ReturnCode::InvalidType);
        }
        self.set_arg_scalar(index, 8, value.to_bits())
    }

    /// 객체 인자. 참조 인자는 빌려주고, 핸들은 참조를 하나 더 얻고,
    /// by-value 인자는 깊은 복사본을 넘깁니다.
    pub fn set_arg_object(&mut self, index: usize, object: Option<ObjectHandle>) -> CallResult<()> {
        let ty = self.param_type(index)?;
        let Some(expected) = ty.object_type() else {
            return Err(ReturnCode::InvalidType);
        };
        let value = match object {
            None => Value::NULL,
            Some(obj) if obj.type_id() != expected => return Err(ReturnCode::InvalidType),
            Some(obj) if ty.is_reference => Value::Owned(obj).borrow_ref(),
            Some(obj) if ty.is_handle() => Value::Owned(obj),
            Some(obj) => Value::Owned(obj.deep_copy()),
        };
        self.store_arg(index, value)
    }

    /// 준비된 함수의 인자 값
    pub fn arg(&self, index: usize) -> Option<Value> {
        let initial = self.initial.as_ref()?;
        if index >= initial.function.param_count() {
            return None;
        }
        self.stack
            .first()?
            .get(self.arg_base + index)
            .map(Value::share)
    }

    // ========== Execute ==========

    pub fn execute(&mut self) -> CallResult<ExecutionState> {
        match self.state {
            ContextState::Prepared => {
                let initial = self.initial.clone().ok_or(ReturnCode::ContextNotPrepared)?;
                self.current = Some(initial);
                self.ip = 0;
            }
            ContextState::Suspended => {}
            _ => return Err(ReturnCode::ContextNotPrepared),
        }
        self.state = ContextState::Active;
        self.control.suspend.store(false, Ordering::Release);

        let state = if self.control.abort.swap(false, Ordering::AcqRel) {
            self.unwind();
            ExecutionState::Aborted
        } else {
            match self.run() {
                Ok(ExecutionState::Aborted) => {
                    self.unwind();
                    ExecutionState::Aborted
                }
                Ok(state) => state,
                Err(e) => {
                    self.raise(e);
                    ExecutionState::Exception
                }
            }
        };
        self.state = state.into();
        Ok(state)
    }

    /// 일시 정지된 컨텍스트를 해제 (실행 중이면 [`ContextHandle::abort`] 사용)
    pub fn abort(&mut self) -> CallResult<()> {
        match self.state {
            ContextState::Prepared | ContextState::Suspended => {
                self.unwind();
                self.state = ContextState::Aborted;
                Ok(())
            }
            ContextState::Uninitialized => Err(ReturnCode::ContextNotPrepared),
            _ => Ok(()),
        }
    }

    /// 현재 스레드에서 suspend 요청
    pub fn suspend(&self) {
        self.control.suspend.store(true, Ordering::Release);
    }

    /// 가장 바깥 함수가 돌아올 때까지, 또는 멈출 이유가 생길 때까지 실행
    fn run(&mut self) -> VmResult<ExecutionState> {
        loop {
            let Some(function) = self.current.as_ref().map(|a| a.function.clone()) else {
                return Ok(ExecutionState::Finished);
            };
            let code = function.code.as_slice();
            loop {
                self.instr_start = self.ip;
                let (op, args) =
                    crate::vm::bytecode::decode(code, self.ip).map_err(|fault| {
                        err(
                            VmErrorKind::InvalidOpcode,
                            format!("bad instruction at {}: {fault:?}", self.ip),
                        )
                    })?;
                self.ip += op.size() as usize;
                match self.execute_instruction(op, &args)? {
                    ExecutionFlow::Continue => {}
                    ExecutionFlow::FrameChanged => break,
                    ExecutionFlow::Stop(state) => return Ok(state),
                }
            }
        }
    }

    /// suspend 지점에서 요청 확인
    fn check_control(&self) -> Option<ExecutionState> {
        if self.control.abort.swap(false, Ordering::AcqRel) {
            debug!("abort requested");
            return Some(ExecutionState::Aborted);
        }
        if self.control.suspend.swap(false, Ordering::AcqRel) {
            tracing::trace!(ip = self.ip, "suspended");
            return Some(ExecutionState::Suspended);
        }
        None
    }

    // ========== 반환값 ==========

    fn return_value(&self) -> CallResult<&Value> {
        if self.state != ContextState::Finished {
            return Err(ReturnCode::ContextNotFinished);
        }
        Ok(&self.register)
    }

    pub fn get_return_byte(&self) -> CallResult<u8> {
        Ok(self.return_value()?.bits() as u8)
    }

    pub fn get_return_word(&self) -> CallResult<u16> {
        Ok(self.return_value()?.bits() as u16)
    }

    pub fn get_return_dword(&self) -> CallResult<u32> {
        Ok(self.return_value()?.bits() as u32)
    }

    pub fn get_return_qword(&self) -> CallResult<u64> {
        Ok(self.return_value()?.bits())
    }

    pub fn get_return_float(&self) -> CallResult<f32> {
        Ok(self.return_value()?.float())
    }

    pub fn get_return_double(&self) -> CallResult<f64> {
        Ok(self.return_value()?.double())
    }

    pub fn get_return_object(&self) -> CallResult<Option<ObjectHandle>> {
        Ok(self.return_value()?.object())
    }

    /// 반환 레지스터의 객체 타입 태그
    pub fn return_type_id(&self) -> Option<TypeId> {
        self.register_type
    }

    // ========== 예외 ==========

    pub fn exception_info(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    pub fn exception_string(&self) -> Option<&str> {
        self.exception.as_ref().map(|e| e.message.as_str())
    }

    pub fn exception_function(&self) -> Option<FunctionId> {
        self.exception.as_ref().and_then(|e| e.function)
    }

    pub fn exception_line_number(&self) -> Option<(u32, u32)> {
        self.exception.as_ref().map(|e| (e.line, e.column))
    }

    // ========== 호출 스택 조회 ==========

    pub fn callstack_size(&self) -> usize {
        match self.current {
            Some(_) => self.call_stack.len() + 1,
            None => 0,
        }
    }

    fn frame_at(&self, level: usize) -> Option<(&Active, usize)> {
        if level == 0 {
            return self.current.as_ref().map(|a| (a, self.instr_start));
        }
        let index = self.call_stack.len().checked_sub(level)?;
        let frame = &self.call_stack[index];
        Some((&frame.active, frame.ip.saturating_sub(1)))
    }

    /// `level` 0은 실행 중인 함수, 1은 그 호출자 ...
    pub fn callstack_function(&self, level: usize) -> Option<Arc<ScriptFunction>> {
        self.frame_at(level).map(|(a, _)| a.function.clone())
    }

    pub fn callstack_line_number(&self, level: usize) -> Option<(u32, u32)> {
        self.frame_at(level)
            .map(|(a, ip)| a.function.line_number(ip))
    }

    pub fn current_function(&self) -> Option<Arc<ScriptFunction>> {
        self.callstack_function(0)
    }

    pub fn current_line_number(&self) -> Option<(u32, u32)> {
        self.callstack_line_number(0)
    }

    /// 할당된 스택 블록 수
    pub fn stack_block_count(&self) -> usize {
        self.stack.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unwind();
        self.release_module_ref();
    }
}

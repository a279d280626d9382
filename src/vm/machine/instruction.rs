use std::cmp::Ordering;

use super::{Context, LineInfo, VmErrorKind, VmResult, err};
use crate::vm::bytecode::{InstrArgs, Opcode as O};
use crate::vm::function::NativeCall;
use crate::vm::status::ExecutionState;
use crate::vm::value::{ScriptObject, Value};

/// 명령어 실행 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFlow {
    /// 다음 명령어 계속 실행
    Continue,
    /// 호출/반환으로 실행 중인 함수가 바뀜
    FrameChanged,
    /// 실행 루프를 빠져나감
    Stop(ExecutionState),
}

fn compare<T: PartialOrd>(a: T, b: T) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        // NaN은 1
        Some(Ordering::Greater) | None => 1,
    }
}

impl Context {
    /// 단일 명령어 실행 (디스패처)
    pub(super) fn execute_instruction(
        &mut self,
        op: O,
        args: &InstrArgs,
    ) -> VmResult<ExecutionFlow> {
        let [a, b, c] = args.w;
        match op {
            // ===== 스택 =====
            O::Pop => self.handle_pop(a),
            O::Push => self.handle_push(a),
            O::PshC4 => self.push_value(Value::Scalar(args.dword() as u64)),
            O::PshC8 => self.push_value(Value::Scalar(args.arg)),
            O::PshV4 => {
                let v = self.var(a)?.share();
                self.push_value(v)
            }
            O::PshRef => {
                let v = self.var(a)?.borrow_ref();
                self.push_value(v)
            }
            O::PshObj => {
                let v = self.var_mut(a)?.take();
                self.push_value(v)
            }
            O::PshG4 => {
                let v = self.read_global(a)?;
                self.push_value(v)
            }
            O::PshNull => self.push_value(Value::NULL),
            O::PshStr => self.handle_push_string(args.dword()),
            O::PshRPtr => {
                let v = self.register.share();
                self.push_value(v)
            }
            O::PopRPtr => {
                let v = self.pop()?;
                self.set_register(v);
                Ok(ExecutionFlow::Continue)
            }
            O::Swap => {
                self.swap_top()?;
                Ok(ExecutionFlow::Continue)
            }
            O::TypeId => self.push_value(Value::Scalar(args.dword() as u64)),

            // ===== 변수 =====
            O::SetV4 => self.store(a, Value::Scalar(args.dword() as u64)),
            O::SetV8 => self.store(a, Value::Scalar(args.arg)),
            O::CpyVtoV4 => {
                let v = self.var(b)?.share();
                self.store(a, v)
            }
            O::CpyVtoR4 => {
                self.register = self.var(a)?.share();
                self.register_type = None;
                Ok(ExecutionFlow::Continue)
            }
            O::CpyRtoV4 => {
                let v = self.register.share();
                self.store(a, v)
            }
            O::CpyGtoV4 => {
                let v = self.read_global(b)?;
                self.store(a, v)
            }
            O::CpyVtoG4 => {
                let v = self.var(b)?.share();
                self.write_global(a, v)?;
                Ok(ExecutionFlow::Continue)
            }
            O::SetG4 => {
                self.write_global(a, Value::Scalar(args.dword() as u64))?;
                Ok(ExecutionFlow::Continue)
            }
            O::LoadObj => {
                let v = self.var_mut(a)?.take();
                self.set_register(v);
                Ok(ExecutionFlow::Continue)
            }
            O::StoreObj => {
                let v = self.register.take();
                self.register_type = None;
                self.store(a, v)
            }

            // ===== 산술 =====
            O::AddI => self.int_op(a, b, c, |x, y| Ok(x.wrapping_add(y))),
            O::SubI => self.int_op(a, b, c, |x, y| Ok(x.wrapping_sub(y))),
            O::MulI => self.int_op(a, b, c, |x, y| Ok(x.wrapping_mul(y))),
            O::DivI => self.int_op(a, b, c, |x, y| {
                if y == 0 {
                    return Err(err(VmErrorKind::DivideByZero, "integer division by zero"));
                }
                Ok(x.wrapping_div(y))
            }),
            O::ModI => self.int_op(a, b, c, |x, y| {
                if y == 0 {
                    return Err(err(VmErrorKind::DivideByZero, "integer modulo by zero"));
                }
                Ok(x.wrapping_rem(y))
            }),
            O::AddD => self.double_op(a, b, c, |x, y| Ok(x + y)),
            O::SubD => self.double_op(a, b, c, |x, y| Ok(x - y)),
            O::MulD => self.double_op(a, b, c, |x, y| Ok(x * y)),
            O::DivD => self.double_op(a, b, c, |x, y| {
                if y == 0.0 {
                    return Err(err(VmErrorKind::DivideByZero, "division by zero"));
                }
                Ok(x / y)
            }),
            O::AddIi => self.int_imm_op(a, b, args.int(), i32::wrapping_add),
            O::SubIi => self.int_imm_op(a, b, args.int(), i32::wrapping_sub),
            O::MulIi => self.int_imm_op(a, b, args.int(), i32::wrapping_mul),
            O::AddId => self.double_imm_op(a, b, args.double(), |x, y| x + y),
            O::SubId => self.double_imm_op(a, b, args.double(), |x, y| x - y),
            O::MulId => self.double_imm_op(a, b, args.double(), |x, y| x * y),

            // ===== 비교 =====
            O::CmpI => {
                let r = compare(self.var(a)?.int(), self.var(b)?.int());
                self.set_register_int(r)
            }
            O::CmpD => {
                let r = compare(self.var(a)?.double(), self.var(b)?.double());
                self.set_register_int(r)
            }
            O::CmpIi => {
                let r = compare(self.var(a)?.int(), args.int());
                self.set_register_int(r)
            }
            O::CmpId => {
                let r = compare(self.var(a)?.double(), args.double());
                self.set_register_int(r)
            }

            // ===== 레지스터 테스트 =====
            O::Tz => self.test_register(|v| v == 0),
            O::Tnz => self.test_register(|v| v != 0),
            O::Ts => self.test_register(|v| v < 0),
            O::Tns => self.test_register(|v| v >= 0),
            O::Tp => self.test_register(|v| v > 0),
            O::Tnp => self.test_register(|v| v <= 0),

            // ===== 점프 =====
            O::Jmp => self.jump_if(true, args.int()),
            O::Jz => self.jump_if(self.register.int() == 0, args.int()),
            O::Jnz => self.jump_if(self.register.int() != 0, args.int()),
            O::Js => self.jump_if(self.register.int() < 0, args.int()),
            O::Jns => self.jump_if(self.register.int() >= 0, args.int()),
            O::Jp => self.jump_if(self.register.int() > 0, args.int()),
            O::Jnp => self.jump_if(self.register.int() <= 0, args.int()),
            O::JmpP => self.handle_jump_table(a, args.dword()),

            // ===== 호출 =====
            O::Call => self.handle_call(args.dword()),
            O::CallBnd => self.handle_call_bound(args.dword()),
            O::CallSys => self.handle_call_native(args.dword()),
            O::Ret => self.handle_ret(a),

            // ===== 객체 =====
            O::Alloc => self.handle_alloc(a, args.arg),
            O::FreeV => {
                let old = self.var_mut(a)?.take();
                drop(old);
                Ok(ExecutionFlow::Continue)
            }
            O::CopyV => {
                let src = self.object_in(b)?;
                self.store(a, Value::Owned(src.deep_copy()))
            }
            O::ChkNullV => {
                self.object_in(a)?;
                Ok(ExecutionFlow::Continue)
            }
            O::LdFld => {
                let obj = self.object_in(b)?;
                let bits = obj.prop(c as u16 as usize).ok_or_else(|| {
                    err(VmErrorKind::InvalidOperand, format!("no property {c}"))
                })?;
                self.store(a, Value::Scalar(bits))
            }
            O::StFld => {
                let obj = self.object_in(a)?;
                let bits = self.var(c)?.bits();
                if !obj.set_prop(b as u16 as usize, bits) {
                    return Err(err(VmErrorKind::InvalidOperand, format!("no property {b}")));
                }
                Ok(ExecutionFlow::Continue)
            }

            // ===== 제어 =====
            O::Suspend => self.handle_suspend(),

            O::Label | O::Line => Err(err(
                VmErrorKind::InvalidOpcode,
                format!("pseudo instruction {op} in finalized code"),
            )),
        }
    }

    // ========== 헬퍼 ==========

    fn push_value(&mut self, v: Value) -> VmResult<ExecutionFlow> {
        self.push(v)?;
        Ok(ExecutionFlow::Continue)
    }

    fn store(&mut self, var: i16, v: Value) -> VmResult<ExecutionFlow> {
        self.set_var(var, v)?;
        Ok(ExecutionFlow::Continue)
    }

    fn set_register(&mut self, v: Value) {
        self.register_type = v.object().map(|o| o.type_id());
        self.register = v;
    }

    fn set_register_int(&mut self, v: i32) -> VmResult<ExecutionFlow> {
        self.register = Value::from_int(v);
        self.register_type = None;
        Ok(ExecutionFlow::Continue)
    }

    fn test_register(&mut self, f: impl FnOnce(i32) -> bool) -> VmResult<ExecutionFlow> {
        let r = f(self.register.int());
        self.set_register_int(r as i32)
    }

    fn object_in(&self, var: i16) -> VmResult<std::sync::Arc<ScriptObject>> {
        self.var(var)?
            .object()
            .ok_or_else(|| err(VmErrorKind::NullPointerAccess, "null pointer access"))
    }

    fn int_op(
        &mut self,
        dst: i16,
        lhs: i16,
        rhs: i16,
        f: impl FnOnce(i32, i32) -> VmResult<i32>,
    ) -> VmResult<ExecutionFlow> {
        let r = f(self.var(lhs)?.int(), self.var(rhs)?.int())?;
        self.store(dst, Value::from_int(r))
    }

    fn double_op(
        &mut self,
        dst: i16,
        lhs: i16,
        rhs: i16,
        f: impl FnOnce(f64, f64) -> VmResult<f64>,
    ) -> VmResult<ExecutionFlow> {
        let r = f(self.var(lhs)?.double(), self.var(rhs)?.double())?;
        self.store(dst, Value::from_double(r))
    }

    fn int_imm_op(
        &mut self,
        dst: i16,
        lhs: i16,
        imm: i32,
        f: impl FnOnce(i32, i32) -> i32,
    ) -> VmResult<ExecutionFlow> {
        let r = f(self.var(lhs)?.int(), imm);
        self.store(dst, Value::from_int(r))
    }

    fn double_imm_op(
        &mut self,
        dst: i16,
        lhs: i16,
        imm: f64,
        f: impl FnOnce(f64, f64) -> f64,
    ) -> VmResult<ExecutionFlow> {
        let r = f(self.var(lhs)?.double(), imm);
        self.store(dst, Value::from_double(r))
    }

    // ========== 핸들러 ==========

    fn handle_pop(&mut self, count: i16) -> VmResult<ExecutionFlow> {
        self.release_cells(count.max(0) as usize)?;
        Ok(ExecutionFlow::Continue)
    }

    fn handle_push(&mut self, count: i16) -> VmResult<ExecutionFlow> {
        self.reserve_cells(count.max(0) as usize)?;
        Ok(ExecutionFlow::Continue)
    }

    fn handle_push_string(&mut self, index: u32) -> VmResult<ExecutionFlow> {
        let text = self
            .active()?
            .code
            .strings
            .get(index as usize)
            .cloned()
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("string {index} out of range")))?;
        let obj = self
            .engine
            .create_string(&text)
            .map_err(|_| err(VmErrorKind::NoStringFactory, "no string factory registered"))?;
        self.push_value(Value::Owned(obj))
    }

    fn jump_if(&mut self, cond: bool, offset: i32) -> VmResult<ExecutionFlow> {
        if cond {
            let target = self.ip as i64 + offset as i64;
            if target < 0 {
                return Err(err(VmErrorKind::InvalidOperand, "jump before function start"));
            }
            self.ip = target as usize;
        }
        Ok(ExecutionFlow::Continue)
    }

    /// `JmpP var, n`: var번째 `Jmp`로 이동
    fn handle_jump_table(&mut self, var: i16, len: u32) -> VmResult<ExecutionFlow> {
        let index = self.var(var)?.int();
        if index < 0 || index as u32 >= len {
            return Err(err(
                VmErrorKind::InvalidOperand,
                format!("jump table index {index} out of range ({len})"),
            ));
        }
        self.ip += index as usize * O::Jmp.size() as usize;
        Ok(ExecutionFlow::Continue)
    }

    fn handle_call(&mut self, index: u32) -> VmResult<ExecutionFlow> {
        let active = self.active()?;
        let function = active
            .code
            .functions
            .get(index as usize)
            .cloned()
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("function {index} out of range")))?;
        let (module, code) = (active.module.clone(), active.code.clone());
        self.call_script(function, module, code)?;
        Ok(ExecutionFlow::FrameChanged)
    }

    fn handle_call_bound(&mut self, index: u32) -> VmResult<ExecutionFlow> {
        let active = self.active()?;
        let binding = active.module.import_binding(index as usize).ok_or_else(|| {
            let name = active
                .module
                .imported_function_declaration(index as usize)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("#{index}"));
            err(VmErrorKind::UnboundFunction, format!("unbound function '{name}'"))
        })?;
        let code = binding.module.code();
        self.call_script(binding.function, binding.module, code)?;
        Ok(ExecutionFlow::FrameChanged)
    }

    /// 네이티브 함수 호출. by-value 객체 인자는 깊은 복사해서 넘깁니다.
    fn handle_call_native(&mut self, id: u32) -> VmResult<ExecutionFlow> {
        let native = self
            .engine
            .native(id)
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("native function {id} is missing")))?;

        let params = &native.signature.params;
        let mut args = Vec::with_capacity(params.len());
        for (i, ty) in params.iter().enumerate() {
            let v = self.cell(self.sp + i)?.share();
            let by_value = ty.is_object() && !ty.is_handle() && !ty.is_reference;
            args.push(match v.object() {
                Some(obj) if by_value => Value::Owned(obj.deep_copy()),
                _ => v,
            });
        }

        let engine = self.engine.clone();
        let (result, ret, exception) = {
            let mut call = NativeCall::new(&engine, args);
            let result = (native.func)(&mut call);
            (result, std::mem::take(&mut call.ret), call.exception.take())
        };
        self.release_cells(params.len())?;

        if let Err(message) = result {
            return Err(err(VmErrorKind::HostException, message));
        }
        if let Some(message) = exception {
            return Err(err(VmErrorKind::HostException, message));
        }
        self.register = ret;
        self.register_type = native.signature.return_type.object_type();

        Ok(match self.check_control() {
            Some(state) => ExecutionFlow::Stop(state),
            None => ExecutionFlow::Continue,
        })
    }

    fn handle_ret(&mut self, pop: i16) -> VmResult<ExecutionFlow> {
        if self.return_from(pop.max(0) as usize)? {
            Ok(ExecutionFlow::Stop(ExecutionState::Finished))
        } else {
            Ok(ExecutionFlow::FrameChanged)
        }
    }

    fn handle_alloc(&mut self, var: i16, ty: u64) -> VmResult<ExecutionFlow> {
        let object_type = u32::try_from(ty)
            .ok()
            .and_then(|id| self.engine.object_type(id))
            .ok_or_else(|| err(VmErrorKind::InvalidOperand, format!("unknown object type {ty}")))?;
        let obj = ScriptObject::new(object_type);
        self.store(var, Value::Owned(obj))
    }

    /// 라인 콜백 호출 후 suspend/abort 요청 확인
    fn handle_suspend(&mut self) -> VmResult<ExecutionFlow> {
        if let Some(mut callback) = self.line_callback.take() {
            if let Some(active) = self.current.as_ref() {
                let function = &active.function;
                let (line, column) = function.line_number(self.instr_start);
                callback(&LineInfo {
                    module: active.module.name(),
                    function: function.id,
                    function_name: function.name(),
                    line,
                    column,
                });
            }
            self.line_callback = Some(callback);
        }
        Ok(match self.check_control() {
            Some(state) => ExecutionFlow::Stop(state),
            None => ExecutionFlow::Continue,
        })
    }
}

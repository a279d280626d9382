//! 스크립트 함수와 네이티브(호스트) 함수

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::vm::builder::LineEntry;
use crate::vm::bytecode::unpack_line;
use crate::vm::engine::Engine;
use crate::vm::type_def::{DataType, TypeId};
use crate::vm::value::{ObjectHandle, Value};

/// 엔진 전역 함수 id (스크립트 함수와 네이티브 함수는 서로 다른 공간)
pub type FunctionId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub return_type: DataType,
    pub params: Vec<DataType>,
}

impl Signature {
    pub fn new(name: impl Into<String>, return_type: DataType, params: Vec<DataType>) -> Self {
        Self {
            name: name.into(),
            return_type,
            params,
        }
    }

    /// 이름을 제외한 인터페이스 비교 (반환 타입, 인자 수, 각 인자 타입 순서)
    pub fn interface_matches(&self, other: &Signature) -> bool {
        self.return_type == other.return_type
            && self.params.len() == other.params.len()
            && self.params.iter().zip(&other.params).all(|(a, b)| a == b)
    }

    /// 인자 셀 수
    pub fn param_cells(&self) -> u32 {
        self.params.len() as u32
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")
    }
}

/// 객체를 담는 지역 변수 슬롯 (예외 해제 대상)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVar {
    pub offset: i16,
    pub type_id: TypeId,
}

#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub id: FunctionId,
    pub signature: Signature,
    pub module: String,
    pub code: Vec<u32>,
    /// 지역 변수 + 최대 스택 사용량 (셀)
    pub stack_needed: u32,
    pub variable_space: u32,
    pub object_vars: Vec<ObjectVar>,
    pub line_numbers: Vec<LineEntry>,
}

impl ScriptFunction {
    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn param_count(&self) -> usize {
        self.signature.params.len()
    }

    /// 인자 `index`의 변수 오프셋 (0, -1, -2, ...)
    pub fn param_offset(index: usize) -> i16 {
        -(index as i16)
    }

    /// 유효한 변수 오프셋 범위
    pub fn variable_range(&self) -> std::ops::RangeInclusive<i32> {
        (1 - self.param_count() as i32)..=self.variable_space as i32
    }

    /// 워드 위치 `ip`가 속한 소스 위치 (line, column)
    pub fn line_number(&self, ip: usize) -> (u32, u32) {
        self.line_numbers
            .iter()
            .take_while(|e| e.offset as usize <= ip)
            .last()
            .map(|e| unpack_line(e.packed))
            .unwrap_or((0, 0))
    }
}

// ========== 네이티브 함수 ==========

pub type NativeFn = Arc<dyn Fn(&mut NativeCall<'_>) -> Result<(), String> + Send + Sync>;

pub struct NativeFunction {
    pub id: FunctionId,
    pub signature: Signature,
    pub(crate) func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .finish()
    }
}

/// 네이티브 함수 호출 프레임
///
/// 인자는 스택에서 읽혀 여기에 담깁니다. by-value 객체 인자는 이미 깊은
/// 복사된 상태입니다. 반환값은 컨텍스트 레지스터로 옮겨집니다.
pub struct NativeCall<'a> {
    pub engine: &'a Engine,
    pub(crate) args: Vec<Value>,
    pub(crate) ret: Value,
    pub(crate) exception: Option<String>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(engine: &'a Engine, args: Vec<Value>) -> Self {
        Self {
            engine,
            args,
            ret: Value::NULL,
            exception: None,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn arg_int(&self, index: usize) -> i32 {
        self.args.get(index).map_or(0, Value::int)
    }

    pub fn arg_double(&self, index: usize) -> f64 {
        self.args.get(index).map_or(0.0, Value::double)
    }

    pub fn arg_object(&self, index: usize) -> Option<ObjectHandle> {
        self.args.get(index).and_then(Value::object)
    }

    pub fn set_return(&mut self, value: Value) {
        self.ret = value;
    }

    pub fn set_return_int(&mut self, v: i32) {
        self.ret = Value::from_int(v);
    }

    pub fn set_return_double(&mut self, v: f64) {
        self.ret = Value::from_double(v);
    }

    pub fn set_return_object(&mut self, handle: Option<ObjectHandle>) {
        self.ret = handle.map_or(Value::NULL, Value::Owned);
    }

    /// 호출이 끝나면 스크립트 예외를 발생시킴
    pub fn set_exception(&mut self, message: impl Into<String>) {
        self.exception = Some(message.into());
    }
}

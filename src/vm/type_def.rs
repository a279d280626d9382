//! 타입 정의
//!
//! - **DataType**: 함수 시그니처와 전역 변수에 쓰이는 값 타입
//! - **ObjectType**: 엔진에 등록된 객체 타입 (이름, 플래그, 속성 수, behaviour)
//! - **Behaviours**: 생성/복사/소멸 시 호출되는 호스트 훅

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::vm::value::ScriptObject;

/// 엔진 전역 객체 타입 id
pub type TypeId = u32;

/// 섹션 안에서 아직 해석되지 않은 모듈 로컬 타입을 가리키는 비트
///
/// `DataType`과 `TypeId` 명령어 인자는 32비트, `Alloc`/`FreeV`의 포인터 인자는
/// 64비트 형식을 씁니다.
pub const LOCAL_TYPE_BIT: u32 = 1 << 31;
pub const LOCAL_TYPE_PTR_BIT: u64 = 1 << 63;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// 참조 카운트로 관리되는 타입 (핸들 가능)
        const REF    = 1 << 0;
        /// 값 타입 (by-value 전달 시 깊은 복사)
        const VALUE  = 1 << 1;
        /// 스크립트에서 선언된 타입
        const SCRIPT = 1 << 2;
    }
}

pub type ConstructFn = Arc<dyn Fn(&ScriptObject) + Send + Sync>;
pub type CopyFn = Arc<dyn Fn(&ScriptObject, &ScriptObject) + Send + Sync>;
pub type DestructFn = Arc<dyn Fn(&ScriptObject) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Behaviours {
    pub construct: Option<ConstructFn>,
    /// `(대상, 원본)`
    pub copy: Option<CopyFn>,
    pub destruct: Option<DestructFn>,
}

impl fmt::Debug for Behaviours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behaviours")
            .field("construct", &self.construct.is_some())
            .field("copy", &self.copy.is_some())
            .field("destruct", &self.destruct.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct ObjectType {
    pub id: TypeId,
    pub name: String,
    pub flags: TypeFlags,
    pub property_count: u16,
    pub behaviours: Behaviours,
    /// 스크립트 타입이면 선언한 모듈 이름
    pub module: Option<String>,
}

impl ObjectType {
    pub fn is_script_type(&self) -> bool {
        self.flags.contains(TypeFlags::SCRIPT)
    }
}

/// 원시 타입 또는 객체 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    /// by-value 객체
    Object(TypeId),
    /// 객체 핸들
    Handle(TypeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub kind: TypeKind,
    /// `&` 참조로 전달되는지
    pub is_reference: bool,
}

impl DataType {
    pub const fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            is_reference: false,
        }
    }

    pub const fn void() -> Self {
        Self::new(TypeKind::Void)
    }

    pub const fn bool() -> Self {
        Self::new(TypeKind::Bool)
    }

    pub const fn int() -> Self {
        Self::new(TypeKind::Int32)
    }

    pub const fn int64() -> Self {
        Self::new(TypeKind::Int64)
    }

    pub const fn float() -> Self {
        Self::new(TypeKind::Float)
    }

    pub const fn double() -> Self {
        Self::new(TypeKind::Double)
    }

    pub const fn object(ty: TypeId) -> Self {
        Self::new(TypeKind::Object(ty))
    }

    pub const fn handle(ty: TypeId) -> Self {
        Self::new(TypeKind::Handle(ty))
    }

    pub const fn reference(mut self) -> Self {
        self.is_reference = true;
        self
    }

    /// 아직 링크되지 않은 섹션 로컬 타입 (`ScriptSection::types`의 인덱스)
    pub const fn local_object(index: u32) -> Self {
        Self::object(index | LOCAL_TYPE_BIT)
    }

    pub const fn local_handle(index: u32) -> Self {
        Self::handle(index | LOCAL_TYPE_BIT)
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn object_type(&self) -> Option<TypeId> {
        match self.kind {
            TypeKind::Object(ty) | TypeKind::Handle(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        self.object_type().is_some()
    }

    pub fn is_handle(&self) -> bool {
        matches!(self.kind, TypeKind::Handle(_))
    }

    /// 스택 셀에 담기는 값의 바이트 크기 (SetArg 타입 검사용)
    pub fn size_in_bytes(&self) -> usize {
        match self.kind {
            TypeKind::Void => 0,
            TypeKind::Bool | TypeKind::Int8 | TypeKind::UInt8 => 1,
            TypeKind::Int16 | TypeKind::UInt16 => 2,
            TypeKind::Int32 | TypeKind::UInt32 | TypeKind::Float => 4,
            TypeKind::Int64 | TypeKind::UInt64 | TypeKind::Double => 8,
            TypeKind::Object(_) | TypeKind::Handle(_) => 8,
        }
    }

    /// 타입 id를 다른 값으로 바꾼 복사본
    pub fn map_object_type(&self, f: impl FnOnce(TypeId) -> TypeId) -> Self {
        let kind = match self.kind {
            TypeKind::Object(ty) => TypeKind::Object(f(ty)),
            TypeKind::Handle(ty) => TypeKind::Handle(f(ty)),
            other => other,
        };
        Self {
            kind,
            is_reference: self.is_reference,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TypeKind::Void => write!(f, "void")?,
            TypeKind::Bool => write!(f, "bool")?,
            TypeKind::Int8 => write!(f, "int8")?,
            TypeKind::Int16 => write!(f, "int16")?,
            TypeKind::Int32 => write!(f, "int")?,
            TypeKind::Int64 => write!(f, "int64")?,
            TypeKind::UInt8 => write!(f, "uint8")?,
            TypeKind::UInt16 => write!(f, "uint16")?,
            TypeKind::UInt32 => write!(f, "uint")?,
            TypeKind::UInt64 => write!(f, "uint64")?,
            TypeKind::Float => write!(f, "float")?,
            TypeKind::Double => write!(f, "double")?,
            TypeKind::Object(ty) => write!(f, "object#{ty}")?,
            TypeKind::Handle(ty) => write!(f, "object#{ty}@")?,
        }
        if self.is_reference {
            write!(f, "&")?;
        }
        Ok(())
    }
}

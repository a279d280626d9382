// 스트림 섹션 레코드
//
// 레코드 안의 객체 타입은 모두 스트림 타입 테이블 인덱스입니다
// (로컬 타입 먼저, 그 뒤 외부 타입).

use serde::{Deserialize, Serialize};

use crate::vm::builder::LineEntry;
use crate::vm::function::{ObjectVar, Signature};
use crate::vm::module::ImportDecl;
use crate::vm::type_def::DataType;

pub(super) const MAGIC: [u8; 4] = *b"VXBC";
pub(super) const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct Header {
    pub magic: [u8; 4],
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct LocalType {
    pub name: String,
    pub property_count: u16,
    /// `TypeFlags` 비트
    pub flags: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct TypeSection {
    pub local: Vec<LocalType>,
    /// 엔진에 등록된 이름으로 찾는 타입
    pub external: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct GlobalRecord {
    pub name: String,
    pub ty: DataType,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct GlobalSection {
    pub globals: Vec<GlobalRecord>,
    /// 전역 메모리 크기 (셀)
    pub memory_size: u32,
}

/// 전역 접근 테이블: 0 이상은 모듈 전역 인덱스, 음수 `-(k + 1)`은
/// `engine_properties[k]`
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct AccessSection {
    pub table: Vec<i32>,
    pub engine_properties: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct NativeSection {
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct FunctionRecord {
    pub signature: Signature,
    pub variable_space: u32,
    pub stack_needed: u32,
    pub object_vars: Vec<ObjectVar>,
    /// `Alloc`/`FreeV`는 타입 테이블, `TypeId`는 타입 id 테이블,
    /// `CallSys`는 네이티브 테이블 인덱스로 바뀐 워드 배열
    pub code: Vec<u32>,
    pub line_numbers: Vec<LineEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct StringSection {
    pub strings: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct ImportSection {
    pub imports: Vec<ImportDecl>,
}

/// `TypeId` 피연산자용 테이블. 각 항목은 타입 테이블 인덱스
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct TypeIdSection {
    pub entries: Vec<u32>,
}

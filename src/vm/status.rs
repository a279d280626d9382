//! 호스트에 노출되는 상태 코드와 실행 상태
//!
//! 라이프사이클 호출(Prepare/SetArg/Execute/Bind ...)은 예외를 던지지 않고
//! 고정된 [`ReturnCode`]를 돌려줍니다. 빌드와 직렬화는 메시지를 가진
//! 구조화된 에러를 씁니다.

use std::fmt;
use strum::Display;

/// 라이프사이클 호출 실패 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ReturnCode {
    Error,
    ContextActive,
    ContextNotPrepared,
    ContextNotFinished,
    InvalidArg,
    InvalidType,
    InvalidName,
    NoFunction,
    NoModule,
    AlreadyRegistered,
    InvalidInterface,
    CantBindAllFunctions,
    InitGlobalVarsFailed,
    InvalidConfiguration,
    OutOfMemory,
    ModuleInUse,
    NoStringFactory,
}

pub type CallResult<T> = Result<T, ReturnCode>;

/// `Execute()`가 멈춘 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ExecutionState {
    Finished,
    Suspended,
    Aborted,
    Exception,
}

/// 컨텍스트 상태 머신
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Default)]
pub enum ContextState {
    #[default]
    Uninitialized,
    Prepared,
    Active,
    Suspended,
    Finished,
    Aborted,
    Exception,
}

impl From<ExecutionState> for ContextState {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Finished => ContextState::Finished,
            ExecutionState::Suspended => ContextState::Suspended,
            ExecutionState::Aborted => ContextState::Aborted,
            ExecutionState::Exception => ContextState::Exception,
        }
    }
}

// ========== 빌드 에러 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildErrorKind {
    /// 섹션 간 연결 실패 (범위 밖 인덱스, 알 수 없는 타입 등)
    Link,
    /// 내부 일관성 위반 (해석되지 않은 레이블, 스택 깊이 불일치)
    Internal,
    /// 전역 변수 초기화 함수가 실패함
    InitFailed,
    ModuleDiscarded,
    ModuleInUse,
    InvalidSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub kind: BuildErrorKind,
    pub message: String,
}

impl BuildError {
    pub fn new(kind: BuildErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BuildError {}

// ========== 직렬화 에러 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StreamErrorKind {
    Io,
    Truncated,
    Corrupt,
    UnknownType,
    UnknownFunction,
    UnknownProperty,
    InitFailed,
    ModuleInUse,
    ModuleDiscarded,
}

#[derive(Debug)]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Corrupt, message)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        let kind = if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StreamErrorKind::Truncated
        } else {
            StreamErrorKind::Io
        };
        StreamError::new(kind, e.to_string())
    }
}

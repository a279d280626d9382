//! 바이트코드 저장/복원
//!
//! 스트림은 bincode로 인코딩된 섹션들이 고정된 순서로 이어진 것입니다:
//!
//! 1. 헤더 (매직, 포맷 버전)
//! 2. 타입 테이블 (모듈 로컬 타입, 이름으로 찾는 외부 타입)
//! 3. 전역 변수 선언과 전역 메모리 크기
//! 4. 전역 접근 테이블 (모듈 전역은 0 이상, 엔진 프로퍼티는 음수)
//! 5. 사용한 네이티브 함수 시그니처
//! 6. 전역 초기화 함수
//! 7. 함수 개수와 함수 레코드들
//! 8. 문자열 상수 풀
//! 9. import 선언
//! 10. `TypeId` 피연산자용 타입 테이블
//!
//! 코드 안의 라이브 타입 id와 네이티브 함수 id는 저장할 때 작은 인덱스로
//! 바뀌고, 복원할 때 모든 섹션을 읽은 다음 두 번째 패스에서 되돌려집니다.
//! 복원은 설치 전에 모든 함수 본문을 검증하고, 실패하면 모듈을 빈 상태로
//! 남깁니다.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::vm::engine::Engine;
use crate::vm::module::Module;
use crate::vm::status::StreamError;

mod reader;
mod records;
mod writer;


pub type StreamResult<T> = Result<T, StreamError>;

/// 섹션 하나가 선언할 수 있는 컨테이너 크기의 절대 상한
const MAX_SECTION_CLAIM: usize = 256 * 1024 * 1024;

fn stream_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_SECTION_CLAIM>()
}

/// 모듈의 링크된 내용을 스트림에 기록
pub fn save<W: Write>(module: &Module, engine: &Engine, out: &mut W) -> StreamResult<()> {
    writer::save(module, engine, out)
}

/// 스트림에서 모듈 내용을 복원하고 전역 초기화를 실행
///
/// 모듈을 참조하는 컨텍스트가 있으면 `ModuleInUse`로 거부합니다.
pub fn restore<R: Read>(module: &Module, engine: &Arc<Engine>, input: &mut R) -> StreamResult<()> {
    reader::restore(module, engine, input)
}

impl Module {
    pub fn save_bytecode<W: Write>(&self, engine: &Engine, out: &mut W) -> StreamResult<()> {
        save(self, engine, out)
    }

    pub fn load_bytecode<R: Read>(&self, engine: &Arc<Engine>, input: &mut R) -> StreamResult<()> {
        restore(self, engine, input)
    }
}

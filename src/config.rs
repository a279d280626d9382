//! 엔진 설정

use serde::{Deserialize, Serialize};

use crate::vm::status::{CallResult, ReturnCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Finalize 단계에서 peephole 최적화를 수행할지
    pub optimize_bytecode: bool,
    /// Line 마커를 Suspend로 바꾸지 않고 완전히 제거 (일시정지 지점이 사라짐)
    pub build_without_line_cues: bool,
    /// Build/Restore 직후 전역 변수 초기화 함수를 실행할지
    pub init_global_vars_after_build: bool,
    /// 컨텍스트 스택 첫 블록의 크기 (셀 단위)
    pub initial_context_stack_size: u32,
    /// 모든 스택 블록 합계의 상한, 0이면 무제한
    pub maximum_context_stack_size: u32,
    /// 중첩 호출 깊이 상한, 0이면 무제한.
    /// 스택 크기가 무제한인 기본 설정에서 폭주 재귀를 멈추는 것은 이 값입니다.
    pub max_call_depth: u32,
    /// 직렬화 섹션 하나가 읽을 수 있는 최대 바이트 수
    pub max_stream_section_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize_bytecode: true,
            build_without_line_cues: false,
            init_global_vars_after_build: true,
            initial_context_stack_size: 1024,
            maximum_context_stack_size: 0,
            max_call_depth: 10_000,
            max_stream_section_bytes: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> CallResult<()> {
        if self.initial_context_stack_size == 0 || self.max_stream_section_bytes == 0 {
            return Err(ReturnCode::InvalidConfiguration);
        }
        Ok(())
    }

    /// 최대 크기로 잘린 첫 블록 크기
    pub fn initial_stack_size(&self) -> u32 {
        match self.maximum_context_stack_size {
            0 => self.initial_context_stack_size,
            max => self.initial_context_stack_size.min(max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_initial_stack_is_rejected() {
        let config = EngineConfig {
            initial_context_stack_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ReturnCode::InvalidConfiguration));
    }

    #[test]
    fn test_initial_stack_is_clamped_to_maximum() {
        let config = EngineConfig {
            initial_context_stack_size: 4096,
            maximum_context_stack_size: 256,
            ..EngineConfig::default()
        };
        assert_eq!(config.initial_stack_size(), 256);
    }

    #[test]
    fn test_config_roundtrips_through_bincode() {
        let config = EngineConfig {
            optimize_bytecode: false,
            max_call_depth: 64,
            ..EngineConfig::default()
        };
        let cfg = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(&config, cfg).unwrap();
        let (decoded, _): (EngineConfig, usize) =
            bincode::serde::decode_from_slice(&bytes, cfg).unwrap();
        assert_eq!(decoded, config);
    }
}

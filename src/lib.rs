pub mod config;
pub mod vm;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

pub use config::EngineConfig;

/// 빌드된 모듈을 바이트코드 파일로 저장
pub fn save_module(
    engine: &vm::Engine,
    module: &vm::Module,
    path: impl AsRef<Path>,
) -> vm::StreamResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    module.save_bytecode(engine, &mut out)
}

/// 바이트코드 파일을 읽어 `name` 모듈로 복원
///
/// 같은 이름의 모듈이 있으면 그 내용을 교체합니다.
pub fn load_module(
    engine: &Arc<vm::Engine>,
    name: &str,
    path: impl AsRef<Path>,
) -> vm::StreamResult<Arc<vm::Module>> {
    let mut input = BufReader::new(File::open(path)?);
    let module = engine
        .get_module(name, vm::GetModuleFlag::CreateIfNotExists)
        .ok_or_else(|| {
            vm::StreamError::new(vm::StreamErrorKind::ModuleDiscarded, format!("module '{name}' is unavailable"))
        })?;
    module.load_bytecode(engine, &mut input)?;
    Ok(module)
}

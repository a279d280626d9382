//! 모듈 (컴파일 단위)
//!
//! 모듈은 링크된 함수들, 전역 변수 메모리, 문자열 상수 풀, import 테이블을
//! 소유합니다. 라이프사이클 변경(Build/Reset/Restore)은 모듈별 임계 구역
//! `lifecycle` 안에서만 일어나고, 평상시 전역 변수 읽기/쓰기는 `globals`
//! 락만 잡습니다.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::vm::engine::{Engine, GetModuleFlag};
use crate::vm::function::{FunctionId, ScriptFunction, Signature};
use crate::vm::linker::{self, Linked, ScriptSection};
use crate::vm::status::{BuildError, BuildErrorKind, CallResult, ExecutionState, ReturnCode};
use crate::vm::type_def::{DataType, ObjectType};
use crate::vm::value::Value;

/// 모듈 전역 참조 테이블의 한 칸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalRef {
    /// 이 모듈의 전역 변수
    Module(u32),
    /// 엔진 전역 프로퍼티
    Engine(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: DataType,
}

/// import 선언: 다른 모듈에 있는 함수의 시그니처
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub signature: Signature,
    pub source_module: String,
}

#[derive(Debug, Clone)]
pub struct ImportBinding {
    pub module: Arc<Module>,
    pub function: Arc<ScriptFunction>,
}

#[derive(Debug)]
struct ImportSlot {
    decl: ImportDecl,
    binding: Option<ImportBinding>,
}

/// 링크가 끝난 모듈 내용. 한 번 설치되면 바뀌지 않습니다.
#[derive(Debug, Default)]
pub struct ModuleCode {
    pub functions: Vec<Arc<ScriptFunction>>,
    pub init: Option<Arc<ScriptFunction>>,
    pub strings: Vec<String>,
    pub global_refs: Vec<GlobalRef>,
    pub globals: Vec<GlobalDecl>,
    /// 이 모듈이 선언한 스크립트 타입
    pub types: Vec<Arc<ObjectType>>,
}

pub struct Module {
    name: String,
    this: Weak<Module>,
    lifecycle: Mutex<()>,
    code: RwLock<Arc<ModuleCode>>,
    imports: RwLock<Vec<ImportSlot>>,
    globals: RwLock<Vec<Value>>,
    sections: Mutex<Vec<ScriptSection>>,
    context_refs: AtomicU32,
    discarded: AtomicBool,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("name", &self.name).finish()
    }
}

impl Module {
    pub(crate) fn new(name: &str) -> Arc<Module> {
        Arc::new_cyclic(|this| Module {
            name: name.to_string(),
            this: this.clone(),
            lifecycle: Mutex::new(()),
            code: RwLock::new(Arc::new(ModuleCode::default())),
            imports: RwLock::new(Vec::new()),
            globals: RwLock::new(Vec::new()),
            sections: Mutex::new(Vec::new()),
            context_refs: AtomicU32::new(0),
            discarded: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    // ========== 빌드 ==========

    /// 다음 `build()`에서 링크할 섹션 추가
    pub fn add_section(&self, section: ScriptSection) {
        self.sections.lock().push(section);
    }

    /// 이전 내용을 비우고 대기 중인 섹션들을 링크한 뒤 전역 초기화 실행
    ///
    /// 실패하면 모듈은 빈 상태로 남습니다.
    pub fn build(&self, engine: &Arc<Engine>) -> Result<(), BuildError> {
        let _guard = self.lifecycle.lock();
        if self.is_discarded() {
            return Err(BuildError::new(
                BuildErrorKind::ModuleDiscarded,
                format!("module '{}' was discarded", self.name),
            ));
        }
        if self.context_ref_count() > 0 {
            return Err(BuildError::new(
                BuildErrorKind::ModuleInUse,
                format!("module '{}' is referenced by a context", self.name),
            ));
        }
        if let Some(importer) = engine.importer_of(self) {
            return Err(BuildError::new(
                BuildErrorKind::ModuleInUse,
                format!("module '{}' is bound by imports of '{}'", self.name, importer),
            ));
        }

        let released = self.clear(engine);
        release_bindings(engine, released);
        let sections = std::mem::take(&mut *self.sections.lock());
        let section_count = sections.len();
        let Linked { code, imports } = linker::link(engine, &self.name, sections)?;
        self.install(engine, code, imports);

        if engine.config().init_global_vars_after_build
            && let Err(message) = self.init_globals(engine)
        {
            let released = self.clear(engine);
            release_bindings(engine, released);
            return Err(BuildError::new(BuildErrorKind::InitFailed, message));
        }

        debug!(
            module = %self.name,
            sections = section_count,
            functions = self.function_count(),
            globals = self.global_var_count(),
            "module built"
        );
        Ok(())
    }

    /// 전역 변수를 해제하고 초기화 함수를 다시 실행
    pub fn reset_global_vars(&self, engine: &Arc<Engine>) -> CallResult<()> {
        let _guard = self.lifecycle.lock();
        self.init_globals(engine).map_err(|message| {
            warn!(module = %self.name, %message, "global reset failed");
            ReturnCode::InitGlobalVarsFailed
        })
    }

    /// exit(전역 해제) → 0으로 채움 → init 실행
    pub(crate) fn init_globals(&self, engine: &Arc<Engine>) -> Result<(), String> {
        self.release_globals();
        let code = self.code();
        let Some(init) = code.init.clone() else {
            return Ok(());
        };
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| "module is being dropped".to_string())?;

        let mut ctx = engine.create_context();
        ctx.prepare_script(this, init)
            .map_err(|rc| format!("failed to prepare initializer: {rc}"))?;
        match ctx.execute() {
            Ok(ExecutionState::Finished) => Ok(()),
            Ok(state) => {
                let message = ctx
                    .exception_string()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("initializer stopped: {state}"));
                drop(ctx);
                self.release_globals();
                Err(message)
            }
            Err(rc) => {
                drop(ctx);
                self.release_globals();
                Err(format!("initializer failed to run: {rc}"))
            }
        }
    }

    fn release_globals(&self) {
        let old: Vec<Value> = {
            let mut globals = self.globals.write();
            let len = globals.len();
            std::mem::replace(&mut *globals, vec![Value::NULL; len])
        };
        drop(old);
    }

    pub fn discard(&self, engine: &Arc<Engine>) -> CallResult<()> {
        let this = self.this.upgrade().ok_or(ReturnCode::NoModule)?;
        engine.discard(&this)
    }

    // ========== 함수 ==========

    pub fn function_count(&self) -> usize {
        self.code.read().functions.len()
    }

    pub fn function_by_index(&self, index: usize) -> Option<Arc<ScriptFunction>> {
        self.code.read().functions.get(index).cloned()
    }

    pub fn function_by_name(&self, name: &str) -> Option<Arc<ScriptFunction>> {
        self.code
            .read()
            .functions
            .iter()
            .find(|f| f.name() == name)
            .cloned()
    }

    /// 이름과 인터페이스가 모두 맞는 함수
    pub fn function_by_decl(&self, signature: &Signature) -> Option<Arc<ScriptFunction>> {
        self.code
            .read()
            .functions
            .iter()
            .find(|f| f.name() == signature.name && f.signature.interface_matches(signature))
            .cloned()
    }

    pub fn function_id_by_name(&self, name: &str) -> Option<FunctionId> {
        self.function_by_name(name).map(|f| f.id)
    }

    // ========== 전역 변수 ==========

    pub fn global_var_count(&self) -> usize {
        self.code.read().globals.len()
    }

    pub fn global_var_index_by_name(&self, name: &str) -> Option<usize> {
        self.code.read().globals.iter().position(|g| g.name == name)
    }

    pub fn global_var_declaration(&self, index: usize) -> Option<GlobalDecl> {
        self.code.read().globals.get(index).cloned()
    }

    pub fn global(&self, index: usize) -> Option<Value> {
        self.globals.read().get(index).map(Value::share)
    }

    pub fn set_global(&self, index: usize, value: Value) -> CallResult<()> {
        let old = {
            let mut globals = self.globals.write();
            let slot = globals.get_mut(index).ok_or(ReturnCode::InvalidArg)?;
            std::mem::replace(slot, value)
        };
        drop(old);
        Ok(())
    }

    /// 전역 메모리의 스칼라 비트 스냅샷
    pub fn global_bits(&self) -> Vec<u64> {
        self.globals.read().iter().map(Value::bits).collect()
    }

    // ========== import ==========

    pub fn imported_function_count(&self) -> usize {
        self.imports.read().len()
    }

    pub fn imported_function_declaration(&self, index: usize) -> Option<Signature> {
        self.imports
            .read()
            .get(index)
            .map(|slot| slot.decl.signature.clone())
    }

    pub fn imported_function_source_module(&self, index: usize) -> Option<String> {
        self.imports
            .read()
            .get(index)
            .map(|slot| slot.decl.source_module.clone())
    }

    /// import 슬롯에 다른 모듈의 함수를 연결. `None`이면 연결 해제
    ///
    /// 인터페이스가 다르면 `InvalidInterface`를 돌려주고 기존 연결은 그대로입니다.
    pub fn bind_imported_function(
        &self,
        engine: &Arc<Engine>,
        index: usize,
        function: Option<FunctionId>,
    ) -> CallResult<()> {
        let Some(id) = function else {
            let old = {
                let mut imports = self.imports.write();
                let slot = imports.get_mut(index).ok_or(ReturnCode::InvalidArg)?;
                slot.binding.take()
            };
            if old.is_some() {
                debug!(module = %self.name, slot = index, "import unbound");
            }
            release_bindings(engine, old);
            return Ok(());
        };

        let (module, target) = engine.function(id).ok_or(ReturnCode::NoFunction)?;
        let old = {
            let mut imports = self.imports.write();
            let slot = imports.get_mut(index).ok_or(ReturnCode::InvalidArg)?;
            if !slot.decl.signature.interface_matches(&target.signature) {
                warn!(
                    module = %self.name,
                    slot = index,
                    expected = %slot.decl.signature,
                    found = %target.signature,
                    "import interface mismatch"
                );
                return Err(ReturnCode::InvalidInterface);
            }
            slot.binding.replace(ImportBinding {
                module: module.clone(),
                function: target,
            })
        };
        debug!(module = %self.name, slot = index, source = %module.name(), "import bound");
        release_bindings(engine, old);
        Ok(())
    }

    /// 모든 import를 선언된 원본 모듈의 같은 이름/인터페이스 함수에 연결
    pub fn bind_all_imported_functions(&self, engine: &Arc<Engine>) -> CallResult<()> {
        let decls: Vec<ImportDecl> = self.imports.read().iter().map(|s| s.decl.clone()).collect();
        let mut all_bound = true;
        for (index, decl) in decls.iter().enumerate() {
            let candidate = engine
                .get_module(&decl.source_module, GetModuleFlag::OnlyIfExists)
                .and_then(|m| m.function_by_decl(&decl.signature));
            let bound = match candidate {
                Some(f) => self.bind_imported_function(engine, index, Some(f.id)).is_ok(),
                None => false,
            };
            if !bound {
                warn!(
                    module = %self.name,
                    import = %decl.signature,
                    source = %decl.source_module,
                    "import could not be bound"
                );
                all_bound = false;
            }
        }
        if all_bound {
            Ok(())
        } else {
            Err(ReturnCode::CantBindAllFunctions)
        }
    }

    /// 모든 import 연결 해제. 버려진 모듈을 붙잡고 있던 마지막 연결이었다면
    /// 그 모듈은 바로 회수됩니다.
    pub fn unbind_all_imported_functions(&self, engine: &Arc<Engine>) {
        let released = self.take_bindings();
        release_bindings(engine, released);
    }

    pub(crate) fn take_bindings(&self) -> Vec<ImportBinding> {
        self.imports
            .write()
            .iter_mut()
            .filter_map(|slot| slot.binding.take())
            .collect()
    }

    // ========== crate 내부 ==========

    pub(crate) fn code(&self) -> Arc<ModuleCode> {
        self.code.read().clone()
    }

    pub(crate) fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock()
    }

    pub(crate) fn import_binding(&self, index: usize) -> Option<ImportBinding> {
        self.imports.read().get(index)?.binding.clone()
    }

    pub(crate) fn import_declarations(&self) -> Vec<ImportDecl> {
        self.imports.read().iter().map(|s| s.decl.clone()).collect()
    }

    pub(crate) fn global_value(&self, index: usize) -> Option<Value> {
        self.global(index)
    }

    pub(crate) fn set_global_value(&self, index: usize, value: Value) -> bool {
        self.set_global(index, value).is_ok()
    }

    pub(crate) fn add_context_ref(&self) {
        self.context_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// 마지막 참조였는지 돌려줌
    pub(crate) fn release_context_ref(&self) -> bool {
        self.context_refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn context_ref_count(&self) -> u32 {
        self.context_refs.load(Ordering::Acquire)
    }

    /// import 바인딩으로 연결된 모듈들 (모듈 GC의 간선)
    pub(crate) fn bound_modules(&self) -> Vec<Arc<Module>> {
        self.imports
            .read()
            .iter()
            .filter_map(|slot| slot.binding.as_ref().map(|b| b.module.clone()))
            .collect()
    }

    /// 링크 결과 설치. 전역 메모리는 0으로 채워집니다.
    pub(crate) fn install(
        &self,
        engine: &Engine,
        code: ModuleCode,
        imports: Vec<ImportDecl>,
    ) {
        let code = Arc::new(code);
        *self.globals.write() = vec![Value::NULL; code.globals.len()];
        *self.imports.write() = imports
            .into_iter()
            .map(|decl| ImportSlot {
                decl,
                binding: None,
            })
            .collect();
        if let Some(this) = self.this.upgrade() {
            engine.register_functions(&this, &code.functions);
        }
        *self.code.write() = code;
    }

    /// 내용 전부 해제: 전역, import, 함수 등록, 스크립트 타입
    ///
    /// 끊은 import 연결을 돌려줍니다.
    #[must_use]
    pub(crate) fn clear(&self, engine: &Engine) -> Vec<ImportBinding> {
        let globals = std::mem::take(&mut *self.globals.write());
        drop(globals);
        let released = self.take_bindings();
        self.imports.write().clear();

        let code = std::mem::take(&mut *self.code.write());
        engine.unregister_functions(code.functions.iter().map(|f| f.id));
        for ty in &code.types {
            engine.unregister_type(ty.id);
        }
        released
    }

    /// GC가 버려진 모듈을 회수할 때 호출
    pub(crate) fn release_contents(&self, engine: &Engine) {
        drop(self.clear(engine));
        self.sections.lock().clear();
    }

    /// 이 모듈의 함수에 연결된 import가 있는지
    pub(crate) fn is_bound_to(&self, module: &Module) -> bool {
        self.imports.read().iter().any(|slot| {
            slot.binding
                .as_ref()
                .is_some_and(|b| std::ptr::eq(Arc::as_ptr(&b.module), module))
        })
    }
}

/// 끊은 연결을 놓고, 그중 버려진 모듈이 있으면 모듈 GC 실행
pub(crate) fn release_bindings(
    engine: &Arc<Engine>,
    released: impl IntoIterator<Item = ImportBinding>,
) {
    let orphaned = released
        .into_iter()
        .fold(false, |any, binding| any | binding.module.is_discarded());
    if orphaned {
        engine.garbage_collect_modules();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::ByteCode;
    use crate::vm::bytecode::Opcode as O;
    use crate::vm::linker::{FunctionDecl, GlobalInit, GlobalVarDecl};

    fn answer_section() -> ScriptSection {
        let mut section = ScriptSection::new("answer");
        let mut code = ByteCode::new();
        code.instr_w_int(O::SetV4, 1, 42);
        code.instr_w(O::CpyVtoR4, 1);
        code.ret(0);
        section.add_function(FunctionDecl::new(
            Signature::new("answer", DataType::int(), vec![]),
            1,
            code,
        ));
        section
    }

    fn counter_section() -> ScriptSection {
        let mut section = ScriptSection::new("counter");
        let mut init = ByteCode::new();
        init.instr_w_int(O::SetV4, 1, 7);
        init.instr_ww(O::CpyVtoG4, 0, 1);
        let g = section.add_global(GlobalVarDecl {
            name: "start".into(),
            ty: DataType::int(),
            init: Some(GlobalInit {
                variable_space: 1,
                object_vars: vec![],
                code: init,
            }),
        });
        section.global_ref_local(g);
        section
    }

    #[test]
    fn test_build_links_functions() {
        let engine = Engine::with_defaults();
        let module = engine.get_module("m", GetModuleFlag::CreateIfNotExists).unwrap();
        module.add_section(answer_section());
        module.build(&engine).unwrap();
        assert_eq!(module.function_count(), 1);
        let f = module.function_by_name("answer").unwrap();
        assert!(engine.function(f.id).is_some());
    }

    #[test]
    fn test_build_runs_global_initializers() {
        let engine = Engine::with_defaults();
        let module = engine.get_module("m", GetModuleFlag::CreateIfNotExists).unwrap();
        module.add_section(counter_section());
        module.build(&engine).unwrap();
        let idx = module.global_var_index_by_name("start").unwrap();
        assert_eq!(module.global(idx).unwrap().int(), 7);
    }

    #[test]
    fn test_rebuild_clears_previous_contents() {
        let engine = Engine::with_defaults();
        let module = engine.get_module("m", GetModuleFlag::CreateIfNotExists).unwrap();
        module.add_section(answer_section());
        module.build(&engine).unwrap();
        let old_id = module.function_by_name("answer").unwrap().id;

        module.add_section(counter_section());
        module.build(&engine).unwrap();
        assert_eq!(module.function_count(), 0);
        assert!(engine.function(old_id).is_none());
    }

    #[test]
    fn test_discarded_module_cannot_build() {
        let engine = Engine::with_defaults();
        let module = engine.get_module("m", GetModuleFlag::CreateIfNotExists).unwrap();
        engine.discard_module("m").unwrap();
        let err = module.build(&engine).unwrap_err();
        assert_eq!(err.kind, BuildErrorKind::ModuleDiscarded);
    }

    #[test]
    fn test_set_global_out_of_range() {
        let engine = Engine::with_defaults();
        let module = engine.get_module("m", GetModuleFlag::CreateIfNotExists).unwrap();
        assert_eq!(module.set_global(3, Value::from_int(1)), Err(ReturnCode::InvalidArg));
    }
}

//! 엔진 컨텍스트
//!
//! 타입, 네이티브 함수, 엔진 전역 변수, 모듈 레지스트리를 소유합니다.
//! 모든 진입점은 `Arc<Engine>`을 명시적으로 받으며, 각 레지스트리는 자기
//! 락을 가집니다.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::EngineConfig;
use crate::vm::function::{FunctionId, NativeCall, NativeFunction, ScriptFunction, Signature};
use crate::vm::machine::Context;
use crate::vm::module::Module;
use crate::vm::status::{CallResult, ReturnCode};
use crate::vm::type_def::{Behaviours, DataType, ObjectType, TypeFlags, TypeId};
use crate::vm::value::{ObjectHandle, ScriptObject, Value};

pub const STRING_TYPE_NAME: &str = "string";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetModuleFlag {
    OnlyIfExists,
    CreateIfNotExists,
    AlwaysCreate,
}

#[derive(Debug)]
pub struct EngineProperty {
    pub name: String,
    pub ty: DataType,
    pub value: Value,
}

struct TypeRegistry {
    by_id: HashMap<TypeId, Arc<ObjectType>>,
    next_id: TypeId,
}

#[derive(Default)]
struct ModuleRegistry {
    live: Vec<Arc<Module>>,
    discarded: Vec<Arc<Module>>,
}

struct FunctionEntry {
    module: Weak<Module>,
    function: Weak<ScriptFunction>,
}

pub struct Engine {
    config: EngineConfig,
    types: RwLock<TypeRegistry>,
    natives: RwLock<Vec<Arc<NativeFunction>>>,
    properties: RwLock<Vec<EngineProperty>>,
    string_type: RwLock<Option<Arc<ObjectType>>>,
    modules: Mutex<ModuleRegistry>,
    functions: RwLock<HashMap<FunctionId, FunctionEntry>>,
    next_function_id: AtomicU32,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("types", &self.types.read().by_id.len())
            .field("natives", &self.natives.read().len())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> CallResult<Arc<Engine>> {
        config.validate()?;
        Ok(Arc::new(Self::build(config)))
    }

    pub fn with_defaults() -> Arc<Engine> {
        Arc::new(Self::build(EngineConfig::default()))
    }

    fn build(config: EngineConfig) -> Engine {
        Engine {
            config,
            types: RwLock::new(TypeRegistry {
                by_id: HashMap::new(),
                next_id: 1,
            }),
            natives: RwLock::new(Vec::new()),
            properties: RwLock::new(Vec::new()),
            string_type: RwLock::new(None),
            modules: Mutex::new(ModuleRegistry::default()),
            functions: RwLock::new(HashMap::new()),
            next_function_id: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn create_context(self: &Arc<Self>) -> Context {
        Context::new(self)
    }

    // ========== 객체 타입 ==========

    fn insert_type(
        &self,
        name: &str,
        flags: TypeFlags,
        property_count: u16,
        behaviours: Behaviours,
        module: Option<String>,
    ) -> Arc<ObjectType> {
        let mut types = self.types.write();
        let id = types.next_id;
        types.next_id += 1;
        let ty = Arc::new(ObjectType {
            id,
            name: name.to_string(),
            flags,
            property_count,
            behaviours,
            module,
        });
        types.by_id.insert(id, ty.clone());
        ty
    }

    /// 호스트 객체 타입 등록
    pub fn register_object_type(
        &self,
        name: &str,
        flags: TypeFlags,
        property_count: u16,
        behaviours: Behaviours,
    ) -> CallResult<TypeId> {
        if name.is_empty() {
            return Err(ReturnCode::InvalidName);
        }
        if flags.contains(TypeFlags::REF) == flags.contains(TypeFlags::VALUE) {
            return Err(ReturnCode::InvalidArg);
        }
        if self.object_type_by_name(name).is_some() {
            return Err(ReturnCode::AlreadyRegistered);
        }
        let ty = self.insert_type(name, flags, property_count, behaviours, None);
        debug!(name, id = ty.id, "registered object type");
        Ok(ty.id)
    }

    pub(crate) fn register_script_type(
        &self,
        module: &str,
        name: &str,
        property_count: u16,
    ) -> Arc<ObjectType> {
        self.insert_type(
            name,
            TypeFlags::REF | TypeFlags::SCRIPT,
            property_count,
            Behaviours::default(),
            Some(module.to_string()),
        )
    }

    pub(crate) fn unregister_type(&self, id: TypeId) {
        self.types.write().by_id.remove(&id);
    }

    pub fn object_type(&self, id: TypeId) -> Option<Arc<ObjectType>> {
        self.types.read().by_id.get(&id).cloned()
    }

    /// 호스트가 등록한 타입을 이름으로 찾음 (스크립트 타입 제외)
    pub fn object_type_by_name(&self, name: &str) -> Option<Arc<ObjectType>> {
        self.types
            .read()
            .by_id
            .values()
            .find(|t| t.name == name && !t.is_script_type())
            .cloned()
    }

    // ========== 문자열 ==========

    /// `string` 값 타입을 만들고 문자열 상수용 팩토리로 지정 (이미 있으면 그대로)
    pub fn register_string_factory(&self) -> TypeId {
        let mut slot = self.string_type.write();
        if let Some(ty) = slot.as_ref() {
            return ty.id;
        }
        let behaviours = Behaviours {
            copy: Some(Arc::new(|dst: &ScriptObject, src: &ScriptObject| {
                if let Some(s) = src.with_payload_ref(|s: &String| s.clone()) {
                    dst.set_payload(s);
                }
            })),
            ..Behaviours::default()
        };
        let ty = self.insert_type(STRING_TYPE_NAME, TypeFlags::VALUE, 0, behaviours, None);
        *slot = Some(ty.clone());
        ty.id
    }

    pub fn string_type(&self) -> Option<TypeId> {
        self.string_type.read().as_ref().map(|t| t.id)
    }

    pub fn create_string(&self, s: &str) -> CallResult<ObjectHandle> {
        let ty = self
            .string_type
            .read()
            .clone()
            .ok_or(ReturnCode::NoStringFactory)?;
        Ok(ScriptObject::with_payload(ty, s.to_string()))
    }

    pub fn string_value(obj: &ScriptObject) -> Option<String> {
        obj.with_payload_ref(|s: &String| s.clone())
    }

    // ========== 네이티브 함수 ==========

    pub fn register_native_function<F>(&self, signature: Signature, f: F) -> CallResult<FunctionId>
    where
        F: Fn(&mut NativeCall<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        if signature.name.is_empty() {
            return Err(ReturnCode::InvalidName);
        }
        let mut natives = self.natives.write();
        if natives
            .iter()
            .any(|n| n.signature.name == signature.name && n.signature.interface_matches(&signature))
        {
            return Err(ReturnCode::AlreadyRegistered);
        }
        let id = natives.len() as FunctionId;
        debug!(id, decl = %signature, "registered native function");
        natives.push(Arc::new(NativeFunction {
            id,
            signature,
            func: Arc::new(f),
        }));
        Ok(id)
    }

    pub fn native(&self, id: FunctionId) -> Option<Arc<NativeFunction>> {
        self.natives.read().get(id as usize).cloned()
    }

    /// 이름과 인터페이스가 모두 같은 네이티브 함수
    pub fn native_by_signature(&self, signature: &Signature) -> Option<Arc<NativeFunction>> {
        self.natives
            .read()
            .iter()
            .find(|n| n.signature.name == signature.name && n.signature.interface_matches(signature))
            .cloned()
    }

    // ========== 엔진 전역 변수 ==========

    pub fn register_global_property(
        &self,
        name: &str,
        ty: DataType,
        value: Value,
    ) -> CallResult<u32> {
        if name.is_empty() {
            return Err(ReturnCode::InvalidName);
        }
        let mut props = self.properties.write();
        if props.iter().any(|p| p.name == name) {
            return Err(ReturnCode::AlreadyRegistered);
        }
        props.push(EngineProperty {
            name: name.to_string(),
            ty,
            value,
        });
        Ok(props.len() as u32 - 1)
    }

    pub fn global_property_index(&self, name: &str) -> Option<u32> {
        self.properties
            .read()
            .iter()
            .position(|p| p.name == name)
            .map(|i| i as u32)
    }

    pub fn global_property_name(&self, index: u32) -> Option<String> {
        self.properties
            .read()
            .get(index as usize)
            .map(|p| p.name.clone())
    }

    pub fn global_property(&self, index: u32) -> Option<Value> {
        self.properties
            .read()
            .get(index as usize)
            .map(|p| p.value.share())
    }

    pub fn set_global_property(&self, index: u32, value: Value) -> CallResult<()> {
        let old = {
            let mut props = self.properties.write();
            let prop = props.get_mut(index as usize).ok_or(ReturnCode::InvalidArg)?;
            std::mem::replace(&mut prop.value, value)
        };
        drop(old);
        Ok(())
    }

    // ========== 스크립트 함수 레지스트리 ==========

    pub(crate) fn new_function_id(&self) -> FunctionId {
        self.next_function_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_functions(&self, module: &Arc<Module>, functions: &[Arc<ScriptFunction>]) {
        let mut registry = self.functions.write();
        for f in functions {
            registry.insert(
                f.id,
                FunctionEntry {
                    module: Arc::downgrade(module),
                    function: Arc::downgrade(f),
                },
            );
        }
    }

    pub(crate) fn unregister_functions(&self, ids: impl IntoIterator<Item = FunctionId>) {
        let mut registry = self.functions.write();
        for id in ids {
            registry.remove(&id);
        }
    }

    /// 스크립트 함수와 그 함수를 가진 모듈
    pub fn function(&self, id: FunctionId) -> Option<(Arc<Module>, Arc<ScriptFunction>)> {
        let registry = self.functions.read();
        let entry = registry.get(&id)?;
        Some((entry.module.upgrade()?, entry.function.upgrade()?))
    }

    // ========== 모듈 ==========

    pub fn get_module(self: &Arc<Self>, name: &str, flag: GetModuleFlag) -> Option<Arc<Module>> {
        let replaced = {
            let mut reg = self.modules.lock();
            let existing = reg.live.iter().position(|m| m.name() == name);
            match (flag, existing) {
                (GetModuleFlag::OnlyIfExists, Some(i))
                | (GetModuleFlag::CreateIfNotExists, Some(i)) => return Some(reg.live[i].clone()),
                (GetModuleFlag::OnlyIfExists, None) => return None,
                (GetModuleFlag::CreateIfNotExists, None) => {
                    let module = Module::new(name);
                    reg.live.push(module.clone());
                    return Some(module);
                }
                (GetModuleFlag::AlwaysCreate, existing) => {
                    let old = existing.map(|i| reg.live.remove(i));
                    if let Some(old) = &old {
                        old.mark_discarded();
                        reg.discarded.push(old.clone());
                    }
                    let module = Module::new(name);
                    reg.live.push(module.clone());
                    (module, old.is_some())
                }
            }
        };
        let (module, had_old) = replaced;
        if had_old {
            self.garbage_collect_modules();
        }
        Some(module)
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().live.len()
    }

    pub fn discarded_module_count(&self) -> usize {
        self.modules.lock().discarded.len()
    }

    pub fn discard_module(self: &Arc<Self>, name: &str) -> CallResult<()> {
        let module = {
            let reg = self.modules.lock();
            reg.live
                .iter()
                .find(|m| m.name() == name)
                .cloned()
                .ok_or(ReturnCode::NoModule)?
        };
        self.discard(&module)
    }

    pub(crate) fn discard(self: &Arc<Self>, module: &Arc<Module>) -> CallResult<()> {
        {
            let mut reg = self.modules.lock();
            let i = reg
                .live
                .iter()
                .position(|m| Arc::ptr_eq(m, module))
                .ok_or(ReturnCode::NoModule)?;
            let module = reg.live.remove(i);
            module.mark_discarded();
            reg.discarded.push(module);
        }
        debug!(module = module.name(), "module discarded");
        self.garbage_collect_modules();
        Ok(())
    }

    /// `module`의 함수에 import가 연결된 다른 모듈의 이름
    pub(crate) fn importer_of(&self, module: &Module) -> Option<String> {
        let reg = self.modules.lock();
        reg.live
            .iter()
            .chain(reg.discarded.iter())
            .filter(|m| !std::ptr::eq(Arc::as_ptr(m), module))
            .find(|m| m.is_bound_to(module))
            .map(|m| m.name().to_string())
    }

    /// 버려진 모듈 중 도달 불가능한 것들을 함께 해제
    ///
    /// 루트: 살아있는 모듈 + 컨텍스트가 참조 중인 버려진 모듈.
    /// 간선: import 바인딩. 표시되지 않은 버려진 모듈은 서로 순환 참조하고
    /// 있더라도 한 번에 바인딩을 끊고 비웁니다.
    pub fn garbage_collect_modules(self: &Arc<Self>) -> usize {
        let doomed: Vec<Arc<Module>> = {
            let mut reg = self.modules.lock();
            if reg.discarded.is_empty() {
                return 0;
            }
            let mut marked: HashSet<*const Module> = HashSet::new();
            let mut stack: Vec<Arc<Module>> = reg.live.clone();
            stack.extend(
                reg.discarded
                    .iter()
                    .filter(|m| m.context_ref_count() > 0)
                    .cloned(),
            );
            while let Some(m) = stack.pop() {
                if marked.insert(Arc::as_ptr(&m)) {
                    stack.extend(m.bound_modules());
                }
            }
            let (keep, doomed): (Vec<_>, Vec<_>) = reg
                .discarded
                .drain(..)
                .partition(|m| marked.contains(&Arc::as_ptr(m)));
            reg.discarded = keep;
            doomed
        };

        for m in &doomed {
            drop(m.take_bindings());
        }
        for m in &doomed {
            m.release_contents(self);
        }
        if !doomed.is_empty() {
            debug!(freed = doomed.len(), "collected discarded modules");
        }
        doomed.len()
    }
}

impl Drop for Engine {
    // 서로 import하는 모듈들의 순환 참조를 끊음
    fn drop(&mut self) {
        let reg = self.modules.get_mut();
        for m in reg.live.iter().chain(reg.discarded.iter()) {
            drop(m.take_bindings());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            initial_context_stack_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(Engine::new(config).unwrap_err(), ReturnCode::InvalidConfiguration);
    }

    #[test]
    fn test_object_type_registration() {
        let engine = Engine::with_defaults();
        let id = engine
            .register_object_type("vec3", TypeFlags::VALUE, 3, Behaviours::default())
            .unwrap();
        assert_eq!(engine.object_type(id).unwrap().name, "vec3");
        assert_eq!(
            engine.register_object_type("vec3", TypeFlags::VALUE, 3, Behaviours::default()),
            Err(ReturnCode::AlreadyRegistered)
        );
        assert_eq!(
            engine.register_object_type("bad", TypeFlags::empty(), 0, Behaviours::default()),
            Err(ReturnCode::InvalidArg)
        );
    }

    #[test]
    fn test_string_factory_copies_payload() {
        let engine = Engine::with_defaults();
        assert_eq!(engine.create_string("x").unwrap_err(), ReturnCode::NoStringFactory);
        let id = engine.register_string_factory();
        assert_eq!(engine.register_string_factory(), id);
        let s = engine.create_string("hello").unwrap();
        let copy = s.deep_copy();
        assert_eq!(Engine::string_value(&copy).as_deref(), Some("hello"));
    }

    #[test]
    fn test_native_registration_rejects_duplicates() {
        let engine = Engine::with_defaults();
        let sig = Signature::new("f", DataType::int(), vec![DataType::int()]);
        let id = engine
            .register_native_function(sig.clone(), |call: &mut NativeCall<'_>| {
                call.set_return_int(1);
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.native_by_signature(&sig).unwrap().id, id);
        assert_eq!(
            engine.register_native_function(sig, |_: &mut NativeCall<'_>| Ok(())),
            Err(ReturnCode::AlreadyRegistered)
        );
    }

    #[test]
    fn test_global_properties() {
        let engine = Engine::with_defaults();
        let i = engine
            .register_global_property("g", DataType::int(), Value::from_int(3))
            .unwrap();
        assert_eq!(engine.global_property(i).unwrap().int(), 3);
        engine.set_global_property(i, Value::from_int(9)).unwrap();
        assert_eq!(engine.global_property(i).unwrap().int(), 9);
        assert_eq!(engine.global_property_index("g"), Some(i));
    }

    #[test]
    fn test_get_module_flags() {
        let engine = Engine::with_defaults();
        assert!(engine.get_module("a", GetModuleFlag::OnlyIfExists).is_none());
        let a = engine.get_module("a", GetModuleFlag::CreateIfNotExists).unwrap();
        let again = engine.get_module("a", GetModuleFlag::CreateIfNotExists).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        let fresh = engine.get_module("a", GetModuleFlag::AlwaysCreate).unwrap();
        assert!(!Arc::ptr_eq(&a, &fresh));
        assert!(a.is_discarded());
        assert_eq!(engine.module_count(), 1);
        assert_eq!(engine.discarded_module_count(), 0);
    }

    #[test]
    fn test_discard_unknown_module() {
        let engine = Engine::with_defaults();
        assert_eq!(engine.discard_module("nope"), Err(ReturnCode::NoModule));
    }
}

//! 섹션 링커
//!
//! 프런트엔드는 스크립트 섹션 단위로 명령어 리스트를 넘깁니다. 섹션 안의
//! 피연산자는 그 섹션의 테이블을 가리키는 로컬 인덱스입니다:
//!
//! - `Call` → `functions` 인덱스, `CallBnd` → `imports` 인덱스
//! - 전역 변수 short 인자 → `global_refs` 인덱스
//! - `PshStr` → `strings` 인덱스
//! - 타입 인자/`DataType` → `LOCAL_TYPE_BIT`가 붙으면 `types` 인덱스,
//!   아니면 엔진에 등록된 타입 id
//! - `CallSys` → 엔진 네이티브 함수 id
//!
//! `link()`는 이 인덱스들을 모듈 전체 테이블 기준으로 바꾸고 각 함수를
//! finalize 합니다. 전역 초기화 코드는 하나의 `$init` 함수로 합쳐집니다.

use std::sync::Arc;

use tracing::debug;

use crate::vm::builder::ByteCode;
use crate::vm::bytecode::{Opcode, global_slot};
use crate::vm::engine::Engine;
use crate::vm::function::{ObjectVar, ScriptFunction, Signature};
use crate::vm::module::{GlobalDecl, GlobalRef, ImportDecl, ModuleCode};
use crate::vm::status::{BuildError, BuildErrorKind};
use crate::vm::type_def::{
    DataType, LOCAL_TYPE_BIT, LOCAL_TYPE_PTR_BIT, ObjectType, TypeId,
};

pub const INIT_FUNCTION_NAME: &str = "$init";

// ========== 섹션 (프런트엔드 경계) ==========

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub property_count: u16,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub signature: Signature,
    /// 인자를 제외한 지역 변수 셀 수
    pub variable_space: u32,
    pub object_vars: Vec<ObjectVar>,
    pub code: ByteCode,
}

impl FunctionDecl {
    pub fn new(signature: Signature, variable_space: u32, code: ByteCode) -> Self {
        Self {
            signature,
            variable_space,
            object_vars: Vec::new(),
            code,
        }
    }

    pub fn with_object_vars(mut self, object_vars: Vec<ObjectVar>) -> Self {
        self.object_vars = object_vars;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GlobalInit {
    pub variable_space: u32,
    pub object_vars: Vec<ObjectVar>,
    pub code: ByteCode,
}

#[derive(Debug, Clone)]
pub struct GlobalVarDecl {
    pub name: String,
    pub ty: DataType,
    pub init: Option<GlobalInit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionGlobal {
    /// 섹션 `globals` 인덱스
    Local(u32),
    /// 엔진 전역 프로퍼티 인덱스
    Engine(u32),
}

#[derive(Debug, Clone, Default)]
pub struct ScriptSection {
    pub name: String,
    pub types: Vec<ClassDecl>,
    pub functions: Vec<FunctionDecl>,
    pub globals: Vec<GlobalVarDecl>,
    pub global_refs: Vec<SectionGlobal>,
    pub imports: Vec<ImportDecl>,
    pub strings: Vec<String>,
}

impl ScriptSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_type(&mut self, name: impl Into<String>, property_count: u16) -> u32 {
        self.types.push(ClassDecl {
            name: name.into(),
            property_count,
        });
        self.types.len() as u32 - 1
    }

    pub fn add_function(&mut self, decl: FunctionDecl) -> u32 {
        self.functions.push(decl);
        self.functions.len() as u32 - 1
    }

    pub fn add_global(&mut self, decl: GlobalVarDecl) -> u32 {
        self.globals.push(decl);
        self.globals.len() as u32 - 1
    }

    /// 전역 변수 명령어에 쓸 인덱스
    pub fn global_ref_local(&mut self, global: u32) -> i16 {
        self.global_ref(SectionGlobal::Local(global))
    }

    pub fn global_ref_engine(&mut self, property: u32) -> i16 {
        self.global_ref(SectionGlobal::Engine(property))
    }

    fn global_ref(&mut self, r: SectionGlobal) -> i16 {
        match self.global_refs.iter().position(|&g| g == r) {
            Some(i) => i as i16,
            None => {
                self.global_refs.push(r);
                self.global_refs.len() as i16 - 1
            }
        }
    }

    pub fn add_import(&mut self, signature: Signature, source_module: impl Into<String>) -> u32 {
        self.imports.push(ImportDecl {
            signature,
            source_module: source_module.into(),
        });
        self.imports.len() as u32 - 1
    }

    pub fn add_string(&mut self, s: impl Into<String>) -> u32 {
        self.strings.push(s.into());
        self.strings.len() as u32 - 1
    }
}

// ========== 링크 ==========

#[derive(Debug)]
pub struct Linked {
    pub code: ModuleCode,
    pub imports: Vec<ImportDecl>,
}

fn link_error(section: &str, message: String) -> BuildError {
    BuildError::new(BuildErrorKind::Link, format!("{section}: {message}"))
}

/// 섹션 로컬 인덱스 → 모듈 인덱스 변환표
struct SectionMap<'a> {
    section: &'a str,
    engine: &'a Engine,
    function_base: u32,
    function_count: u32,
    import_base: u32,
    import_count: u32,
    globals: Vec<i16>,
    strings: Vec<u32>,
    types: Vec<TypeId>,
}

impl SectionMap<'_> {
    fn error(&self, message: String) -> BuildError {
        link_error(self.section, message)
    }

    fn local_index(&self, index: u32, count: u32, what: &str) -> Result<u32, BuildError> {
        if index < count {
            Ok(index)
        } else {
            Err(self.error(format!("{what} index {index} out of range ({count})")))
        }
    }

    fn type_id(&self, id: u32) -> Result<TypeId, BuildError> {
        if id & LOCAL_TYPE_BIT != 0 {
            let local = id & !LOCAL_TYPE_BIT;
            return self
                .types
                .get(local as usize)
                .copied()
                .ok_or_else(|| self.error(format!("local type {local} is not declared")));
        }
        self.engine
            .object_type(id)
            .map(|t| t.id)
            .ok_or_else(|| self.error(format!("unknown object type {id}")))
    }

    fn type_ptr(&self, ptr: u64) -> Result<TypeId, BuildError> {
        if ptr & LOCAL_TYPE_PTR_BIT != 0 {
            let local = (ptr & !LOCAL_TYPE_PTR_BIT) as u32;
            return self.type_id(local | LOCAL_TYPE_BIT);
        }
        let id = u32::try_from(ptr).map_err(|_| self.error(format!("bad type operand {ptr:#x}")))?;
        self.type_id(id)
    }

    fn data_type(&self, ty: DataType) -> Result<DataType, BuildError> {
        match ty.object_type() {
            Some(id) => {
                let resolved = self.type_id(id)?;
                Ok(ty.map_object_type(|_| resolved))
            }
            None => Ok(ty),
        }
    }

    fn signature(&self, sig: &Signature) -> Result<Signature, BuildError> {
        Ok(Signature {
            name: sig.name.clone(),
            return_type: self.data_type(sig.return_type)?,
            params: sig
                .params
                .iter()
                .map(|p| self.data_type(*p))
                .collect::<Result<_, _>>()?,
        })
    }

    fn object_vars(&self, vars: &[ObjectVar]) -> Result<Vec<ObjectVar>, BuildError> {
        vars.iter()
            .map(|v| {
                Ok(ObjectVar {
                    offset: v.offset,
                    type_id: self.type_id(v.type_id)?,
                })
            })
            .collect()
    }

    fn translate(&self, code: &mut ByteCode) -> Result<(), BuildError> {
        let mut fault = None;
        code.for_each_instr_mut(|op, args| {
            if fault.is_some() {
                return;
            }
            if let Err(e) = self.translate_instr(op, args) {
                fault = Some(e);
            }
        });
        fault.map_or(Ok(()), Err)
    }

    fn translate_instr(
        &self,
        op: Opcode,
        args: &mut crate::vm::bytecode::InstrArgs,
    ) -> Result<(), BuildError> {
        match op {
            Opcode::Call => {
                let i = self.local_index(args.dword(), self.function_count, "function")?;
                args.arg = (self.function_base + i) as u64;
            }
            Opcode::CallBnd => {
                let i = self.local_index(args.dword(), self.import_count, "import")?;
                args.arg = (self.import_base + i) as u64;
            }
            Opcode::CallSys => {
                if self.engine.native(args.dword()).is_none() {
                    return Err(self.error(format!("unknown native function {}", args.dword())));
                }
            }
            Opcode::PshStr => {
                let i = self.local_index(args.dword(), self.strings.len() as u32, "string")?;
                args.arg = self.strings[i as usize] as u64;
            }
            Opcode::TypeId => args.arg = self.type_id(args.dword())? as u64,
            Opcode::Alloc | Opcode::FreeV => args.arg = self.type_ptr(args.arg)? as u64,
            _ => {}
        }
        if let Some(slot) = global_slot(op) {
            let local = args.w[slot] as u16 as u32;
            let i = self.local_index(local, self.globals.len() as u32, "global")?;
            args.w[slot] = self.globals[i as usize];
        }
        Ok(())
    }
}

fn finalize_function(
    engine: &Engine,
    module_name: &str,
    signature: Signature,
    variable_space: u32,
    object_vars: Vec<ObjectVar>,
    code: ByteCode,
) -> Result<Arc<ScriptFunction>, BuildError> {
    let out = code.finalize(engine.config())?;
    Ok(Arc::new(ScriptFunction {
        id: engine.new_function_id(),
        signature,
        module: module_name.to_string(),
        code: out.code,
        stack_needed: variable_space + out.largest_stack_used,
        variable_space,
        object_vars,
        line_numbers: out.line_numbers,
    }))
}

/// 섹션들을 하나의 모듈 내용으로 링크
///
/// 실패하면 도중에 등록한 스크립트 타입을 모두 해제합니다.
pub fn link(
    engine: &Arc<Engine>,
    module_name: &str,
    sections: Vec<ScriptSection>,
) -> Result<Linked, BuildError> {
    let mut created: Vec<Arc<ObjectType>> = Vec::new();
    let result = link_sections(engine, module_name, sections, &mut created);
    if result.is_err() {
        for ty in &created {
            engine.unregister_type(ty.id);
        }
    }
    result
}

fn intern<T: PartialEq>(table: &mut Vec<T>, value: T) -> usize {
    match table.iter().position(|v| *v == value) {
        Some(i) => i,
        None => {
            table.push(value);
            table.len() - 1
        }
    }
}

fn link_sections(
    engine: &Arc<Engine>,
    module_name: &str,
    sections: Vec<ScriptSection>,
    created: &mut Vec<Arc<ObjectType>>,
) -> Result<Linked, BuildError> {
    let mut code = ModuleCode::default();
    let mut imports = Vec::new();
    let mut function_base = 0u32;
    let mut import_base = 0u32;
    let mut global_base = 0u32;

    // 1단계: 타입 등록과 인덱스 변환표
    let mut maps = Vec::with_capacity(sections.len());
    for section in &sections {
        let mut types = Vec::with_capacity(section.types.len());
        for class in &section.types {
            let ty = engine.register_script_type(module_name, &class.name, class.property_count);
            types.push(ty.id);
            created.push(ty);
        }

        let mut globals = Vec::with_capacity(section.global_refs.len());
        for r in &section.global_refs {
            let global = match *r {
                SectionGlobal::Local(i) if (i as usize) < section.globals.len() => {
                    GlobalRef::Module(global_base + i)
                }
                SectionGlobal::Engine(i) if engine.global_property(i).is_some() => {
                    GlobalRef::Engine(i)
                }
                other => {
                    return Err(link_error(
                        &section.name,
                        format!("unresolved global reference {other:?}"),
                    ));
                }
            };
            let index = intern(&mut code.global_refs, global);
            let index = i16::try_from(index)
                .map_err(|_| link_error(&section.name, "too many global references".into()))?;
            globals.push(index);
        }

        let strings = section
            .strings
            .iter()
            .map(|s| intern(&mut code.strings, s.clone()) as u32)
            .collect();

        maps.push((function_base, import_base, globals, strings, types));
        function_base += section.functions.len() as u32;
        import_base += section.imports.len() as u32;
        global_base += section.globals.len() as u32;
    }

    // 2단계: 피연산자 변환과 finalize
    let mut init_code: Option<ByteCode> = None;
    let mut init_space = 0u32;
    let mut init_vars: Vec<ObjectVar> = Vec::new();

    for (section, (function_base, import_base, globals, strings, types)) in
        sections.into_iter().zip(maps)
    {
        let map = SectionMap {
            section: &section.name,
            engine,
            function_base,
            function_count: section.functions.len() as u32,
            import_base,
            import_count: section.imports.len() as u32,
            globals,
            strings,
            types,
        };

        for decl in &section.imports {
            imports.push(ImportDecl {
                signature: map.signature(&decl.signature)?,
                source_module: decl.source_module.clone(),
            });
        }

        for global in section.globals {
            code.globals.push(GlobalDecl {
                name: global.name.clone(),
                ty: map.data_type(global.ty)?,
            });
            if let Some(mut init) = global.init {
                map.translate(&mut init.code)?;
                init_space = init_space.max(init.variable_space);
                for var in map.object_vars(&init.object_vars)? {
                    if !init_vars.iter().any(|v| v.offset == var.offset) {
                        init_vars.push(var);
                    }
                }
                match init_code.as_mut() {
                    Some(all) => all.append(init.code),
                    None => init_code = Some(init.code),
                }
            }
        }

        for decl in section.functions {
            let FunctionDecl {
                signature,
                variable_space,
                object_vars,
                code: mut body,
            } = decl;
            let signature = map.signature(&signature)?;
            let object_vars = map.object_vars(&object_vars)?;
            // 객체 인자는 프레임 정리 때 따로 해제됨. 지역 변수 영역만 허용
            if let Some(bad) = object_vars
                .iter()
                .find(|v| !(1..=variable_space as i32).contains(&(v.offset as i32)))
            {
                return Err(map.error(format!(
                    "object variable {} outside the frame of {}",
                    bad.offset, signature.name
                )));
            }
            map.translate(&mut body)?;
            let function = finalize_function(
                engine,
                module_name,
                signature,
                variable_space,
                object_vars,
                body,
            )?;
            code.functions.push(function);
        }
    }

    if let Some(mut init) = init_code {
        init.ret(0);
        code.init = Some(finalize_function(
            engine,
            module_name,
            Signature::new(INIT_FUNCTION_NAME, DataType::void(), vec![]),
            init_space,
            init_vars,
            init,
        )?);
    }
    code.types = created.clone();

    debug!(
        module = module_name,
        functions = code.functions.len(),
        globals = code.globals.len(),
        strings = code.strings.len(),
        imports = imports.len(),
        "linked module"
    );
    Ok(Linked { code, imports })
}

// Restore: 섹션 읽기, 구조 검증, 2차 패치, 설치

use std::collections::HashSet;
use std::io::{ErrorKind, Read};
use std::sync::Arc;

use bincode::error::DecodeError;
use serde::de::DeserializeOwned;

use super::records::*;
use super::{StreamResult, stream_config};
use crate::vm::bytecode::{Opcode, dword_slot, global_slot, instructions, qword_slot};
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionId, ObjectVar, ScriptFunction, Signature};
use crate::vm::module::{GlobalDecl, GlobalRef, ImportDecl, Module, ModuleCode, release_bindings};
use crate::vm::status::{StreamError, StreamErrorKind};
use crate::vm::type_def::{DataType, ObjectType, TypeFlags, TypeId};

/// 섹션 하나를 `limit` 바이트 안에서 디코드
fn read_section<R: Read, T: DeserializeOwned>(input: &mut R, limit: u64) -> StreamResult<T> {
    let mut limited = Read::take(&mut *input, limit);
    bincode::serde::decode_from_std_read(&mut limited, stream_config()).map_err(|e| {
        if limited.limit() == 0 {
            return StreamError::corrupt(format!("section exceeds {limit} bytes"));
        }
        match e {
            DecodeError::UnexpectedEnd { .. } => {
                StreamError::new(StreamErrorKind::Truncated, "stream ended inside a section")
            }
            DecodeError::Io { inner, .. } if inner.kind() == ErrorKind::UnexpectedEof => {
                StreamError::new(StreamErrorKind::Truncated, "stream ended inside a section")
            }
            DecodeError::Io { inner, .. } => StreamError::new(StreamErrorKind::Io, inner.to_string()),
            other => StreamError::corrupt(other.to_string()),
        }
    })
}

/// 스트림 인덱스 → 라이브 id 변환표
struct Tables {
    types: Vec<TypeId>,
    natives: Vec<FunctionId>,
    type_ids: Vec<u32>,
    function_count: usize,
    import_count: usize,
    global_ref_count: usize,
    string_count: usize,
}

impl Tables {
    fn type_id(&self, index: u32) -> StreamResult<TypeId> {
        self.types
            .get(index as usize)
            .copied()
            .ok_or_else(|| StreamError::corrupt(format!("type index {index} out of range")))
    }

    fn data_type(&self, ty: DataType) -> StreamResult<DataType> {
        match ty.object_type() {
            Some(i) => {
                let id = self.type_id(i)?;
                Ok(ty.map_object_type(|_| id))
            }
            None => Ok(ty),
        }
    }

    fn signature(&self, sig: &Signature) -> StreamResult<Signature> {
        Ok(Signature {
            name: sig.name.clone(),
            return_type: self.data_type(sig.return_type)?,
            params: sig
                .params
                .iter()
                .map(|p| self.data_type(*p))
                .collect::<StreamResult<_>>()?,
        })
    }
}

// ========== 검증 ==========

fn in_range(name: &str, what: &str, index: u64, count: usize) -> StreamResult<()> {
    if index < count as u64 {
        Ok(())
    } else {
        Err(StreamError::corrupt(format!(
            "{name}: {what} index {index} out of range ({count})"
        )))
    }
}

/// 함수 본문의 구조 검증. 통과한 코드만 패치/설치됩니다.
fn validate(record: &FunctionRecord, tables: &Tables) -> StreamResult<()> {
    let name = record.signature.name.as_str();
    let corrupt = |message: String| StreamError::corrupt(format!("{name}: {message}"));

    if record.stack_needed < record.variable_space {
        return Err(corrupt("stack size smaller than variable space".into()));
    }
    let params = record.signature.params.len() as i32;
    let vars = (1 - params)..=record.variable_space as i32;
    for v in &record.object_vars {
        if !(1..=record.variable_space as i32).contains(&(v.offset as i32)) {
            return Err(corrupt(format!("object variable {} outside the frame", v.offset)));
        }
        in_range(name, "type", v.type_id as u64, tables.types.len())?;
    }

    let mut decoded = Vec::new();
    for item in instructions(&record.code) {
        let (ip, op, args) = item.map_err(|fault| corrupt(format!("bad instruction ({fault:?})")))?;
        decoded.push((ip, op, args));
    }
    let boundaries: HashSet<usize> = decoded.iter().map(|&(ip, _, _)| ip).collect();

    for (n, &(ip, op, args)) in decoded.iter().enumerate() {
        let kind = op.kind();
        let globals = global_slot(op);
        let var_slots = kind.written_var().into_iter().chain(kind.read_vars().iter().copied());
        for slot in var_slots.filter(|s| Some(*s) != globals) {
            if !vars.contains(&(args.w[slot] as i32)) {
                return Err(corrupt(format!(
                    "{op} at {ip}: variable {} outside the frame",
                    args.w[slot]
                )));
            }
        }
        if let Some(slot) = globals {
            in_range(name, "global", args.w[slot] as u16 as u64, tables.global_ref_count)?;
        }

        match op {
            op if op.is_jump() => {
                let target = (ip + op.size() as usize) as i64 + args.int() as i64;
                if target < 0 || !boundaries.contains(&(target as usize)) {
                    return Err(corrupt(format!("{op} at {ip}: jump to {target}")));
                }
            }
            Opcode::JmpP => {
                let len = args.dword() as usize;
                let table = decoded.get(n + 1..n + 1 + len);
                if len == 0 || !table.is_some_and(|t| t.iter().all(|&(_, o, _)| o == Opcode::Jmp)) {
                    return Err(corrupt(format!("JmpP at {ip}: malformed jump table")));
                }
            }
            Opcode::Call => in_range(name, "function", args.arg, tables.function_count)?,
            Opcode::CallBnd => in_range(name, "import", args.arg, tables.import_count)?,
            Opcode::CallSys => in_range(name, "native", args.arg, tables.natives.len())?,
            Opcode::PshStr => in_range(name, "string", args.arg, tables.string_count)?,
            Opcode::TypeId => in_range(name, "type id", args.arg, tables.type_ids.len())?,
            Opcode::Alloc | Opcode::FreeV => in_range(name, "type", args.arg, tables.types.len())?,
            _ => {}
        }
    }

    if let Some(e) = record.line_numbers.iter().find(|e| e.offset as usize > record.code.len()) {
        return Err(corrupt(format!("line entry at {} past the end", e.offset)));
    }
    Ok(())
}

/// 2차 패스: 스트림 인덱스를 라이브 id로 되돌림
fn patch(record: &FunctionRecord, tables: &Tables) -> StreamResult<Vec<u32>> {
    let mut code = record.code.clone();
    for item in instructions(&record.code) {
        let (ip, op, args) = item.map_err(|fault| StreamError::corrupt(format!("{fault:?}")))?;
        match op {
            Opcode::Alloc | Opcode::FreeV => {
                let id = tables.type_id(args.arg as u32)? as u64;
                if let Some(slot) = qword_slot(op) {
                    code[ip + slot] = id as u32;
                    code[ip + slot + 1] = (id >> 32) as u32;
                }
            }
            Opcode::TypeId => {
                let index = tables.type_ids.get(args.dword() as usize).copied();
                let id = tables.type_id(index.unwrap_or(u32::MAX))?;
                if let Some(slot) = dword_slot(op) {
                    code[ip + slot] = id;
                }
            }
            Opcode::CallSys => {
                let id = tables.natives.get(args.dword() as usize).copied().ok_or_else(|| {
                    StreamError::corrupt(format!("native index {} out of range", args.dword()))
                })?;
                if let Some(slot) = dword_slot(op) {
                    code[ip + slot] = id;
                }
            }
            _ => {}
        }
    }
    Ok(code)
}

fn finish_function(
    engine: &Engine,
    module: &str,
    record: &FunctionRecord,
    tables: &Tables,
) -> StreamResult<Arc<ScriptFunction>> {
    Ok(Arc::new(ScriptFunction {
        id: engine.new_function_id(),
        signature: tables.signature(&record.signature)?,
        module: module.to_string(),
        code: patch(record, tables)?,
        stack_needed: record.stack_needed,
        variable_space: record.variable_space,
        object_vars: record
            .object_vars
            .iter()
            .map(|v| {
                Ok(ObjectVar {
                    offset: v.offset,
                    type_id: tables.type_id(v.type_id)?,
                })
            })
            .collect::<StreamResult<_>>()?,
        line_numbers: record.line_numbers.clone(),
    }))
}

// ========== Restore ==========

pub(super) fn restore<R: Read>(
    module: &Module,
    engine: &Arc<Engine>,
    input: &mut R,
) -> StreamResult<()> {
    let _guard = module.lock_lifecycle();
    if module.is_discarded() {
        return Err(StreamError::new(
            StreamErrorKind::ModuleDiscarded,
            format!("module '{}' was discarded", module.name()),
        ));
    }
    if module.context_ref_count() > 0 {
        return Err(StreamError::new(
            StreamErrorKind::ModuleInUse,
            format!("module '{}' is referenced by a context", module.name()),
        ));
    }
    if let Some(importer) = engine.importer_of(module) {
        return Err(StreamError::new(
            StreamErrorKind::ModuleInUse,
            format!("module '{}' is bound by imports of '{}'", module.name(), importer),
        ));
    }
    release_bindings(engine, module.clear(engine));

    let mut created = Vec::new();
    let result = restore_contents(module, engine, input, &mut created);
    if let Err(e) = &result {
        release_bindings(engine, module.clear(engine));
        for ty in &created {
            engine.unregister_type(ty.id);
        }
        tracing::warn!(module = module.name(), kind = %e.kind, message = %e.message, "restore rejected");
    }
    result
}

fn restore_contents<R: Read>(
    module: &Module,
    engine: &Arc<Engine>,
    input: &mut R,
    created: &mut Vec<Arc<ObjectType>>,
) -> StreamResult<()> {
    let limit = engine.config().max_stream_section_bytes;

    let header: Header = read_section(input, limit)?;
    if header.magic != MAGIC {
        return Err(StreamError::corrupt("not a bytecode stream"));
    }
    if header.version != FORMAT_VERSION {
        return Err(StreamError::corrupt(format!(
            "unsupported format version {}",
            header.version
        )));
    }

    // 타입은 뒤 섹션들이 인덱스로 참조하므로 먼저 복원
    let type_section: TypeSection = read_section(input, limit)?;
    let mut types = Vec::with_capacity(type_section.local.len() + type_section.external.len());
    for local in &type_section.local {
        TypeFlags::from_bits(local.flags)
            .filter(|f| f.contains(TypeFlags::SCRIPT))
            .ok_or_else(|| StreamError::corrupt(format!("type '{}' has bad flags", local.name)))?;
        let ty = engine.register_script_type(module.name(), &local.name, local.property_count);
        types.push(ty.id);
        created.push(ty);
    }
    for name in &type_section.external {
        let ty = engine.object_type_by_name(name).ok_or_else(|| {
            StreamError::new(StreamErrorKind::UnknownType, format!("type '{name}' is not registered"))
        })?;
        types.push(ty.id);
    }

    let global_section: GlobalSection = read_section(input, limit)?;
    if global_section.memory_size as usize != global_section.globals.len() {
        return Err(StreamError::corrupt("global memory size does not match declarations"));
    }

    let access: AccessSection = read_section(input, limit)?;
    let mut properties = Vec::with_capacity(access.engine_properties.len());
    for name in &access.engine_properties {
        let index = engine.global_property_index(name).ok_or_else(|| {
            StreamError::new(
                StreamErrorKind::UnknownProperty,
                format!("engine property '{name}' is not registered"),
            )
        })?;
        properties.push(index);
    }
    let global_refs = access
        .table
        .iter()
        .map(|&entry| {
            if entry >= 0 {
                in_range("globals", "global", entry as u64, global_section.globals.len())?;
                Ok(GlobalRef::Module(entry as u32))
            } else {
                let k = (-(entry as i64) - 1) as usize;
                properties
                    .get(k)
                    .map(|&p| GlobalRef::Engine(p))
                    .ok_or_else(|| StreamError::corrupt(format!("engine property slot {k} missing")))
            }
        })
        .collect::<StreamResult<Vec<_>>>()?;

    let mut tables = Tables {
        types,
        natives: Vec::new(),
        type_ids: Vec::new(),
        function_count: 0,
        import_count: 0,
        global_ref_count: global_refs.len(),
        string_count: 0,
    };

    let native_section: NativeSection = read_section(input, limit)?;
    for sig in &native_section.signatures {
        let sig = tables.signature(sig)?;
        let native = engine.native_by_signature(&sig).ok_or_else(|| {
            StreamError::new(
                StreamErrorKind::UnknownFunction,
                format!("native function '{sig}' is not registered"),
            )
        })?;
        tables.natives.push(native.id);
    }

    let init: Option<FunctionRecord> = read_section(input, limit)?;
    let count: u32 = read_section(input, limit)?;
    let mut records = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        records.push(read_section::<_, FunctionRecord>(input, limit)?);
    }
    let strings: StringSection = read_section(input, limit)?;
    let imports: ImportSection = read_section(input, limit)?;
    // TypeId 피연산자는 스트림 끝의 이 테이블을 읽은 뒤에야 해석됩니다
    let type_ids: TypeIdSection = read_section(input, limit)?;

    tables.function_count = records.len();
    tables.import_count = imports.imports.len();
    tables.string_count = strings.strings.len();
    tables.type_ids = type_ids.entries;
    if let Some(&bad) = tables.type_ids.iter().find(|&&i| i as usize >= tables.types.len()) {
        return Err(StreamError::corrupt(format!("type id entry {bad} out of range")));
    }

    for record in init.iter().chain(&records) {
        validate(record, &tables)?;
    }

    let globals = global_section
        .globals
        .iter()
        .map(|g| {
            Ok(GlobalDecl {
                name: g.name.clone(),
                ty: tables.data_type(g.ty)?,
            })
        })
        .collect::<StreamResult<Vec<_>>>()?;
    let import_decls = imports
        .imports
        .iter()
        .map(|d| {
            Ok(ImportDecl {
                signature: tables.signature(&d.signature)?,
                source_module: d.source_module.clone(),
            })
        })
        .collect::<StreamResult<Vec<_>>>()?;

    let functions = records
        .iter()
        .map(|r| finish_function(engine, module.name(), r, &tables))
        .collect::<StreamResult<Vec<_>>>()?;
    let init = init
        .as_ref()
        .map(|r| finish_function(engine, module.name(), r, &tables))
        .transpose()?;

    let function_count = functions.len();
    module.install(
        engine,
        ModuleCode {
            functions,
            init,
            strings: strings.strings,
            global_refs,
            globals,
            types: created.clone(),
        },
        import_decls,
    );

    if engine.config().init_global_vars_after_build
        && let Err(message) = module.init_globals(engine)
    {
        return Err(StreamError::new(StreamErrorKind::InitFailed, message));
    }

    tracing::debug!(module = module.name(), functions = function_count, "module restored");
    Ok(())
}

// Save: 모듈 내용을 섹션 순서대로 기록

use std::collections::HashMap;
use std::io::Write;

use serde::Serialize;

use super::records::*;
use super::{StreamResult, stream_config};
use crate::vm::bytecode::{Opcode, dword_slot, instructions, qword_slot};
use crate::vm::engine::Engine;
use crate::vm::function::{FunctionId, ObjectVar, ScriptFunction, Signature};
use crate::vm::module::{GlobalRef, ImportDecl, Module};
use crate::vm::status::{StreamError, StreamErrorKind};
use crate::vm::type_def::{DataType, ObjectType, TypeId};

/// 라이브 타입 id → 스트림 타입 테이블 인덱스
struct TypeTable<'a> {
    engine: &'a Engine,
    index: HashMap<TypeId, u32>,
    local: usize,
    external: Vec<String>,
}

impl<'a> TypeTable<'a> {
    fn new(engine: &'a Engine, local: &[std::sync::Arc<ObjectType>]) -> Self {
        let index = local
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i as u32))
            .collect();
        Self {
            engine,
            index,
            local: local.len(),
            external: Vec::new(),
        }
    }

    fn index_of(&mut self, id: TypeId) -> StreamResult<u32> {
        if let Some(&i) = self.index.get(&id) {
            return Ok(i);
        }
        let ty = self.engine.object_type(id).ok_or_else(|| {
            StreamError::new(StreamErrorKind::UnknownType, format!("type {id} is not registered"))
        })?;
        let i = (self.local + self.external.len()) as u32;
        self.external.push(ty.name.clone());
        self.index.insert(id, i);
        Ok(i)
    }

    fn data_type(&mut self, ty: DataType) -> StreamResult<DataType> {
        match ty.object_type() {
            Some(id) => {
                let i = self.index_of(id)?;
                Ok(ty.map_object_type(|_| i))
            }
            None => Ok(ty),
        }
    }

    fn signature(&mut self, sig: &Signature) -> StreamResult<Signature> {
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

/// 값을 처음 본 순서대로 번호 매김
#[derive(Default)]
struct Interner<T> {
    items: Vec<T>,
}

impl<T: PartialEq> Interner<T> {
    fn intern(&mut self, value: T) -> u32 {
        match self.items.iter().position(|v| *v == value) {
            Some(i) => i as u32,
            None => {
                self.items.push(value);
                self.items.len() as u32 - 1
            }
        }
    }
}

struct Writer<'a> {
    engine: &'a Engine,
    types: TypeTable<'a>,
    natives: Interner<FunctionId>,
    type_ids: Interner<u32>,
}

impl Writer<'_> {
    fn function(&mut self, f: &ScriptFunction) -> StreamResult<FunctionRecord> {
        let mut code = f.code.clone();
        for item in instructions(&f.code) {
            let (ip, op, args) = item.map_err(|fault| {
                StreamError::corrupt(format!("{}: undecodable code ({fault:?})", f.name()))
            })?;
            match op {
                Opcode::Alloc | Opcode::FreeV => {
                    let id = u32::try_from(args.arg).map_err(|_| {
                        StreamError::corrupt(format!("{}: bad type operand", f.name()))
                    })?;
                    let i = self.types.index_of(id)? as u64;
                    if let Some(slot) = qword_slot(op) {
                        code[ip + slot] = i as u32;
                        code[ip + slot + 1] = (i >> 32) as u32;
                    }
                }
                Opcode::TypeId => {
                    let i = self.types.index_of(args.dword())?;
                    let entry = self.type_ids.intern(i);
                    if let Some(slot) = dword_slot(op) {
                        code[ip + slot] = entry;
                    }
                }
                Opcode::CallSys => {
                    let entry = self.natives.intern(args.dword());
                    if let Some(slot) = dword_slot(op) {
                        code[ip + slot] = entry;
                    }
                }
                _ => {}
            }
        }

        Ok(FunctionRecord {
            signature: self.types.signature(&f.signature)?,
            variable_space: f.variable_space,
            stack_needed: f.stack_needed,
            object_vars: f
                .object_vars
                .iter()
                .map(|v| {
                    Ok(ObjectVar {
                        offset: v.offset,
                        type_id: self.types.index_of(v.type_id)?,
                    })
                })
                .collect::<StreamResult<_>>()?,
            code,
            line_numbers: f.line_numbers.clone(),
        })
    }

    fn native_signatures(&mut self) -> StreamResult<Vec<Signature>> {
        let ids = self.natives.items.clone();
        ids.into_iter()
            .map(|id| {
                let native = self.engine.native(id).ok_or_else(|| {
                    StreamError::new(
                        StreamErrorKind::UnknownFunction,
                        format!("native function {id} is not registered"),
                    )
                })?;
                self.types.signature(&native.signature)
            })
            .collect()
    }
}

fn write_section<W: Write, T: Serialize>(out: &mut W, record: &T) -> StreamResult<()> {
    bincode::serde::encode_into_std_write(record, out, stream_config())
        .map(|_| ())
        .map_err(|e| StreamError::new(StreamErrorKind::Io, e.to_string()))
}

pub(super) fn save<W: Write>(module: &Module, engine: &Engine, out: &mut W) -> StreamResult<()> {
    let code = module.code();
    let mut writer = Writer {
        engine,
        types: TypeTable::new(engine, &code.types),
        natives: Interner::default(),
        type_ids: Interner::default(),
    };

    let local = code
        .types
        .iter()
        .map(|t| LocalType {
            name: t.name.clone(),
            property_count: t.property_count,
            flags: t.flags.bits(),
        })
        .collect();

    let globals = GlobalSection {
        globals: code
            .globals
            .iter()
            .map(|g| {
                Ok(GlobalRecord {
                    name: g.name.clone(),
                    ty: writer.types.data_type(g.ty)?,
                })
            })
            .collect::<StreamResult<_>>()?,
        memory_size: code.globals.len() as u32,
    };

    let mut engine_properties = Interner::default();
    let mut table = Vec::with_capacity(code.global_refs.len());
    for r in &code.global_refs {
        table.push(match *r {
            GlobalRef::Module(i) => i as i32,
            GlobalRef::Engine(p) => {
                let name = engine.global_property_name(p).ok_or_else(|| {
                    StreamError::new(
                        StreamErrorKind::UnknownProperty,
                        format!("engine property {p} is not registered"),
                    )
                })?;
                -(engine_properties.intern(name) as i32) - 1
            }
        });
    }
    let access = AccessSection {
        table,
        engine_properties: engine_properties.items,
    };

    let init = code.init.as_deref().map(|f| writer.function(f)).transpose()?;
    let functions = code
        .functions
        .iter()
        .map(|f| writer.function(f))
        .collect::<StreamResult<Vec<_>>>()?;
    let imports = ImportSection {
        imports: module
            .import_declarations()
            .iter()
            .map(|d| {
                Ok(ImportDecl {
                    signature: writer.types.signature(&d.signature)?,
                    source_module: d.source_module.clone(),
                })
            })
            .collect::<StreamResult<_>>()?,
    };
    let natives = NativeSection {
        signatures: writer.native_signatures()?,
    };

    // 외부 타입 목록은 모든 참조를 모은 뒤에 확정
    let types = TypeSection {
        local,
        external: std::mem::take(&mut writer.types.external),
    };

    write_section(
        out,
        &Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
        },
    )?;
    write_section(out, &types)?;
    write_section(out, &globals)?;
    write_section(out, &access)?;
    write_section(out, &natives)?;
    write_section(out, &init)?;
    write_section(out, &(functions.len() as u32))?;
    for f in &functions {
        write_section(out, f)?;
    }
    write_section(
        out,
        &StringSection {
            strings: code.strings.clone(),
        },
    )?;
    write_section(out, &imports)?;
    write_section(
        out,
        &TypeIdSection {
            entries: writer.type_ids.items,
        },
    )?;
    out.flush()?;

    tracing::debug!(
        module = module.name(),
        functions = functions.len(),
        types = types.local.len() + types.external.len(),
        "module saved"
    );
    Ok(())
}

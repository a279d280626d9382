use std::fmt::{self, Write};

use super::bytecode::{ArgKind, InstrArgs, Opcode, instructions, unpack_line};
use super::function::ScriptFunction;
use super::module::{GlobalRef, Module, ModuleCode};

pub fn disassemble_module_to_string(module: &Module) -> String {
    let mut output = String::new();
    let _ = disassemble_module(module, &mut output);
    output
}

pub fn disassemble_module(module: &Module, w: &mut impl Write) -> fmt::Result {
    let code = module.code();
    writeln!(w, "=== Module '{}' ===", module.name())?;
    writeln!(w)?;

    writeln!(w, "Types ({}):", code.types.len())?;
    for ty in &code.types {
        writeln!(w, "  #{}: {} (properties={})", ty.id, ty.name, ty.property_count)?;
    }
    writeln!(w)?;

    writeln!(w, "Globals ({}):", code.globals.len())?;
    for (i, g) in code.globals.iter().enumerate() {
        writeln!(w, "  {}: {} {}", i, g.ty, g.name)?;
    }
    writeln!(w)?;

    writeln!(w, "Strings ({}):", code.strings.len())?;
    for (i, s) in code.strings.iter().enumerate() {
        writeln!(w, "  {}: {:?}", i, s)?;
    }
    writeln!(w)?;

    writeln!(w, "Imports ({}):", module.imported_function_count())?;
    for (i, decl) in module.import_declarations().iter().enumerate() {
        writeln!(w, "  {}: {} from '{}'", i, decl.signature, decl.source_module)?;
    }
    writeln!(w)?;

    if let Some(init) = &code.init {
        disassemble_function(&code, init, w)?;
        writeln!(w)?;
    }
    writeln!(w, "Functions ({}):", code.functions.len())?;
    for func in &code.functions {
        disassemble_function(&code, func, w)?;
        writeln!(w)?;
    }

    Ok(())
}

pub fn disassemble_function_to_string(code: &ModuleCode, func: &ScriptFunction) -> String {
    let mut output = String::new();
    let _ = disassemble_function(code, func, &mut output);
    output
}

pub fn disassemble_function(
    code: &ModuleCode,
    func: &ScriptFunction,
    w: &mut impl Write,
) -> fmt::Result {
    writeln!(
        w,
        "Function #{} - {} (locals={}, stack={})",
        func.id, func.signature, func.variable_space, func.stack_needed
    )?;
    writeln!(w, "  Instructions:")?;

    let mut lines = func.line_numbers.iter().peekable();
    for item in instructions(&func.code) {
        let (ip, op, args) = match item {
            Ok(decoded) => decoded,
            Err(fault) => return writeln!(w, "    <{fault:?}>"),
        };
        while let Some(entry) = lines.next_if(|e| e.offset as usize <= ip) {
            let (line, column) = unpack_line(entry.packed);
            writeln!(w, "          ; line {line}:{column}")?;
        }
        write!(w, "    {:4}: ", ip)?;
        disassemble_instruction(code, ip, op, &args, w)?;
        writeln!(w)?;
    }

    Ok(())
}

fn var(v: i16) -> String {
    format!("v{v}")
}

fn global_name(code: &ModuleCode, index: i16) -> String {
    match code.global_refs.get(index as u16 as usize) {
        Some(GlobalRef::Module(i)) => code
            .globals
            .get(*i as usize)
            .map_or_else(|| format!("global#{i}"), |g| g.name.clone()),
        Some(GlobalRef::Engine(p)) => format!("engine#{p}"),
        None => "?".to_string(),
    }
}

fn disassemble_instruction(
    code: &ModuleCode,
    ip: usize,
    op: Opcode,
    args: &InstrArgs,
    w: &mut impl Write,
) -> fmt::Result {
    let [a, b, c] = args.w;
    match op {
        Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::Js | Opcode::Jns | Opcode::Jp | Opcode::Jnp => {
            let target = (ip + op.size() as usize) as i64 + args.int() as i64;
            write!(w, "{} {:+} (-> {})", op, args.int(), target)
        }
        Opcode::JmpP => write!(w, "{} {} (cases={})", op, var(a), args.dword()),
        Opcode::Call => {
            let name = code
                .functions
                .get(args.dword() as usize)
                .map_or("?", |f| f.name());
            write!(w, "{} {} (\"{}\")", op, args.dword(), name)
        }
        Opcode::PshStr => {
            let s = code.strings.get(args.dword() as usize).map_or("?", String::as_str);
            write!(w, "{} {} ({:?})", op, args.dword(), s)
        }
        Opcode::PshG4 | Opcode::SetG4 => {
            write!(w, "{} {} (\"{}\")", op, a, global_name(code, a))?;
            if op == Opcode::SetG4 {
                write!(w, ", {}", args.int())?;
            }
            Ok(())
        }
        Opcode::CpyVtoG4 => write!(w, "{} {} (\"{}\"), {}", op, a, global_name(code, a), var(b)),
        Opcode::CpyGtoV4 => write!(w, "{} {}, {} (\"{}\")", op, var(a), b, global_name(code, b)),
        Opcode::SetV8 => write!(w, "{} {}, {:#x} ({})", op, var(a), args.arg, args.double()),
        Opcode::Alloc | Opcode::FreeV => write!(w, "{} {}, type#{}", op, var(a), args.arg),
        Opcode::Ret | Opcode::Pop | Opcode::Push => write!(w, "{} {}", op, a),
        Opcode::LdFld => write!(w, "{} {}, {}.{}", op, var(a), var(b), c),
        Opcode::StFld => write!(w, "{} {}.{}, {}", op, var(a), b, var(c)),
        _ => match op.kind() {
            ArgKind::NoArg => write!(w, "{}", op),
            ArgKind::W | ArgKind::RW | ArgKind::WW => write!(w, "{} {}", op, var(a)),
            ArgKind::WwRw | ArgKind::RwRw | ArgKind::WRw | ArgKind::WwW => {
                write!(w, "{} {}, {}", op, var(a), var(b))
            }
            ArgKind::WwRwRw | ArgKind::WwRwW | ArgKind::RwWRw => {
                write!(w, "{} {}, {}, {}", op, var(a), var(b), var(c))
            }
            ArgKind::Dw => write!(w, "{} {}", op, args.int()),
            ArgKind::WwDw | ArgKind::RwDw | ArgKind::WDw => {
                write!(w, "{} {}, {}", op, var(a), args.int())
            }
            ArgKind::Qw | ArgKind::Ptr => write!(w, "{} {:#x}", op, args.arg),
            ArgKind::WwQw | ArgKind::RwQw | ArgKind::WwPtr => {
                write!(w, "{} {}, {}", op, var(a), args.double())
            }
            ArgKind::WwRwDw => write!(w, "{} {}, {}, {}", op, var(a), var(b), args.int()),
            ArgKind::WwRwQw => write!(w, "{} {}, {}, {}", op, var(a), var(b), args.double()),
        },
    }
}

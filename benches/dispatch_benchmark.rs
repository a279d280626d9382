use std::time::Instant;

use vortexvm::EngineConfig;
use vortexvm::vm::{
    ByteCode, DataType, Engine, ExecutionState, FunctionDecl, GetModuleFlag, Opcode as O,
    ScriptSection, Signature,
};

/// fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
fn fib_section() -> ScriptSection {
    let mut code = ByteCode::new();
    code.instr_w_int(O::CmpIi, 0, 2);
    code.jump(O::Jns, 1);
    code.instr_w(O::CpyVtoR4, 0);
    code.ret(1);
    code.label(1);
    code.instr_ww_dw(O::SubIi, 1, 0, 1);
    code.instr_w(O::PshV4, 1);
    code.call(O::Call, 0, 1);
    code.instr_w(O::CpyRtoV4, 2);
    code.instr_ww_dw(O::SubIi, 1, 0, 2);
    code.instr_w(O::PshV4, 1);
    code.call(O::Call, 0, 1);
    code.instr_w(O::CpyRtoV4, 1);
    code.instr_www(O::AddI, 1, 1, 2);
    code.instr_w(O::CpyVtoR4, 1);
    code.ret(1);

    let mut section = ScriptSection::new("bench");
    section.add_function(FunctionDecl::new(
        Signature::new("fib", DataType::int(), vec![DataType::int()]),
        2,
        code,
    ));
    section
}

/// sum = 0; for i in 0..n { sum += i * 2 }
fn loop_section() -> ScriptSection {
    let mut code = ByteCode::new();
    code.define_temporary(3);
    code.instr_w_int(O::SetV4, 1, 0);
    code.instr_w_int(O::SetV4, 2, 0);
    code.label(0);
    code.instr_ww(O::CmpI, 2, 0);
    code.jump(O::Jns, 1);
    code.instr_w_int(O::SetV4, 3, 2);
    code.instr_www(O::MulI, 3, 2, 3);
    code.instr_www(O::AddI, 1, 1, 3);
    code.instr_ww_dw(O::AddIi, 2, 2, 1);
    code.jump(O::Jmp, 0);
    code.label(1);
    code.instr_w(O::CpyVtoR4, 1);
    code.ret(1);

    let mut section = ScriptSection::new("bench");
    section.add_function(FunctionDecl::new(
        Signature::new("sum", DataType::int(), vec![DataType::int()]),
        3,
        code,
    ));
    section
}

fn measure(label: &str, optimize: bool, section: ScriptSection, name: &str, arg: u32, runs: u32) {
    let engine = Engine::new(EngineConfig {
        optimize_bytecode: optimize,
        build_without_line_cues: true,
        ..EngineConfig::default()
    })
    .expect("engine");
    let module = engine
        .get_module("bench", GetModuleFlag::AlwaysCreate)
        .expect("module");
    module.add_section(section);
    if let Err(e) = module.build(&engine) {
        eprintln!("Build error: {}", e);
        return;
    }

    let id = module.function_id_by_name(name);
    let mut ctx = engine.create_context();
    let mut result = 0;
    let start = Instant::now();
    for _ in 0..runs {
        ctx.prepare(id).expect("prepare");
        ctx.set_arg_dword(0, arg).expect("arg");
        match ctx.execute() {
            Ok(ExecutionState::Finished) => result = ctx.get_return_dword().unwrap_or(0),
            other => {
                eprintln!("Runtime error: {:?} {:?}", other, ctx.exception_string());
                return;
            }
        }
    }
    let elapsed = start.elapsed();
    println!(
        "{:<28} result={:<10} total={:>9.2}ms  per run={:.4}ms",
        label,
        result,
        elapsed.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0 / runs as f64
    );
}

fn main() {
    println!("=== VortexVM Dispatch Benchmark ===\n");

    measure("fib(24) unoptimized", false, fib_section(), "fib", 24, 10);
    measure("fib(24) optimized", true, fib_section(), "fib", 24, 10);
    measure("loop(1_000_000) unoptimized", false, loop_section(), "sum", 1_000_000, 5);
    measure("loop(1_000_000) optimized", true, loop_section(), "sum", 1_000_000, 5);
}

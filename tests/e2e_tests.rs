use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use vortexvm::EngineConfig;
use vortexvm::vm::function::ObjectVar;
use vortexvm::vm::linker::{GlobalInit, GlobalVarDecl};
use vortexvm::vm::type_def::Behaviours;
use vortexvm::vm::{
    BuildErrorKind, ByteCode, ContextState, DataType, Engine, ExecutionState, FunctionDecl,
    GetModuleFlag, Module, Opcode as O, ReturnCode, ScriptObject, ScriptSection, Signature,
    StreamErrorKind, TypeFlags, TypeId, VmErrorKind,
};

/// 호스트 API만으로 모듈을 만들고 실행하는 통합 테스트

fn build(engine: &Arc<Engine>, name: &str, section: ScriptSection) -> Arc<Module> {
    let module = engine
        .get_module(name, GetModuleFlag::AlwaysCreate)
        .unwrap();
    module.add_section(section);
    module.build(engine).unwrap();
    module
}

fn int_fn(name: &str, params: usize) -> Signature {
    Signature::new(name, DataType::int(), vec![DataType::int(); params])
}

fn void_fn(name: &str) -> Signature {
    Signature::new(name, DataType::void(), vec![])
}

fn call_int(engine: &Arc<Engine>, module: &Module, name: &str, args: &[i32]) -> i32 {
    let mut ctx = engine.create_context();
    ctx.prepare(module.function_id_by_name(name)).unwrap();
    for (i, a) in args.iter().enumerate() {
        ctx.set_arg_dword(i, *a as u32).unwrap();
    }
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished, "{name}");
    ctx.get_return_dword().unwrap() as i32
}

fn tracked_type(engine: &Engine, drops: &Arc<AtomicUsize>) -> TypeId {
    let drops = drops.clone();
    engine
        .register_object_type(
            "tracked",
            TypeFlags::REF,
            1,
            Behaviours {
                destruct: Some(Arc::new(move |_: &ScriptObject| {
                    drops.fetch_add(1, Ordering::SeqCst);
                })),
                ..Behaviours::default()
            },
        )
        .unwrap()
}

#[test]
fn test_exception_in_callee_releases_handle_argument() {
    let engine = Engine::with_defaults();
    let drops = Arc::new(AtomicUsize::new(0));
    let ty = tracked_type(&engine, &drops);
    let mut section = ScriptSection::new("nested");

    // void inner(int x, tracked@ h) { tracked@ local; local.check(); }
    let mut inner = ByteCode::new();
    inner.instr_w(O::ChkNullV, 1);
    inner.ret(2);
    let inner_index = section.add_function(
        FunctionDecl::new(
            Signature::new(
                "inner",
                DataType::void(),
                vec![DataType::int(), DataType::handle(ty)],
            ),
            1,
            inner,
        )
        .with_object_vars(vec![ObjectVar {
            offset: 1,
            type_id: ty,
        }]),
    );

    // void outer(tracked@ h) { inner(7, h); }
    let mut outer = ByteCode::new();
    outer.instr_w(O::PshV4, 0);
    outer.instr_dw(O::PshC4, 7);
    outer.call(O::Call, inner_index, 2);
    outer.ret(1);
    section.add_function(FunctionDecl::new(
        Signature::new("outer", DataType::void(), vec![DataType::handle(ty)]),
        0,
        outer,
    ));
    let module = build(&engine, "nested", section);

    let obj = ScriptObject::new(engine.object_type(ty).unwrap());
    let mut ctx = engine.create_context();
    ctx.prepare(module.function_id_by_name("outer")).unwrap();
    ctx.set_arg_object(0, Some(obj.clone())).unwrap();
    assert_eq!(Arc::strong_count(&obj), 2);

    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    let info = ctx.exception_info().unwrap();
    assert_eq!(info.kind, VmErrorKind::NullPointerAccess);
    assert_eq!(ctx.exception_function(), module.function_id_by_name("inner"));
    assert_eq!(info.function_name, "inner");
    assert_eq!(ctx.callstack_size(), 0);

    // 컨텍스트가 잡고 있던 참조는 모두 풀림
    assert_eq!(Arc::strong_count(&obj), 1);
    drop(obj);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_abort_unwinds_every_frame() {
    let engine = Engine::with_defaults();
    let drops = Arc::new(AtomicUsize::new(0));
    let ty = tracked_type(&engine, &drops);
    let mut section = ScriptSection::new("frames");

    // level(i)는 지역 객체를 하나 만들고 level(i + 1)을 부름. 가장 안쪽은 멈춤
    for depth in 0..3u32 {
        let mut code = ByteCode::new();
        code.instr_w_ptr(O::Alloc, 1, ty as u64);
        if depth == 2 {
            code.instr(O::Suspend);
        } else {
            code.call(O::Call, depth + 1, 0);
        }
        code.instr_w_ptr(O::FreeV, 1, ty as u64);
        code.ret(0);
        section.add_function(
            FunctionDecl::new(void_fn(&format!("level{depth}")), 1, code).with_object_vars(vec![
                ObjectVar {
                    offset: 1,
                    type_id: ty,
                },
            ]),
        );
    }
    let module = build(&engine, "frames", section);

    let mut ctx = engine.create_context();
    ctx.prepare(module.function_id_by_name("level0")).unwrap();
    let handle = ctx.handle();
    ctx.set_line_callback(move |_| handle.suspend());
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);
    assert_eq!(ctx.callstack_size(), 3);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    ctx.abort().unwrap();
    assert_eq!(ctx.state(), ContextState::Aborted);
    assert_eq!(ctx.callstack_size(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 3);

    // 같은 컨텍스트로 다시 끝까지 실행
    ctx.clear_line_callback();
    ctx.prepare(module.function_id_by_name("level0")).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(drops.load(Ordering::SeqCst), 6);
}

#[test]
fn test_reset_global_vars_is_repeatable() {
    let engine = Engine::with_defaults();
    let drops = Arc::new(AtomicUsize::new(0));
    let ty = tracked_type(&engine, &drops);
    let mut section = ScriptSection::new("globals");

    let mut seed_init = ByteCode::new();
    seed_init.instr_w_int(O::SetV4, 1, 17);
    seed_init.instr_ww(O::CpyVtoG4, 0, 1);
    let seed = section.add_global(GlobalVarDecl {
        name: "seed".into(),
        ty: DataType::int(),
        init: Some(GlobalInit {
            variable_space: 1,
            object_vars: vec![],
            code: seed_init,
        }),
    });
    let seed_ref = section.global_ref_local(seed);

    let mut holder_init = ByteCode::new();
    holder_init.instr_w_ptr(O::Alloc, 1, ty as u64);
    holder_init.instr_ww(O::CpyVtoG4, 1, 1);
    holder_init.instr_w_ptr(O::FreeV, 1, ty as u64);
    let holder = section.add_global(GlobalVarDecl {
        name: "holder".into(),
        ty: DataType::handle(ty),
        init: Some(GlobalInit {
            variable_space: 1,
            object_vars: vec![ObjectVar {
                offset: 1,
                type_id: ty,
            }],
            code: holder_init,
        }),
    });
    let holder_ref = section.global_ref_local(holder);
    assert_eq!(holder_ref, 1);

    let mut bump = ByteCode::new();
    bump.instr_ww(O::CpyGtoV4, 1, seed_ref);
    bump.instr_ww_dw(O::AddIi, 1, 1, 100);
    bump.instr_ww(O::CpyVtoG4, seed_ref, 1);
    bump.instr_w(O::CpyVtoR4, 1);
    bump.ret(0);
    section.add_function(FunctionDecl::new(int_fn("bump", 0), 1, bump));
    let module = build(&engine, "globals", section);

    let initial = module.global_bits();
    assert_eq!(initial, vec![17, 1]);
    assert_eq!(call_int(&engine, &module, "bump", &[]), 117);
    assert_ne!(module.global_bits(), initial);

    module.reset_global_vars(&engine).unwrap();
    let first = module.global_bits();
    module.reset_global_vars(&engine).unwrap();
    let second = module.global_bits();
    assert_eq!(first, initial);
    assert_eq!(second, initial);

    // 리셋마다 이전 holder 객체가 해제됨
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    let index = module.global_var_index_by_name("holder").unwrap();
    assert!(module.global(index).unwrap().object().is_some());
}

fn fib_section() -> ScriptSection {
    let mut section = ScriptSection::new("fib");
    // fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
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
    section.add_function(FunctionDecl::new(int_fn("fib", 1), 2, code));
    section
}

#[test]
fn test_saved_module_behaves_like_original() {
    let engine = Engine::with_defaults();
    let original = build(&engine, "fib", fib_section());
    let expected: Vec<i32> = (0..15)
        .map(|n| call_int(&engine, &original, "fib", &[n]))
        .collect();
    assert_eq!(expected[10], 55);

    let path = std::env::temp_dir().join(format!("vortexvm-fib-{}.vxbc", std::process::id()));
    vortexvm::save_module(&engine, &original, &path).unwrap();

    let other = Engine::with_defaults();
    let restored = vortexvm::load_module(&other, "fib", &path).unwrap();
    let _ = std::fs::remove_file(&path);

    let actual: Vec<i32> = (0..15)
        .map(|n| call_int(&other, &restored, "fib", &[n]))
        .collect();
    assert_eq!(actual, expected);
    assert_eq!(restored.function_count(), original.function_count());
}

#[test]
fn test_stack_grows_then_reports_overflow() {
    let engine = Engine::new(EngineConfig {
        initial_context_stack_size: 32,
        maximum_context_stack_size: 4096,
        ..EngineConfig::default()
    })
    .unwrap();
    let module = build(&engine, "fib", fib_section());
    assert_eq!(call_int(&engine, &module, "fib", &[15]), 610);

    // count(n) = count(n + 1): 끝없는 재귀
    let mut section = ScriptSection::new("loop");
    let mut code = ByteCode::new();
    code.instr_ww_dw(O::AddIi, 1, 0, 1);
    code.instr_w(O::PshV4, 1);
    code.call(O::Call, 0, 1);
    code.ret(1);
    section.add_function(FunctionDecl::new(int_fn("count", 1), 1, code));
    let runaway = build(&engine, "loop", section);

    let mut ctx = engine.create_context();
    ctx.prepare(runaway.function_id_by_name("count")).unwrap();
    ctx.set_arg_dword(0, 0).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_info().unwrap().kind, VmErrorKind::StackOverflow);
    assert_eq!(ctx.state(), ContextState::Exception);

    // 예외 후에도 컨텍스트는 재사용 가능
    ctx.prepare(module.function_id_by_name("fib")).unwrap();
    ctx.set_arg_dword(0, 12).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.get_return_dword().unwrap(), 144);
}

fn provider_section() -> ScriptSection {
    let mut section = ScriptSection::new("lib");
    let mut triple = ByteCode::new();
    triple.instr_ww_dw(O::MulIi, 1, 0, 3);
    triple.instr_w(O::CpyVtoR4, 1);
    triple.ret(1);
    section.add_function(FunctionDecl::new(int_fn("triple", 1), 1, triple));

    let mut square = ByteCode::new();
    square.instr_www(O::MulI, 1, 0, 0);
    square.instr_w(O::CpyVtoR4, 1);
    square.ret(1);
    section.add_function(FunctionDecl::new(int_fn("square", 1), 1, square));

    let mut half = ByteCode::new();
    half.instr_w_double(O::SetV8, 1, 0.5);
    half.instr_w(O::CpyVtoR4, 1);
    half.ret(0);
    section.add_function(FunctionDecl::new(
        Signature::new("half", DataType::double(), vec![]),
        1,
        half,
    ));
    section
}

fn consumer_section() -> ScriptSection {
    let mut section = ScriptSection::new("app");
    let import = section.add_import(int_fn("triple", 1), "lib");
    let mut main = ByteCode::new();
    main.instr_dw(O::PshC4, 14);
    main.call(O::CallBnd, import, 1);
    main.ret(0);
    section.add_function(FunctionDecl::new(int_fn("main", 0), 0, main));
    section
}

#[test]
fn test_bind_rejects_mismatched_interface() {
    let engine = Engine::with_defaults();
    let lib = build(&engine, "lib", provider_section());
    let app = build(&engine, "app", consumer_section());

    app.bind_all_imported_functions(&engine).unwrap();
    assert_eq!(call_int(&engine, &app, "main", &[]), 42);

    let half = lib.function_id_by_name("half");
    assert_eq!(
        app.bind_imported_function(&engine, 0, half),
        Err(ReturnCode::InvalidInterface)
    );
    assert_eq!(call_int(&engine, &app, "main", &[]), 42);

    // 이름이 달라도 인터페이스가 같으면 연결됨
    let square = lib.function_id_by_name("square");
    app.bind_imported_function(&engine, 0, square).unwrap();
    assert_eq!(call_int(&engine, &app, "main", &[]), 196);

    assert_eq!(
        app.bind_imported_function(&engine, 3, square),
        Err(ReturnCode::InvalidArg)
    );
    app.bind_imported_function(&engine, 0, None).unwrap();
    let mut ctx = engine.create_context();
    ctx.prepare(app.function_id_by_name("main")).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_info().unwrap().kind, VmErrorKind::UnboundFunction);
}

#[test]
fn test_bound_provider_cannot_be_replaced_in_place() {
    let engine = Engine::with_defaults();
    let lib = build(&engine, "lib", provider_section());
    let app = build(&engine, "app", consumer_section());
    app.bind_all_imported_functions(&engine).unwrap();
    let mut saved = Vec::new();
    lib.save_bytecode(&engine, &mut saved).unwrap();

    // 다른 전역/함수 배치로 다시 빌드하려 해도 app이 연결된 동안은 거부
    let mut other = ScriptSection::new("lib");
    other.add_global(GlobalVarDecl {
        name: "other".into(),
        ty: DataType::int(),
        init: None,
    });
    let mut unrelated = ByteCode::new();
    unrelated.instr_dw(O::PshC4, 5);
    unrelated.instr(O::PopRPtr);
    unrelated.ret(0);
    other.add_function(FunctionDecl::new(int_fn("unrelated", 0), 0, unrelated));
    lib.add_section(other);
    assert_eq!(lib.build(&engine).unwrap_err().kind, BuildErrorKind::ModuleInUse);
    assert_eq!(
        lib.load_bytecode(&engine, &mut saved.as_slice()).unwrap_err().kind,
        StreamErrorKind::ModuleInUse
    );
    assert_eq!(call_int(&engine, &app, "main", &[]), 42);
    assert_eq!(call_int(&engine, &lib, "square", &[9]), 81);

    // 연결을 끊으면 빌드 가능
    app.unbind_all_imported_functions(&engine);
    lib.build(&engine).unwrap();
    assert_eq!(call_int(&engine, &lib, "unrelated", &[]), 5);
    assert_eq!(
        app.bind_all_imported_functions(&engine),
        Err(ReturnCode::CantBindAllFunctions)
    );
}

#[test]
fn test_unbinding_collects_discarded_provider() {
    let engine = Engine::with_defaults();
    let lib = build(&engine, "lib", provider_section());
    let app = build(&engine, "app", consumer_section());
    app.bind_all_imported_functions(&engine).unwrap();

    engine.discard_module("lib").unwrap();
    assert_eq!(engine.discarded_module_count(), 1);
    assert_eq!(call_int(&engine, &app, "main", &[]), 42);

    app.bind_imported_function(&engine, 0, None).unwrap();
    assert_eq!(engine.discarded_module_count(), 0);
    assert_eq!(lib.function_count(), 0);

    let lib = build(&engine, "lib", provider_section());
    app.bind_all_imported_functions(&engine).unwrap();
    engine.discard_module("lib").unwrap();
    assert_eq!(engine.discarded_module_count(), 1);
    app.unbind_all_imported_functions(&engine);
    assert_eq!(engine.discarded_module_count(), 0);
    assert_eq!(lib.function_count(), 0);
}

#[test]
fn test_bind_all_reports_missing_source() {
    let engine = Engine::with_defaults();
    let app = build(&engine, "app", consumer_section());
    assert_eq!(
        app.bind_all_imported_functions(&engine),
        Err(ReturnCode::CantBindAllFunctions)
    );
}

/// `name()`이 `other`의 `peer()`를 import해서 부르는 모듈
fn peer_section(name: &str, other: &str, value: u32) -> ScriptSection {
    let mut section = ScriptSection::new(name);
    section.add_import(int_fn("peer", 0), other);

    let mut peer = ByteCode::new();
    peer.instr_dw(O::PshC4, value);
    peer.instr(O::PopRPtr);
    peer.ret(0);
    section.add_function(FunctionDecl::new(int_fn("peer", 0), 0, peer));

    let mut ask = ByteCode::new();
    ask.call(O::CallBnd, 0, 0);
    ask.ret(0);
    section.add_function(FunctionDecl::new(int_fn("ask", 0), 0, ask));
    section
}

#[test]
fn test_cyclic_modules_are_collected_together() {
    let engine = Engine::with_defaults();
    let a = build(&engine, "a", peer_section("a", "b", 1));
    let b = build(&engine, "b", peer_section("b", "a", 2));
    a.bind_all_imported_functions(&engine).unwrap();
    b.bind_all_imported_functions(&engine).unwrap();
    assert_eq!(call_int(&engine, &a, "ask", &[]), 2);
    assert_eq!(call_int(&engine, &b, "ask", &[]), 1);

    // b가 아직 a를 참조하므로 a는 남아 있음
    engine.discard_module("a").unwrap();
    assert_eq!(engine.module_count(), 1);
    assert_eq!(engine.discarded_module_count(), 1);
    assert_eq!(call_int(&engine, &b, "ask", &[]), 1);

    // 실행 중인 컨텍스트가 있으면 회수를 미룸
    let mut ctx = engine.create_context();
    ctx.prepare(b.function_id_by_name("ask")).unwrap();
    engine.discard_module("b").unwrap();
    assert_eq!(engine.discarded_module_count(), 2);
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.get_return_dword().unwrap(), 1);

    drop(ctx);
    assert_eq!(engine.module_count(), 0);
    assert_eq!(engine.discarded_module_count(), 0);
    assert_eq!(a.function_count(), 0);
    assert_eq!(b.imported_function_count(), 0);
}

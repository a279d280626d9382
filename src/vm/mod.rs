pub mod builder; // 바이트코드 빌더 + 최적화
pub mod bytecode;
pub mod disasm; // 디스어셈블러
pub mod engine;
pub mod function;
pub mod linker;
pub mod machine; // machine/ 디렉토리
pub mod module;
pub mod serialize;
pub mod status;
pub mod type_def;
pub mod value;

pub use builder::ByteCode;
pub use bytecode::Opcode;
pub use engine::{Engine, GetModuleFlag};
pub use function::{FunctionId, NativeCall, Signature};
pub use linker::{ClassDecl, FunctionDecl, ScriptSection};
pub use machine::{Context, ContextHandle, ExceptionInfo, LineInfo, VmError, VmErrorKind, VmResult, err};
pub use module::Module;
pub use serialize::StreamResult;
pub use status::{
    BuildError, BuildErrorKind, CallResult, ContextState, ExecutionState, ReturnCode, StreamError,
    StreamErrorKind,
};
pub use type_def::{DataType, ObjectType, TypeFlags, TypeId};
pub use value::{ObjectHandle, ScriptObject, Value};

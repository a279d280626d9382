//! 바이트코드 명령어 테이블과 워드 인코딩
//!
//! 최종 바이트코드는 `Vec<u32>` 워드 배열입니다. 각 명령어의 첫 워드는
//! 하위 8비트에 opcode, 상위 16비트에 첫 번째 short 인자를 담습니다.
//! 나머지 인자는 [`ArgKind`]에 따라 뒤따르는 워드에 배치됩니다.
//!
//! ```text
//! NoArg      : [op]
//! W/rW/wW    : [op | w0<<16]
//! wW_rW ...  : [op | w0<<16, w1]
//! wW_rW_rW   : [op | w0<<16, w1 | w2<<16]
//! DW         : [op, dw]
//! wW_DW      : [op | w0<<16, dw]
//! QW / PTR   : [op, lo, hi]
//! wW_rW_QW   : [op | w0<<16, w1, lo, hi]
//! ```

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

/// 스택 프레임 아래쪽에 항상 남겨두는 서비스 예약 영역 (워드)
pub const RESERVE_STACK: u32 = 2;

/// 라인 정보 패킹: 하위 20비트 = line, 상위 12비트 = column
pub fn pack_line(line: u32, column: u32) -> u32 {
    (line & 0xFFFFF) | ((column & 0xFFF) << 20)
}

pub fn unpack_line(packed: u32) -> (u32, u32) {
    (packed & 0xFFFFF, packed >> 20)
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, EnumIter, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Opcode {
    // stack
    Pop = 0,
    Push,
    PshC4,
    PshC8,
    PshV4,
    PshRef,
    PshObj,
    PshG4,
    PshNull,
    PshStr,
    PshRPtr,
    PopRPtr,
    Swap,
    TypeId,

    // variables
    SetV4,
    SetV8,
    CpyVtoV4,
    CpyVtoR4,
    CpyRtoV4,
    CpyGtoV4,
    CpyVtoG4,
    SetG4,
    LoadObj,
    StoreObj,

    // arithmetic (i32 / f64)
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,
    AddD,
    SubD,
    MulD,
    DivD,
    AddIi,
    SubIi,
    MulIi,
    AddId,
    SubId,
    MulId,

    // compare → register (-1, 0, 1)
    CmpI,
    CmpD,
    CmpIi,
    CmpId,

    // register tests → register (0/1)
    Tz,
    Tnz,
    Ts,
    Tns,
    Tp,
    Tnp,

    // jumps
    Jmp,
    Jz,
    Jnz,
    Js,
    Jns,
    Jp,
    Jnp,
    JmpP,

    // calls
    Call,
    CallSys,
    CallBnd,
    Ret,

    // objects
    Alloc,
    FreeV,
    CopyV,
    ChkNullV,
    LdFld,
    StFld,

    Suspend,

    // pseudo instructions (빌드 중에만 존재)
    Label,
    Line,
}

/// 명령어 인자 배치
///
/// `r`/`w` 접두사는 해당 short 인자가 변수를 읽는지/쓰는지를 나타냅니다.
/// 이름 없는 `W`는 변수가 아닌 값(개수, 전역 인덱스, 필드 번호 등)입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    NoArg,
    W,
    RW,
    WW,
    WwRw,
    RwRw,
    WwRwRw,
    WRw,
    WwW,
    WwRwW,
    RwWRw,
    Dw,
    WwDw,
    RwDw,
    WDw,
    Qw,
    WwQw,
    RwQw,
    WwRwDw,
    WwRwQw,
    Ptr,
    WwPtr,
}

impl ArgKind {
    /// 인코딩된 크기 (u32 워드 단위)
    pub const fn size(self) -> u32 {
        match self {
            ArgKind::NoArg | ArgKind::W | ArgKind::RW | ArgKind::WW => 1,
            ArgKind::WwRw
            | ArgKind::RwRw
            | ArgKind::WwRwRw
            | ArgKind::WRw
            | ArgKind::WwW
            | ArgKind::WwRwW
            | ArgKind::RwWRw
            | ArgKind::Dw
            | ArgKind::WwDw
            | ArgKind::RwDw
            | ArgKind::WDw => 2,
            ArgKind::Qw | ArgKind::WwQw | ArgKind::RwQw | ArgKind::WwRwDw => 3,
            ArgKind::Ptr | ArgKind::WwPtr => 3,
            ArgKind::WwRwQw => 4,
        }
    }

    /// 이 배치에서 쓰기 대상 변수 인자의 위치
    pub const fn written_var(self) -> Option<usize> {
        match self {
            ArgKind::WW
            | ArgKind::WwRw
            | ArgKind::WwRwRw
            | ArgKind::WwW
            | ArgKind::WwRwW
            | ArgKind::WwDw
            | ArgKind::WwQw
            | ArgKind::WwRwDw
            | ArgKind::WwRwQw
            | ArgKind::WwPtr => Some(0),
            _ => None,
        }
    }

    /// 이 배치에서 읽기 대상 변수 인자들의 위치
    pub const fn read_vars(self) -> &'static [usize] {
        match self {
            ArgKind::RW | ArgKind::RwDw | ArgKind::RwQw => &[0],
            ArgKind::WwRw | ArgKind::WwRwW | ArgKind::WwRwDw | ArgKind::WwRwQw => &[1],
            ArgKind::RwRw => &[0, 1],
            ArgKind::WwRwRw => &[1, 2],
            ArgKind::WRw => &[1],
            ArgKind::RwWRw => &[0, 2],
            _ => &[],
        }
    }

    /// 변수 인자가 아닌 short 인자의 개수까지 포함한 전체 short 인자 수
    pub const fn word_args(self) -> usize {
        match self {
            ArgKind::NoArg | ArgKind::Dw | ArgKind::Qw | ArgKind::Ptr => 0,
            ArgKind::W
            | ArgKind::RW
            | ArgKind::WW
            | ArgKind::WwDw
            | ArgKind::RwDw
            | ArgKind::WDw
            | ArgKind::WwQw
            | ArgKind::RwQw
            | ArgKind::WwPtr => 1,
            ArgKind::WwRw
            | ArgKind::RwRw
            | ArgKind::WRw
            | ArgKind::WwW
            | ArgKind::WwRwDw
            | ArgKind::WwRwQw => 2,
            ArgKind::WwRwRw | ArgKind::WwRwW | ArgKind::RwWRw => 3,
        }
    }

    /// 32비트 또는 64비트 즉치 인자를 가지는지
    pub const fn has_arg(self) -> bool {
        matches!(
            self,
            ArgKind::Dw
                | ArgKind::WwDw
                | ArgKind::RwDw
                | ArgKind::WDw
                | ArgKind::Qw
                | ArgKind::WwQw
                | ArgKind::RwQw
                | ArgKind::WwRwDw
                | ArgKind::WwRwQw
                | ArgKind::Ptr
                | ArgKind::WwPtr
        )
    }
}

/// 명령어 하나가 스택 깊이에 주는 영향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackInc {
    Fixed(i32),
    /// `Push`/`Pop`/호출 명령어처럼 인자에 따라 달라짐
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub kind: ArgKind,
    pub stack_inc: StackInc,
}

const fn info(kind: ArgKind, inc: i32) -> OpInfo {
    OpInfo {
        kind,
        stack_inc: StackInc::Fixed(inc),
    }
}

const fn variable(kind: ArgKind) -> OpInfo {
    OpInfo {
        kind,
        stack_inc: StackInc::Variable,
    }
}

impl Opcode {
    pub const fn info(self) -> OpInfo {
        use ArgKind as K;
        use Opcode as O;
        match self {
            O::Pop | O::Push => variable(K::W),
            O::PshC4 => info(K::Dw, 1),
            O::PshC8 => info(K::Qw, 1),
            O::PshV4 | O::PshRef | O::PshObj => info(K::RW, 1),
            O::PshG4 => info(K::W, 1),
            O::PshNull | O::PshRPtr => info(K::NoArg, 1),
            O::PshStr => info(K::Dw, 1),
            O::PopRPtr => info(K::NoArg, -1),
            O::Swap => info(K::NoArg, 0),
            O::TypeId => info(K::Dw, 1),

            O::SetV4 => info(K::WwDw, 0),
            O::SetV8 => info(K::WwQw, 0),
            O::CpyVtoV4 => info(K::WwRw, 0),
            O::CpyVtoR4 | O::LoadObj => info(K::RW, 0),
            O::CpyRtoV4 | O::StoreObj => info(K::WW, 0),
            O::CpyGtoV4 => info(K::WwW, 0),
            O::CpyVtoG4 => info(K::WRw, 0),
            O::SetG4 => info(K::WDw, 0),

            O::AddI | O::SubI | O::MulI | O::DivI | O::ModI => info(K::WwRwRw, 0),
            O::AddD | O::SubD | O::MulD | O::DivD => info(K::WwRwRw, 0),
            O::AddIi | O::SubIi | O::MulIi => info(K::WwRwDw, 0),
            O::AddId | O::SubId | O::MulId => info(K::WwRwQw, 0),

            O::CmpI | O::CmpD => info(K::RwRw, 0),
            O::CmpIi => info(K::RwDw, 0),
            O::CmpId => info(K::RwQw, 0),

            O::Tz | O::Tnz | O::Ts | O::Tns | O::Tp | O::Tnp => info(K::NoArg, 0),

            O::Jmp | O::Jz | O::Jnz | O::Js | O::Jns | O::Jp | O::Jnp => info(K::Dw, 0),
            O::JmpP => info(K::RwDw, 0),

            O::Call | O::CallSys | O::CallBnd => variable(K::Dw),
            O::Ret => info(K::W, 0),

            O::Alloc | O::FreeV => info(K::WwPtr, 0),
            O::CopyV => info(K::WwRw, 0),
            O::ChkNullV => info(K::RW, 0),
            O::LdFld => info(K::WwRwW, 0),
            O::StFld => info(K::RwWRw, 0),

            O::Suspend => info(K::NoArg, 0),

            O::Label => info(K::W, 0),
            O::Line => info(K::Dw, 0),
        }
    }

    pub const fn kind(self) -> ArgKind {
        self.info().kind
    }

    /// 인코딩 크기. pseudo 명령어는 0 (Line은 빌더가 따로 정함)
    pub const fn size(self) -> u32 {
        match self {
            Opcode::Label | Opcode::Line => 0,
            _ => self.kind().size(),
        }
    }

    pub const fn is_pseudo(self) -> bool {
        matches!(self, Opcode::Label | Opcode::Line)
    }

    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Jz
                | Opcode::Jnz
                | Opcode::Js
                | Opcode::Jns
                | Opcode::Jp
                | Opcode::Jnp
        )
    }

    pub const fn is_conditional_jump(self) -> bool {
        self.is_jump() && !matches!(self, Opcode::Jmp)
    }

    pub const fn is_register_test(self) -> bool {
        matches!(
            self,
            Opcode::Tz | Opcode::Tnz | Opcode::Ts | Opcode::Tns | Opcode::Tp | Opcode::Tnp
        )
    }

    /// 레지스터 값을 읽는 명령어
    pub const fn reads_register(self) -> bool {
        self.is_conditional_jump()
            || self.is_register_test()
            || matches!(
                self,
                Opcode::CpyRtoV4 | Opcode::PshRPtr | Opcode::StoreObj | Opcode::Ret
            )
    }

    /// 레지스터 값을 덮어쓰거나 버리는 명령어
    pub const fn overwrites_register(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallSys
                | Opcode::CallBnd
                | Opcode::PopRPtr
                | Opcode::CpyVtoR4
                | Opcode::LoadObj
                | Opcode::CmpI
                | Opcode::CmpD
                | Opcode::CmpIi
                | Opcode::CmpId
        )
    }

    /// 결과를 쓰는 것 외의 부수효과(예외, 객체 소유권 이동)가 없는 명령어
    ///
    /// 옵티마이저는 이런 명령어만 죽은 쓰기로 제거합니다.
    pub const fn is_pure_write(self) -> bool {
        matches!(
            self,
            Opcode::SetV4
                | Opcode::SetV8
                | Opcode::CpyVtoV4
                | Opcode::CpyRtoV4
                | Opcode::CpyGtoV4
                | Opcode::AddI
                | Opcode::SubI
                | Opcode::MulI
                | Opcode::AddD
                | Opcode::SubD
                | Opcode::MulD
                | Opcode::AddIi
                | Opcode::SubIi
                | Opcode::MulIi
                | Opcode::AddId
                | Opcode::SubId
                | Opcode::MulId
        )
    }

    /// 객체 타입 포인터(엔진 타입 id)를 인자로 가지는 명령어
    pub const fn has_object_type_arg(self) -> bool {
        matches!(self.kind(), ArgKind::Ptr | ArgKind::WwPtr)
    }
}

/// 명령어 인자 (short 인자 3개 + 64비트 인자 1개)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrArgs {
    pub w: [i16; 3],
    pub arg: u64,
}

impl InstrArgs {
    pub fn dword(&self) -> u32 {
        self.arg as u32
    }

    pub fn int(&self) -> i32 {
        self.arg as u32 as i32
    }

    pub fn double(&self) -> f64 {
        f64::from_bits(self.arg)
    }
}

/// 명령어 하나를 워드 배열 뒤에 덧붙임
pub fn encode(op: Opcode, args: &InstrArgs, out: &mut Vec<u32>) {
    let kind = op.kind();
    let head = op as u32 | ((args.w[0] as u16 as u32) << 16);
    let lo = args.arg as u32;
    let hi = (args.arg >> 32) as u32;
    let w1 = args.w[1] as u16 as u32;
    let w2 = args.w[2] as u16 as u32;
    match kind {
        ArgKind::NoArg | ArgKind::W | ArgKind::RW | ArgKind::WW => out.push(head),
        ArgKind::WwRw | ArgKind::RwRw | ArgKind::WRw | ArgKind::WwW => {
            out.extend_from_slice(&[head, w1])
        }
        ArgKind::WwRwRw | ArgKind::WwRwW | ArgKind::RwWRw => {
            out.extend_from_slice(&[head, w1 | (w2 << 16)])
        }
        ArgKind::Dw => out.extend_from_slice(&[op as u32, lo]),
        ArgKind::WwDw | ArgKind::RwDw | ArgKind::WDw => out.extend_from_slice(&[head, lo]),
        ArgKind::Qw | ArgKind::Ptr => out.extend_from_slice(&[op as u32, lo, hi]),
        ArgKind::WwQw | ArgKind::RwQw | ArgKind::WwPtr => out.extend_from_slice(&[head, lo, hi]),
        ArgKind::WwRwDw => out.extend_from_slice(&[head, w1, lo]),
        ArgKind::WwRwQw => out.extend_from_slice(&[head, w1, lo, hi]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFault {
    /// 알 수 없는 opcode 바이트
    UnknownOpcode(u8),
    /// 명령어가 코드 끝을 넘어감
    Truncated,
}

/// `ip` 위치의 명령어를 해석
pub fn decode(code: &[u32], ip: usize) -> Result<(Opcode, InstrArgs), DecodeFault> {
    let head = *code.get(ip).ok_or(DecodeFault::Truncated)?;
    let byte = (head & 0xFF) as u8;
    let op = Opcode::from_repr(byte).ok_or(DecodeFault::UnknownOpcode(byte))?;
    if op.is_pseudo() {
        return Err(DecodeFault::UnknownOpcode(byte));
    }
    let kind = op.kind();
    let size = kind.size() as usize;
    if ip + size > code.len() {
        return Err(DecodeFault::Truncated);
    }
    let word = |n: usize| code[ip + n];
    let qword = |n: usize| code[ip + n] as u64 | ((code[ip + n + 1] as u64) << 32);
    let w0 = (head >> 16) as u16 as i16;

    let mut args = InstrArgs::default();
    match kind {
        ArgKind::NoArg => {}
        ArgKind::W | ArgKind::RW | ArgKind::WW => args.w[0] = w0,
        ArgKind::WwRw | ArgKind::RwRw | ArgKind::WRw | ArgKind::WwW => {
            args.w[0] = w0;
            args.w[1] = word(1) as u16 as i16;
        }
        ArgKind::WwRwRw | ArgKind::WwRwW | ArgKind::RwWRw => {
            args.w[0] = w0;
            args.w[1] = word(1) as u16 as i16;
            args.w[2] = (word(1) >> 16) as u16 as i16;
        }
        ArgKind::Dw => args.arg = word(1) as u64,
        ArgKind::WwDw | ArgKind::RwDw | ArgKind::WDw => {
            args.w[0] = w0;
            args.arg = word(1) as u64;
        }
        ArgKind::Qw | ArgKind::Ptr => args.arg = qword(1),
        ArgKind::WwQw | ArgKind::RwQw | ArgKind::WwPtr => {
            args.w[0] = w0;
            args.arg = qword(1);
        }
        ArgKind::WwRwDw => {
            args.w[0] = w0;
            args.w[1] = word(1) as u16 as i16;
            args.arg = word(2) as u64;
        }
        ArgKind::WwRwQw => {
            args.w[0] = w0;
            args.w[1] = word(1) as u16 as i16;
            args.arg = qword(2);
        }
    }
    Ok((op, args))
}

/// 워드 배열 안의 64비트 인자 위치 (포인터 인자 패치용)
pub fn qword_slot(op: Opcode) -> Option<usize> {
    match op.kind() {
        ArgKind::Qw | ArgKind::Ptr | ArgKind::WwQw | ArgKind::RwQw | ArgKind::WwPtr => Some(1),
        ArgKind::WwRwQw => Some(2),
        _ => None,
    }
}

/// 워드 배열 안의 32비트 인자 위치
pub fn dword_slot(op: Opcode) -> Option<usize> {
    match op.kind() {
        ArgKind::Dw | ArgKind::WwDw | ArgKind::RwDw | ArgKind::WDw => Some(1),
        ArgKind::WwRwDw => Some(2),
        _ => None,
    }
}

/// 전역 변수 인덱스를 담은 short 인자 위치
pub fn global_slot(op: Opcode) -> Option<usize> {
    match op {
        Opcode::PshG4 | Opcode::CpyVtoG4 | Opcode::SetG4 => Some(0),
        Opcode::CpyGtoV4 => Some(1),
        _ => None,
    }
}

/// 워드 배열을 명령어 단위로 순회 (`(ip, opcode, args)`)
pub fn instructions(
    code: &[u32],
) -> impl Iterator<Item = Result<(usize, Opcode, InstrArgs), DecodeFault>> + '_ {
    let mut ip = 0usize;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || ip >= code.len() {
            return None;
        }
        match decode(code, ip) {
            Ok((op, args)) => {
                let at = ip;
                ip += op.size() as usize;
                Some(Ok((at, op, args)))
            }
            Err(e) => {
                failed = true;
                Some(Err(e))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_real_opcode_roundtrips_through_words() {
        for op in Opcode::iter().filter(|op| !op.is_pseudo()) {
            let kind = op.kind();
            let mut args = InstrArgs::default();
            for i in 0..kind.word_args() {
                args.w[i] = -(i as i16) - 3;
            }
            if kind.has_arg() {
                args.arg = match kind {
                    ArgKind::Dw | ArgKind::WwDw | ArgKind::RwDw | ArgKind::WDw | ArgKind::WwRwDw => {
                        0xDEAD_BEEF
                    }
                    _ => 0x0123_4567_89AB_CDEF,
                };
            }
            let mut words = Vec::new();
            encode(op, &args, &mut words);
            assert_eq!(words.len() as u32, op.size(), "{op}");
            let (decoded, decoded_args) = decode(&words, 0).unwrap();
            assert_eq!(decoded, op);
            assert_eq!(decoded_args, args, "{op}");
        }
    }

    #[test]
    fn test_decode_rejects_unknown_opcode_and_truncation() {
        assert_eq!(decode(&[0xFE], 0), Err(DecodeFault::UnknownOpcode(0xFE)));

        let mut words = Vec::new();
        encode(
            Opcode::SetV8,
            &InstrArgs {
                w: [1, 0, 0],
                arg: 7,
            },
            &mut words,
        );
        words.pop();
        assert_eq!(decode(&words, 0), Err(DecodeFault::Truncated));
    }

    #[test]
    fn test_pseudo_instructions_are_not_decodable() {
        let head = Opcode::Label as u32;
        assert!(matches!(decode(&[head], 0), Err(DecodeFault::UnknownOpcode(_))));
    }

    #[test]
    fn test_line_packing() {
        let packed = pack_line(1234, 56);
        assert_eq!(unpack_line(packed), (1234, 56));
    }
}

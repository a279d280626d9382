//! # 설계 원칙
//!
//! 1. **스택 셀 하나 = `Value` 하나**: 스칼라는 64비트 패턴으로 저장
//! 2. **소유권 태그**: `Owned`는 참조 하나를 소유하고(drop = release),
//!    `Borrowed`는 소유하지 않음. 예외 해제는 태그만 보고 결정됩니다.
//! 3. **null**: `Scalar(0)` 또는 이미 사라진 `Borrowed`

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::vm::type_def::{ObjectType, TypeId};

pub type ObjectHandle = Arc<ScriptObject>;

/// 스크립트 객체
///
/// 속성은 스칼라 비트 패턴으로 저장됩니다. 호스트 타입은 `payload`에
/// 임의의 데이터를 둘 수 있습니다 (예: `string`의 `String`).
pub struct ScriptObject {
    ty: Arc<ObjectType>,
    props: Mutex<Vec<u64>>,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ScriptObject {
    /// 새 객체를 만들고 construct behaviour를 호출
    pub fn new(ty: Arc<ObjectType>) -> ObjectHandle {
        let obj = Arc::new(Self::raw(ty));
        if let Some(construct) = &obj.ty.behaviours.construct {
            construct(&obj);
        }
        obj
    }

    pub fn with_payload<T: Any + Send>(ty: Arc<ObjectType>, payload: T) -> ObjectHandle {
        let obj = Self::new(ty);
        obj.set_payload(payload);
        obj
    }

    fn raw(ty: Arc<ObjectType>) -> Self {
        let props = vec![0; ty.property_count as usize];
        Self {
            ty,
            props: Mutex::new(props),
            payload: Mutex::new(None),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.ty.id
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.ty
    }

    pub fn prop(&self, index: usize) -> Option<u64> {
        self.props.lock().get(index).copied()
    }

    pub fn set_prop(&self, index: usize, bits: u64) -> bool {
        match self.props.lock().get_mut(index) {
            Some(slot) => {
                *slot = bits;
                true
            }
            None => false,
        }
    }

    pub fn set_payload<T: Any + Send>(&self, payload: T) {
        *self.payload.lock() = Some(Box::new(payload));
    }

    /// payload를 `T`로 빌려서 `f` 실행
    pub fn with_payload_ref<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.payload.lock();
        guard.as_ref()?.downcast_ref::<T>().map(f)
    }

    /// 깊은 복사: 같은 타입의 새 객체를 만들고 속성과 copy behaviour를 적용
    pub fn deep_copy(&self) -> ObjectHandle {
        let copy = Self::new(self.ty.clone());
        {
            let src = self.props.lock();
            let mut dst = copy.props.lock();
            dst.clone_from(&src);
        }
        if let Some(copy_fn) = &self.ty.behaviours.copy {
            copy_fn(&copy, self);
        }
        copy
    }
}

impl Drop for ScriptObject {
    fn drop(&mut self) {
        if let Some(destruct) = self.ty.behaviours.destruct.clone() {
            destruct(self);
        }
    }
}

impl fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptObject")
            .field("type", &self.ty.name)
            .field("props", &*self.props.lock())
            .finish()
    }
}

/// 스택 셀 / 레지스터 / 전역 변수 값
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(u64),
    Owned(ObjectHandle),
    Borrowed(Weak<ScriptObject>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(0)
    }
}

impl Value {
    pub const NULL: Value = Value::Scalar(0);

    pub fn from_int(v: i32) -> Self {
        Value::Scalar(v as u32 as u64)
    }

    pub fn from_int64(v: i64) -> Self {
        Value::Scalar(v as u64)
    }

    pub fn from_double(v: f64) -> Self {
        Value::Scalar(v.to_bits())
    }

    pub fn from_float(v: f32) -> Self {
        Value::Scalar(v.to_bits() as u64)
    }

    pub fn from_bool(v: bool) -> Self {
        Value::Scalar(v as u64)
    }

    pub fn owned(handle: ObjectHandle) -> Self {
        Value::Owned(handle)
    }

    /// 스칼라 비트. 살아있는 객체는 1, null은 0
    pub fn bits(&self) -> u64 {
        match self {
            Value::Scalar(bits) => *bits,
            Value::Owned(_) => 1,
            Value::Borrowed(weak) => (weak.strong_count() > 0) as u64,
        }
    }

    pub fn int(&self) -> i32 {
        self.bits() as u32 as i32
    }

    pub fn int64(&self) -> i64 {
        self.bits() as i64
    }

    pub fn double(&self) -> f64 {
        f64::from_bits(self.bits())
    }

    pub fn float(&self) -> f32 {
        f32::from_bits(self.bits() as u32)
    }

    pub fn is_null(&self) -> bool {
        self.bits() == 0
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Value::Owned(_))
    }

    pub fn object(&self) -> Option<ObjectHandle> {
        match self {
            Value::Scalar(_) => None,
            Value::Owned(handle) => Some(handle.clone()),
            Value::Borrowed(weak) => weak.upgrade(),
        }
    }

    /// 복사본. `Owned`는 참조를 하나 더 얻고 `Borrowed`는 빌린 채로 남음
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// 소유하지 않는 참조
    pub fn borrow_ref(&self) -> Self {
        match self {
            Value::Owned(handle) => Value::Borrowed(Arc::downgrade(handle)),
            other => other.clone(),
        }
    }

    /// 값을 꺼내고 null을 남김
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::type_def::{Behaviours, TypeFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_type(drops: Arc<AtomicUsize>) -> Arc<ObjectType> {
        Arc::new(ObjectType {
            id: 1,
            name: "counted".into(),
            flags: TypeFlags::REF,
            property_count: 2,
            behaviours: Behaviours {
                destruct: Some(Arc::new(move |_: &ScriptObject| {
                    drops.fetch_add(1, Ordering::SeqCst);
                })),
                ..Behaviours::default()
            },
            module: None,
        })
    }

    #[test]
    fn test_scalar_views() {
        assert_eq!(Value::from_int(-5).int(), -5);
        assert_eq!(Value::from_double(1.5).double(), 1.5);
        assert!(Value::NULL.is_null());
        assert!(!Value::from_int(1).is_null());
    }

    #[test]
    fn test_owned_release_runs_destructor_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ty = counted_type(drops.clone());
        let mut cell = Value::owned(ScriptObject::new(ty));
        let shared = cell.share();
        drop(cell.take());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(cell.is_null());
        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrowed_does_not_keep_object_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let owned = Value::owned(ScriptObject::new(counted_type(drops.clone())));
        let borrowed = owned.borrow_ref();
        assert!(!borrowed.is_null());
        drop(owned);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(borrowed.is_null());
        assert!(borrowed.object().is_none());
    }

    #[test]
    fn test_deep_copy_copies_properties() {
        let drops = Arc::new(AtomicUsize::new(0));
        let obj = ScriptObject::new(counted_type(drops));
        assert!(obj.set_prop(1, 42));
        assert!(!obj.set_prop(5, 1));
        let copy = obj.deep_copy();
        assert_eq!(copy.prop(1), Some(42));
        assert!(!Arc::ptr_eq(&obj, &copy));
    }

    #[test]
    fn test_payload_access() {
        let drops = Arc::new(AtomicUsize::new(0));
        let obj = ScriptObject::with_payload(counted_type(drops), String::from("hi"));
        let len = obj.with_payload_ref(|s: &String| s.len());
        assert_eq!(len, Some(2));
    }
}

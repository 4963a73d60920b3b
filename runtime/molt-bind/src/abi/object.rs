use std::alloc::{Layout, handle_alloc_error};
use std::ffi::CStr;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use molt_obj_model::{PyObject, PySsize, PyTypeObject, TPFLAGS_HEAPTYPE};

use crate::gil::{GilGuard, gil_assert};

/// # Safety
/// `obj` must be null or point to a live object.
pub unsafe fn incref(obj: *mut PyObject) {
    if obj.is_null() {
        return;
    }
    unsafe {
        if (*obj).is_immortal() {
            return;
        }
        (*obj).ob_refcnt += 1;
    }
}

/// # Safety
/// `obj` must be null or a live object the caller owns a reference to; the
/// execution lock must be held.
pub unsafe fn decref(obj: *mut PyObject) {
    if obj.is_null() {
        return;
    }
    gil_assert();
    unsafe {
        let header = &mut *obj;
        if header.is_immortal() {
            return;
        }
        header.ob_refcnt -= 1;
        if header.ob_refcnt == 0 {
            dealloc(obj);
        }
    }
}

/// Teardown of an object whose refcount reached zero. Bound and enum type
/// objects are recognised by their marker before per-type teardown runs.
///
/// # Safety
/// `obj` must be unreachable and its refcount zero.
pub unsafe fn dealloc(obj: *mut PyObject) {
    unsafe {
        if crate::metaclass::is_native_type_object(obj) {
            crate::metaclass::teardown_type(obj);
            return;
        }
        let ty = (*obj).ob_type;
        match (*ty).tp_dealloc {
            Some(slot) => slot(obj),
            None => generic_free(obj),
        }
    }
}

/// Alignment `calloc` guarantees on the supported targets.
const MALLOC_ALIGN: usize = 2 * size_of::<usize>();

/// Zeroed allocation of `size` bytes with the header initialised. Instances
/// of heap types hold a reference to their type.
///
/// # Safety
/// `ty` must be a readied type and `size` at least the header size.
pub unsafe fn generic_alloc(ty: *mut PyTypeObject, size: usize) -> *mut PyObject {
    unsafe { generic_alloc_aligned(ty, size, align_of::<PyObject>()) }
}

/// [`generic_alloc`] for layouts that need more than the allocator's
/// default alignment. The memory is released by [`generic_free`] all the
/// same.
///
/// # Safety
/// As for [`generic_alloc`]; `align` must be a power of two.
pub unsafe fn generic_alloc_aligned(
    ty: *mut PyTypeObject,
    size: usize,
    align: usize,
) -> *mut PyObject {
    debug_assert!(size >= size_of::<PyObject>());
    debug_assert!(align.is_power_of_two());
    unsafe {
        let raw = if align <= MALLOC_ALIGN {
            libc::calloc(1, size)
        } else {
            let mut out = ptr::null_mut();
            if libc::posix_memalign(&mut out, align, size) != 0 {
                return ptr::null_mut();
            }
            ptr::write_bytes(out.cast::<u8>(), 0, size);
            out
        };
        let raw = raw.cast::<PyObject>();
        if raw.is_null() {
            return ptr::null_mut();
        }
        ptr::write(raw, PyObject::new(ty));
        if (*ty).has_flag(TPFLAGS_HEAPTYPE) {
            incref(ty.cast());
        }
        raw
    }
}

/// Same as [`generic_alloc`] but aborts through the allocation error handler
/// instead of returning null.
///
/// # Safety
/// As for [`generic_alloc`].
pub unsafe fn alloc_or_abort(ty: *mut PyTypeObject, size: usize) -> NonNull<PyObject> {
    let raw = unsafe { generic_alloc(ty, size) };
    NonNull::new(raw).unwrap_or_else(|| {
        let layout = Layout::from_size_align(size, align_of::<usize>())
            .unwrap_or(Layout::new::<PyObject>());
        handle_alloc_error(layout)
    })
}

/// Releases memory obtained from [`generic_alloc`] or
/// [`generic_alloc_aligned`] and the type reference it holds.
///
/// # Safety
/// `obj` must come from [`generic_alloc`] and must not be used afterwards.
pub unsafe fn generic_free(obj: *mut PyObject) {
    unsafe {
        let ty = (*obj).ob_type;
        libc::free(obj.cast());
        if (*ty).has_flag(TPFLAGS_HEAPTYPE) {
            decref(ty.cast());
        }
    }
}

pub(crate) unsafe extern "C" fn generic_tp_alloc(
    ty: *mut PyTypeObject,
    _nitems: PySsize,
) -> *mut PyObject {
    unsafe { generic_alloc(ty, (*ty).tp_basicsize as usize) }
}

pub(crate) unsafe extern "C" fn generic_dealloc(obj: *mut PyObject) {
    unsafe { generic_free(obj) }
}

/// # Safety
/// `ty` must point to a type object.
pub unsafe fn type_name(ty: *const PyTypeObject) -> String {
    unsafe {
        if ty.is_null() || (*ty).tp_name.is_null() {
            return "<unknown>".to_string();
        }
        CStr::from_ptr((*ty).tp_name).to_string_lossy().into_owned()
    }
}

/// True if `ty` is `base` or inherits from it through `tp_base`.
///
/// # Safety
/// Both pointers must be type objects.
pub unsafe fn is_subtype(mut ty: *const PyTypeObject, base: *const PyTypeObject) -> bool {
    while !ty.is_null() {
        if ptr::eq(ty, base) {
            return true;
        }
        ty = unsafe { (*ty).tp_base };
    }
    false
}

/// Owning handle: holds one reference and releases it on drop.
#[repr(transparent)]
pub struct ObjRef(NonNull<PyObject>);

// Refcount traffic happens under the execution lock, taken in `Drop`/`Clone`.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// # Safety
    /// `ptr` must be null or a new reference the caller transfers.
    pub unsafe fn from_owned_ptr(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// # Safety
    /// `ptr` must be a new reference the caller transfers.
    pub(crate) unsafe fn from_non_null(ptr: NonNull<PyObject>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// `ptr` must be null or a live object.
    pub unsafe fn from_borrowed_ptr(ptr: *mut PyObject) -> Option<Self> {
        let obj = NonNull::new(ptr)?;
        unsafe { incref(obj.as_ptr()) };
        Some(Self(obj))
    }

    pub fn as_ptr(&self) -> *mut PyObject {
        self.0.as_ptr()
    }

    /// Gives up ownership without decrementing.
    pub fn into_ptr(self) -> *mut PyObject {
        let ptr = self.0.as_ptr();
        std::mem::forget(self);
        ptr
    }

    pub fn borrow(&self) -> Borrowed<'_> {
        Borrowed {
            ptr: self.0,
            _marker: PhantomData,
        }
    }

    pub fn refcnt(&self) -> PySsize {
        unsafe { (*self.0.as_ptr()).ob_refcnt }
    }

    pub fn is(&self, other: &ObjRef) -> bool {
        self.0 == other.0
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        let _gil = GilGuard::new();
        unsafe { incref(self.0.as_ptr()) };
        Self(self.0)
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        let _gil = GilGuard::new();
        unsafe { decref(self.0.as_ptr()) };
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.borrow().fmt(f)
    }
}

/// Borrowing handle: valid for `'a`, never touches the refcount.
#[derive(Copy, Clone)]
pub struct Borrowed<'a> {
    ptr: NonNull<PyObject>,
    _marker: PhantomData<&'a PyObject>,
}

impl<'a> Borrowed<'a> {
    /// # Safety
    /// `ptr` must be null or an object that stays alive for `'a`.
    pub unsafe fn from_ptr(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            _marker: PhantomData,
        })
    }

    pub fn as_ptr(self) -> *mut PyObject {
        self.ptr.as_ptr()
    }

    pub fn type_ptr(self) -> *mut PyTypeObject {
        unsafe { (*self.ptr.as_ptr()).ob_type }
    }

    pub fn type_name(self) -> String {
        unsafe { type_name(self.type_ptr()) }
    }

    pub fn is_instance(self, ty: *const PyTypeObject) -> bool {
        unsafe { is_subtype(self.type_ptr(), ty) }
    }

    pub fn to_owned(self) -> ObjRef {
        unsafe { incref(self.ptr.as_ptr()) };
        ObjRef(self.ptr)
    }

    pub fn is(self, other: Borrowed<'_>) -> bool {
        self.ptr == other.ptr
    }
}

impl fmt::Debug for Borrowed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:p}>", self.type_name(), self.ptr.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::builtins;
    use crate::gil::with_gil;

    #[test]
    fn test_aligned_alloc_honours_large_alignments() {
        with_gil(|_py| {
            let ty = builtins().object;
            let size = 512;
            for align in [8, 16, 64, 256] {
                let obj = unsafe { generic_alloc_aligned(ty, size, align) };
                assert!(!obj.is_null());
                assert_eq!(obj as usize % align, 0);
                let body = unsafe {
                    std::slice::from_raw_parts(
                        obj.cast::<u8>().add(size_of::<PyObject>()),
                        size - size_of::<PyObject>(),
                    )
                };
                assert!(body.iter().all(|byte| *byte == 0));
                unsafe { generic_free(obj) };
            }
        });
    }
}

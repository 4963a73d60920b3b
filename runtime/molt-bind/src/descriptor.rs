use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use libc::c_ulong;
use molt_obj_model::{
    Destructor, InitProc, NewFunc, PyGetSetDef, PyMethodDef, PyObject, PySsize, PyTypeObject,
    TPFLAGS_DEFAULT, TPFLAGS_HEAPTYPE,
};

use crate::abi::{Borrowed, ObjRef, type_ready};
use crate::context::TypeContext;
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::metaclass;
use crate::registry::TypeHash;

/// Tag in every type object created by this crate, read before teardown.
pub const NATIVE_TYPE_MARKER: u64 = 0x4d4f_4c54_4249_4e44;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Value,
    MutRef,
    ConstRef,
    Enum,
}

/// A type object plus what it owns: names, tables, and a share of the
/// per-type context. Allocated as a `Box` and released by the metaclass.
#[repr(C)]
pub struct HeapType {
    pub ty: PyTypeObject,
    magic: u64,
    kind: TypeKind,
    payload_offset: usize,
    context: Option<Arc<TypeContext>>,
    name: CString,
    doc: Option<CString>,
    methods: Vec<PyMethodDef>,
    getsets: Vec<PyGetSetDef>,
    strings: Vec<CString>,
}

impl HeapType {
    pub fn is_marked(&self) -> bool {
        self.magic == NATIVE_TYPE_MARKER
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn context(&self) -> Option<&TypeContext> {
        self.context.as_deref()
    }

    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<invalid>")
    }
}

pub(crate) fn cstring(text: &str) -> BindResult<CString> {
    CString::new(text).map_err(|_| BindError::mismatch(format!("{text:?} contains a NUL byte")))
}

/// Everything needed to build one heap type object.
pub(crate) struct HeapTypeSpec {
    pub name: String,
    pub doc: Option<String>,
    pub kind: TypeKind,
    pub basicsize: usize,
    pub payload_offset: usize,
    pub context: Option<Arc<TypeContext>>,
    /// Entries without the sentinel; one is appended.
    pub methods: Vec<PyMethodDef>,
    pub getsets: Vec<PyGetSetDef>,
    /// Backing storage for names the method and getset tables point into.
    pub strings: Vec<CString>,
    pub base: Option<ObjRef>,
    pub dict: Option<ObjRef>,
    pub dealloc: Option<Destructor>,
    pub new: Option<NewFunc>,
    pub init: Option<InitProc>,
    pub flags: c_ulong,
}

impl HeapTypeSpec {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            doc: None,
            kind,
            basicsize: size_of::<PyObject>(),
            payload_offset: 0,
            context: None,
            methods: Vec::new(),
            getsets: Vec::new(),
            strings: Vec::new(),
            base: None,
            dict: None,
            dealloc: None,
            new: None,
            init: None,
            flags: 0,
        }
    }

    /// Boxes the type, points its header at the metaclass and readies it.
    pub fn create(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        let name = cstring(&self.name)?;
        let doc = self.doc.as_deref().map(cstring).transpose()?;
        let mut methods = self.methods;
        methods.push(PyMethodDef::sentinel());
        let mut getsets = self.getsets;
        getsets.push(PyGetSetDef::sentinel());

        let mut heap = Box::new(HeapType {
            ty: PyTypeObject::zeroed(),
            magic: NATIVE_TYPE_MARKER,
            kind: self.kind,
            payload_offset: self.payload_offset,
            context: self.context,
            name,
            doc,
            methods,
            getsets,
            strings: self.strings,
        });
        let ty = &mut heap.ty;
        ty.ob_base.ob_base = PyObject::new(metaclass::metaclass_ptr());
        ty.tp_name = heap.name.as_ptr();
        ty.tp_doc = heap.doc.as_ref().map_or(std::ptr::null(), |doc| doc.as_ptr());
        ty.tp_basicsize = self.basicsize as PySsize;
        ty.tp_flags = TPFLAGS_DEFAULT | TPFLAGS_HEAPTYPE | self.flags;
        ty.tp_methods = heap.methods.as_mut_ptr();
        ty.tp_getset = heap.getsets.as_mut_ptr();
        ty.tp_base = self
            .base
            .map_or(std::ptr::null_mut(), |base| base.into_ptr().cast());
        ty.tp_dict = self.dict.map_or(std::ptr::null_mut(), ObjRef::into_ptr);
        ty.tp_dealloc = self.dealloc;
        ty.tp_new = self.new;
        ty.tp_init = self.init;

        let raw = Box::into_raw(heap);
        // From here on the metaclass teardown owns the box.
        let obj = unsafe { ObjRef::from_owned_ptr(raw.cast()) }
            .ok_or_else(|| BindError::Native("type allocation failed".into()))?;
        unsafe { type_ready(py, raw.cast())? };
        Ok(obj)
    }
}

struct DescriptorInner {
    name: String,
    doc: Option<String>,
    hash: TypeHash,
    basic_size: usize,
    payload_offset: usize,
    value_type: ObjRef,
    mut_ref_type: ObjRef,
    const_ref_type: ObjRef,
    context: Arc<TypeContext>,
}

/// A finalized bound type: the value type object, its two reference shadow
/// types, and the context they share.
#[derive(Clone)]
pub struct TypeDescriptor {
    inner: Arc<DescriptorInner>,
}

pub(crate) struct DescriptorParts {
    pub name: String,
    pub doc: Option<String>,
    pub hash: TypeHash,
    pub basic_size: usize,
    pub payload_offset: usize,
    pub value_type: ObjRef,
    pub mut_ref_type: ObjRef,
    pub const_ref_type: ObjRef,
    pub context: Arc<TypeContext>,
}

impl TypeDescriptor {
    pub(crate) fn new(parts: DescriptorParts) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                name: parts.name,
                doc: parts.doc,
                hash: parts.hash,
                basic_size: parts.basic_size,
                payload_offset: parts.payload_offset,
                value_type: parts.value_type,
                mut_ref_type: parts.mut_ref_type,
                const_ref_type: parts.const_ref_type,
                context: parts.context,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.inner.doc.as_deref()
    }

    pub fn hash(&self) -> TypeHash {
        self.inner.hash
    }

    pub fn basic_size(&self) -> usize {
        self.inner.basic_size
    }

    pub fn payload_offset(&self) -> usize {
        self.inner.payload_offset
    }

    pub fn value_type(&self) -> Borrowed<'_> {
        self.inner.value_type.borrow()
    }

    pub fn mut_ref_type(&self) -> Borrowed<'_> {
        self.inner.mut_ref_type.borrow()
    }

    pub fn const_ref_type(&self) -> Borrowed<'_> {
        self.inner.const_ref_type.borrow()
    }

    pub fn value_type_ptr(&self) -> *mut PyTypeObject {
        self.inner.value_type.as_ptr().cast()
    }

    pub fn mut_ref_type_ptr(&self) -> *mut PyTypeObject {
        self.inner.mut_ref_type.as_ptr().cast()
    }

    pub fn const_ref_type_ptr(&self) -> *mut PyTypeObject {
        self.inner.const_ref_type.as_ptr().cast()
    }

    pub fn context(&self) -> &TypeContext {
        &self.inner.context
    }

    /// The value type's teardown slot.
    pub fn destructor(&self) -> Option<Destructor> {
        unsafe { (*self.value_type_ptr()).tp_dealloc }
    }

    pub fn is_constructible(&self) -> bool {
        unsafe { (*self.value_type_ptr()).tp_init.is_some() }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.inner.name)
            .field("hash", &self.inner.hash)
            .field("basic_size", &self.inner.basic_size)
            .finish_non_exhaustive()
    }
}

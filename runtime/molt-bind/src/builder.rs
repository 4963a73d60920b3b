use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use libc::c_void;
use molt_obj_model::{
    METH_VARARGS, PyCFunction, PyGetSetDef, PyMethodDef, PyTypeObject,
    TPFLAGS_DISALLOW_INSTANTIATION,
};
use tracing::{debug, error};

use crate::abi::{Borrowed, ObjRef, dict_set_item};
use crate::config::config;
use crate::context::{FieldAccessor, Overload, TypeContext};
use crate::descriptor::{DescriptorParts, HeapTypeSpec, TypeDescriptor, TypeKind, cstring};
use crate::dispatch::{
    ArgList, CallTarget, NativeFn, callable_object, constructor_overload, destroy_thunk,
    function_overload, init_thunk, member_get, member_set, method_thunk, no_constructor_new,
};
use crate::error::{BindError, BindResult};
use crate::gil::{GilGuard, PyToken};
use crate::marshal::{FromWire, IntoWire};
use crate::module::ModuleBuilder;
use crate::object_model::{Instance, instance_dealloc, instance_new};
use crate::registry::{self, TypeHash, name_hash};

struct MethodEntry {
    name: CString,
    meth: PyCFunction,
}

struct MemberEntry {
    name: CString,
    offset: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BuilderState {
    Building,
    Finalized,
}

/// Declares how a native type `T` is exposed, then builds its type objects.
///
/// Declarations chain on `&mut self`. `finalize` readies the value type and
/// its `&mut T` / `&T` shadow types, registers the descriptor, and attaches
/// it to the module the builder came from. A builder dropped without an
/// explicit `finalize` finalizes itself and logs any error.
pub struct TypeBuilder<'m, T: 'static> {
    name: String,
    doc: Option<String>,
    state: BuilderState,
    context: TypeContext,
    methods: Vec<MethodEntry>,
    members: Vec<MemberEntry>,
    default_constructor: Option<Overload>,
    constructible: bool,
    force: Option<bool>,
    module: Option<&'m mut ModuleBuilder>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> TypeBuilder<'static, T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_module(name.into(), None)
    }
}

impl<'m, T: 'static> TypeBuilder<'m, T> {
    pub(crate) fn with_module(name: String, module: Option<&'m mut ModuleBuilder>) -> Self {
        Self {
            context: TypeContext::new(name.clone(), TypeHash::of::<T>()),
            name,
            doc: None,
            state: BuilderState::Building,
            methods: Vec::new(),
            members: Vec::new(),
            default_constructor: None,
            constructible: true,
            force: None,
            module,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finalized(&self) -> bool {
        self.state == BuilderState::Finalized
    }

    fn check_building(&self, what: &str) -> BindResult<()> {
        if self.is_finalized() {
            return Err(BindError::FinalizationMisuse(format!(
                "cannot declare {what} on '{}' after finalize",
                self.name
            )));
        }
        Ok(())
    }

    fn check_constructible(&self) -> BindResult<()> {
        if !self.constructible {
            return Err(BindError::ConstructionUnsupported(format!(
                "'{}' is declared non-constructible",
                self.name
            )));
        }
        Ok(())
    }

    pub fn doc(&mut self, doc: impl Into<String>) -> BindResult<&mut Self> {
        self.check_building("a doc string")?;
        self.doc = Some(doc.into());
        Ok(self)
    }

    /// Replace an already registered type with the same identity instead of
    /// failing.
    pub fn force_register(&mut self) -> BindResult<&mut Self> {
        self.check_building("a registration policy")?;
        self.force = Some(true);
        Ok(self)
    }

    pub fn constructor<Args, F>(&mut self, f: F) -> BindResult<&mut Self>
    where
        Args: ArgList,
        F: NativeFn<Args, T>,
    {
        self.check_building("a constructor")?;
        self.check_constructible()?;
        self.context
            .constructors_mut()
            .add(constructor_overload::<T, Args, F>(f))?;
        Ok(self)
    }

    /// Construct from `T::default()` when no other constructor is declared.
    pub fn default_constructor(&mut self) -> BindResult<&mut Self>
    where
        T: Default,
    {
        self.check_building("a constructor")?;
        self.check_constructible()?;
        self.default_constructor = Some(constructor_overload::<T, (), _>(T::default));
        Ok(self)
    }

    /// Calling the type object raises instead of constructing.
    pub fn no_construct(&mut self) -> BindResult<&mut Self> {
        self.check_building("construction policy")?;
        if !self.context.constructors().is_empty() || self.default_constructor.is_some() {
            return Err(BindError::ConstructionUnsupported(format!(
                "'{}' already declares a constructor",
                self.name
            )));
        }
        self.constructible = false;
        Ok(self)
    }

    /// Instance method; the receiver is the callable's first parameter.
    /// `NAME` must be `name_hash(name)`; the [`method!`](crate::method)
    /// macro supplies it.
    pub fn method<const NAME: u64, Args, R, F>(&mut self, name: &str, f: F) -> BindResult<&mut Self>
    where
        Args: ArgList,
        R: IntoWire + 'static,
        F: NativeFn<Args, R>,
    {
        self.check_building("a method")?;
        if name_hash(name) != NAME {
            return Err(BindError::mismatch(format!(
                "method '{name}' declared under a foreign name hash"
            )));
        }
        let name_c = cstring(name)?;
        let first = self
            .context
            .methods_mut()
            .insert(name, function_overload(f))?;
        if first {
            self.methods.push(MethodEntry {
                name: name_c,
                meth: method_thunk::<NAME>,
            });
        }
        Ok(self)
    }

    pub fn static_method<Args, R, F>(&mut self, name: &str, f: F) -> BindResult<&mut Self>
    where
        Args: ArgList,
        R: IntoWire + 'static,
        F: NativeFn<Args, R>,
    {
        self.check_building("a static method")?;
        cstring(name)?;
        self.context
            .statics_mut()
            .insert(name, function_overload(f))?;
        Ok(self)
    }

    /// Exposes the field of type `M` at `offset`. `_field` only pins `M`.
    ///
    /// # Safety
    /// `offset` must be the offset of a field of type `M` inside `T`; the
    /// [`member!`](crate::member) macro derives both from the field name.
    pub unsafe fn member_at<M, P>(
        &mut self,
        name: &str,
        offset: usize,
        readonly: bool,
        _field: P,
    ) -> BindResult<&mut Self>
    where
        M: FromWire + IntoWire + Clone + 'static,
        P: Fn(&T) -> &M,
    {
        self.check_building("a member")?;
        let name_c = cstring(name)?;
        let accessor = unsafe { FieldAccessor::<T, M>::new(offset, readonly) };
        self.context.add_member(offset, name, Box::new(accessor))?;
        self.members.push(MemberEntry {
            name: name_c,
            offset,
        });
        Ok(self)
    }

    /// Builds and registers the type objects. Runs at most once; later calls
    /// fail with `FinalizationMisuse`.
    pub fn finalize(&mut self) -> BindResult<TypeDescriptor> {
        self.check_building("finalize")?;
        self.state = BuilderState::Finalized;
        let guard = GilGuard::new();
        let py = guard.token();

        let mut context = std::mem::replace(
            &mut self.context,
            TypeContext::new(self.name.clone(), TypeHash::of::<T>()),
        );
        if context.constructors().is_empty() {
            if let Some(default) = self.default_constructor.take() {
                context.constructors_mut().add(default)?;
            }
        }
        let constructible = !context.constructors().is_empty();
        let context = Arc::new(context);

        let value_type = self.build_value_type(&py, &context, constructible)?;
        let mut_ref_type = self.build_shadow_type(&py, &context, &value_type, TypeKind::MutRef)?;
        let const_ref_type =
            self.build_shadow_type(&py, &context, &value_type, TypeKind::ConstRef)?;

        let descriptor = TypeDescriptor::new(DescriptorParts {
            name: self.name.clone(),
            doc: self.doc.clone(),
            hash: TypeHash::of::<T>(),
            basic_size: Instance::<T>::SIZE,
            payload_offset: Instance::<T>::PAYLOAD_OFFSET,
            value_type,
            mut_ref_type,
            const_ref_type,
            context,
        });
        let force = self.force.unwrap_or(config().force_register);
        registry::register(descriptor.hash(), descriptor.clone(), force)?;
        if let Some(module) = self.module.as_deref_mut() {
            module.attach_type(&self.name, descriptor.clone())?;
        }
        debug!(
            type_name = %self.name,
            methods = self.methods.len(),
            members = self.members.len(),
            constructible,
            "finalized native type"
        );
        Ok(descriptor)
    }

    fn build_value_type(
        &mut self,
        py: &PyToken<'_>,
        context: &Arc<TypeContext>,
        constructible: bool,
    ) -> BindResult<ObjRef> {
        let mut strings = Vec::new();
        let mut methods = Vec::new();
        for entry in self.methods.drain(..) {
            methods.push(method_def(&entry.name, entry.meth));
            strings.push(entry.name);
        }
        let destroy_name = cstring("__destroy__")?;
        methods.push(method_def(&destroy_name, destroy_thunk::<T>));
        strings.push(destroy_name);

        let mut getsets = Vec::new();
        for entry in self.members.drain(..) {
            getsets.push(PyGetSetDef {
                name: entry.name.as_ptr(),
                get: Some(member_get),
                set: Some(member_set),
                doc: ptr::null(),
                closure: entry.offset as *mut c_void,
            });
            strings.push(entry.name);
        }

        let mut spec = HeapTypeSpec::new(self.name.clone(), TypeKind::Value);
        spec.doc = self.doc.clone();
        spec.basicsize = Instance::<T>::SIZE;
        spec.payload_offset = Instance::<T>::PAYLOAD_OFFSET;
        spec.context = Some(context.clone());
        spec.methods = methods;
        spec.getsets = getsets;
        spec.strings = strings;
        spec.dealloc = Some(instance_dealloc::<T>);
        if constructible {
            spec.new = Some(instance_new::<T>);
            spec.init = Some(init_thunk);
        } else {
            spec.new = Some(no_constructor_new);
        }
        let value_type = spec.create(py)?;

        let dict = unsafe { Borrowed::from_ptr((*value_type.as_ptr().cast::<PyTypeObject>()).tp_dict) }
            .ok_or_else(|| BindError::lookup(format!("'{}' has no type dict", self.name)))?;
        for name in context.statics().names() {
            let function = callable_object(py, name, CallTarget::Static(context.clone()))?;
            dict_set_item(py, dict, name, function)?;
        }
        Ok(value_type)
    }

    fn build_shadow_type(
        &self,
        py: &PyToken<'_>,
        context: &Arc<TypeContext>,
        value_type: &ObjRef,
        kind: TypeKind,
    ) -> BindResult<ObjRef> {
        let name = match kind {
            TypeKind::MutRef => format!("&mut {}", self.name),
            _ => format!("&{}", self.name),
        };
        let mut spec = HeapTypeSpec::new(name, kind);
        spec.doc = self.doc.clone();
        spec.basicsize = Instance::<T>::SIZE;
        spec.payload_offset = Instance::<T>::PAYLOAD_OFFSET;
        spec.context = Some(context.clone());
        spec.base = Some(value_type.clone());
        spec.dealloc = Some(instance_dealloc::<T>);
        spec.flags = TPFLAGS_DISALLOW_INSTANTIATION;
        spec.create(py)
    }
}

impl<T: 'static> fmt::Debug for TypeBuilder<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeBuilder")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("constructible", &self.constructible)
            .field("attached", &self.module.is_some())
            .finish_non_exhaustive()
    }
}

fn method_def(name: &CString, meth: PyCFunction) -> PyMethodDef {
    PyMethodDef {
        ml_name: name.as_ptr(),
        ml_meth: Some(meth),
        ml_flags: METH_VARARGS,
        ml_doc: ptr::null(),
    }
}

impl<T: 'static> Drop for TypeBuilder<'_, T> {
    fn drop(&mut self) {
        if self.is_finalized() || std::thread::panicking() {
            return;
        }
        if let Err(err) = self.finalize() {
            error!(type_name = %self.name, error = %err, "finalizing type builder on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Unbuilt;

    #[test]
    fn test_constructor_after_no_construct_is_rejected() {
        let mut builder = TypeBuilder::<Unbuilt>::new("Unbuilt");
        builder.no_construct().unwrap();
        let err = builder.default_constructor().unwrap_err();
        assert!(matches!(err, BindError::ConstructionUnsupported(_)));
        // Never registered: mark finalized so drop leaves the registry alone.
        builder.state = BuilderState::Finalized;
    }

    #[test]
    fn test_method_under_wrong_hash_is_rejected() {
        let mut builder = TypeBuilder::<Unbuilt>::new("Unbuilt");
        let err = builder
            .method::<{ name_hash("other") }, _, _, _>("name", |x: i32| x)
            .unwrap_err();
        assert!(matches!(err, BindError::ArgumentMismatch(_)));
        builder.state = BuilderState::Finalized;
    }
}

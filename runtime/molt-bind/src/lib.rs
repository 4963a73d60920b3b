//! Binding engine that exposes Rust types, functions, fields and enums as
//! objects of a CPython-ABI runtime.
//!
//! A [`TypeBuilder`] turns a native type into a readied heap type plus two
//! shadow types for `&mut T` and `&T` aliases. A [`ModuleBuilder`] collects
//! types, free functions, variables and enums and emits them into a module
//! object once. Calls from the runtime land in `extern "C"` thunks that
//! resolve an overload, marshal the arguments through [`FromWire`], invoke
//! the native callable and wrap the result through [`IntoWire`].
//!
//! ```ignore
//! struct Counter { count: i64 }
//! molt_bind::native_class!(Counter);
//!
//! let mut module = ModuleBuilder::new("demo");
//! let mut counter = module.class::<Counter>("Counter")?;
//! counter.constructor(|count: i64| Counter { count })?;
//! molt_bind::method!(counter, "inc", |c: &mut Counter| { c.count += 1; c.count })?;
//! molt_bind::member!(counter, Counter, count)?;
//! counter.finalize()?;
//! ```

pub mod abi;
mod builder;
pub mod config;
mod context;
mod descriptor;
mod dispatch;
pub mod error;
pub mod gil;
pub mod marshal;
pub mod metaclass;
mod module;
pub mod object_model;
mod primitives;
pub mod registry;

pub use abi::{Borrowed, ObjRef};
pub use builder::TypeBuilder;
pub use config::{BindConfig, config};
pub use context::{
    FieldAccessor, FunctionTable, MemberAccessor, MemberEntry, Overload, OverloadSet,
    TypeContext,
};
pub use descriptor::{HeapType, NATIVE_TYPE_MARKER, TypeDescriptor, TypeKind};
pub use dispatch::{ArgList, DispatchFailure, NativeFn};
pub use error::{BindError, BindResult, ExceptionSentinel};
pub use gil::{GilGuard, GilReleaseGuard, PyToken, allow_threads, gil_held, with_gil};
pub use marshal::{FromWire, IntoWire, NativeClass, WireTag, extract, resolve_shared};
pub use module::ModuleBuilder;
pub use object_model::{ReferenceObject, ValueObject};
pub use primitives::ensure_registered as register_primitives;
pub use registry::{TypeHash, name_hash};

/// Declares an instance method on a [`TypeBuilder`], deriving the const name
/// hash from the literal name.
#[macro_export]
macro_rules! method {
    ($builder:expr, $name:literal, $f:expr $(,)?) => {
        $builder.method::<{ $crate::name_hash($name) }, _, _, _>($name, $f)
    };
}

/// Declares a field of the builder's type as a member, by field name.
///
/// `member!(builder, Type, field)` is read-write;
/// `member!(builder, Type, readonly field)` rejects assignment.
#[macro_export]
macro_rules! member {
    (@at $builder:expr, $ty:ty, $field:ident, $readonly:expr) => {
        // The offset and the projection name the same field.
        unsafe {
            $builder.member_at(
                stringify!($field),
                ::std::mem::offset_of!($ty, $field),
                $readonly,
                |value: &$ty| &value.$field,
            )
        }
    };
    ($builder:expr, $ty:ty, readonly $field:ident $(,)?) => {
        $crate::member!(@at $builder, $ty, $field, true)
    };
    ($builder:expr, $ty:ty, $field:ident $(,)?) => {
        $crate::member!(@at $builder, $ty, $field, false)
    };
}

/// Implements [`NativeClass`] and by-value [`IntoWire`] for a type.
///
/// `native_class!(T)` also implements by-value [`FromWire`], cloning out of an
/// existing instance, and needs `T: Clone`. `native_class!(move_only T)`
/// leaves it out: such a type is only taken by reference.
#[macro_export]
macro_rules! native_class {
    (@common $ty:ty) => {
        impl $crate::NativeClass for $ty {
            const NAME: &'static str = stringify!($ty);
        }

        impl $crate::IntoWire for $ty {
            fn into_wire(
                self,
                py: &$crate::PyToken<'_>,
            ) -> $crate::BindResult<$crate::ObjRef> {
                $crate::ValueObject::alloc(py, self)
            }
        }
    };
    (move_only $ty:ty) => {
        $crate::native_class!(@common $ty);
    };
    ($ty:ty) => {
        $crate::native_class!(@common $ty);

        impl $crate::FromWire for $ty {
            const TAG: $crate::WireTag = $crate::WireTag::Instance;
            type Raw = ::std::ptr::NonNull<$ty>;

            fn describe() -> String {
                stringify!($ty).to_string()
            }

            fn unpack(
                _py: &$crate::PyToken<'_>,
                obj: $crate::Borrowed<'_>,
            ) -> $crate::BindResult<Self::Raw> {
                $crate::resolve_shared::<$ty>(obj)
            }

            fn convert(
                _py: &$crate::PyToken<'_>,
                raw: &mut Self::Raw,
            ) -> $crate::BindResult<Self> {
                Ok(<$ty as ::std::clone::Clone>::clone(unsafe { raw.as_ref() }))
            }
        }
    };
}

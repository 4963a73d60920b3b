use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::ptr::NonNull;

use tracing::trace;

use crate::abi::{Borrowed, ObjRef};
use crate::config::config;
use crate::dispatch::DispatchFailure;
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::marshal::{FromWire, IntoWire, extract};
use crate::object_model::{Access, resolve};
use crate::registry::{TypeHash, name_hash};

/// Type-erased call of one native signature. Receivers, when there is one,
/// arrive as the first argument.
pub(crate) type Invoke =
    dyn Fn(&PyToken<'_>, &[Borrowed<'_>]) -> Result<ObjRef, DispatchFailure> + Send + Sync;

pub struct Overload {
    signature: u64,
    describe: String,
    invoke: Box<Invoke>,
}

impl Overload {
    pub(crate) fn new(signature: u64, describe: String, invoke: Box<Invoke>) -> Self {
        Self {
            signature,
            describe,
            invoke,
        }
    }

    pub fn describe(&self) -> &str {
        &self.describe
    }

    pub(crate) fn invoke(
        &self,
        py: &PyToken<'_>,
        args: &[Borrowed<'_>],
    ) -> Result<ObjRef, DispatchFailure> {
        (self.invoke)(py, args)
    }
}

/// Every native callable registered under one name, tried in declaration
/// order.
pub struct OverloadSet {
    name: String,
    candidates: Vec<Overload>,
}

impl OverloadSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            candidates: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(Overload::describe)
    }

    pub(crate) fn add(&mut self, overload: Overload) -> BindResult<()> {
        if self
            .candidates
            .iter()
            .any(|existing| existing.signature == overload.signature)
        {
            return Err(BindError::duplicate(format!(
                "{}({}) is already registered",
                self.name, overload.describe
            )));
        }
        self.candidates.push(overload);
        Ok(())
    }

    /// Runs the first candidate whose argument shapes match. A single
    /// candidate reports its own error; several report the candidate list.
    pub(crate) fn dispatch(&self, py: &PyToken<'_>, args: &[Borrowed<'_>]) -> BindResult<ObjRef> {
        if config().trace_dispatch {
            trace!(function = %self.name, argc = args.len(), "dispatch");
        }
        let mut mismatches = Vec::new();
        for candidate in &self.candidates {
            match candidate.invoke(py, args) {
                Ok(result) => return Ok(result),
                Err(DispatchFailure::Raised(err)) => return Err(err),
                Err(DispatchFailure::Mismatch(err)) => mismatches.push(err),
            }
        }
        if mismatches.len() == 1 {
            return Err(mismatches.remove(0));
        }
        let given = args
            .iter()
            .map(|arg| arg.type_name())
            .collect::<Vec<_>>()
            .join(", ");
        let candidates = self.signatures().collect::<Vec<_>>().join(" | ");
        Err(BindError::mismatch(format!(
            "no overload of {} accepts ({given}); candidates: {candidates}",
            self.name
        )))
    }
}

/// Name hash to overload set, keeping declaration order for emission.
#[derive(Default)]
pub struct FunctionTable {
    sets: HashMap<u64, OverloadSet>,
    order: Vec<u64>,
}

impl FunctionTable {
    /// Adds an overload; returns true when `name` was not present before.
    pub(crate) fn insert(&mut self, name: &str, overload: Overload) -> BindResult<bool> {
        let hash = name_hash(name);
        match self.sets.get_mut(&hash) {
            Some(set) if set.name() != name => Err(BindError::duplicate(format!(
                "function hash of '{name}' collides with '{}'",
                set.name()
            ))),
            Some(set) => set.add(overload).map(|()| false),
            None => {
                let mut set = OverloadSet::new(name);
                set.add(overload)?;
                self.sets.insert(hash, set);
                self.order.push(hash);
                Ok(true)
            }
        }
    }

    pub fn get(&self, hash: u64) -> BindResult<&OverloadSet> {
        self.sets
            .get(&hash)
            .ok_or_else(|| BindError::lookup(format!("no function with name hash {hash:#018x}")))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.sets.contains_key(&name_hash(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter_map(|hash| self.sets.get(hash))
            .map(OverloadSet::name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Reads and writes one member of the native value behind an instance.
pub trait MemberAccessor: Send + Sync {
    fn get(&self, py: &PyToken<'_>, slf: Borrowed<'_>) -> BindResult<ObjRef>;
    fn set(&self, py: &PyToken<'_>, slf: Borrowed<'_>, value: Borrowed<'_>) -> BindResult<()>;
    fn is_readonly(&self) -> bool;
}

/// Accessor for a field of type `M` at a byte offset inside `T`.
pub struct FieldAccessor<T, M> {
    offset: usize,
    readonly: bool,
    _marker: PhantomData<fn(&T) -> &M>,
}

impl<T, M> FieldAccessor<T, M> {
    /// # Safety
    /// A valid `M` must live at `offset` bytes into every `T`.
    pub unsafe fn new(offset: usize, readonly: bool) -> Self {
        Self {
            offset,
            readonly,
            _marker: PhantomData,
        }
    }

    fn field(&self, base: NonNull<T>) -> NonNull<M> {
        unsafe { base.cast::<u8>().add(self.offset).cast::<M>() }
    }
}

impl<T, M> MemberAccessor for FieldAccessor<T, M>
where
    T: 'static,
    M: FromWire + IntoWire + Clone + 'static,
{
    fn get(&self, py: &PyToken<'_>, slf: Borrowed<'_>) -> BindResult<ObjRef> {
        let base = resolve::<T>(slf, Access::Shared)?;
        let value = unsafe { self.field(base).as_ref() }.clone();
        value.into_wire(py)
    }

    fn set(&self, py: &PyToken<'_>, slf: Borrowed<'_>, value: Borrowed<'_>) -> BindResult<()> {
        if self.readonly {
            return Err(BindError::mismatch(format!(
                "member of '{}' is read-only",
                slf.type_name()
            )));
        }
        let base = resolve::<T>(slf, Access::Exclusive)?;
        let value = extract::<M>(py, value)?;
        unsafe { *self.field(base).as_mut() = value };
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

pub struct MemberEntry {
    name: String,
    accessor: Box<dyn MemberAccessor>,
}

impl MemberEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accessor(&self) -> &dyn MemberAccessor {
        self.accessor.as_ref()
    }
}

/// Side table shared by a type and its reference shadows: member accessors
/// by offset, instance and static methods by name hash, and constructors.
pub struct TypeContext {
    name: String,
    type_hash: TypeHash,
    members: BTreeMap<usize, MemberEntry>,
    methods: FunctionTable,
    statics: FunctionTable,
    constructors: OverloadSet,
}

impl TypeContext {
    pub fn new(name: impl Into<String>, type_hash: TypeHash) -> Self {
        let name = name.into();
        Self {
            constructors: OverloadSet::new(name.clone()),
            name,
            type_hash,
            members: BTreeMap::new(),
            methods: FunctionTable::default(),
            statics: FunctionTable::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }

    pub fn add_member(
        &mut self,
        offset: usize,
        name: impl Into<String>,
        accessor: Box<dyn MemberAccessor>,
    ) -> BindResult<()> {
        let name = name.into();
        if let Some(existing) = self.members.get(&offset) {
            return Err(BindError::duplicate(format!(
                "{}: offset {offset} is already bound to member '{}'",
                self.name, existing.name
            )));
        }
        if self.members.values().any(|entry| entry.name == name) {
            return Err(BindError::duplicate(format!(
                "{}: member '{name}' is already declared",
                self.name
            )));
        }
        self.members.insert(offset, MemberEntry { name, accessor });
        Ok(())
    }

    pub fn get_accessor(&self, offset: usize) -> BindResult<&dyn MemberAccessor> {
        self.members
            .get(&offset)
            .map(MemberEntry::accessor)
            .ok_or_else(|| {
                BindError::lookup(format!("{}: no member at offset {offset}", self.name))
            })
    }

    pub fn members(&self) -> impl Iterator<Item = (usize, &MemberEntry)> {
        self.members.iter().map(|(offset, entry)| (*offset, entry))
    }

    pub fn method(&self, hash: u64) -> BindResult<&OverloadSet> {
        self.methods.get(hash)
    }

    pub fn static_method(&self, hash: u64) -> BindResult<&OverloadSet> {
        self.statics.get(hash)
    }

    pub fn methods(&self) -> &FunctionTable {
        &self.methods
    }

    pub fn statics(&self) -> &FunctionTable {
        &self.statics
    }

    pub fn constructors(&self) -> &OverloadSet {
        &self.constructors
    }

    pub(crate) fn methods_mut(&mut self) -> &mut FunctionTable {
        &mut self.methods
    }

    pub(crate) fn statics_mut(&mut self) -> &mut FunctionTable {
        &mut self.statics
    }

    pub(crate) fn constructors_mut(&mut self) -> &mut OverloadSet {
        &mut self.constructors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::none;

    fn constant(signature: u64) -> Overload {
        Overload::new(
            signature,
            format!("sig{signature}"),
            Box::new(|py, _args| Ok(none(py))),
        )
    }

    fn rejecting(signature: u64) -> Overload {
        Overload::new(
            signature,
            format!("sig{signature}"),
            Box::new(|_py, _args| {
                Err(DispatchFailure::Mismatch(BindError::mismatch("rejected")))
            }),
        )
    }

    struct Dummy;

    #[test]
    fn test_duplicate_member_offset_keeps_first() {
        let mut ctx = TypeContext::new("Dummy", TypeHash::of::<Dummy>());
        let first = unsafe { FieldAccessor::<u32, u32>::new(0, false) };
        let second = unsafe { FieldAccessor::<u32, u32>::new(0, true) };
        ctx.add_member(0, "a", Box::new(first)).unwrap();
        let err = ctx.add_member(0, "b", Box::new(second)).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
        assert!(!ctx.get_accessor(0).unwrap().is_readonly());
        assert_eq!(ctx.members().count(), 1);
    }

    #[test]
    fn test_missing_accessor_is_lookup_failure() {
        let ctx = TypeContext::new("Dummy", TypeHash::of::<Dummy>());
        assert!(matches!(
            ctx.get_accessor(8),
            Err(BindError::LookupFailure(_))
        ));
    }

    #[test]
    fn test_same_signature_twice_is_duplicate() {
        let mut table = FunctionTable::default();
        assert!(table.insert("f", constant(1)).unwrap());
        assert!(!table.insert("f", constant(2)).unwrap());
        let err = table.insert("f", constant(1)).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
        assert_eq!(table.get(name_hash("f")).unwrap().len(), 2);
    }

    #[test]
    fn test_names_keep_declaration_order() {
        let mut table = FunctionTable::default();
        table.insert("zeta", constant(1)).unwrap();
        table.insert("alpha", constant(1)).unwrap();
        table.insert("zeta", constant(2)).unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_dispatch_tries_candidates_in_order() {
        crate::gil::with_gil(|py| {
            let mut set = OverloadSet::new("f");
            set.add(rejecting(1)).unwrap();
            set.add(constant(2)).unwrap();
            assert!(set.dispatch(py, &[]).is_ok());

            let mut only_rejects = OverloadSet::new("g");
            only_rejects.add(rejecting(1)).unwrap();
            only_rejects.add(rejecting(2)).unwrap();
            let err = only_rejects.dispatch(py, &[]).unwrap_err();
            assert!(err.message().contains("candidates: sig1 | sig2"));
        });
    }
}

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::abi::{Borrowed, ObjRef, dict_set_item, module_add_object, new_dict, new_int, new_module};
use crate::builder::TypeBuilder;
use crate::context::FunctionTable;
use crate::descriptor::{TypeDescriptor, cstring};
use crate::dispatch::{ArgList, CallTarget, NativeFn, callable_object, function_overload};
use crate::error::{BindError, BindResult};
use crate::gil::{GilGuard, PyToken};
use crate::marshal::IntoWire;
use crate::metaclass::new_enum_type;
use crate::primitives;

type VariableInit = Box<dyn FnOnce(&PyToken<'_>) -> BindResult<ObjRef>>;

struct PendingEnum {
    name: String,
    members: Vec<(String, i64)>,
}

/// Collects the types, functions, variables and enumerations of one module
/// and emits them into a runtime module object, exactly once.
pub struct ModuleBuilder {
    name: String,
    doc: Option<String>,
    names: HashSet<String>,
    types: Vec<(String, TypeDescriptor)>,
    functions: FunctionTable,
    variables: Vec<(String, VariableInit)>,
    enums: Vec<PendingEnum>,
    finalized: bool,
    module: Option<ObjRef>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            names: HashSet::new(),
            types: Vec::new(),
            functions: FunctionTable::default(),
            variables: Vec::new(),
            enums: Vec::new(),
            finalized: false,
            module: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The emitted module, once finalized.
    pub fn module(&self) -> Option<Borrowed<'_>> {
        self.module.as_ref().map(ObjRef::borrow)
    }

    fn check_building(&self, what: &str) -> BindResult<()> {
        if self.is_finalized() {
            return Err(BindError::FinalizationMisuse(format!(
                "cannot add {what} to module '{}' after finalize",
                self.name
            )));
        }
        Ok(())
    }

    fn claim(&mut self, name: &str) -> BindResult<()> {
        cstring(name)?;
        if !self.names.insert(name.to_owned()) {
            return Err(BindError::duplicate(format!(
                "module '{}' already defines '{name}'",
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

    /// Starts a type builder whose finalized type lands in this module.
    pub fn class<T: 'static>(&mut self, name: &str) -> BindResult<TypeBuilder<'_, T>> {
        self.check_building("a type")?;
        {
            let guard = GilGuard::new();
            primitives::ensure_registered(&guard.token())?;
        }
        self.claim(name)?;
        Ok(TypeBuilder::with_module(name.to_owned(), Some(self)))
    }

    /// Adds a type finalized elsewhere.
    pub fn add_type(&mut self, name: &str, descriptor: TypeDescriptor) -> BindResult<&mut Self> {
        self.check_building("a type")?;
        self.claim(name)?;
        self.types.push((name.to_owned(), descriptor));
        Ok(self)
    }

    /// Called by a type builder created through [`class`](Self::class); the
    /// name is already claimed.
    pub(crate) fn attach_type(&mut self, name: &str, descriptor: TypeDescriptor) -> BindResult<()> {
        self.check_building("a type")?;
        self.types.push((name.to_owned(), descriptor));
        Ok(())
    }

    /// Adds a free function. Repeating a name adds an overload when the
    /// signature differs.
    pub fn add_function<Args, R, F>(&mut self, name: &str, f: F) -> BindResult<&mut Self>
    where
        Args: ArgList,
        R: IntoWire + 'static,
        F: NativeFn<Args, R>,
    {
        self.check_building("a function")?;
        if !self.functions.contains_name(name) {
            self.claim(name)?;
        }
        self.functions.insert(name, function_overload(f))?;
        Ok(self)
    }

    /// Adds a module attribute; `init` runs when the module is finalized.
    pub fn add_variable<V, I>(&mut self, name: &str, init: I) -> BindResult<&mut Self>
    where
        V: IntoWire + 'static,
        I: FnOnce() -> V + 'static,
    {
        self.check_building("a variable")?;
        self.claim(name)?;
        let init: VariableInit = Box::new(move |py: &PyToken<'_>| init().into_wire(py));
        self.variables.push((name.to_owned(), init));
        Ok(self)
    }

    pub fn add_enum<S, I>(&mut self, name: &str, members: I) -> BindResult<&mut Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, i64)>,
    {
        self.check_building("an enum")?;
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (member, value) in members {
            let member = member.into();
            if !seen.insert(member.clone()) {
                return Err(BindError::duplicate(format!(
                    "enum '{name}' repeats member '{member}'"
                )));
            }
            entries.push((member, value));
        }
        self.claim(name)?;
        self.enums.push(PendingEnum {
            name: name.to_owned(),
            members: entries,
        });
        Ok(self)
    }

    /// Emits functions, then types, then variables, then enums into a new
    /// module object. A failed finalize is not retried.
    pub fn finalize(&mut self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        self.check_building("finalize")?;
        self.finalized = true;
        primitives::ensure_registered(py)?;
        let module = new_module(py, &self.name, self.doc.as_deref())?;
        let target = module.borrow();

        let functions = Arc::new(std::mem::take(&mut self.functions));
        for name in functions.names() {
            let function = callable_object(py, name, CallTarget::Free(functions.clone()))?;
            module_add_object(py, target, name, function)?;
        }
        for (name, descriptor) in &self.types {
            module_add_object(py, target, name, descriptor.value_type().to_owned())?;
        }
        for (name, init) in self.variables.drain(..) {
            let value = init(py)?;
            module_add_object(py, target, &name, value)?;
        }
        for pending in &self.enums {
            let members = new_dict(py);
            for (member, value) in &pending.members {
                dict_set_item(py, members.borrow(), member, new_int(py, i128::from(*value)))?;
            }
            let ty = new_enum_type(py, &pending.name, members.borrow())?;
            module_add_object(py, target, &pending.name, ty)?;
        }

        debug!(
            module = %self.name,
            functions = functions.len(),
            types = self.types.len(),
            enums = self.enums.len(),
            "finalized module"
        );
        self.module = Some(module.clone());
        Ok(module)
    }
}

impl fmt::Debug for ModuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBuilder")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("types", &self.types.len())
            .field("variables", &self.variables.len())
            .field("enums", &self.enums.len())
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{dict_keys, getattr, int_value, module_dict, str_value};
    use crate::gil::with_gil;

    #[test]
    fn test_emission_order_and_values() {
        let mut module = ModuleBuilder::new("ordering");
        module.doc("emission order").unwrap();
        module.add_enum("Color", [("RED", 1), ("GREEN", 2)]).unwrap();
        module.add_variable("answer", || 42i64).unwrap();
        module.add_function("twice", |x: i64| x * 2).unwrap();
        with_gil(|py| {
            let obj = module.finalize(py).unwrap();
            let keys = dict_keys(module_dict(obj.borrow()).unwrap());
            assert_eq!(keys, ["__name__", "__doc__", "twice", "answer", "Color"]);
            let answer = getattr(py, obj.borrow(), "answer").unwrap();
            assert_eq!(int_value(answer.borrow()), Some(42));
            let color = getattr(py, obj.borrow(), "Color").unwrap();
            let green = getattr(py, color.borrow(), "GREEN").unwrap();
            assert_eq!(int_value(green.borrow()), Some(2));
            let doc = getattr(py, obj.borrow(), "__doc__").unwrap();
            assert_eq!(str_value(doc.borrow()), Some("emission order"));
        });
    }

    #[test]
    fn test_name_collisions_are_rejected() {
        let mut module = ModuleBuilder::new("collide");
        module.add_variable("shared", || 1i64).unwrap();
        let err = module.add_function("shared", |x: i64| x).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
        let err = module.add_enum("shared", [("A", 0)]).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
        let err = module.add_enum("Dup", [("A", 0), ("A", 1)]).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_function_overloads_share_a_name() {
        let mut module = ModuleBuilder::new("overloads");
        module.add_function("pick", |x: i64| x).unwrap();
        module.add_function("pick", |s: String| s).unwrap();
        let err = module.add_function("pick", |y: i64| y + 1).unwrap_err();
        assert!(matches!(err, BindError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_finalize_runs_once() {
        let mut module = ModuleBuilder::new("once");
        with_gil(|py| {
            module.finalize(py).unwrap();
            assert!(module.is_finalized());
            assert!(matches!(
                module.finalize(py),
                Err(BindError::FinalizationMisuse(_))
            ));
        });
        assert!(matches!(
            module.add_variable("late", || 0i64),
            Err(BindError::FinalizationMisuse(_))
        ));
    }
}

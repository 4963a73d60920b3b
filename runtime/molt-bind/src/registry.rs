use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::descriptor::TypeDescriptor;
use crate::error::{BindError, BindResult};

/// Stable identity of a native type within the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHash(pub u64);

impl TypeHash {
    pub fn of<T: ?Sized + 'static>() -> Self {
        let mut hasher = DefaultHasher::new();
        TypeId::of::<T>().hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// FNV-1a over the UTF-8 bytes of a function name. `const` so method
/// thunks can be instantiated per name.
pub const fn name_hash(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let bytes = name.as_bytes();
    let mut hash = OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(PRIME);
        i += 1;
    }
    hash
}

/// Hash of a signature, from the Rust names of its parameter types.
pub fn signature_hash<Args: 'static>() -> u64 {
    let mut hasher = DefaultHasher::new();
    type_name::<Args>().hash(&mut hasher);
    TypeId::of::<Args>().hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<TypeHash, TypeDescriptor>,
}

impl TypeRegistry {
    /// Inserts `descriptor`. With `force == false` an existing entry wins and
    /// the call fails; with `force == true` the entry is replaced and the old
    /// descriptor is handed back.
    pub fn register(
        &mut self,
        hash: TypeHash,
        descriptor: TypeDescriptor,
        force: bool,
    ) -> BindResult<Option<TypeDescriptor>> {
        match self.entries.entry(hash) {
            Entry::Occupied(mut slot) => {
                if !force {
                    return Err(BindError::duplicate(format!(
                        "type '{}' ({hash}) is already registered as '{}'",
                        descriptor.name(),
                        slot.get().name()
                    )));
                }
                Ok(Some(slot.insert(descriptor)))
            }
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                Ok(None)
            }
        }
    }

    pub fn lookup(&self, hash: TypeHash) -> BindResult<TypeDescriptor> {
        self.entries
            .get(&hash)
            .cloned()
            .ok_or_else(|| BindError::lookup(format!("no type registered for {hash}")))
    }

    pub fn contains(&self, hash: TypeHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn unregister(&mut self, hash: TypeHash) -> Option<TypeDescriptor> {
        self.entries.remove(&hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static REGISTRY: Lazy<RwLock<TypeRegistry>> = Lazy::new(|| RwLock::new(TypeRegistry::default()));

pub fn register(hash: TypeHash, descriptor: TypeDescriptor, force: bool) -> BindResult<()> {
    let name = descriptor.name().to_owned();
    let replaced = REGISTRY.write().register(hash, descriptor, force)?;
    debug!(type_name = %name, %hash, replaced = replaced.is_some(), "registered native type");
    // The replaced descriptor releases its type objects after the lock is gone.
    drop(replaced);
    Ok(())
}

pub fn lookup(hash: TypeHash) -> BindResult<TypeDescriptor> {
    REGISTRY.read().lookup(hash)
}

pub fn lookup_type<T: 'static>() -> BindResult<TypeDescriptor> {
    lookup(TypeHash::of::<T>()).map_err(|_| {
        BindError::lookup(format!(
            "native type {} has not been registered",
            type_name::<T>()
        ))
    })
}

pub fn contains(hash: TypeHash) -> bool {
    REGISTRY.read().contains(hash)
}

pub fn unregister(hash: TypeHash) -> Option<TypeDescriptor> {
    let removed = REGISTRY.write().unregister(hash);
    if let Some(descriptor) = &removed {
        debug!(type_name = %descriptor.name(), %hash, "unregistered native type");
    }
    removed
}

pub fn len() -> usize {
    REGISTRY.read().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_is_fnv1a() {
        assert_eq!(name_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(name_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(name_hash("inc"), name_hash("dec"));
        const AT_COMPILE_TIME: u64 = name_hash("inc");
        assert_eq!(AT_COMPILE_TIME, name_hash("inc"));
    }

    #[test]
    fn test_type_hash_distinguishes_types() {
        assert_eq!(TypeHash::of::<u32>(), TypeHash::of::<u32>());
        assert_ne!(TypeHash::of::<u32>(), TypeHash::of::<i32>());
        assert_ne!(TypeHash::of::<&'static u32>(), TypeHash::of::<u32>());
    }

    #[test]
    fn test_signature_hash_distinguishes_arity_and_types() {
        assert_ne!(signature_hash::<(i32,)>(), signature_hash::<(i32, i32)>());
        assert_ne!(signature_hash::<(i32,)>(), signature_hash::<(f64,)>());
        assert_eq!(signature_hash::<(String,)>(), signature_hash::<(String,)>());
    }

    #[test]
    fn test_lookup_of_unknown_type_fails() {
        struct NeverRegistered;
        let err = lookup_type::<NeverRegistered>().unwrap_err();
        assert!(matches!(err, BindError::LookupFailure(_)));
    }
}

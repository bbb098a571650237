use std::any::TypeId;
use std::collections::HashMap;
use std::sync::RwLock;

use log::trace;

use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelPtr};

type Constructor = fn() -> KernelPtr;

struct KernelType {
    id: u16,
    index: TypeId,
    name: &'static str,
    construct: Constructor,
}

/// Maps stable user-chosen `u16` ids to kernel constructors and back.
/// Registration is idempotent for an identical `(type, id)` pair;
/// conflicting pairs are configuration errors. Lookups take the read side
/// of the lock, so concurrent deserialization never contends.
pub struct TypeRegistry {
    types: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<u16, usize>,
    by_index: HashMap<TypeId, usize>,
    all: Vec<KernelType>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            types: RwLock::new(Inner::default()),
        }
    }

    /// Register kernel type `T` under `id`.
    pub fn register<T>(&self, id: u16) -> Result<()>
    where
        T: Kernel + Default,
    {
        self.register_with(id, std::any::type_name::<T>(), TypeId::of::<T>(), || {
            Box::new(T::default())
        })
    }

    fn register_with(
        &self,
        id: u16,
        name: &'static str,
        index: TypeId,
        construct: Constructor,
    ) -> Result<()> {
        let mut inner = self.types.write().unwrap();
        match (inner.by_id.get(&id), inner.by_index.get(&index)) {
            (Some(&a), Some(&b)) if a == b => return Ok(()),
            (Some(&a), _) => {
                return Err(Error::TypeRegistry(format!(
                    "id {} is already taken by {}",
                    id, inner.all[a].name
                )));
            }
            (_, Some(&b)) => {
                return Err(Error::TypeRegistry(format!(
                    "{} is already registered with id {}",
                    name, inner.all[b].id
                )));
            }
            (None, None) => {}
        }
        trace!("reg: add type {} id {}", name, id);
        let slot = inner.all.len();
        inner.all.push(KernelType {
            id,
            index,
            name,
            construct,
        });
        inner.by_id.insert(id, slot);
        inner.by_index.insert(index, slot);
        Ok(())
    }

    pub fn find_id(&self, index: TypeId) -> Option<u16> {
        let inner = self.types.read().unwrap();
        inner.by_index.get(&index).map(|&slot| inner.all[slot].id)
    }

    pub fn construct(&self, id: u16) -> Option<KernelPtr> {
        let inner = self.types.read().unwrap();
        inner
            .by_id
            .get(&id)
            .map(|&slot| (inner.all[slot].construct)())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.types.read().unwrap().by_id.contains_key(&id)
    }
}

impl Default for TypeRegistry {
    fn default() -> TypeRegistry {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBase;

    #[derive(Default)]
    struct A {
        base: KernelBase,
    }

    #[derive(Default)]
    struct B {
        base: KernelBase,
    }

    impl Kernel for A {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
    }

    impl Kernel for B {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
    }

    #[test]
    fn registration_laws() {
        let reg = TypeRegistry::new();
        reg.register::<A>(10).unwrap();
        // Same (type, id) pair is a no-op.
        reg.register::<A>(10).unwrap();
        // Same id, different type.
        assert!(reg.register::<B>(10).is_err());
        // Same type, different id.
        assert!(reg.register::<A>(11).is_err());
        reg.register::<B>(11).unwrap();
    }

    #[test]
    fn construct_by_id() {
        let reg = TypeRegistry::new();
        reg.register::<A>(3).unwrap();
        let k = reg.construct(3).unwrap();
        assert!(k.is::<A>());
        assert!(reg.construct(4).is_none());
        assert_eq!(reg.find_id(std::any::TypeId::of::<A>()), Some(3));
        assert_eq!(reg.find_id(std::any::TypeId::of::<B>()), None);
    }
}

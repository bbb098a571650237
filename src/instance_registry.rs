use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::kernel::KernelPtr;

/// The arena of suspended kernels. A kernel that spawned subordinates (or
/// declared itself resident) is parked here under its id; deliveries take
/// the kernel out, run `react`, and either park it again or let it move on.
/// Ids are authoritative throughout the runtime, so this map is the only
/// place a suspended kernel is owned.
///
/// A take that misses means the principal is gone or momentarily checked
/// out by another delivery; callers translate that into
/// `ExitCode::NoPrincipalFound` and bounce, they do not wait.
pub struct InstanceRegistry {
    instances: Mutex<HashMap<u64, KernelPtr>>,
}

impl InstanceRegistry {
    pub fn new() -> InstanceRegistry {
        InstanceRegistry {
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn park(&self, k: KernelPtr) {
        let id = k.base().id();
        debug_assert!(id != 0, "cannot park a kernel without an id");
        let mut map = self.instances.lock().unwrap();
        if map.insert(id, k).is_some() {
            debug!("instances: replaced kernel {}", id);
        }
    }

    pub fn take(&self, id: u64) -> Option<KernelPtr> {
        self.instances.lock().unwrap().remove(&id)
    }

    /// Run `f` against a parked kernel without taking it out, e.g. to
    /// serialize a carried parent that stays suspended here.
    pub fn with<R>(&self, id: u64, f: impl FnOnce(&dyn crate::kernel::Kernel) -> R) -> Option<R> {
        let map = self.instances.lock().unwrap();
        map.get(&id).map(|k| f(&**k))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.instances.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every parked kernel into `sack` for release after the
    /// pipelines have joined.
    pub fn clear(&self, sack: &mut Vec<KernelPtr>) {
        let mut map = self.instances.lock().unwrap();
        sack.extend(map.drain().map(|(_, k)| k));
    }
}

impl Default for InstanceRegistry {
    fn default() -> InstanceRegistry {
        InstanceRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelBase};

    #[derive(Default)]
    struct Plain {
        base: KernelBase,
    }

    impl Kernel for Plain {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
    }

    #[test]
    fn park_take_round_trip() {
        let reg = InstanceRegistry::new();
        let mut k = Box::new(Plain::default());
        k.base_mut().set_id(9);
        reg.park(k);
        assert!(reg.contains(9));
        let k = reg.take(9).unwrap();
        assert_eq!(k.base().id(), 9);
        assert!(reg.take(9).is_none());
    }

    #[test]
    fn clear_drains_to_sack() {
        let reg = InstanceRegistry::new();
        for id in 1..=3u64 {
            let mut k = Box::new(Plain::default());
            k.base_mut().set_id(id);
            reg.park(k);
        }
        let mut sack = Vec::new();
        reg.clear(&mut sack);
        assert_eq!(sack.len(), 3);
        assert!(reg.is_empty());
    }
}

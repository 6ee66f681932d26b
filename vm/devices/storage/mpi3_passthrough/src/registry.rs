// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lookup of adapters by the id management applications address them with.

use crate::backing::ControllerBacking;
use crate::Adapter;
use crate::PassthroughError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The adapters managed by one driver instance.
pub struct AdapterRegistry<T: ControllerBacking> {
    adapters: RwLock<BTreeMap<u32, Arc<Adapter<T>>>>,
}

impl<T: ControllerBacking> std::fmt::Debug for AdapterRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.adapters.read().keys())
            .finish()
    }
}

impl<T: ControllerBacking> Default for AdapterRegistry<T> {
    fn default() -> Self {
        Self {
            adapters: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: ControllerBacking> AdapterRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `adapter`, replacing any adapter with the same id.
    pub fn insert(&self, adapter: Arc<Adapter<T>>) -> Option<Arc<Adapter<T>>> {
        let id = adapter.id();
        let old = self.adapters.write().insert(id, adapter);
        if old.is_some() {
            tracing::warn!(adapter = id, "replaced registered adapter");
        }
        old
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Adapter<T>>> {
        self.adapters.write().remove(&id)
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<Adapter<T>>> {
        self.adapters.read().get(&id).cloned()
    }

    /// Like [`Self::lookup`], failing with [`PassthroughError::NoDevice`].
    pub fn adapter(&self, id: u32) -> Result<Arc<Adapter<T>>, PassthroughError> {
        self.lookup(id).ok_or(PassthroughError::NoDevice(id))
    }

    pub fn ids(&self) -> Vec<u32> {
        self.adapters.read().keys().copied().collect()
    }
}

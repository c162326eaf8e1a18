//! Query-time index from referenced objects back to the records pointing at them.
//!
//! Extractors are registered once at startup and evaluated against the
//! controller's reflector store on every lookup, so the index is rebuilt for
//! free whenever the watch replays.

use kube::{
    Resource, ResourceExt,
    runtime::reflector::{ObjectRef, Store},
};
use std::{collections::HashMap, sync::Arc};

/// Extracts the `namespace/name` keys a record refers to
pub type Extractor<K> = fn(&K) -> Vec<String>;

pub fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// `namespace/name` key of a watched object
pub fn key_of<R: Resource>(obj: &R) -> String {
    key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

pub struct ReferenceIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    extractors: Arc<HashMap<&'static str, Extractor<K>>>,
}

impl<K> Clone for ReferenceIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            extractors: self.extractors.clone(),
        }
    }
}

impl<K> ReferenceIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self {
        Self {
            store,
            extractors: Arc::new(HashMap::new()),
        }
    }

    /// Register an extractor under `name`. Only valid before the index is shared.
    pub fn with_index(mut self, name: &'static str, extractor: Extractor<K>) -> Self {
        Arc::make_mut(&mut self.extractors).insert(name, extractor);
        self
    }

    /// Every record whose `name` extractor yields `key`
    pub fn lookup(&self, name: &str, key: &str) -> Vec<ObjectRef<K>> {
        let Some(extractor) = self.extractors.get(name) else {
            return vec![];
        };

        self.store
            .state()
            .iter()
            .filter(|obj| extractor(obj.as_ref()).iter().any(|k| k == key))
            .map(|obj| ObjectRef::from_obj(obj.as_ref()))
            .collect()
    }
}

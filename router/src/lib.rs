//! # pathtrie-router
//!
//! Method-keyed routing layer over [`pathtrie`]: one matching engine per
//! HTTP/event method, a capture assembler for name -> value access, and a
//! lock-guarded shared router for embedders that register routes while
//! serving.
//!
//! ## Example
//!
//! ```rust
//! use pathtrie_router::Router;
//!
//! let mut router: Router<&str> = Router::new();
//! router.insert("GET", "/api/users/{id}", "get_user").unwrap();
//! router.insert("POST", "/api/users", "create_user").unwrap();
//!
//! let m = router.route("GET", "/api/users/42").unwrap();
//! assert_eq!(m.value, &"get_user");
//! assert_eq!(m.params, vec![("id", "42")]);
//! assert!(router.route("DELETE", "/api/users/42").is_none());
//! ```

#![warn(clippy::all)]

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

pub use pathtrie::{
    BatchError, Config, Match, MatchResult, PathTrie, Result, TemplateErrorKind, TrieError,
};

// =============================================================================
// Router
// =============================================================================

/// A method-keyed engine map.
///
/// Methods are arbitrary strings (HTTP verbs, event-bus topics); each gets
/// its own [`PathTrie`], created lazily from one shared [`Config`]. Insert,
/// search, and delete are delegated verbatim to the method's engine.
#[derive(Debug)]
pub struct Router<V> {
    config: Config,
    frozen: bool,
    engines: FxHashMap<Box<str>, PathTrie<V>>,
}

impl<V> Router<V> {
    pub fn new() -> Self {
        Self::with_config(Config::default()).expect("default config is valid")
    }

    pub fn with_config(config: Config) -> Result<Self> {
        // Validate once so lazy per-method engine creation cannot fail.
        config.validate()?;
        Ok(Self {
            config,
            frozen: false,
            engines: FxHashMap::default(),
        })
    }

    /// Register a template under a method.
    pub fn insert(&mut self, method: &str, template: &str, value: V) -> Result<()> {
        if self.frozen {
            return Err(TrieError::Frozen);
        }
        if !self.engines.contains_key(method) {
            let engine =
                PathTrie::with_config(self.config.clone()).expect("validated at construction");
            self.engines.insert(method.into(), engine);
            debug!(method, "engine created");
        }
        let engine = self.engines.get_mut(method).expect("just ensured");
        engine.insert(template, value)
    }

    /// Remove a template from a method's engine. Unknown methods and absent
    /// templates are a no-op.
    pub fn delete(&mut self, method: &str, template: &str) -> Result<Option<V>> {
        match self.engines.get_mut(method) {
            Some(engine) => engine.delete(template),
            None => Ok(None),
        }
    }

    /// Zero-allocation search against the method's engine. `caps` must hold
    /// at least [`Self::required_caps`] slots.
    pub fn search(&self, method: &str, path: &[u8], caps: &mut [u32], out: &mut MatchResult) -> bool {
        match self.engines.get(method) {
            Some(engine) => engine.search(path, caps, out),
            None => {
                *out = MatchResult::default();
                false
            }
        }
    }

    /// Allocating convenience lookup: payload plus assembled params.
    pub fn route<'r, 'p>(&'r self, method: &str, path: &'p str) -> Option<Match<'r, 'p, V>> {
        self.engines.get(method)?.find(path)
    }

    /// The engine backing a method, if any template was registered for it.
    pub fn engine(&self, method: &str) -> Option<&PathTrie<V>> {
        self.engines.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(|k| k.as_ref())
    }

    /// Capture-buffer length sufficient for every method's engine.
    pub fn required_caps(&self) -> usize {
        self.engines
            .values()
            .map(PathTrie::required_caps)
            .max()
            .unwrap_or(0)
    }

    /// Live templates across all methods.
    pub fn len(&self) -> usize {
        self.engines.values().map(PathTrie::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.engines.values().map(PathTrie::memory_usage).sum()
    }

    /// Finalize every engine; see [`PathTrie::finalize`]. Freezing also stops
    /// new methods from being registered.
    pub fn finalize_all(&mut self, freeze: bool, drop_intern_map: bool) {
        for engine in self.engines.values_mut() {
            engine.finalize(freeze, drop_intern_map);
        }
        if freeze {
            self.frozen = true;
        }
        debug!(freeze, drop_intern_map, "router finalized");
    }
}

impl<V> Default for Router<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Capture assembler
// =============================================================================

/// Name -> substring view assembled from a raw [`PathTrie::search`] result.
///
/// Off the hot path by design: the zero-allocation contract belongs to
/// `search` itself, while handlers that want named access pay one small
/// allocation here.
#[derive(Debug)]
pub struct Params<'t, 'p> {
    pairs: Vec<(&'t str, &'p str)>,
}

impl<'t, 'p> Params<'t, 'p> {
    pub fn from_search<V>(
        engine: &'t PathTrie<V>,
        path: &'p str,
        caps: &[u32],
        out: &MatchResult,
    ) -> Self {
        debug_assert!(out.found);
        let keys = engine.param_keys(out.node_index);
        debug_assert_eq!(keys.len(), out.param_count as usize);
        let pairs = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| {
                let s = caps[2 * i] as usize;
                let e = caps[2 * i + 1] as usize;
                (key, &path[s..e])
            })
            .collect();
        Self { pairs }
    }

    /// Value captured under `name`, if the matched template declared it.
    pub fn get(&self, name: &str) -> Option<&'p str> {
        self.pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    /// Pairs in template declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'t str, &'p str)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// =============================================================================
// SharedRouter
// =============================================================================

/// A route match with owned captures, for results that must outlive the
/// shared router's read guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRoute<V> {
    pub value: V,
    pub params: Vec<(String, String)>,
    pub wildcard: Option<String>,
}

/// An `RwLock`-guarded [`Router`] for embedders that keep registering routes
/// while serving lookups from other threads.
///
/// Once the route table stops changing, [`Self::freeze`] converts it into an
/// `Arc<Router<V>>` whose readers need no lock at all.
pub struct SharedRouter<V> {
    inner: RwLock<Router<V>>,
}

impl<V: Clone> SharedRouter<V> {
    pub fn new() -> Self {
        Self::with_config(Config::default()).expect("default config is valid")
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Router::with_config(config)?),
        })
    }

    pub fn insert(&self, method: &str, template: &str, value: V) -> Result<()> {
        self.inner.write().insert(method, template, value)
    }

    pub fn delete(&self, method: &str, template: &str) -> Result<Option<V>> {
        self.inner.write().delete(method, template)
    }

    /// Lookup under the read lock, cloning the payload and captures out.
    pub fn route(&self, method: &str, path: &str) -> Option<OwnedRoute<V>> {
        let guard = self.inner.read();
        let m = guard.route(method, path)?;
        Some(OwnedRoute {
            value: m.value.clone(),
            params: m
                .params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            wildcard: m.wildcard.map(str::to_owned),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Freeze every engine and shed the lock. The returned router is
    /// immutable and shareable across any number of reader threads.
    pub fn freeze(self, drop_intern_map: bool) -> Arc<Router<V>> {
        let mut router = self.inner.into_inner();
        router.finalize_all(true, drop_intern_map);
        Arc::new(router)
    }
}

impl<V: Clone> Default for SharedRouter<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

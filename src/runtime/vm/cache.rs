//! Inline caches for call sites
//!
//! Each call site is keyed by (chunk id, offset) and moves through the
//! states Uninitialized -> Monomorphic -> Polymorphic -> Megamorphic, in
//! that direction only. Targets are compared by heap identity. A site that
//! resolved its callee through a global binding is invalidated back to
//! Uninitialized when that global is rebound, so callers never see a stale
//! target.

use crate::runtime::Value;
use rustc_hash::FxHashMap;

/// Maximum distinct targets a polymorphic site tracks
pub const POLYMORPHIC_BOUND: usize = 4;

/// A cached callee; the value keeps the target alive so the identity
/// pointer stays valid
#[derive(Debug, Clone)]
pub struct CacheTarget {
    pub identity: usize,
    pub value: Value,
}

/// Call-site cache state
#[derive(Debug, Clone, Default)]
pub enum CacheState {
    #[default]
    Uninitialized,
    Monomorphic(CacheTarget),
    Polymorphic(Vec<CacheTarget>),
    Megamorphic,
}

impl CacheState {
    /// Short name for stats output
    pub fn name(&self) -> &'static str {
        match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Monomorphic(_) => "monomorphic",
            CacheState::Polymorphic(_) => "polymorphic",
            CacheState::Megamorphic => "megamorphic",
        }
    }
}

/// One call site's cache entry
#[derive(Debug, Clone, Default)]
pub struct CallSiteCache {
    pub state: CacheState,
    pub hits: u64,
    /// Global binding the callee was resolved through, when known
    pub global: Option<String>,
}

/// Per-VM inline cache table
#[derive(Debug, Default)]
pub struct InlineCaches {
    poly_bound: usize,
    entries: FxHashMap<(u64, usize), CallSiteCache>,
    /// Reverse index: global name -> sites resolved through it
    by_global: FxHashMap<String, Vec<(u64, usize)>>,
}

impl InlineCaches {
    /// Create a cache table with the given polymorphic bound
    pub fn new(poly_bound: usize) -> Self {
        Self {
            poly_bound,
            ..Self::default()
        }
    }

    /// Record an observed callee at a call site. `global` names the binding
    /// the callee was loaded from, when there was one.
    pub fn record(&mut self, site: (u64, usize), callee: &Value, global: Option<&str>) {
        let Some(identity) = callee.identity() else {
            return;
        };
        let entry = self.entries.entry(site).or_default();
        entry.hits += 1;

        match &mut entry.state {
            CacheState::Uninitialized => {
                entry.state = CacheState::Monomorphic(CacheTarget {
                    identity,
                    value: callee.clone(),
                });
                if let Some(name) = global {
                    entry.global = Some(name.to_string());
                    self.by_global.entry(name.to_string()).or_default().push(site);
                }
            }
            CacheState::Monomorphic(target) => {
                if target.identity != identity {
                    let targets = vec![
                        target.clone(),
                        CacheTarget {
                            identity,
                            value: callee.clone(),
                        },
                    ];
                    entry.state = CacheState::Polymorphic(targets);
                }
            }
            CacheState::Polymorphic(targets) => {
                if !targets.iter().any(|t| t.identity == identity) {
                    if targets.len() >= self.poly_bound {
                        entry.state = CacheState::Megamorphic;
                    } else {
                        targets.push(CacheTarget {
                            identity,
                            value: callee.clone(),
                        });
                    }
                }
            }
            CacheState::Megamorphic => {}
        }
    }

    /// The cache entry for a site, if one exists
    pub fn lookup(&self, site: (u64, usize)) -> Option<&CallSiteCache> {
        self.entries.get(&site)
    }

    /// The single cached target of a monomorphic site
    pub fn monomorphic_target(&self, site: (u64, usize)) -> Option<&CacheTarget> {
        match self.entries.get(&site).map(|e| &e.state) {
            Some(CacheState::Monomorphic(target)) => Some(target),
            _ => None,
        }
    }

    /// Reset every site that resolved through `name` to Uninitialized
    pub fn invalidate_global(&mut self, name: &str) {
        let Some(sites) = self.by_global.remove(name) else {
            return;
        };
        for site in sites {
            if let Some(entry) = self.entries.get_mut(&site) {
                entry.state = CacheState::Uninitialized;
            }
        }
    }

    /// Number of sites tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no sites are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::expr::BinaryKind;

/// Index of a uniqued expression node within its [Context].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ExprId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct MapId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SetId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ExprNode {
    Dim(usize),
    Symbol(usize),
    Constant(i64),
    Binary(BinaryKind, ExprId, ExprId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MapStorage {
    pub(crate) num_dims: usize,
    pub(crate) num_symbols: usize,
    pub(crate) results: Arc<[ExprId]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SetStorage {
    pub(crate) num_dims: usize,
    pub(crate) num_symbols: usize,
    pub(crate) constraints: Arc<[ExprId]>,
    pub(crate) eq_flags: Arc<[bool]>,
}

/// Owner of the uniquing tables for affine expressions, maps, and integer sets.
///
/// Every [crate::expr::AffineExpr], [crate::map::AffineMap], and
/// [crate::set::IntegerSet] borrows the `Context` that created it, so structurally equal
/// values created through the same `Context` share one entry and compare by identity. All
/// entries are freed together when the `Context` is dropped.
///
/// Lookups and insertions are safe to perform from multiple threads.
#[derive(Default)]
pub struct Context {
    exprs: RwLock<Interner<ExprNode>>,
    maps: RwLock<Interner<MapStorage>>,
    sets: RwLock<Interner<SetStorage>>,
}

struct Interner<T> {
    items: Vec<T>,
    index: HashMap<T, u32>,
}

impl<T> Default for Interner<T> {
    fn default() -> Self {
        Interner {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> Interner<T> {
    fn lookup(&self, item: &T) -> Option<u32> {
        self.index.get(item).copied()
    }

    fn intern(&mut self, item: T) -> u32 {
        if let Some(id) = self.lookup(&item) {
            return id;
        }
        let id = u32::try_from(self.items.len()).expect("uniquing table overflowed u32");
        self.items.push(item.clone());
        self.index.insert(item, id);
        id
    }
}

/// Look up `item` under a shared lock, only taking the exclusive lock on a miss.
fn intern_in<T: Clone + Eq + Hash>(table: &RwLock<Interner<T>>, item: T) -> u32 {
    if let Some(id) = table.read().lookup(&item) {
        return id;
    }
    table.write().intern(item)
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    /// The number of distinct expressions uniqued so far.
    pub fn num_uniqued_exprs(&self) -> usize {
        self.exprs.read().items.len()
    }

    /// The number of distinct maps uniqued so far.
    pub fn num_uniqued_maps(&self) -> usize {
        self.maps.read().items.len()
    }

    pub(crate) fn intern_expr(&self, node: ExprNode) -> ExprId {
        ExprId(intern_in(&self.exprs, node))
    }

    pub(crate) fn expr_node(&self, id: ExprId) -> ExprNode {
        self.exprs.read().items[id.0 as usize]
    }

    pub(crate) fn intern_map(&self, storage: MapStorage) -> MapId {
        MapId(intern_in(&self.maps, storage))
    }

    pub(crate) fn map_storage(&self, id: MapId) -> MapStorage {
        self.maps.read().items[id.0 as usize].clone()
    }

    pub(crate) fn intern_set(&self, storage: SetStorage) -> SetId {
        SetId(intern_in(&self.sets, storage))
    }

    pub(crate) fn set_storage(&self, id: SetId) -> SetStorage {
        self.sets.read().items[id.0 as usize].clone()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("exprs", &self.exprs.read().items.len())
            .field("maps", &self.maps.read().items.len())
            .field("sets", &self.sets.read().items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Context;
    use std::thread;

    #[test]
    fn test_structurally_equal_exprs_share_an_entry() {
        let ctx = Context::new();
        let a = ctx.dim(0) + ctx.symbol(1);
        let before = ctx.num_uniqued_exprs();
        let b = ctx.dim(0) + ctx.symbol(1);
        assert_eq!(a, b);
        assert_eq!(ctx.num_uniqued_exprs(), before);
    }

    #[test]
    fn test_concurrent_uniquing_agrees() {
        let ctx = Context::new();
        let exprs = thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..32)
                            .map(|i| (ctx.dim(i % 3) * 2 + ctx.symbol(0)).floor_div(ctx.constant(4)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        for other in &exprs[1..] {
            assert_eq!(&exprs[0], other);
        }
    }
}

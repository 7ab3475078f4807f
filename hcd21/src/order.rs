//!
//! # Dependency Ordering
//!
//! Cells instantiate other cells, forming a directed graph which must be acyclic.
//! Hierarchical output requires every cell's dependencies to be written before the cell itself.
//!
//! The [DepOrder] trait aids these orderings.
//! Implementers supply `process`, which passes each of an item's direct dependencies to [DepOrderer::push].
//! `push` recurses depth-first, and reports cycles through the implementer's `fail`.
//!

// Std-lib
use std::collections::HashSet;

// Local imports
use crate::arena::Ticket;
use crate::digest::Digest;
use crate::error::{HcdError, HcdResult};
use crate::symtab::Mode;

///
/// # Dependency-Ordering Trait
///
/// Unlike a free-standing graph, our items are tickets which only mean something in a context,
/// typically a [Digest]. Implementers are that context.
///
pub trait DepOrder: Sized {
    /// Item Type. Keys to the nodes in the dependency graph.
    type Item: Clone + Eq + std::hash::Hash;
    /// Error Type
    type Error;

    /// Dependency-order all entries in slice `items`
    fn order(&self, items: &[Self::Item]) -> Result<Vec<Self::Item>, Self::Error> {
        DepOrderer::order(self, items)
    }
    /// Process a single `item`, pushing each of its dependencies
    fn process(
        &self,
        item: &Self::Item,
        orderer: &mut DepOrderer<'_, Self>,
    ) -> Result<(), Self::Error>;
    /// Failure-handler, called with the item that closes a cycle
    fn fail(&self, item: &Self::Item) -> Self::Error;
}

/// # Dependency Order Helper
/// Public solely for use in the call-signature of [DepOrder::process].
pub struct DepOrderer<'p, P: DepOrder> {
    /// Ordering context
    ctx: &'p P,
    /// Ordered, completed items
    stack: Vec<P::Item>,
    /// Completed items, for quick membership tests
    seen: HashSet<P::Item>,
    /// Items with an open recursive frame, for cycle detection
    pending: HashSet<P::Item>,
}
impl<'p, P: DepOrder> DepOrderer<'p, P> {
    /// Dependency-order all entries in slice `items`
    pub fn order(ctx: &'p P, items: &[P::Item]) -> Result<Vec<P::Item>, P::Error> {
        let len = items.len();
        let mut this = Self {
            ctx,
            stack: Vec::with_capacity(len),
            seen: HashSet::with_capacity(len),
            pending: HashSet::new(),
        };
        for item in items.iter() {
            this.push(item)?;
        }
        Ok(this.stack)
    }
    /// Push `item`'s dependencies, and then itself, onto the stack
    pub fn push(&mut self, item: &P::Item) -> Result<(), P::Error> {
        if self.seen.contains(item) {
            return Ok(());
        }
        if !self.pending.insert(item.clone()) {
            return Err(self.ctx.fail(item));
        }
        let ctx = self.ctx;
        ctx.process(item, self)?;
        self.pending.remove(item);
        self.seen.insert(item.clone());
        self.stack.push(item.clone());
        Ok(())
    }
}

///
/// # Cell Ordering
///
/// Orders the cells of one [Mode] of a [Digest], children first.
///
pub struct CellOrder<'d> {
    pub digest: &'d Digest,
    pub mode: Mode,
}
impl<'d> DepOrder for CellOrder<'d> {
    type Item = Ticket;
    type Error = HcdError;

    fn process(&self, item: &Ticket, orderer: &mut DepOrderer<'_, Self>) -> HcdResult<()> {
        // Children of a single cell commonly repeat. Push each once.
        let mut children: Vec<Ticket> = Vec::new();
        let mut seen: HashSet<Ticket> = HashSet::new();
        for cref in self.digest.instances(self.mode, *item)? {
            let child = cref?.child_ticket()?;
            if seen.insert(child) {
                children.push(child);
            }
        }
        for child in children.iter() {
            orderer.push(child)?;
        }
        Ok(())
    }
    fn fail(&self, item: &Ticket) -> HcdError {
        let name = self
            .digest
            .cell_name(self.mode, *item)
            .unwrap_or("<unknown>");
        HcdError::format(format!("Cell hierarchy cycle through {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Integer graph, edges from each node to its dependencies
    struct Graph(Vec<Vec<usize>>);
    impl DepOrder for Graph {
        type Item = usize;
        type Error = String;
        fn process(&self, item: &usize, orderer: &mut DepOrderer<'_, Self>) -> Result<(), String> {
            for dep in self.0[*item].iter() {
                orderer.push(dep)?;
            }
            Ok(())
        }
        fn fail(&self, item: &usize) -> String {
            format!("cycle at {}", item)
        }
    }
    #[test]
    fn dependencies_first() -> Result<(), String> {
        let g = Graph(vec![vec![1, 2], vec![2], vec![], vec![0]]);
        assert_eq!(g.order(&[3])?, vec![2, 1, 0, 3]);
        assert_eq!(g.order(&[0, 1, 2, 3])?, vec![2, 1, 0, 3]);
        Ok(())
    }
    #[test]
    fn cycles_fail() {
        let g = Graph(vec![vec![1], vec![2], vec![0]]);
        assert_eq!(g.order(&[0]), Err("cycle at 0".to_string()));
    }
}

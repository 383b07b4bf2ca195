// Forward range cursor over the leaf chain.
//
// Lazy and single-pass: internal nodes are visited once to find the first
// leaf, after that only right-sibling links. The cursor remembers the leaf
// page-LSN it last read; if the leaf changed underneath it (split, merge,
// compaction) it re-seeks from the last returned key instead of trusting
// the stale slot.

use crate::btree::node::{cell_key, leaf_cell_value, leaf_search};
use crate::btree::tree::BTree;
use crate::common::{Lsn, PageId};
use crate::error::Result;
use crate::storage::page::INVALID_PAGE_ID;

/// Inclusive/exclusive bound on an encoded key.
pub type Bound = (Vec<u8>, bool);

enum State {
    Start,
    At {
        leaf: PageId,
        leaf_lsn: Lsn,
        next_slot: usize,
        last_key: Option<Vec<u8>>,
    },
    Done,
}

pub struct RangeCursor<'t> {
    tree: &'t BTree,
    lo: Option<Bound>,
    hi: Option<Bound>,
    /// repeatable-read filter: leaves stamped past this LSN are skipped
    snapshot: Option<Lsn>,
    state: State,
}

impl<'t> RangeCursor<'t> {
    pub fn new(tree: &'t BTree, lo: Option<Bound>, hi: Option<Bound>) -> Self {
        Self {
            tree,
            lo,
            hi,
            snapshot: None,
            state: State::Start,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<Lsn>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Next pair in key order, None when the range is exhausted.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            match &mut self.state {
                State::Done => return Ok(None),
                State::Start => {
                    let (leaf, slot) = match &self.lo {
                        Some((key, inclusive)) => {
                            let (guard, leaf) = self.tree.find_leaf(key)?;
                            let buf = guard.read();
                            let slot = match leaf_search(&buf, key) {
                                Ok(s) => {
                                    if *inclusive {
                                        s
                                    } else {
                                        s + 1
                                    }
                                }
                                Err(s) => s,
                            };
                            (leaf, slot)
                        }
                        None => (self.tree.leftmost_leaf()?, 0),
                    };
                    self.state = State::At {
                        leaf,
                        leaf_lsn: 0,
                        next_slot: slot,
                        last_key: None,
                    };
                }
                State::At {
                    leaf,
                    leaf_lsn,
                    next_slot,
                    last_key,
                } => {
                    let (leaf, leaf_lsn, next_slot) = (*leaf, *leaf_lsn, *next_slot);
                    let last_key = last_key.clone();
                    let guard = self.tree.pin_page(leaf)?;
                    let buf = guard.read();

                    // leaf changed underneath us (split, merge, or even
                    // freed): re-seek past the last returned key
                    let invalidated = (leaf_lsn != 0 && buf.lsn() != leaf_lsn)
                        || buf.kind() != crate::storage::page::PageKind::TreeLeaf;
                    if invalidated {
                        let resume = last_key.clone();
                        drop(buf);
                        drop(guard);
                        match resume {
                            Some(key) => {
                                let (g2, new_leaf) = self.tree.find_leaf(&key)?;
                                let b2 = g2.read();
                                let slot = match leaf_search(&b2, &key) {
                                    Ok(s) => s + 1,
                                    Err(s) => s,
                                };
                                let lsn = b2.lsn();
                                drop(b2);
                                self.state = State::At {
                                    leaf: new_leaf,
                                    leaf_lsn: lsn,
                                    next_slot: slot,
                                    last_key: Some(key),
                                };
                            }
                            None => self.state = State::Start,
                        }
                        continue;
                    }

                    // snapshot isolation: a leaf written after the snapshot
                    // LSN is not visible to this statement
                    let leaf_hidden = self
                        .snapshot
                        .map(|snap| buf.lsn() > snap)
                        .unwrap_or(false);

                    if leaf_hidden || next_slot >= buf.slot_count() {
                        let sibling = buf.right_sibling();
                        drop(buf);
                        if sibling == INVALID_PAGE_ID {
                            self.state = State::Done;
                            return Ok(None);
                        }
                        self.state = State::At {
                            leaf: sibling,
                            leaf_lsn: 0,
                            next_slot: 0,
                            last_key,
                        };
                        continue;
                    }

                    let cell = buf.cell(next_slot);
                    let key = cell_key(cell).to_vec();
                    if let Some((hi, inclusive)) = &self.hi {
                        let beyond = if *inclusive {
                            key.as_slice() > hi.as_slice()
                        } else {
                            key.as_slice() >= hi.as_slice()
                        };
                        if beyond {
                            self.state = State::Done;
                            return Ok(None);
                        }
                    }
                    let value = leaf_cell_value(cell).to_vec();
                    let lsn = buf.lsn();
                    drop(buf);
                    self.state = State::At {
                        leaf,
                        leaf_lsn: lsn,
                        next_slot: next_slot + 1,
                        last_key: Some(key.clone()),
                    };
                    return Ok(Some((key, value)));
                }
            }
        }
    }

    /// Pull up to `max` pairs.
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::with_capacity(max.min(256));
        while out.len() < max {
            match self.next()? {
                Some(pair) => out.push(pair),
                None => break,
            }
        }
        Ok(out)
    }
}

// Disk-resident B+ tree.
//
// One tree per page file; page 0 is the meta page holding the root pointer,
// free-list head, fan-out order, and key schema. Descents crab-latch
// top-down, releasing ancestors once a child is known not to propagate a
// structural change. Every structural modification (split, merge, root
// swap) is logged as a single WAL record carrying full images of every
// touched page, so recovery sees it fully present or fully absent.

use crate::btree::key::{KeyCodec, KeyType};
use crate::btree::node::{
    cell_key, child_at, internal_cell, internal_child_slot, leaf_cell, leaf_cell_value,
    leaf_search, low_key,
};
use crate::buffer::{BufferPool, FrameGuard, PageWriteGuard};
use crate::common::{page_id, page_no, FileId, Lsn, PageId, Value};
use crate::error::{DbError, Result};
use crate::storage::page::{PageBuf, PageKind, INVALID_PAGE_ID};
use crate::storage::PageStore;
use crate::txn::Txn;
use crate::wal::{PageDelta, Payload, TreeUndo, WalManager};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Meta-page payload, stored as cell 0 of page 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeMeta {
    pub root: u32,
    /// head of the free-page chain; 0 means empty (page 0 is always meta)
    pub free_head: u32,
    pub order: u32,
    pub key_type: KeyType,
}

/// A pinned, write-latched page plus its captured before-image.
struct PageMut {
    guard: FrameGuard,
    buf: PageWriteGuard,
    page: PageId,
    before: Vec<u8>,
}

impl PageMut {
    fn acquire(pool: &BufferPool, page: PageId) -> Result<PageMut> {
        let guard = pool.pin(page)?;
        let buf = guard.frame().write_owned();
        let before = buf.data().to_vec();
        Ok(PageMut {
            guard,
            buf,
            page,
            before,
        })
    }

    fn delta(&self) -> PageDelta {
        PageDelta {
            page_id: self.page,
            before: self.before.clone(),
            after: self.buf.data().to_vec(),
        }
    }

    fn finish(mut self, lsn: Lsn) {
        self.buf.set_lsn(lsn);
        self.guard.mark_dirty(lsn);
    }
}

pub struct BTree {
    name: String,
    file: FileId,
    order: usize,
    codec: KeyCodec,
    pool: Arc<BufferPool>,
    wal: Arc<WalManager>,
    store: Arc<PageStore>,
    meta: RwLock<TreeMeta>,
    entry_count: AtomicU64,
    height: AtomicU64,
}

impl BTree {
    /// Maximum encoded key length; keys beyond this cannot share a page
    /// with their siblings at any order.
    fn max_key_len(&self) -> usize {
        self.store.page_size() / 8
    }

    fn max_value_len(&self) -> usize {
        self.store.page_size() / 2
    }

    fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Format a brand-new tree in an empty, registered file: meta page plus
    /// one empty leaf root.
    pub fn create(
        name: &str,
        file: FileId,
        order: usize,
        codec: KeyCodec,
        pool: Arc<BufferPool>,
        wal: Arc<WalManager>,
        store: Arc<PageStore>,
        txn: &Txn,
    ) -> Result<BTree> {
        if order < 2 {
            return Err(DbError::InvalidArgument(format!(
                "tree order must be >= 2, got {}",
                order
            )));
        }
        let dm = store.file(file)?;
        if dm.page_count() != 0 {
            return Err(DbError::Storage(format!(
                "tree file {} is not empty",
                name
            )));
        }
        dm.extend()?; // page 0: meta
        dm.extend()?; // page 1: root leaf

        let meta = TreeMeta {
            root: 1,
            free_head: 0,
            order: order as u32,
            key_type: codec.key_type.clone(),
        };

        let meta_lsn = wal.append(
            txn.id(),
            txn.last_lsn(),
            Payload::AllocPage {
                file,
                page_no: 0,
                kind: PageKind::Meta as u32,
            },
        )?;
        txn.chain(meta_lsn);
        let root_lsn = wal.append(
            txn.id(),
            txn.last_lsn(),
            Payload::AllocPage {
                file,
                page_no: 1,
                kind: PageKind::TreeLeaf as u32,
            },
        )?;
        txn.chain(root_lsn);

        let meta_page = pool.install_new_page(page_id(file, 0), PageKind::Meta, meta_lsn)?;
        {
            let mut buf = meta_page.write();
            let cell = bincode::serde::encode_to_vec(&meta, bincode::config::standard())?;
            if !buf.insert_cell(0, &cell) {
                return Err(DbError::Internal("meta cell cannot fit".into()));
            }
        }
        let root_page = pool.install_new_page(page_id(file, 1), PageKind::TreeLeaf, root_lsn)?;
        drop(root_page);

        // persist the formatted meta through a logged update
        let tree = BTree {
            name: name.to_string(),
            file,
            order,
            codec,
            pool,
            wal,
            store,
            meta: RwLock::new(meta),
            entry_count: AtomicU64::new(0),
            height: AtomicU64::new(1),
        };
        tree.log_meta(txn)?;
        debug!(tree = name, file, order, "tree created");
        Ok(tree)
    }

    /// Mount an existing tree, reading the meta page and sizing counters.
    pub fn open(
        name: &str,
        file: FileId,
        codec_epsilon: Option<f64>,
        pool: Arc<BufferPool>,
        wal: Arc<WalManager>,
        store: Arc<PageStore>,
    ) -> Result<BTree> {
        let meta_guard = pool.pin(page_id(file, 0))?;
        let meta: TreeMeta = {
            let buf = meta_guard.read();
            if buf.kind() != PageKind::Meta {
                return Err(DbError::CorruptPage {
                    page_id: page_id(file, 0),
                    reason: "page 0 is not a meta page".into(),
                });
            }
            let (meta, _) =
                bincode::serde::decode_from_slice(buf.cell(0), bincode::config::standard())?;
            meta
        };
        drop(meta_guard);

        let codec = match codec_epsilon {
            Some(eps) => KeyCodec::with_epsilon(meta.key_type.clone(), eps),
            None => KeyCodec::new(meta.key_type.clone()),
        };
        let tree = BTree {
            name: name.to_string(),
            file,
            order: meta.order as usize,
            codec,
            pool,
            wal,
            store,
            meta: RwLock::new(meta),
            entry_count: AtomicU64::new(0),
            height: AtomicU64::new(1),
        };
        let (height, entries) = tree.measure()?;
        tree.height.store(height, Ordering::Relaxed);
        tree.entry_count.store(entries, Ordering::Relaxed);
        Ok(tree)
    }

    fn measure(&self) -> Result<(u64, u64)> {
        let mut height = 1u64;
        let mut cur = self.root();
        loop {
            let guard = self.pool.pin(cur)?;
            let buf = guard.read();
            match buf.kind() {
                PageKind::TreeLeaf => break,
                PageKind::TreeInternal => {
                    let child = child_at(&buf, 0);
                    height += 1;
                    drop(buf);
                    cur = child;
                }
                other => {
                    return Err(DbError::CorruptPage {
                        page_id: cur,
                        reason: format!("unexpected {:?} on root path", other),
                    })
                }
            }
        }
        // leaf chain walk for the entry count
        let mut entries = 0u64;
        let mut leaf = cur;
        loop {
            let guard = self.pool.pin(leaf)?;
            let buf = guard.read();
            entries += buf.slot_count() as u64;
            let next = buf.right_sibling();
            drop(buf);
            if next == INVALID_PAGE_ID {
                break;
            }
            leaf = next;
        }
        Ok((height, entries))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    #[inline]
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn root(&self) -> PageId {
        page_id(self.file, self.meta.read().root)
    }

    #[inline]
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    /// Leaf pages currently linked into the chain.
    pub fn leaf_count(&self) -> Result<u64> {
        let mut leaf = self.leftmost_leaf()?;
        let mut count = 0u64;
        loop {
            let guard = self.pool.pin(leaf)?;
            let buf = guard.read();
            count += 1;
            let next = buf.right_sibling();
            drop(buf);
            if next == INVALID_PAGE_ID {
                break;
            }
            leaf = next;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Point lookup. With a configured float epsilon the probe widens to
    /// the [key-eps, key+eps] band and returns the first hit.
    pub fn get(&self, key_values: &[Value]) -> Result<Option<Vec<u8>>> {
        if let Some((lo, hi)) = self.codec.epsilon_range(key_values)? {
            let mut cursor = crate::btree::cursor::RangeCursor::new(
                self,
                Some((lo, true)),
                Some((hi, true)),
            );
            return Ok(cursor.next()?.map(|(_, v)| v));
        }
        let key = self.codec.encode(key_values)?;
        self.get_encoded(&key)
    }

    pub fn get_encoded(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (guard, _) = self.find_leaf(key)?;
        let buf = guard.read();
        match leaf_search(&buf, key) {
            Ok(slot) => Ok(Some(leaf_cell_value(buf.cell(slot)).to_vec())),
            Err(_) => Ok(None),
        }
    }

    /// Read-latched descent to the leaf that owns `key`. A concurrent leaf
    /// split can leave the key one page to the right; the sibling walk at
    /// the bottom absorbs that. A page freed mid-descent (merge, root
    /// collapse) restarts from the current root.
    pub(crate) fn find_leaf(&self, key: &[u8]) -> Result<(FrameGuard, PageId)> {
        let mut restarts = 0usize;
        'restart: loop {
            let mut cur = self.root();
            loop {
                let guard = self.pool.pin(cur)?;
                let buf = guard.read();
                match buf.kind() {
                    PageKind::TreeInternal => {
                        let slot = internal_child_slot(&buf, key);
                        let child = child_at(&buf, slot);
                        drop(buf);
                        cur = child;
                    }
                    PageKind::TreeLeaf => {
                        let n = buf.slot_count();
                        if n > 0
                            && key > cell_key(buf.cell(n - 1))
                            && buf.right_sibling() != INVALID_PAGE_ID
                        {
                            let next = buf.right_sibling();
                            drop(buf);
                            cur = next;
                            continue;
                        }
                        drop(buf);
                        return Ok((guard, cur));
                    }
                    other => {
                        restarts += 1;
                        if restarts > 8 {
                            return Err(DbError::CorruptPage {
                                page_id: cur,
                                reason: format!("unexpected {:?} in descent", other),
                            });
                        }
                        continue 'restart;
                    }
                }
            }
        }
    }

    pub(crate) fn pin_page(&self, page: PageId) -> Result<FrameGuard> {
        self.pool.pin(page)
    }

    /// Largest key in the tree (rightmost leaf, last slot); None if empty.
    /// Row-id allocation seeds from this at mount.
    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        let mut cur = self.root();
        loop {
            let guard = self.pool.pin(cur)?;
            let buf = guard.read();
            match buf.kind() {
                PageKind::TreeInternal => {
                    let child = child_at(&buf, buf.slot_count() - 1);
                    drop(buf);
                    cur = child;
                }
                PageKind::TreeLeaf => {
                    // a rightmost leaf can sit empty after deletes; follow
                    // the chain backward is impossible, so report None only
                    // when the tree is truly empty
                    if buf.slot_count() == 0 {
                        return Ok(None);
                    }
                    return Ok(Some(cell_key(buf.cell(buf.slot_count() - 1)).to_vec()));
                }
                other => {
                    return Err(DbError::CorruptPage {
                        page_id: cur,
                        reason: format!("unexpected {:?} in descent", other),
                    })
                }
            }
        }
    }

    pub(crate) fn leftmost_leaf(&self) -> Result<PageId> {
        let mut restarts = 0usize;
        'restart: loop {
            let mut cur = self.root();
            loop {
                let guard = self.pool.pin(cur)?;
                let buf = guard.read();
                match buf.kind() {
                    PageKind::TreeLeaf => return Ok(cur),
                    PageKind::TreeInternal => {
                        let child = child_at(&buf, 0);
                        drop(buf);
                        cur = child;
                    }
                    other => {
                        restarts += 1;
                        if restarts > 8 {
                            return Err(DbError::CorruptPage {
                                page_id: cur,
                                reason: format!("unexpected {:?} in descent", other),
                            });
                        }
                        continue 'restart;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert or replace. Returns the previous value when the key existed.
    pub fn insert(
        &self,
        txn: &Txn,
        key_values: &[Value],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let key = self.codec.encode(key_values)?;
        self.insert_encoded(txn, &key, value)
    }

    pub fn insert_encoded(&self, txn: &Txn, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() > self.max_key_len() {
            return Err(DbError::InvalidArgument(format!(
                "key length {} exceeds limit {}",
                key.len(),
                self.max_key_len()
            )));
        }
        if value.len() > self.max_value_len() {
            return Err(DbError::InvalidArgument(format!(
                "value length {} exceeds half-page limit {}",
                value.len(),
                self.max_value_len()
            )));
        }
        self.insert_with_undo(txn, key, value, true)
    }

    /// Compensating writes during rollback take `record_undo = false` so a
    /// re-run of undo after a crash stays idempotent.
    pub(crate) fn insert_with_undo(
        &self,
        txn: &Txn,
        key: &[u8],
        value: &[u8],
        record_undo: bool,
    ) -> Result<Option<Vec<u8>>> {
        // optimistic pass first; escalate when a split is needed
        match self.try_leaf_insert(txn, key, value, record_undo)? {
            Some(old) => Ok(old),
            None => self.insert_split(txn, key, value, record_undo),
        }
    }

    /// Fast path: write-latch only the leaf. Returns None when the leaf
    /// must split.
    fn try_leaf_insert(
        &self,
        txn: &Txn,
        key: &[u8],
        value: &[u8],
        record_undo: bool,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let (guard, leaf_id) = self.find_leaf(key)?;
        drop(guard);
        let mut page = PageMut::acquire(&self.pool, leaf_id)?;
        // the leaf may have split or merged away between the read descent
        // and the latch; the pessimistic path re-descends safely
        if page.buf.kind() != PageKind::TreeLeaf {
            return Ok(None);
        }
        {
            let n = page.buf.slot_count();
            if n > 0
                && key > cell_key(page.buf.cell(n - 1))
                && page.buf.right_sibling() != INVALID_PAGE_ID
            {
                return Ok(None);
            }
        }
        let cell = leaf_cell(key, value);
        match leaf_search(&page.buf, key) {
            Ok(slot) => {
                let old = leaf_cell_value(page.buf.cell(slot)).to_vec();
                if !page.buf.replace_cell(slot, &cell) {
                    return Ok(None); // needs split to make room
                }
                let undo = record_undo.then(|| TreeUndo::Insert {
                    file: self.file,
                    key: key.to_vec(),
                    old_value: Some(old.clone()),
                });
                self.log_pages(txn, vec![page], undo)?;
                Ok(Some(Some(old)))
            }
            Err(slot) => {
                if page.buf.slot_count() >= self.max_keys()
                    || page.buf.reusable_space() < cell.len() + 4
                {
                    return Ok(None);
                }
                if !page.buf.insert_cell(slot, &cell) {
                    return Ok(None);
                }
                let undo = record_undo.then(|| TreeUndo::Insert {
                    file: self.file,
                    key: key.to_vec(),
                    old_value: None,
                });
                self.log_pages(txn, vec![page], undo)?;
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                Ok(Some(None))
            }
        }
    }

    /// Split path: re-descend from the root under write latches, keeping
    /// every ancestor that might receive a separator. One WAL record covers
    /// page allocation, key movement, and parent link updates.
    fn insert_split(
        &self,
        txn: &Txn,
        key: &[u8],
        value: &[u8],
        record_undo: bool,
    ) -> Result<Option<Vec<u8>>> {
        let mut path: Vec<(PageMut, usize)> = Vec::new(); // (node, child slot taken)
        // worst-case internal cell (2 + key + 8) plus slot overhead
        let sep_reserve = self.max_key_len() + 16;

        // latch the root, re-validating against a concurrent root swap
        let mut pending: Option<PageMut> = None;
        let mut cur;
        loop {
            let root_no = self.meta.read().root;
            cur = page_id(self.file, root_no);
            let page = PageMut::acquire(&self.pool, cur)?;
            if self.meta.read().root == root_no {
                pending = Some(page);
                break;
            }
        }

        let leaf = loop {
            let page = match pending.take() {
                Some(page) => page,
                None => PageMut::acquire(&self.pool, cur)?,
            };
            match page.buf.kind() {
                PageKind::TreeInternal => {
                    let slot = internal_child_slot(&page.buf, key);
                    let child = child_at(&page.buf, slot);
                    let safe = page.buf.slot_count() < self.order
                        && page.buf.reusable_space() >= sep_reserve;
                    path.push((page, slot));
                    if safe {
                        // ancestors above a safe node never change
                        let keep = path.len() - 1;
                        path.drain(..keep);
                    }
                    cur = child;
                }
                PageKind::TreeLeaf => break page,
                other => {
                    return Err(DbError::CorruptPage {
                        page_id: cur,
                        reason: format!("unexpected {:?} in descent", other),
                    })
                }
            }
        };

        let mut leaf = leaf;
        let cell = leaf_cell(key, value);

        // replace without growth never splits
        if let Ok(slot) = leaf_search(&leaf.buf, key) {
            let old = leaf_cell_value(leaf.buf.cell(slot)).to_vec();
            if leaf.buf.replace_cell(slot, &cell) {
                let undo = record_undo.then(|| TreeUndo::Insert {
                    file: self.file,
                    key: key.to_vec(),
                    old_value: Some(old.clone()),
                });
                self.log_pages(txn, vec![leaf], undo)?;
                return Ok(Some(old));
            }
        }

        // gather every page the structural change touches
        let mut touched: Vec<PageMut> = Vec::new();

        // split the leaf at the median
        let (right_no, mut right) = self.fresh_page(PageKind::TreeLeaf, &mut touched)?;
        let split_at = leaf.buf.slot_count() / 2;
        let moved: Vec<Vec<u8>> = (split_at..leaf.buf.slot_count())
            .map(|i| leaf.buf.cell(i).to_vec())
            .collect();
        for _ in split_at..leaf.buf.slot_count() {
            leaf.buf.remove_cell(split_at);
        }
        for (i, c) in moved.iter().enumerate() {
            if !right.buf.insert_cell(i, c) {
                return Err(DbError::Internal("split target overflow".into()));
            }
        }
        right
            .buf
            .set_right_sibling(leaf.buf.right_sibling());
        leaf.buf.set_right_sibling(page_id(self.file, right_no));

        // promoted separator: smallest key of the new right sibling
        let sep = low_key(&right.buf)?;

        // place the new cell in whichever half owns it
        let replaced_old = {
            let target = if key < sep.as_slice() {
                &mut leaf
            } else {
                &mut right
            };
            match leaf_search(&target.buf, key) {
                Ok(slot) => {
                    let old = leaf_cell_value(target.buf.cell(slot)).to_vec();
                    if !target.buf.replace_cell(slot, &cell) {
                        return Err(DbError::Internal("post-split replace overflow".into()));
                    }
                    Some(old)
                }
                Err(slot) => {
                    if !target.buf.insert_cell(slot, &cell) {
                        return Err(DbError::Internal("post-split insert overflow".into()));
                    }
                    None
                }
            }
        };

        let leaf_page_no = page_no(leaf.page);
        touched.push(leaf);
        touched.push(right);

        // propagate the separator up the held path
        self.propagate_split(sep, leaf_page_no, right_no, path, &mut touched)?;

        let undo = record_undo.then(|| TreeUndo::Insert {
            file: self.file,
            key: key.to_vec(),
            old_value: replaced_old.clone(),
        });
        self.log_pages(txn, touched, undo)?;
        if replaced_old.is_none() {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(replaced_old)
    }

    /// Insert `sep` between `left_no` and `right_no` in the lowest held
    /// ancestor, splitting upward while ancestors overflow.
    fn propagate_split(
        &self,
        sep: Vec<u8>,
        left_no: u32,
        right_no: u32,
        mut path: Vec<(PageMut, usize)>,
        touched: &mut Vec<PageMut>,
    ) -> Result<()> {
        let mut sep = sep;
        let mut right_no = right_no;
        let mut left_no = left_no;

        loop {
            match path.pop() {
                Some((mut parent, slot)) => {
                    debug_assert_eq!(page_no(child_at(&parent.buf, slot)), left_no);
                    let cell = internal_cell(&sep, page_id(self.file, right_no));
                    if parent.buf.slot_count() < self.order
                        && parent.buf.insert_cell(slot + 1, &cell)
                    {
                        touched.push(parent);
                        // remaining ancestors are untouched; drop latches
                        path.clear();
                        return Ok(());
                    }

                    // parent splits: median key moves up
                    let (new_no, mut new_node) =
                        self.fresh_page(PageKind::TreeInternal, touched)?;
                    let split_at = parent.buf.slot_count() / 2;
                    let median = cell_key(parent.buf.cell(split_at)).to_vec();
                    let median_child = child_at(&parent.buf, split_at);

                    let moved: Vec<Vec<u8>> = (split_at + 1..parent.buf.slot_count())
                        .map(|i| parent.buf.cell(i).to_vec())
                        .collect();
                    for _ in split_at..parent.buf.slot_count() {
                        parent.buf.remove_cell(split_at);
                    }
                    if !new_node.buf.insert_cell(0, &internal_cell(b"", median_child)) {
                        return Err(DbError::Internal("internal split overflow".into()));
                    }
                    for (i, c) in moved.iter().enumerate() {
                        if !new_node.buf.insert_cell(i + 1, c) {
                            return Err(DbError::Internal("internal split overflow".into()));
                        }
                    }

                    // route the pending separator into the correct half
                    let pending = internal_cell(&sep, page_id(self.file, right_no));
                    if sep.as_slice() < median.as_slice() {
                        let at = internal_child_slot(&parent.buf, &sep);
                        if !parent.buf.insert_cell(at + 1, &pending) {
                            return Err(DbError::Internal("internal split overflow".into()));
                        }
                    } else {
                        let at = internal_child_slot(&new_node.buf, &sep);
                        if !new_node.buf.insert_cell(at + 1, &pending) {
                            return Err(DbError::Internal("internal split overflow".into()));
                        }
                    }

                    left_no = page_no(parent.page);
                    touched.push(parent);
                    touched.push(new_node);
                    sep = median;
                    right_no = new_no;
                }
                None => {
                    // the split reached the top of the held path; since the
                    // path always starts at the root when any ancestor is
                    // unsafe, this is a root split
                    self.grow_root(sep, left_no, right_no, touched)?;
                    return Ok(());
                }
            }
        }
    }

    /// Allocate a new root one level above the split halves.
    fn grow_root(
        &self,
        sep: Vec<u8>,
        left_no: u32,
        right_no: u32,
        touched: &mut Vec<PageMut>,
    ) -> Result<()> {
        let (new_root_no, mut root) = self.fresh_page(PageKind::TreeInternal, touched)?;
        if !root
            .buf
            .insert_cell(0, &internal_cell(b"", page_id(self.file, left_no)))
            || !root
                .buf
                .insert_cell(1, &internal_cell(&sep, page_id(self.file, right_no)))
        {
            return Err(DbError::Internal("root cell overflow".into()));
        }
        touched.push(root);
        self.set_root(new_root_no, touched)?;
        self.height.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a key. Returns the removed value, None when absent.
    pub fn delete(&self, txn: &Txn, key_values: &[Value]) -> Result<Option<Vec<u8>>> {
        let key = self.codec.encode(key_values)?;
        self.delete_encoded(txn, &key)
    }

    pub fn delete_encoded(&self, txn: &Txn, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.delete_with_undo(txn, key, true)
    }

    pub(crate) fn delete_with_undo(
        &self,
        txn: &Txn,
        key: &[u8],
        record_undo: bool,
    ) -> Result<Option<Vec<u8>>> {
        let mut path: Vec<(PageMut, usize)> = Vec::new();

        // latch the root, re-validating against a concurrent root swap
        let mut pending: Option<PageMut> = None;
        let mut cur;
        loop {
            let root_no = self.meta.read().root;
            cur = page_id(self.file, root_no);
            let page = PageMut::acquire(&self.pool, cur)?;
            if self.meta.read().root == root_no {
                pending = Some(page);
                break;
            }
        }

        let mut leaf = loop {
            let page = match pending.take() {
                Some(page) => page,
                None => PageMut::acquire(&self.pool, cur)?,
            };
            match page.buf.kind() {
                PageKind::TreeInternal => {
                    let slot = internal_child_slot(&page.buf, key);
                    let child = child_at(&page.buf, slot);
                    // safe for delete: losing one key keeps the child at or
                    // above the minimum occupancy
                    let safe = page.buf.slot_count() > self.min_keys() + 1;
                    path.push((page, slot));
                    if safe {
                        let keep = path.len() - 1;
                        path.drain(..keep);
                    }
                    cur = child;
                }
                PageKind::TreeLeaf => break page,
                other => {
                    return Err(DbError::CorruptPage {
                        page_id: cur,
                        reason: format!("unexpected {:?} in descent", other),
                    })
                }
            }
        };

        let slot = match leaf_search(&leaf.buf, key) {
            Ok(slot) => slot,
            Err(_) => return Ok(None),
        };
        let old = leaf_cell_value(leaf.buf.cell(slot)).to_vec();
        leaf.buf.remove_cell(slot);

        let mut touched: Vec<PageMut> = Vec::new();
        let is_root_leaf = path.is_empty() && page_no(leaf.page) == self.meta.read().root;
        if !is_root_leaf && leaf.buf.slot_count() < self.min_keys() {
            self.rebalance(leaf, path, &mut touched)?;
        } else {
            touched.push(leaf);
            path.clear();
        }

        let undo = record_undo.then(|| TreeUndo::Delete {
            file: self.file,
            key: key.to_vec(),
            old_value: old.clone(),
        });
        self.log_pages(txn, touched, undo)?;
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(old))
    }

    /// Fix an underflowing node by borrowing from a sibling or merging with
    /// it; may propagate up the held path and collapse the root.
    fn rebalance(
        &self,
        node: PageMut,
        mut path: Vec<(PageMut, usize)>,
        touched: &mut Vec<PageMut>,
    ) -> Result<()> {
        let mut node = node;
        loop {
            let Some((mut parent, slot)) = path.pop() else {
                // node is the root: collapse an internal root with a single
                // child; an underflowing root leaf is legal
                if node.buf.kind() == PageKind::TreeInternal && node.buf.slot_count() == 1 {
                    let only_child = page_no(child_at(&node.buf, 0));
                    let freed = page_no(node.page);
                    self.release_page(node, touched)?;
                    self.set_root(only_child, touched)?;
                    self.height.fetch_sub(1, Ordering::Relaxed);
                    debug!(tree = %self.name, freed, new_root = only_child, "root collapsed");
                } else {
                    touched.push(node);
                }
                return Ok(());
            };

            // prefer the right sibling; fall back to the left when we are
            // the rightmost child
            let (mut left, mut right, left_slot, node_is_left) =
                if slot + 1 < parent.buf.slot_count() {
                    let sib = PageMut::acquire(&self.pool, child_at(&parent.buf, slot + 1))?;
                    (node, sib, slot, true)
                } else {
                    let sib = PageMut::acquire(&self.pool, child_at(&parent.buf, slot - 1))?;
                    (sib, node, slot - 1, false)
                };

            let is_leaf = left.buf.kind() == PageKind::TreeLeaf;
            // real key count: internal nodes spend slot 0 on the sentinel
            let keys_of = |p: &PageMut| {
                if is_leaf {
                    p.buf.slot_count()
                } else {
                    p.buf.slot_count().saturating_sub(1)
                }
            };

            let donor_is_right = node_is_left;
            let can_borrow = if donor_is_right {
                keys_of(&right) > self.min_keys()
            } else {
                keys_of(&left) > self.min_keys()
            };

            if can_borrow {
                if is_leaf {
                    self.redistribute_leaf(&mut left, &mut right, &mut parent, left_slot, donor_is_right)?;
                } else {
                    self.redistribute_internal(
                        &mut left,
                        &mut right,
                        &mut parent,
                        left_slot,
                        donor_is_right,
                    )?;
                }
                touched.push(left);
                touched.push(right);
                touched.push(parent);
                path.clear();
                return Ok(());
            }

            // merge right into left, drop the separator
            if is_leaf {
                let n = left.buf.slot_count();
                for i in 0..right.buf.slot_count() {
                    let cell = right.buf.cell(i).to_vec();
                    if !left.buf.insert_cell(n + i, &cell) {
                        return Err(DbError::Internal("leaf merge overflow".into()));
                    }
                }
                left.buf.set_right_sibling(right.buf.right_sibling());
            } else {
                let sep = cell_key(parent.buf.cell(left_slot + 1)).to_vec();
                let n = left.buf.slot_count();
                // the right node's sentinel child re-enters under the
                // separator key that used to divide the halves
                let first_child = child_at(&right.buf, 0);
                if !left.buf.insert_cell(n, &internal_cell(&sep, first_child)) {
                    return Err(DbError::Internal("internal merge overflow".into()));
                }
                for i in 1..right.buf.slot_count() {
                    let cell = right.buf.cell(i).to_vec();
                    if !left.buf.insert_cell(n + i, &cell) {
                        return Err(DbError::Internal("internal merge overflow".into()));
                    }
                }
            }
            parent.buf.remove_cell(left_slot + 1);
            self.release_page(right, touched)?;
            touched.push(left);

            let parent_keys = parent.buf.slot_count().saturating_sub(1);
            if path.is_empty() {
                if parent.buf.slot_count() == 1 {
                    // root down to a single child: collapse on the next turn
                    node = parent;
                    continue;
                }
                touched.push(parent);
                return Ok(());
            }
            if parent_keys >= self.min_keys() {
                touched.push(parent);
                path.clear();
                return Ok(());
            }
            node = parent;
        }
    }

    fn redistribute_leaf(
        &self,
        left: &mut PageMut,
        right: &mut PageMut,
        parent: &mut PageMut,
        left_slot: usize,
        donor_is_right: bool,
    ) -> Result<()> {
        if donor_is_right {
            let cell = right.buf.cell(0).to_vec();
            right.buf.remove_cell(0);
            let n = left.buf.slot_count();
            if !left.buf.insert_cell(n, &cell) {
                return Err(DbError::Internal("redistribute overflow".into()));
            }
        } else {
            let n = left.buf.slot_count();
            let cell = left.buf.cell(n - 1).to_vec();
            left.buf.remove_cell(n - 1);
            if !right.buf.insert_cell(0, &cell) {
                return Err(DbError::Internal("redistribute overflow".into()));
            }
        }
        // refresh the separator: smallest key now in the right node
        let sep = low_key(&right.buf)?;
        let sep_cell = internal_cell(&sep, page_id(self.file, page_no(right.page)));
        if !parent.buf.replace_cell(left_slot + 1, &sep_cell) {
            return Err(DbError::Internal("separator update overflow".into()));
        }
        Ok(())
    }

    fn redistribute_internal(
        &self,
        left: &mut PageMut,
        right: &mut PageMut,
        parent: &mut PageMut,
        left_slot: usize,
        donor_is_right: bool,
    ) -> Result<()> {
        let sep = cell_key(parent.buf.cell(left_slot + 1)).to_vec();
        if donor_is_right {
            // separator comes down into left; right's sentinel child rides it
            let first_child = child_at(&right.buf, 0);
            let n = left.buf.slot_count();
            if !left.buf.insert_cell(n, &internal_cell(&sep, first_child)) {
                return Err(DbError::Internal("redistribute overflow".into()));
            }
            // right's first real key becomes the new separator
            let new_sep = cell_key(right.buf.cell(1)).to_vec();
            let new_first = child_at(&right.buf, 1);
            right.buf.remove_cell(1);
            if !right.buf.replace_cell(0, &internal_cell(b"", new_first)) {
                return Err(DbError::Internal("sentinel update overflow".into()));
            }
            let sep_cell = internal_cell(&new_sep, page_id(self.file, page_no(right.page)));
            if !parent.buf.replace_cell(left_slot + 1, &sep_cell) {
                return Err(DbError::Internal("separator update overflow".into()));
            }
        } else {
            // left's last entry rotates up; old separator comes down onto
            // right's sentinel
            let n = left.buf.slot_count();
            let moved_key = cell_key(left.buf.cell(n - 1)).to_vec();
            let moved_child = child_at(&left.buf, n - 1);
            left.buf.remove_cell(n - 1);
            let old_first = child_at(&right.buf, 0);
            if !right.buf.replace_cell(0, &internal_cell(b"", moved_child)) {
                return Err(DbError::Internal("sentinel update overflow".into()));
            }
            if !right.buf.insert_cell(1, &internal_cell(&sep, old_first)) {
                return Err(DbError::Internal("redistribute overflow".into()));
            }
            let sep_cell = internal_cell(&moved_key, page_id(self.file, page_no(right.page)));
            if !parent.buf.replace_cell(left_slot + 1, &sep_cell) {
                return Err(DbError::Internal("separator update overflow".into()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page allocation / release
    // ------------------------------------------------------------------

    /// Produce a write-latched fresh page, reusing the free list when a
    /// freed page's freeing record is already durable. The meta lock is
    /// held across the pop so two allocators never hand out the same page.
    fn fresh_page(
        &self,
        kind: PageKind,
        touched: &mut Vec<PageMut>,
    ) -> Result<(u32, PageMut)> {
        let mut meta = self.meta.write();
        if meta.free_head != 0 {
            let no = meta.free_head;
            let mut page = PageMut::acquire(&self.pool, page_id(self.file, no))?;
            // a page is only reused once its freeing LSN is durable
            self.wal.flush_through(page.buf.lsn())?;
            let next = u32::from_le_bytes(page.buf.cell(0)[..4].try_into().unwrap());
            *page.buf = PageBuf::new(kind, self.store.page_size());
            meta.free_head = next;
            drop(meta);
            self.stage_meta(touched)?;
            return Ok((no, page));
        }
        drop(meta);
        let dm = self.store.file(self.file)?;
        let no = dm.extend()?;
        let guard = self
            .pool
            .install_new_page(page_id(self.file, no), kind, 0)?;
        let buf = guard.frame().write_owned();
        let before = buf.data().to_vec();
        Ok((
            no,
            PageMut {
                guard,
                buf,
                page: page_id(self.file, no),
                before,
            },
        ))
    }

    /// Push a page onto the free chain (logged with the caller's record).
    fn release_page(&self, mut page: PageMut, touched: &mut Vec<PageMut>) -> Result<()> {
        let no = page_no(page.page);
        let mut meta = self.meta.write();
        *page.buf = PageBuf::new(PageKind::Free, self.store.page_size());
        if !page.buf.insert_cell(0, &meta.free_head.to_le_bytes()) {
            return Err(DbError::Internal("free-list cell overflow".into()));
        }
        meta.free_head = no;
        drop(meta);
        touched.push(page);
        self.stage_meta(touched)
    }

    fn set_root(&self, new_root: u32, touched: &mut Vec<PageMut>) -> Result<()> {
        self.meta.write().root = new_root;
        self.stage_meta(touched)
    }

    /// Serialize the current meta into the meta page and stage it into the
    /// caller's touched set (reusing an already-latched meta page).
    fn stage_meta(&self, touched: &mut Vec<PageMut>) -> Result<()> {
        let serialized =
            bincode::serde::encode_to_vec(&*self.meta.read(), bincode::config::standard())?;
        let meta_page_id = page_id(self.file, 0);
        if let Some(existing) = touched.iter_mut().find(|p| p.page == meta_page_id) {
            if !existing.buf.replace_cell(0, &serialized) {
                return Err(DbError::Internal("meta cell overflow".into()));
            }
            return Ok(());
        }
        let mut page = PageMut::acquire(&self.pool, meta_page_id)?;
        if !page.buf.replace_cell(0, &serialized) {
            return Err(DbError::Internal("meta cell overflow".into()));
        }
        touched.push(page);
        Ok(())
    }

    /// Persist the in-memory meta under the caller's transaction.
    fn log_meta(&self, txn: &Txn) -> Result<()> {
        let mut touched = Vec::new();
        self.stage_meta(&mut touched)?;
        self.log_pages(txn, touched, None)
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    /// Append one WAL record covering every touched page, then stamp the
    /// record's LSN onto the pages (WAL-before-data).
    fn log_pages(
        &self,
        txn: &Txn,
        pages: Vec<PageMut>,
        undo: Option<TreeUndo>,
    ) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let deltas: Vec<PageDelta> = pages.iter().map(|p| p.delta()).collect();
        let lsn = self.wal.append(
            txn.id(),
            txn.last_lsn(),
            Payload::PageUpdate {
                deltas,
                undo: undo.clone(),
            },
        )?;
        txn.chain(lsn);
        if let Some(u) = undo {
            txn.push_undo(u);
        }
        for page in pages {
            page.finish(lsn);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk load
    // ------------------------------------------------------------------

    /// Build the tree bottom-up from key-sorted pairs; only legal on a
    /// freshly created, empty tree (index builds).
    pub fn bulk_load(
        &self,
        txn: &Txn,
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        if self.entry_count() != 0 {
            return Err(DbError::InvalidArgument(
                "bulk load requires an empty tree".into(),
            ));
        }
        if pairs.is_empty() {
            return Ok(());
        }
        debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

        let fill = self.max_keys().max(1);
        let mut touched: Vec<PageMut> = Vec::new();
        // the tree is invisible until the catalog commits, so the build can
        // log in batches instead of one oversized record
        let flush_at = 16usize;

        // leaf level
        let mut leaves: Vec<(u32, Vec<u8>)> = Vec::new(); // (page_no, low key)
        let mut prev: Option<PageMut> = None;
        for chunk in pairs.chunks(fill) {
            let (no, mut page) = self.fresh_page(PageKind::TreeLeaf, &mut touched)?;
            for (i, (k, v)) in chunk.iter().enumerate() {
                if !page.buf.insert_cell(i, &leaf_cell(k, v)) {
                    return Err(DbError::Internal("bulk leaf overflow".into()));
                }
            }
            if let Some(mut p) = prev.take() {
                p.buf.set_right_sibling(page_id(self.file, no));
                touched.push(p);
            }
            leaves.push((no, chunk[0].0.clone()));
            prev = Some(page);
            if touched.len() >= flush_at {
                self.log_pages(txn, std::mem::take(&mut touched), None)?;
            }
        }
        if let Some(p) = prev.take() {
            touched.push(p);
        }

        // internal levels bottom-up
        let mut level = leaves;
        let mut height = 1u64;
        while level.len() > 1 {
            let mut parents: Vec<(u32, Vec<u8>)> = Vec::new();
            for group in level.chunks(self.order) {
                let (no, mut page) = self.fresh_page(PageKind::TreeInternal, &mut touched)?;
                for (i, (child_no, lowkey)) in group.iter().enumerate() {
                    let cell = if i == 0 {
                        internal_cell(b"", page_id(self.file, *child_no))
                    } else {
                        internal_cell(lowkey, page_id(self.file, *child_no))
                    };
                    if !page.buf.insert_cell(i, &cell) {
                        return Err(DbError::Internal("bulk internal overflow".into()));
                    }
                }
                parents.push((no, group[0].1.clone()));
                touched.push(page);
                if touched.len() >= flush_at {
                    self.log_pages(txn, std::mem::take(&mut touched), None)?;
                }
            }
            level = parents;
            height += 1;
        }

        // root swap and the old empty root's release commit together
        let old_root = self.meta.read().root;
        self.set_root(level[0].0, &mut touched)?;
        let old_root_page = PageMut::acquire(&self.pool, page_id(self.file, old_root))?;
        self.release_page(old_root_page, &mut touched)?;

        self.log_pages(txn, touched, None)?;
        self.height.store(height, Ordering::Relaxed);
        self.entry_count.store(pairs.len() as u64, Ordering::Relaxed);
        debug!(tree = %self.name, entries = pairs.len(), height, "bulk load complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invariant checks (tests and repair tooling)
    // ------------------------------------------------------------------

    /// Walk the whole tree validating ordering, balanced depth, and leaf
    /// chaining. Expensive; test and repair use only.
    pub fn check_invariants(&self) -> Result<()> {
        let root = self.root();
        let mut leaf_depths = Vec::new();
        self.check_node(root, None, None, 1, &mut leaf_depths)?;
        if let (Some(min), Some(max)) =
            (leaf_depths.iter().min(), leaf_depths.iter().max())
        {
            if min != max {
                return Err(DbError::Internal(format!(
                    "leaves at unequal depth: {} vs {}",
                    min, max
                )));
            }
        }
        // leaf chain is ascending and covers every key
        let mut leaf = self.leftmost_leaf()?;
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let guard = self.pool.pin(leaf)?;
            let buf = guard.read();
            for i in 0..buf.slot_count() {
                let k = cell_key(buf.cell(i)).to_vec();
                if let Some(prev) = &last_key {
                    if *prev >= k {
                        return Err(DbError::Internal("leaf chain out of order".into()));
                    }
                }
                last_key = Some(k);
            }
            let next = buf.right_sibling();
            drop(buf);
            if next == INVALID_PAGE_ID {
                break;
            }
            leaf = next;
        }
        Ok(())
    }

    fn check_node(
        &self,
        page: PageId,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: u64,
        leaf_depths: &mut Vec<u64>,
    ) -> Result<()> {
        let guard = self.pool.pin(page)?;
        let buf = guard.read();
        match buf.kind() {
            PageKind::TreeLeaf => {
                for i in 0..buf.slot_count() {
                    let k = cell_key(buf.cell(i));
                    if let Some(lo) = lo {
                        if k < lo {
                            return Err(DbError::Internal("key below subtree range".into()));
                        }
                    }
                    if let Some(hi) = hi {
                        if k >= hi {
                            return Err(DbError::Internal("key above subtree range".into()));
                        }
                    }
                }
                leaf_depths.push(depth);
            }
            PageKind::TreeInternal => {
                let n = buf.slot_count();
                let mut children = Vec::new();
                for i in 0..n {
                    let child_lo = if i == 0 {
                        lo.map(|s| s.to_vec())
                    } else {
                        Some(cell_key(buf.cell(i)).to_vec())
                    };
                    let child_hi = if i + 1 < n {
                        Some(cell_key(buf.cell(i + 1)).to_vec())
                    } else {
                        hi.map(|s| s.to_vec())
                    };
                    children.push((child_at(&buf, i), child_lo, child_hi));
                }
                drop(buf);
                drop(guard);
                for (child, clo, chi) in children {
                    self.check_node(
                        child,
                        clo.as_deref(),
                        chi.as_deref(),
                        depth + 1,
                        leaf_depths,
                    )?;
                }
            }
            other => {
                return Err(DbError::CorruptPage {
                    page_id: page,
                    reason: format!("unexpected {:?} inside tree", other),
                })
            }
        }
        Ok(())
    }
}

// Page-file I/O.
//
// One DiskManager per page-structured file (`data/<table>.db`,
// `data/<table>.<index>.db`). Page 0 is the meta page; pages are read and
// written whole, checksummed at the page layer.

use crate::common::{FileId, PageId};
use crate::error::{DbError, Result};
use crate::storage::page::PageBuf;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct DiskManager {
    file_id: FileId,
    path: PathBuf,
    page_size: usize,
    file: Mutex<File>,
    page_count: Mutex<u32>,
}

impl DiskManager {
    /// Open or create a page file. A brand-new file has zero pages; the
    /// caller formats page 0 as the meta page.
    pub fn open(file_id: FileId, path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(DbError::Storage(format!(
                "{}: file length {} not page-aligned",
                path.display(),
                len
            )));
        }
        Ok(Self {
            file_id,
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(file),
            page_count: Mutex::new((len / page_size as u64) as u32),
        })
    }

    #[inline]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> u32 {
        *self.page_count.lock()
    }

    /// Read a page image and verify its checksum; torn writes surface as
    /// `CorruptPage` and are repaired from the WAL during recovery.
    pub fn read_page(&self, page_no: u32, page_id: PageId) -> Result<PageBuf> {
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
            file.read_exact(&mut buf)?;
        }
        let page = PageBuf::from_bytes(page_id, buf)?;
        page.verify(page_id)?;
        Ok(page)
    }

    /// Write a sealed page image in place.
    pub fn write_page(&self, page_no: u32, page: &PageBuf) -> Result<()> {
        debug_assert_eq!(page.page_size(), self.page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(page.data())?;
        Ok(())
    }

    /// Extend the file by one zero page; returns the new page number.
    pub fn extend(&self) -> Result<u32> {
        let mut count = self.page_count.lock();
        let page_no = *count;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(&vec![0u8; self.page_size])?;
        *count += 1;
        Ok(page_no)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Registry mapping file ids to their disk managers. Trees hold only ids;
/// the store owns the handles. File ids are assigned by the catalog when a
/// tree is created and stay stable across restarts so WAL page ids remain
/// meaningful.
pub struct PageStore {
    page_size: usize,
    files: parking_lot::RwLock<std::collections::HashMap<FileId, std::sync::Arc<DiskManager>>>,
}

impl PageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            files: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Open a page file and register it under its catalog-assigned id.
    pub fn register(&self, file_id: FileId, path: &Path) -> Result<()> {
        let mut files = self.files.write();
        if files.contains_key(&file_id) {
            return Err(DbError::Storage(format!(
                "file id {} already registered",
                file_id
            )));
        }
        files.insert(
            file_id,
            std::sync::Arc::new(DiskManager::open(file_id, path, self.page_size)?),
        );
        Ok(())
    }

    /// Drop the handle for a removed tree.
    pub fn unregister(&self, file_id: FileId) {
        self.files.write().remove(&file_id);
    }

    pub fn file(&self, file_id: FileId) -> Result<std::sync::Arc<DiskManager>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| DbError::Storage(format!("unknown file id {}", file_id)))
    }

    pub fn contains(&self, file_id: FileId) -> bool {
        self.files.read().contains_key(&file_id)
    }

    pub fn sync_all(&self) -> Result<()> {
        for f in self.files.read().values() {
            f.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::page_id;
    use crate::storage::page::PageKind;

    #[test]
    fn test_roundtrip_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let dm = DiskManager::open(0, &path, 4096).unwrap();
        assert_eq!(dm.page_count(), 0);

        let no = dm.extend().unwrap();
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        page.insert_cell(0, b"hello");
        page.seal();
        dm.write_page(no, &page).unwrap();

        let read = dm.read_page(no, page_id(0, no)).unwrap();
        assert_eq!(read.cell(0), b"hello");
    }

    #[test]
    fn test_torn_page_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let dm = DiskManager::open(0, &path, 4096).unwrap();
        let no = dm.extend().unwrap();
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        page.seal();
        dm.write_page(no, &page).unwrap();

        // corrupt a byte mid-page, bypassing the page layer
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(2048)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }
        assert!(matches!(
            dm.read_page(no, page_id(0, no)),
            Err(DbError::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_page_store_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(4096);
        store.register(3, &dir.path().join("a.db")).unwrap();
        store.register(7, &dir.path().join("b.db")).unwrap();
        assert!(store.file(3).is_ok());
        assert!(store.file(7).is_ok());
        assert!(store.file(99).is_err());
        assert!(store.register(3, &dir.path().join("c.db")).is_err());
    }
}

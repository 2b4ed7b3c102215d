//! Virtual filesystem interface consumed by the server, and an in-memory
//! implementation of it.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::state::FileId;

/// Opaque, filesystem-specific identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inode(Vec<u8>);

impl Inode {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Inode(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Stable file identity used by the open, lock and delegation tables.
    pub fn file_id(&self) -> FileId {
        FileId::new(self.0.clone())
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

/// Attributes of a filesystem object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub ftype: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub ino: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Filesystem usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsStat {
    pub total_space: u64,
    pub total_files: u64,
    pub used_space: u64,
    pub used_files: u64,
}

/// Identity on whose behalf an object is created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    pub uid: u32,
    pub gid: u32,
}

/// Backing filesystem as seen by the NFS server.
///
/// All failures are plain I/O errors; callers map them to protocol status.
#[async_trait]
pub trait VirtualFileSystem: Send + Sync {
    async fn lookup(&self, parent: &Inode, name: &str) -> io::Result<Inode>;
    async fn getattr(&self, inode: &Inode) -> io::Result<Stat>;
    async fn parent_of(&self, inode: &Inode) -> io::Result<Inode>;
    async fn fs_stat(&self) -> io::Result<FsStat>;
    async fn create(
        &self,
        parent: &Inode,
        ftype: FileType,
        name: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode>;
    async fn mkdir(&self, parent: &Inode, name: &str, subject: &Subject, mode: u32)
        -> io::Result<Inode>;
    /// Hard link `target` into `parent` as `name`.
    async fn link(
        &self,
        parent: &Inode,
        target: &Inode,
        name: &str,
        subject: &Subject,
    ) -> io::Result<Inode>;
    async fn symlink(
        &self,
        parent: &Inode,
        name: &str,
        target: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode>;
    async fn readlink(&self, inode: &Inode) -> io::Result<String>;
    async fn remove(&self, parent: &Inode, name: &str) -> io::Result<()>;
    /// Rename. Returns false if nothing changed.
    async fn move_entry(
        &self,
        src: &Inode,
        old_name: &str,
        dest: &Inode,
        new_name: &str,
    ) -> io::Result<bool>;
    async fn setattr(&self, inode: &Inode, stat: &Stat) -> io::Result<()>;
    async fn read(&self, inode: &Inode, offset: u64, count: u32) -> io::Result<Vec<u8>>;
    async fn write(&self, inode: &Inode, offset: u64, data: &[u8]) -> io::Result<u32>;
    async fn commit(&self, inode: &Inode, offset: u64, count: u32) -> io::Result<()>;
}

const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    stat: Stat,
    parent: u64,
    data: Vec<u8>,
    children: HashMap<String, u64>,
    link_target: Option<String>,
}

impl InodeEntry {
    fn new(ino: u64, parent: u64, ftype: FileType, subject: &Subject, mode: u32) -> Self {
        let now = SystemTime::now();
        InodeEntry {
            stat: Stat {
                ftype,
                mode,
                nlink: if ftype == FileType::Directory { 2 } else { 1 },
                uid: subject.uid,
                gid: subject.gid,
                size: 0,
                ino,
                atime: now,
                mtime: now,
                ctime: now,
            },
            parent,
            data: Vec::new(),
            children: HashMap::new(),
            link_target: None,
        }
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        self.stat.mtime = now;
        self.stat.ctime = now;
    }
}

fn not_found() -> io::Error {
    io::Error::new(ErrorKind::NotFound, "no such file or directory")
}

fn not_dir() -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, "not a directory")
}

/// Filesystem kept entirely in memory. Inode ids are 8-byte big-endian
/// inode numbers; the root is inode 1.
pub struct MemoryFs {
    inodes: RwLock<HashMap<u64, InodeEntry>>,
    next_ino: AtomicU64,
    total_space: u64,
}

impl MemoryFs {
    pub fn new(total_space: u64) -> Self {
        let root = InodeEntry::new(
            ROOT_INO,
            ROOT_INO,
            FileType::Directory,
            &Subject::default(),
            0o755,
        );
        MemoryFs {
            inodes: RwLock::new([(ROOT_INO, root)].into()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            total_space,
        }
    }

    pub fn root(&self) -> Inode {
        Self::inode(ROOT_INO)
    }

    fn inode(ino: u64) -> Inode {
        Inode::new(ino.to_be_bytes().to_vec())
    }

    fn ino(inode: &Inode) -> io::Result<u64> {
        let bytes: [u8; 8] = inode
            .as_bytes()
            .try_into()
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "bad inode"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn add_entry(
        &self,
        parent: &Inode,
        name: &str,
        ftype: FileType,
        subject: &Subject,
        mode: u32,
        link_target: Option<String>,
    ) -> io::Result<Inode> {
        let parent_ino = Self::ino(parent)?;
        let mut inodes = self.inodes.write();
        let dir = inodes.get_mut(&parent_ino).ok_or_else(not_found)?;
        if dir.stat.ftype != FileType::Directory {
            return Err(not_dir());
        }
        if dir.children.contains_key(name) {
            return Err(io::Error::new(ErrorKind::AlreadyExists, name.to_string()));
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        dir.children.insert(name.to_string(), ino);
        if ftype == FileType::Directory {
            dir.stat.nlink += 1;
        }
        dir.touch();

        let mut entry = InodeEntry::new(ino, parent_ino, ftype, subject, mode);
        if let Some(target) = link_target {
            entry.stat.size = target.len() as u64;
            entry.link_target = Some(target);
        }
        inodes.insert(ino, entry);
        Ok(Self::inode(ino))
    }
}

#[async_trait]
impl VirtualFileSystem for MemoryFs {
    async fn lookup(&self, parent: &Inode, name: &str) -> io::Result<Inode> {
        let parent_ino = Self::ino(parent)?;
        let inodes = self.inodes.read();
        let dir = inodes.get(&parent_ino).ok_or_else(not_found)?;
        if dir.stat.ftype != FileType::Directory {
            return Err(not_dir());
        }
        match name {
            "." => Ok(parent.clone()),
            ".." => Ok(Self::inode(dir.parent)),
            _ => dir
                .children
                .get(name)
                .map(|ino| Self::inode(*ino))
                .ok_or_else(not_found),
        }
    }

    async fn getattr(&self, inode: &Inode) -> io::Result<Stat> {
        let ino = Self::ino(inode)?;
        self.inodes
            .read()
            .get(&ino)
            .map(|e| e.stat.clone())
            .ok_or_else(not_found)
    }

    async fn parent_of(&self, inode: &Inode) -> io::Result<Inode> {
        let ino = Self::ino(inode)?;
        self.inodes
            .read()
            .get(&ino)
            .map(|e| Self::inode(e.parent))
            .ok_or_else(not_found)
    }

    async fn fs_stat(&self) -> io::Result<FsStat> {
        let inodes = self.inodes.read();
        Ok(FsStat {
            total_space: self.total_space,
            total_files: u64::MAX,
            used_space: inodes.values().map(|e| e.data.len() as u64).sum(),
            used_files: inodes.len() as u64,
        })
    }

    async fn create(
        &self,
        parent: &Inode,
        ftype: FileType,
        name: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        self.add_entry(parent, name, ftype, subject, mode, None)
    }

    async fn mkdir(
        &self,
        parent: &Inode,
        name: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        self.add_entry(parent, name, FileType::Directory, subject, mode, None)
    }

    async fn link(
        &self,
        parent: &Inode,
        target: &Inode,
        name: &str,
        _subject: &Subject,
    ) -> io::Result<Inode> {
        let parent_ino = Self::ino(parent)?;
        let target_ino = Self::ino(target)?;
        let mut inodes = self.inodes.write();

        match inodes.get(&target_ino) {
            Some(e) if e.stat.ftype == FileType::Directory => {
                return Err(io::Error::new(
                    ErrorKind::PermissionDenied,
                    "hard link to directory",
                ))
            }
            Some(_) => {}
            None => return Err(not_found()),
        }

        let dir = inodes.get_mut(&parent_ino).ok_or_else(not_found)?;
        if dir.stat.ftype != FileType::Directory {
            return Err(not_dir());
        }
        if dir.children.contains_key(name) {
            return Err(io::Error::new(ErrorKind::AlreadyExists, name.to_string()));
        }
        dir.children.insert(name.to_string(), target_ino);
        dir.touch();

        if let Some(entry) = inodes.get_mut(&target_ino) {
            entry.stat.nlink += 1;
            entry.stat.ctime = SystemTime::now();
        }
        Ok(target.clone())
    }

    async fn symlink(
        &self,
        parent: &Inode,
        name: &str,
        target: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        self.add_entry(
            parent,
            name,
            FileType::Symlink,
            subject,
            mode,
            Some(target.to_string()),
        )
    }

    async fn readlink(&self, inode: &Inode) -> io::Result<String> {
        let ino = Self::ino(inode)?;
        let inodes = self.inodes.read();
        let entry = inodes.get(&ino).ok_or_else(not_found)?;
        entry
            .link_target
            .clone()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "not a symlink"))
    }

    async fn remove(&self, parent: &Inode, name: &str) -> io::Result<()> {
        let parent_ino = Self::ino(parent)?;
        let mut inodes = self.inodes.write();
        let child = {
            let dir = inodes.get(&parent_ino).ok_or_else(not_found)?;
            *dir.children.get(name).ok_or_else(not_found)?
        };
        let is_dir = match inodes.get(&child) {
            Some(e) if e.stat.ftype == FileType::Directory => {
                if !e.children.is_empty() {
                    return Err(io::Error::new(ErrorKind::Other, "directory not empty"));
                }
                true
            }
            Some(_) => false,
            None => return Err(not_found()),
        };

        if let Some(dir) = inodes.get_mut(&parent_ino) {
            dir.children.remove(name);
            if is_dir {
                dir.stat.nlink -= 1;
            }
            dir.touch();
        }

        let drop_inode = match inodes.get_mut(&child) {
            Some(e) if !is_dir && e.stat.nlink > 1 => {
                e.stat.nlink -= 1;
                e.stat.ctime = SystemTime::now();
                false
            }
            _ => true,
        };
        if drop_inode {
            inodes.remove(&child);
        }
        Ok(())
    }

    async fn move_entry(
        &self,
        src: &Inode,
        old_name: &str,
        dest: &Inode,
        new_name: &str,
    ) -> io::Result<bool> {
        let src_ino = Self::ino(src)?;
        let dest_ino = Self::ino(dest)?;
        if src_ino == dest_ino && old_name == new_name {
            return Ok(false);
        }

        let mut inodes = self.inodes.write();
        match inodes.get(&dest_ino) {
            Some(d) if d.stat.ftype != FileType::Directory => return Err(not_dir()),
            Some(d) if d.children.contains_key(new_name) => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    new_name.to_string(),
                ))
            }
            Some(_) => {}
            None => return Err(not_found()),
        }

        let child = {
            let dir = inodes.get_mut(&src_ino).ok_or_else(not_found)?;
            let child = dir.children.remove(old_name).ok_or_else(not_found)?;
            dir.touch();
            child
        };
        if let Some(dir) = inodes.get_mut(&dest_ino) {
            dir.children.insert(new_name.to_string(), child);
            dir.touch();
        }
        if let Some(entry) = inodes.get_mut(&child) {
            entry.parent = dest_ino;
            entry.stat.ctime = SystemTime::now();
        }
        Ok(true)
    }

    async fn setattr(&self, inode: &Inode, stat: &Stat) -> io::Result<()> {
        let ino = Self::ino(inode)?;
        let mut inodes = self.inodes.write();
        let entry = inodes.get_mut(&ino).ok_or_else(not_found)?;
        entry.stat.mode = stat.mode;
        entry.stat.uid = stat.uid;
        entry.stat.gid = stat.gid;
        entry.stat.atime = stat.atime;
        entry.stat.mtime = stat.mtime;
        if entry.stat.ftype == FileType::Regular && stat.size != entry.stat.size {
            entry.data.resize(stat.size as usize, 0);
            entry.stat.size = stat.size;
        }
        entry.stat.ctime = SystemTime::now();
        Ok(())
    }

    async fn read(&self, inode: &Inode, offset: u64, count: u32) -> io::Result<Vec<u8>> {
        let ino = Self::ino(inode)?;
        let inodes = self.inodes.read();
        let entry = inodes.get(&ino).ok_or_else(not_found)?;
        if entry.stat.ftype != FileType::Regular {
            return Err(io::Error::new(ErrorKind::InvalidInput, "not a regular file"));
        }
        let start = (offset as usize).min(entry.data.len());
        let end = (start + count as usize).min(entry.data.len());
        Ok(entry.data[start..end].to_vec())
    }

    async fn write(&self, inode: &Inode, offset: u64, data: &[u8]) -> io::Result<u32> {
        let ino = Self::ino(inode)?;
        let mut inodes = self.inodes.write();
        let entry = inodes.get_mut(&ino).ok_or_else(not_found)?;
        if entry.stat.ftype != FileType::Regular {
            return Err(io::Error::new(ErrorKind::InvalidInput, "not a regular file"));
        }
        let offset = offset as usize;
        if offset + data.len() > entry.data.len() {
            entry.data.resize(offset + data.len(), 0);
        }
        entry.data[offset..offset + data.len()].copy_from_slice(data);
        entry.stat.size = entry.data.len() as u64;
        entry.touch();
        Ok(data.len() as u32)
    }

    async fn commit(&self, inode: &Inode, _offset: u64, _count: u32) -> io::Result<()> {
        let ino = Self::ino(inode)?;
        if self.inodes.read().contains_key(&ino) {
            Ok(())
        } else {
            Err(not_found())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Subject {
        Subject { uid: 100, gid: 100 }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let fs = MemoryFs::new(1 << 30);
        let root = fs.root();
        let file = fs
            .create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();
        assert_eq!(fs.lookup(&root, "a").await.unwrap(), file);
        assert_eq!(fs.parent_of(&file).await.unwrap(), root);

        let stat = fs.getattr(&file).await.unwrap();
        assert_eq!(stat.ftype, FileType::Regular);
        assert_eq!(stat.uid, 100);
        assert_eq!(stat.mode, 0o644);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let fs = MemoryFs::new(0);
        let err = fs.lookup(&fs.root(), "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_create_existing() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        fs.mkdir(&root, "d", &subject(), 0o755).await.unwrap();
        let err = fs.mkdir(&root, "d", &subject(), 0o755).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_mkdir_updates_nlink() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        fs.mkdir(&root, "d", &subject(), 0o755).await.unwrap();
        assert_eq!(fs.getattr(&root).await.unwrap().nlink, 3);
    }

    #[tokio::test]
    async fn test_link_and_remove() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let file = fs
            .create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();
        let linked = fs.link(&root, &file, "b", &subject()).await.unwrap();
        assert_eq!(linked, file);
        assert_eq!(fs.getattr(&file).await.unwrap().nlink, 2);

        fs.remove(&root, "a").await.unwrap();
        assert_eq!(fs.getattr(&file).await.unwrap().nlink, 1);
        fs.remove(&root, "b").await.unwrap();
        assert!(fs.getattr(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_non_empty_dir() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let dir = fs.mkdir(&root, "d", &subject(), 0o755).await.unwrap();
        fs.create(&dir, FileType::Regular, "f", &subject(), 0o644)
            .await
            .unwrap();
        assert!(fs.remove(&root, "d").await.is_err());
    }

    #[tokio::test]
    async fn test_symlink_readlink() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let link = fs
            .symlink(&root, "l", "/target", &subject(), 0o777)
            .await
            .unwrap();
        assert_eq!(fs.readlink(&link).await.unwrap(), "/target");
        assert_eq!(fs.getattr(&link).await.unwrap().ftype, FileType::Symlink);
    }

    #[tokio::test]
    async fn test_move_entry() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let dir = fs.mkdir(&root, "d", &subject(), 0o755).await.unwrap();
        let file = fs
            .create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();

        assert!(!fs.move_entry(&root, "a", &root, "a").await.unwrap());
        assert!(fs.move_entry(&root, "a", &dir, "b").await.unwrap());
        assert_eq!(fs.lookup(&dir, "b").await.unwrap(), file);
        assert!(fs.lookup(&root, "a").await.is_err());
        assert_eq!(fs.parent_of(&file).await.unwrap(), dir);
    }

    #[tokio::test]
    async fn test_read_write() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let file = fs
            .create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();
        assert_eq!(fs.write(&file, 4, b"data").await.unwrap(), 4);
        assert_eq!(fs.read(&file, 0, 100).await.unwrap(), b"\0\0\0\0data");
        assert_eq!(fs.read(&file, 100, 10).await.unwrap(), Vec::<u8>::new());
        assert_eq!(fs.getattr(&file).await.unwrap().size, 8);
        fs.commit(&file, 0, 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_setattr_truncates() {
        let fs = MemoryFs::new(0);
        let root = fs.root();
        let file = fs
            .create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();
        fs.write(&file, 0, b"abcdef").await.unwrap();
        let mut stat = fs.getattr(&file).await.unwrap();
        stat.size = 2;
        stat.mode = 0o600;
        fs.setattr(&file, &stat).await.unwrap();
        let stat = fs.getattr(&file).await.unwrap();
        assert_eq!(stat.size, 2);
        assert_eq!(stat.mode, 0o600);
    }

    #[tokio::test]
    async fn test_fs_stat() {
        let fs = MemoryFs::new(1000);
        let root = fs.root();
        fs.create(&root, FileType::Regular, "a", &subject(), 0o644)
            .await
            .unwrap();
        let st = fs.fs_stat().await.unwrap();
        assert_eq!(st.total_space, 1000);
        assert_eq!(st.used_files, 2);
    }

    #[test]
    fn test_inode_file_id() {
        let inode = Inode::new(vec![0, 1]);
        assert_eq!(inode.file_id(), FileId::new(vec![0, 1]));
        assert_eq!(inode.to_string(), "0001");
    }
}

/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! File orchestration.
//!
//! [`Hfive`] ties the structural layers together: it creates or opens a
//! file, resolves paths through groups and links, routes operations to the
//! attribute, link and dataset engines, and rewrites the superblock last on
//! every flush so the recorded end of file always points at acknowledged
//! data.

use crate::attribute;
use crate::btree1::BtreeV1;
use crate::btree1::CHUNK_NODE_CAPACITY;
use crate::btree1::NODE_TYPE_CHUNK;
use crate::dataset;
use crate::dataset::CancelToken;
use crate::dataset::ChunkIterator;
use crate::dataset::DatasetOptions;
use crate::datatype::Datatype;
use crate::error::Error;
use crate::error::Result;
use crate::io::FileStorage;
use crate::io::MemStorage;
use crate::io::Storage;
use crate::link;
use crate::link::MAX_LINK_DEPTH;
use crate::message::Attribute;
use crate::message::Dataspace;
use crate::message::Layout;
use crate::message::Link;
use crate::message::LinkTarget;
use crate::object_header::HeaderVersion;
use crate::object_header::ObjectHeader;
use crate::superblock::Superblock;
use crate::superblock::SuperblockVersion;
use log::debug;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

/// File creation mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreateMode {
    /// Overwrite the file if it exists.
    Truncate,
    /// Fail if the file exists.
    Exclusive,
}

/// File open mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Reading only.
    ReadOnly,
    /// Reading and writing.
    ReadWrite,
}

/// File-level options.
#[derive(Clone, Copy, Debug)]
pub struct FileOptions {
    /// Superblock layout to write.
    pub superblock_version: SuperblockVersion,
    /// Rebalance dense B-trees on every deletion. When disabled, deletions
    /// defer to an explicit rebalance call.
    pub btree_rebalancing: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            superblock_version: SuperblockVersion::default(),
            btree_rebalancing: true,
        }
    }
}

/// Resolution result: the object lives here or in another file.
enum Place {
    /// Object header address in this file.
    Local(u64),
    /// The path continues in an external file.
    External {
        /// Name of the external file.
        file: String,
        /// Remaining absolute path within it.
        path: String,
    },
}

/// An open file.
pub struct Hfive {
    /// The underlying storage.
    storage: Box<dyn Storage>,
    /// The superblock, rewritten on flush.
    superblock: Superblock,
    /// Object header layout matching the superblock version.
    header_version: HeaderVersion,
    /// Whether mutating operations are allowed.
    writable: bool,
    /// Whether deletions rebalance dense B-trees immediately.
    rebalancing: bool,
    /// Directory external file names resolve against.
    base_dir: Option<PathBuf>,
    /// External files, cached by joined path.
    externals: HashMap<PathBuf, Hfive>,
    /// Count of external hops leading to this instance.
    ext_depth: usize,
}

impl Hfive {
    /// Creates a file at `path`.
    pub fn create(path: impl AsRef<Path>, mode: CreateMode, options: FileOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut open = OpenOptions::new();
        open.read(true).write(true);
        match mode {
            CreateMode::Truncate => open.create(true).truncate(true),
            CreateMode::Exclusive => open.create_new(true),
        };
        let file = open.open(path).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                Error::AlreadyExists(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let storage = Box::new(FileStorage::new(file, 0));
        let base_dir = path.parent().map(Path::to_path_buf);
        Self::create_on(storage, options, base_dir)
    }

    /// Creates a file over an in-memory buffer.
    pub fn create_memory(options: FileOptions) -> Result<Self> {
        Self::create_on(Box::new(MemStorage::new()), options, None)
    }

    /// Initializes a fresh file on `storage`: root group, then superblock.
    fn create_on(
        mut storage: Box<dyn Storage>,
        options: FileOptions,
        base_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let header_version = match options.superblock_version {
            SuperblockVersion::V0 => HeaderVersion::V1,
            SuperblockVersion::V2 => HeaderVersion::V2,
        };
        storage.set_eof(options.superblock_version.size());
        let root = link::create_group_object(storage.as_mut(), header_version)?;
        let (root_btree_addr, root_heap_addr) = root.symbol_table().unwrap();

        let superblock = Superblock {
            version: options.superblock_version,
            eof: storage.eof(),
            root_oh_addr: root.addr,
            root_btree_addr,
            root_heap_addr,
        };
        superblock.write(storage.as_mut())?;
        debug!("file created, root object at {:#x}", root.addr);
        Ok(Self {
            storage,
            superblock,
            header_version,
            writable: true,
            rebalancing: options.btree_rebalancing,
            base_dir,
            externals: HashMap::new(),
            ext_depth: 0,
        })
    }

    /// Opens the file at `path`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let writable = mode == OpenMode::ReadWrite;
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let storage = Box::new(FileStorage::new(file, 0));
        let base_dir = path.parent().map(Path::to_path_buf);
        Self::open_on(storage, writable, base_dir)
    }

    /// Opens a file whose content lives on `storage`.
    fn open_on(
        mut storage: Box<dyn Storage>,
        writable: bool,
        base_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let superblock = Superblock::load(storage.as_mut())?;
        // Allocation resumes at the recorded end of file
        storage.set_eof(superblock.eof);
        let header_version = match superblock.version {
            SuperblockVersion::V0 => HeaderVersion::V1,
            SuperblockVersion::V2 => HeaderVersion::V2,
        };
        Ok(Self {
            storage,
            superblock,
            header_version,
            writable,
            rebalancing: true,
            base_dir,
            externals: HashMap::new(),
            ext_depth: 0,
        })
    }

    /// Establishes a durability point: data first, then the superblock with
    /// the new end-of-file address.
    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()?;
        self.superblock.eof = self.storage.eof();
        self.superblock.write(self.storage.as_mut())?;
        self.storage.flush()
    }

    /// Flushes and closes the file.
    pub fn close(mut self) -> Result<()> {
        if self.writable {
            self.flush()?;
        }
        Ok(())
    }

    /// Defers dense B-tree rebalancing until an explicit rebalance call.
    pub fn disable_rebalancing(&mut self) {
        self.rebalancing = false;
    }

    /// Restores rebalancing on every deletion.
    pub fn enable_rebalancing(&mut self) {
        self.rebalancing = true;
    }

    /// Checks that the file accepts mutations.
    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidArgument("file is open read-only".into()));
        }
        Ok(())
    }

    /// Loads the object header at `addr`.
    fn load_oh(&mut self, addr: u64) -> Result<ObjectHeader> {
        ObjectHeader::load(self.storage.as_mut(), addr)
    }

    /// Resolves `path` to a place, following soft and external links.
    fn walk(&mut self, path: &str, depth: usize, visited: &mut Vec<String>) -> Result<Place> {
        if depth > MAX_LINK_DEPTH {
            return Err(Error::LinkCycle(format!("`{path}` exceeds the link depth bound")));
        }
        link::validate_path(path)?;
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = self.superblock.root_oh_addr;
        for (i, comp) in comps.iter().enumerate() {
            let oh = self.load_oh(current)?;
            let found = link::find_link(self.storage.as_mut(), &oh, comp)?;
            let Some(found) = found else {
                return Err(if i + 1 == comps.len() {
                    Error::NotFound(path.into())
                } else {
                    Error::ParentMissing(format!("`{comp}` while resolving `{path}`"))
                });
            };
            match found.target {
                LinkTarget::Hard(addr) => current = addr,
                LinkTarget::Soft(target) => {
                    if visited.contains(&target) {
                        return Err(Error::LinkCycle(target));
                    }
                    visited.push(target.clone());
                    match self.walk(&target, depth + 1, visited)? {
                        Place::Local(addr) => current = addr,
                        Place::External {
                            file,
                            path: ext_path,
                        } => {
                            return Ok(Place::External {
                                file,
                                path: join_rest(&ext_path, &comps[i + 1..]),
                            });
                        }
                    }
                }
                LinkTarget::External {
                    file,
                    path: ext_path,
                } => {
                    return Ok(Place::External {
                        file,
                        path: join_rest(&ext_path, &comps[i + 1..]),
                    });
                }
            }
        }
        Ok(Place::Local(current))
    }

    /// Resolves `path` within this file, rejecting external targets.
    fn resolve_local(&mut self, path: &str) -> Result<u64> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => Ok(addr),
            Place::External { .. } => Err(Error::Unsupported(format!(
                "mutating `{path}` through an external link"
            ))),
        }
    }

    /// Returns the resolved object header address of `path`.
    pub fn resolve_addr(&mut self, path: &str) -> Result<u64> {
        self.resolve_local(path)
    }

    /// Opens (or returns the cached) external file `name`.
    fn external_file(&mut self, name: &str) -> Result<&mut Hfive> {
        if name.contains("..") {
            return Err(Error::format(
                "external link",
                0,
                "a file name without `..`",
                name,
            ));
        }
        let Some(base) = &self.base_dir else {
            return Err(Error::Unsupported(
                "external links from a file without a directory".into(),
            ));
        };
        if self.ext_depth >= MAX_LINK_DEPTH {
            return Err(Error::LinkCycle(format!("external chain through `{name}`")));
        }
        let key = base.join(name);
        if !self.externals.contains_key(&key) {
            let mut ext = Hfive::open(&key, OpenMode::ReadOnly)?;
            ext.ext_depth = self.ext_depth + 1;
            self.externals.insert(key.clone(), ext);
        }
        Ok(self.externals.get_mut(&key).unwrap())
    }

    /// Resolves the parent group of `path` and the final component.
    fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u64, &'p str)> {
        let (parent, name) = link::split_path(path)?;
        let addr = match self.walk(parent, 0, &mut Vec::new()) {
            Ok(Place::Local(addr)) => addr,
            Ok(Place::External { .. }) => {
                return Err(Error::Unsupported(format!(
                    "mutating `{path}` through an external link"
                )));
            }
            Err(Error::NotFound(p)) => return Err(Error::ParentMissing(p)),
            Err(e) => return Err(e),
        };
        Ok((addr, name))
    }

    /// Inserts a hard link to a fresh object into the parent of `path`.
    fn link_new_object(&mut self, path: &str, target_addr: u64) -> Result<()> {
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.load_oh(parent_addr)?;
        link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::Hard(target_addr),
            },
        )
    }

    /// Creates an empty group at `path`.
    pub fn create_group(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.load_oh(parent_addr)?;
        if link::find_link(self.storage.as_mut(), &parent, name)?.is_some() {
            return Err(Error::AlreadyExists(path.into()));
        }
        let group = link::create_group_object(self.storage.as_mut(), self.header_version)?;
        link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::Hard(group.addr),
            },
        )
    }

    /// Creates a dataset at `path`.
    pub fn create_dataset(
        &mut self,
        path: &str,
        datatype: Datatype,
        dataspace: Dataspace,
        options: &DatasetOptions,
    ) -> Result<()> {
        self.check_writable()?;
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.load_oh(parent_addr)?;
        if link::find_link(self.storage.as_mut(), &parent, name)?.is_some() {
            return Err(Error::AlreadyExists(path.into()));
        }
        let oh = dataset::create_dataset_object(
            self.storage.as_mut(),
            self.header_version,
            datatype,
            dataspace,
            options,
        )?;
        link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::Hard(oh.addr),
            },
        )
    }

    /// Writes the whole content of the dataset at `path`.
    pub fn write_dataset(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let mut oh = self.load_oh(addr)?;
        dataset::write(self.storage.as_mut(), &mut oh, data)
    }

    /// Writes one chunk of the chunked dataset at `path`.
    ///
    /// `coords` are chunk-grid coordinates and `tile` a full pre-filter
    /// chunk.
    pub fn write_chunk(&mut self, path: &str, coords: &[u64], tile: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let mut oh = self.load_oh(addr)?;
        dataset::write_chunk(self.storage.as_mut(), &mut oh, coords, tile)
    }

    /// Reads the whole content of the dataset at `path`.
    pub fn read_dataset(&mut self, path: &str) -> Result<Vec<u8>> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => {
                let oh = self.load_oh(addr)?;
                dataset::read(self.storage.as_mut(), &oh)
            }
            Place::External {
                file,
                path,
            } => self.external_file(&file)?.read_dataset(&path),
        }
    }

    /// Returns the datatype and dataspace of the dataset at `path`.
    pub fn dataset_shape(&mut self, path: &str) -> Result<(Datatype, Dataspace)> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => {
                let oh = self.load_oh(addr)?;
                let ds = dataset::Dataset::from_header(&oh)?;
                Ok((ds.datatype, ds.dataspace))
            }
            Place::External {
                file,
                path,
            } => self.external_file(&file)?.dataset_shape(&path),
        }
    }

    /// Builds a streaming iterator over the chunks of the dataset at `path`.
    pub fn chunk_iterator(&mut self, path: &str, cancel: CancelToken) -> Result<ChunkIterator<'_>> {
        let addr = self.resolve_local(path)?;
        let oh = self.load_oh(addr)?;
        ChunkIterator::new(self.storage.as_mut(), &oh, cancel)
    }

    /// Number of chunks currently stored for the dataset at `path`.
    pub fn chunk_count(&mut self, path: &str) -> Result<usize> {
        let addr = self.resolve_local(path)?;
        let oh = self.load_oh(addr)?;
        let ds = dataset::Dataset::from_header(&oh)?;
        let Layout::Chunked {
            btree_addr,
            dims,
            ..
        } = &ds.layout
        else {
            return Err(Error::InvalidArgument(format!("`{path}` is not chunked")));
        };
        let btree = BtreeV1::open(
            *btree_addr,
            NODE_TYPE_CHUNK,
            8 + (dims.len() + 1) * 8,
            CHUNK_NODE_CAPACITY,
        );
        Ok(btree.records(self.storage.as_mut())?.len())
    }

    /// On-disk locations `(address, size)` of the chunks of the dataset at
    /// `path`, in key order.
    pub fn chunk_locations(&mut self, path: &str) -> Result<Vec<(u64, u64)>> {
        let addr = self.resolve_local(path)?;
        let oh = self.load_oh(addr)?;
        let ds = dataset::Dataset::from_header(&oh)?;
        let Layout::Chunked {
            btree_addr,
            dims,
            ..
        } = &ds.layout
        else {
            return Err(Error::InvalidArgument(format!("`{path}` is not chunked")));
        };
        let btree = BtreeV1::open(
            *btree_addr,
            NODE_TYPE_CHUNK,
            8 + (dims.len() + 1) * 8,
            CHUNK_NODE_CAPACITY,
        );
        let records = btree.records(self.storage.as_mut())?;
        Ok(records
            .into_iter()
            .map(|(key, addr)| {
                (addr, u32::from_le_bytes(key[0..4].try_into().unwrap()) as u64)
            })
            .collect())
    }

    /// Writes a new attribute on the object at `path`.
    pub fn write_attribute(&mut self, path: &str, attr: Attribute) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let mut oh = self.load_oh(addr)?;
        attribute::write(self.storage.as_mut(), &mut oh, attr)
    }

    /// Replaces the value of an existing attribute on the object at `path`.
    pub fn modify_attribute(&mut self, path: &str, attr: Attribute) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let mut oh = self.load_oh(addr)?;
        attribute::modify(self.storage.as_mut(), &mut oh, attr)
    }

    /// Deletes the attribute `name` of the object at `path`.
    pub fn delete_attribute(&mut self, path: &str, name: &str) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let mut oh = self.load_oh(addr)?;
        attribute::delete(self.storage.as_mut(), &mut oh, name, self.rebalancing)
    }

    /// Reads the attribute `name` of the object at `path`.
    pub fn read_attribute(&mut self, path: &str, name: &str) -> Result<Attribute> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => {
                let oh = self.load_oh(addr)?;
                attribute::read(self.storage.as_mut(), &oh, name)
            }
            Place::External {
                file,
                path,
            } => self.external_file(&file)?.read_attribute(&path, name),
        }
    }

    /// Lists the attribute names of the object at `path`, sorted.
    pub fn list_attributes(&mut self, path: &str) -> Result<Vec<String>> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => {
                let oh = self.load_oh(addr)?;
                attribute::list(self.storage.as_mut(), &oh)
            }
            Place::External {
                file,
                path,
            } => self.external_file(&file)?.list_attributes(&path),
        }
    }

    /// Tells whether the object at `path` stores its attributes densely.
    pub fn attribute_storage_is_dense(&mut self, path: &str) -> Result<bool> {
        let addr = self.resolve_local(path)?;
        Ok(self.load_oh(addr)?.attribute_info().is_some())
    }

    /// Tells whether the group at `path` stores its links densely.
    pub fn link_storage_is_dense(&mut self, path: &str) -> Result<bool> {
        let addr = self.resolve_local(path)?;
        Ok(self.load_oh(addr)?.link_info().is_some())
    }

    /// Lists the link names of the group at `path`, sorted.
    pub fn list_links(&mut self, path: &str) -> Result<Vec<String>> {
        match self.walk(path, 0, &mut Vec::new())? {
            Place::Local(addr) => {
                let oh = self.load_oh(addr)?;
                let links = link::list_links(self.storage.as_mut(), &oh)?;
                Ok(links.into_iter().map(|l| l.name).collect())
            }
            Place::External {
                file,
                path,
            } => self.external_file(&file)?.list_links(&path),
        }
    }

    /// Returns the reference count of the object at `path`.
    pub fn refcount(&mut self, path: &str) -> Result<u32> {
        let addr = self.resolve_local(path)?;
        Ok(self.load_oh(addr)?.refcount)
    }

    /// Creates a hard link at `link_path` to the object at `target_path`.
    ///
    /// The target's reference count is incremented; the increment is rolled
    /// back if the link cannot be inserted.
    pub fn hard_link(&mut self, target_path: &str, link_path: &str) -> Result<()> {
        self.check_writable()?;
        let target_addr = self.resolve_local(target_path)?;
        let (parent_addr, name) = self.resolve_parent(link_path)?;

        let mut target = self.load_oh(target_addr)?;
        target.refcount += 1;
        target.rewrite(self.storage.as_mut())?;

        let mut parent = self.load_oh(parent_addr)?;
        let inserted = link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::Hard(target_addr),
            },
        );
        if inserted.is_err() {
            target.refcount -= 1;
            target.rewrite(self.storage.as_mut())?;
        }
        inserted
    }

    /// Creates a soft link at `link_path` to the absolute `target_path`.
    ///
    /// A dangling target is legal.
    pub fn soft_link(&mut self, target_path: &str, link_path: &str) -> Result<()> {
        self.check_writable()?;
        link::validate_path(target_path)?;
        let (parent_addr, name) = self.resolve_parent(link_path)?;
        let mut parent = self.load_oh(parent_addr)?;
        link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::Soft(target_path.into()),
            },
        )
    }

    /// Creates an external link at `link_path` to `target_path` inside the
    /// file named `file`.
    pub fn external_link(&mut self, file: &str, target_path: &str, link_path: &str) -> Result<()> {
        self.check_writable()?;
        if file.is_empty() || file.contains("..") {
            return Err(Error::InvalidArgument(format!(
                "external file name `{file}` is empty or escapes with `..`"
            )));
        }
        link::validate_path(target_path)?;
        let (parent_addr, name) = self.resolve_parent(link_path)?;
        let mut parent = self.load_oh(parent_addr)?;
        link::insert_link(
            self.storage.as_mut(),
            &mut parent,
            Link {
                name: name.into(),
                corder: 0,
                target: LinkTarget::External {
                    file: file.into(),
                    path: target_path.into(),
                },
            },
        )
    }

    /// Removes the link at `path`.
    ///
    /// A removed hard link decrements the target's reference count; a target
    /// reaching zero stays allocated but unreferenced.
    pub fn delete_link(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let (parent_addr, name) = self.resolve_parent(path)?;
        let mut parent = self.load_oh(parent_addr)?;
        let removed =
            link::remove_link(self.storage.as_mut(), &mut parent, name, self.rebalancing)?;
        if let LinkTarget::Hard(addr) = removed.target {
            let mut target = self.load_oh(addr)?;
            target.refcount = target.refcount.saturating_sub(1);
            target.rewrite(self.storage.as_mut())?;
            if target.refcount == 0 {
                debug!("object at {addr:#x} is now unreferenced");
            }
        }
        Ok(())
    }

    /// Rebalances the dense attribute index of the object at `path`.
    pub fn rebalance_attribute_btree(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let oh = self.load_oh(addr)?;
        attribute::rebalance(self.storage.as_mut(), &oh)
    }

    /// Rebalances the dense link index of the group at `path`.
    pub fn rebalance_link_btree(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let addr = self.resolve_local(path)?;
        let oh = self.load_oh(addr)?;
        link::rebalance(self.storage.as_mut(), &oh)
    }

    /// Rebalances every dense index reachable from the root group.
    pub fn rebalance_all_btrees(&mut self) -> Result<()> {
        self.check_writable()?;
        let mut visited = HashSet::new();
        self.rebalance_walk(self.superblock.root_oh_addr, &mut visited)
    }

    /// Depth-first rebalance over the hard-link graph.
    fn rebalance_walk(&mut self, addr: u64, visited: &mut HashSet<u64>) -> Result<()> {
        if !visited.insert(addr) {
            return Ok(());
        }
        let oh = self.load_oh(addr)?;
        attribute::rebalance(self.storage.as_mut(), &oh)?;
        let is_group = oh.symbol_table().is_some() || oh.link_info().is_some();
        if !is_group {
            return Ok(());
        }
        link::rebalance(self.storage.as_mut(), &oh)?;
        for l in link::list_links(self.storage.as_mut(), &oh)? {
            if let LinkTarget::Hard(child) = l.target {
                self.rebalance_walk(child, visited)?;
            }
        }
        Ok(())
    }
}

/// Joins the already-resolved external path with the remaining components.
fn join_rest(ext_path: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        ext_path.to_owned()
    } else if ext_path == "/" {
        format!("/{}", rest.join("/"))
    } else {
        format!("{ext_path}/{}", rest.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Hfive {
        Hfive::create_memory(FileOptions::default()).unwrap()
    }

    fn scalar_i32(name: &str, value: i32) -> Attribute {
        Attribute {
            name: name.into(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::scalar(),
            data: value.to_le_bytes().to_vec(),
        }
    }

    #[test]
    fn group_tree_and_resolution() {
        let mut f = memory();
        f.create_group("/a").unwrap();
        f.create_group("/a/b").unwrap();
        f.create_group("/a/b/c").unwrap();

        assert!(f.resolve_addr("/a/b/c").is_ok());
        assert!(matches!(f.resolve_addr("/a/x/c"), Err(Error::ParentMissing(_))));
        assert!(matches!(f.resolve_addr("/a/b/x"), Err(Error::NotFound(_))));
        assert!(matches!(f.create_group("/x/y"), Err(Error::ParentMissing(_))));
        assert!(matches!(f.create_group("/a"), Err(Error::AlreadyExists(_))));
        assert_eq!(f.list_links("/a").unwrap(), ["b"]);
    }

    #[test]
    fn dataset_create_write_read() {
        let mut f = memory();
        f.create_dataset(
            "/data",
            Datatype::int32(),
            Dataspace::new(vec![10]),
            &DatasetOptions::default(),
        )
        .unwrap();
        let data: Vec<u8> = (0..10i32).flat_map(|i| i.to_le_bytes()).collect();
        f.write_dataset("/data", &data).unwrap();
        assert_eq!(f.read_dataset("/data").unwrap(), data);

        let (dt, ds) = f.dataset_shape("/data").unwrap();
        assert_eq!(dt, Datatype::int32());
        assert_eq!(ds.dims, [10]);
    }

    #[test]
    fn attributes_through_paths() {
        let mut f = memory();
        f.create_group("/g").unwrap();
        f.write_attribute("/g", scalar_i32("answer", 42)).unwrap();
        assert_eq!(f.read_attribute("/g", "answer").unwrap().data, 42i32.to_le_bytes());
        assert_eq!(f.list_attributes("/g").unwrap(), ["answer"]);

        f.delete_attribute("/g", "answer").unwrap();
        assert!(matches!(
            f.read_attribute("/g", "answer"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn hard_link_shares_object_and_refcount() {
        let mut f = memory();
        f.create_dataset(
            "/data",
            Datatype::uint8(),
            Dataspace::new(vec![1]),
            &DatasetOptions::default(),
        )
        .unwrap();
        f.write_dataset("/data", &[7]).unwrap();
        f.create_group("/g").unwrap();
        f.hard_link("/data", "/g/alias").unwrap();

        assert_eq!(f.resolve_addr("/data").unwrap(), f.resolve_addr("/g/alias").unwrap());
        assert_eq!(f.refcount("/data").unwrap(), 2);
        assert_eq!(f.read_dataset("/g/alias").unwrap(), [7]);

        f.delete_link("/g/alias").unwrap();
        assert_eq!(f.refcount("/data").unwrap(), 1);
        assert!(matches!(f.read_dataset("/g/alias"), Err(Error::NotFound(_))));
    }

    #[test]
    fn soft_link_resolution_and_dangling() {
        let mut f = memory();
        f.create_group("/real").unwrap();
        f.create_group("/real/sub").unwrap();
        f.soft_link("/real", "/alias").unwrap();

        assert_eq!(f.resolve_addr("/alias/sub").unwrap(), f.resolve_addr("/real/sub").unwrap());

        // Dangling soft links are legal to create, and fail only on use
        f.soft_link("/missing", "/dangling").unwrap();
        assert!(matches!(f.resolve_addr("/dangling"), Err(Error::NotFound(_))));
    }

    #[test]
    fn soft_link_cycle_detected() {
        let mut f = memory();
        f.soft_link("/b", "/a").unwrap();
        f.soft_link("/a", "/b").unwrap();
        assert!(matches!(f.resolve_addr("/a"), Err(Error::LinkCycle(_))));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut f = memory();
        f.create_group("/g").unwrap();
        f.writable = false;
        assert!(f.create_group("/h").is_err());
        assert!(f.write_attribute("/g", scalar_i32("a", 1)).is_err());
        assert!(f.list_links("/").is_ok());
    }

    #[test]
    fn path_errors() {
        let mut f = memory();
        assert!(matches!(f.create_group("relative"), Err(Error::InvalidArgument(_))));
        assert!(matches!(f.create_group("/a//b"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rebalance_all_reaches_nested_objects() {
        let mut f = memory();
        f.create_group("/g").unwrap();
        f.create_group("/g/h").unwrap();
        for i in 0..20 {
            f.write_attribute("/g/h", scalar_i32(&format!("a{i:02}"), i)).unwrap();
        }
        f.disable_rebalancing();
        for i in 0..15 {
            f.delete_attribute("/g/h", &format!("a{i:02}")).unwrap();
        }
        f.enable_rebalancing();
        f.rebalance_all_btrees().unwrap();
        assert_eq!(f.list_attributes("/g/h").unwrap().len(), 5);
    }
}

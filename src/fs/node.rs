//! Node identities, attributes and the staleness protocol.
//!
//! Three node kinds back the mounted tree: the mount root, discovered
//! directories, and discovered files. Root and Directory carry the child map,
//! the streamed entry buffer, and the short-lived probe cache; File carries
//! the materialized content buffer.

use bytes::Bytes;
use fuser::FileType;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::command::CommandState;
use crate::config::{DirectoryConfig, FileConfig, MountConfig};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("read command not provided for {0}")]
    MissingReadCommand(&'static str),
    #[error("name separator not provided for {0}")]
    MissingNameSeparator(&'static str),
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// FNV-1a-64 over `mount_root_dir_path || relative_path`, so an entry keeps
/// its inode number across restarts. Collisions are accepted as negligible
/// for practical tree sizes.
pub fn inode_number(state: &CommandState) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in state
        .mount_root_dir_path
        .bytes()
        .chain(state.relative_path.bytes())
    {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Whole-second timestamp triple. `ctime` is fixed at construction; `mtime`
/// advances when the node's driving command runs; `atime` on read/traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = unix_now();
        Self {
            atime: now,
            ctime: now,
            mtime: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

/// Directory-side state: children keyed by name, the entry buffer streamed to
/// the kernel, and the probe cache carried from the parent's classification
/// run (or a point lookup's listing).
#[derive(Debug, Default)]
pub struct DirState {
    pub children: HashMap<String, u64>,
    entries: Vec<DirEntry>,
    cursor: usize,
    pub probe_cache: Bytes,
}

impl DirState {
    pub fn set_entries(&mut self, entries: Vec<DirEntry>) {
        self.entries = entries;
        self.cursor = 0;
    }

    pub fn seek(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn next_entry(&mut self) -> Option<DirEntry> {
        let entry = self.entries.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    /// Empties the entry buffer and resets the cursor; the node can be
    /// iterated again after a subsequent readdir.
    pub fn close(&mut self) {
        self.entries = Vec::new();
        self.cursor = 0;
    }
}

#[derive(Debug)]
pub enum NodeKind {
    Root {
        config: MountConfig,
        dir: DirState,
    },
    Directory {
        dir_config: DirectoryConfig,
        file_config: FileConfig,
        dir: DirState,
    },
    File {
        config: FileConfig,
        content: Bytes,
    },
}

#[derive(Debug)]
pub struct Node {
    pub ino: u64,
    pub parent_ino: u64,
    pub times: Timestamps,
    pub state: CommandState,
    pub kind: NodeKind,
}

impl Node {
    pub fn new_root(mount_name: &str, config: MountConfig) -> Self {
        let state = CommandState {
            mount_name: mount_name.to_string(),
            mount_root_dir_path: config.path.clone(),
            relative_path: String::new(),
            name: String::new(),
        };
        Self {
            ino: fuser::FUSE_ROOT_ID,
            parent_ino: fuser::FUSE_ROOT_ID,
            times: Timestamps::now(),
            state,
            kind: NodeKind::Root {
                config,
                dir: DirState::default(),
            },
        }
    }

    /// A directory child discovered by a successful classification probe; the
    /// probe's stdout is carried in so the child's first listing can reuse it.
    pub fn new_directory(
        dir_config: DirectoryConfig,
        file_config: FileConfig,
        state: CommandState,
        parent_ino: u64,
        probe_output: Bytes,
    ) -> Self {
        Self {
            ino: inode_number(&state),
            parent_ino,
            times: Timestamps::now(),
            state,
            kind: NodeKind::Directory {
                dir_config,
                file_config,
                dir: DirState {
                    probe_cache: probe_output,
                    ..DirState::default()
                },
            },
        }
    }

    pub fn new_file(config: FileConfig, state: CommandState, parent_ino: u64) -> Self {
        Self {
            ino: inode_number(&state),
            parent_ino,
            times: Timestamps::now(),
            state,
            kind: NodeKind::File {
                config,
                content: Bytes::new(),
            },
        }
    }

    /// The kind bit is fixed at creation and never changes.
    pub fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::Root { .. } | NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::File { .. } => FileType::RegularFile,
        }
    }

    pub fn mode(&self) -> u32 {
        match &self.kind {
            NodeKind::Root { config, .. } => config.mode,
            NodeKind::Directory { dir_config, .. } => dir_config.mode,
            NodeKind::File { config, .. } => config.mode,
        }
    }

    pub fn should_cache(&self) -> bool {
        match &self.kind {
            NodeKind::Root { config, .. } => config.cache,
            NodeKind::Directory { dir_config, .. } => dir_config.cache,
            NodeKind::File { config, .. } => config.cache,
        }
    }

    pub fn cache_seconds(&self) -> u64 {
        match &self.kind {
            NodeKind::Root { config, .. } => config.cache_seconds,
            NodeKind::Directory { dir_config, .. } => dir_config.cache_seconds,
            NodeKind::File { config, .. } => config.cache_seconds,
        }
    }

    /// A node is stale when caching is off for it, it was never populated
    /// (`mtime == ctime`), or its TTL has expired.
    pub fn is_stale(&self, now: u64) -> bool {
        !self.should_cache()
            || self.times.mtime == self.times.ctime
            || now.saturating_sub(self.times.mtime) > self.cache_seconds()
    }

    /// The directory-listing template: the mount root consults its own field
    /// first and falls back to the directory sub-config.
    pub fn listing_command(&self) -> Result<&str, NodeError> {
        match &self.kind {
            NodeKind::Root { config, .. } => non_empty(config.read_command.as_deref())
                .or_else(|| non_empty(config.directory.read_command.as_deref()))
                .ok_or(NodeError::MissingReadCommand("mount root")),
            NodeKind::Directory { dir_config, .. } => non_empty(dir_config.read_command.as_deref())
                .ok_or(NodeError::MissingReadCommand("directory")),
            NodeKind::File { .. } => Err(NodeError::MissingReadCommand("file")),
        }
    }

    pub fn name_separator(&self) -> Result<&str, NodeError> {
        match &self.kind {
            NodeKind::Root { config, .. } => non_empty(config.name_separator.as_deref())
                .or_else(|| non_empty(config.directory.name_separator.as_deref()))
                .ok_or(NodeError::MissingNameSeparator("mount root")),
            NodeKind::Directory { dir_config, .. } => {
                non_empty(dir_config.name_separator.as_deref())
                    .ok_or(NodeError::MissingNameSeparator("directory"))
            }
            NodeKind::File { .. } => Err(NodeError::MissingNameSeparator("file")),
        }
    }

    /// The sub-configs handed to children created under this node; `None`
    /// for files, which have no children.
    pub fn child_configs(&self) -> Option<(DirectoryConfig, FileConfig)> {
        match &self.kind {
            NodeKind::Root { config, .. } => {
                Some((config.directory.clone(), config.file.clone()))
            }
            NodeKind::Directory {
                dir_config,
                file_config,
                ..
            } => Some((dir_config.clone(), file_config.clone())),
            NodeKind::File { .. } => None,
        }
    }

    pub fn file_read_command(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { config, .. } => non_empty(config.read_command.as_deref()),
            _ => None,
        }
    }

    pub fn dir_state(&self) -> Option<&DirState> {
        match &self.kind {
            NodeKind::Root { dir, .. } | NodeKind::Directory { dir, .. } => Some(dir),
            NodeKind::File { .. } => None,
        }
    }

    pub fn dir_state_mut(&mut self) -> Option<&mut DirState> {
        match &mut self.kind {
            NodeKind::Root { dir, .. } | NodeKind::Directory { dir, .. } => Some(dir),
            NodeKind::File { .. } => None,
        }
    }

    /// Takes the carried probe output, leaving the cache empty.
    pub fn take_probe_cache(&mut self) -> Bytes {
        match self.dir_state_mut() {
            Some(dir) => std::mem::take(&mut dir.probe_cache),
            None => Bytes::new(),
        }
    }

    pub fn set_probe_cache(&mut self, output: Bytes) {
        if let Some(dir) = self.dir_state_mut() {
            dir.probe_cache = output;
        }
    }

    pub fn content(&self) -> Option<&Bytes> {
        match &self.kind {
            NodeKind::File { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn set_content(&mut self, new_content: Bytes) {
        if let NodeKind::File { content, .. } = &mut self.kind {
            *content = new_content;
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.is_empty())
}

//! FUSE-facing layer.
//!
//! `CommandFs` holds the per-mount state: the lazily-populated node tree and
//! the worker pool that executes listing, classification and file-read
//! commands. The `Filesystem` impl is a dispatcher that forwards each kernel
//! callback to the matching sub-module (`attr`, `read`, `load`).

use fuser::{Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyOpen, Request};
use log::{debug, error, info};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::time::Duration;
use thiserror::Error;

use crate::command::pool::Pool;
use crate::config::MountConfig;

pub mod attr;
pub mod load;
pub mod node;
pub mod prelude;
pub mod read;

use node::{Node, Timestamps};

/// TTL handed to the kernel for attribute and entry caches. Content freshness
/// is governed by the per-node staleness protocol, so this stays short.
pub const TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount path not provided for '{0}'")]
    MissingPath(String),
    #[error("failed to mount: {0}")]
    Fuse(#[from] std::io::Error),
}

/// Per-mount filesystem state: one root, its discovered descendants, and the
/// worker pool shared by every node under this mount.
pub struct CommandFs {
    nodes: HashMap<u64, Node>,
    pool: Pool,
    mount_name: String,
    uid: u32,
    gid: u32,
}

impl CommandFs {
    pub fn new(mount_name: &str, config: MountConfig) -> Result<Self, MountError> {
        if config.path.is_empty() {
            return Err(MountError::MissingPath(mount_name.to_string()));
        }
        let pool = Pool::new(config.thread_count);
        let root = Node::new_root(mount_name, config);
        let mut nodes = HashMap::new();
        nodes.insert(fuser::FUSE_ROOT_ID, root);
        Ok(Self {
            nodes,
            pool,
            mount_name: mount_name.to_string(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        })
    }

    pub fn mount_point(&self) -> &str {
        self.nodes
            .get(&fuser::FUSE_ROOT_ID)
            .map(|root| root.state.mount_root_dir_path.as_str())
            .unwrap_or("")
    }

    pub(crate) fn node(&self, ino: u64) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    pub(crate) fn node_mut(&mut self, ino: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&ino)
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn uid(&self) -> u32 {
        self.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.gid
    }

    pub(crate) fn start_pool(&mut self) {
        self.pool.start();
    }

    /// Attaches a node under `parent_ino`, keyed by its entry name. Repeated
    /// attachment under the same name overwrites: the most recent population
    /// wins.
    pub(crate) fn attach(&mut self, parent_ino: u64, node: Node) -> u64 {
        let ino = node.ino;
        let name = node.state.name.clone();
        self.nodes.insert(ino, node);
        if let Some(dir) = self.node_mut(parent_ino).and_then(Node::dir_state_mut) {
            dir.children.insert(name, ino);
        }
        ino
    }

    /// Root attachment: start the pool, stamp the timestamp triple, and
    /// eagerly populate the top-level children.
    pub fn initialize(&mut self) {
        info!(
            "initializing mount '{}' with {} worker threads",
            self.mount_name,
            self.pool.runner_count()
        );
        self.start_pool();
        if let Some(root) = self.node_mut(fuser::FUSE_ROOT_ID) {
            root.times = Timestamps::now();
        }
        if let Err(err) = load::load_children(self, fuser::FUSE_ROOT_ID) {
            error!(
                "failed to load top-level entries for '{}': {}",
                self.mount_name, err
            );
        }
    }

    pub fn shutdown(&self) {
        self.pool.stop();
    }
}

impl Drop for CommandFs {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

impl Filesystem for CommandFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.initialize();
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("destroy called for mount '{}'", self.mount_name);
        self.shutdown();
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: fuser::ReplyEntry) {
        read::lookup(self, req, parent, name, reply);
    }

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        attr::getattr(self, req, ino, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        read::opendir(self, req, ino, flags, reply);
    }

    fn readdir(&mut self, req: &Request, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        read::readdir(self, req, ino, fh, offset, reply);
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        read::releasedir(self, req, ino, fh, flags, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        read::open(self, req, ino, flags, reply);
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        read::read(self, req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        read::release(self, req, ino, fh, flags, lock_owner, flush, reply);
    }
}

//! Shared re-exports for the `fs` sub-modules, keeping their import blocks
//! down to a single line.

pub use fuser::consts::FOPEN_DIRECT_IO;
pub use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    Request,
};

pub use libc::ENOENT;

pub use log::{debug, error, info};

pub use std::ffi::OsStr;
pub use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use bytes::Bytes;

pub use crate::command::CommandError;

pub use super::node::{DirEntry, Node, unix_now};
pub use super::{CommandFs, TTL, attr, load};

use super::prelude::*;

/// Builds the kernel-facing attributes for a node: configured permission
/// bits, the node's timestamp triple, and the content length for files.
pub fn file_attr(node: &Node, uid: u32, gid: u32) -> FileAttr {
    let size = node.content().map(|content| content.len() as u64).unwrap_or(0);
    let kind = node.file_type();
    FileAttr {
        ino: node.ino,
        size,
        blocks: (size + 511) / 512,
        atime: timestamp(node.times.atime),
        mtime: timestamp(node.times.mtime),
        ctime: timestamp(node.times.ctime),
        crtime: timestamp(node.times.ctime),
        kind,
        perm: (node.mode() & 0o7777) as u16,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        flags: 0,
        blksize: 4096,
    }
}

fn timestamp(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn getattr(fs: &mut CommandFs, _req: &Request, ino: u64, reply: ReplyAttr) {
    debug!("getattr called for inode {}", ino);
    let (uid, gid) = (fs.uid(), fs.gid());
    match fs.node(ino) {
        Some(node) => reply.attr(&TTL, &file_attr(node, uid, gid)),
        None => reply.error(ENOENT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandState;
    use crate::config::FileConfig;
    use bytes::Bytes;

    #[test]
    fn file_attributes_reflect_content_and_mode() {
        let state = CommandState {
            mount_name: "m".to_string(),
            mount_root_dir_path: "/mnt".to_string(),
            relative_path: "f".to_string(),
            name: "f".to_string(),
        };
        let mut node = Node::new_file(
            FileConfig {
                read_command: None,
                mode: 0o640,
                cache: false,
                cache_seconds: 0,
            },
            state,
            1,
        );
        node.set_content(Bytes::from_static(b"hello world"));

        let attr = file_attr(&node, 1000, 1000);
        assert_eq!(attr.ino, node.ino);
        assert_eq!(attr.size, 11);
        assert_eq!(attr.blocks, 1);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.mtime, timestamp(node.times.mtime));
    }
}

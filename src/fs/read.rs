use super::prelude::*;

/// FUSE `lookup`: delegates to the shared point-lookup protocol and answers
/// `ENOENT` when no child by that name exists after loading.
pub fn lookup(fs: &mut CommandFs, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
    debug!("lookup called for {:?} under inode {}", name, parent);
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    match load::lookup_child(fs, parent, name) {
        Some(ino) => {
            let (uid, gid) = (fs.uid(), fs.gid());
            match fs.node(ino) {
                Some(node) => reply.entry(&TTL, &attr::file_attr(node, uid, gid), 0),
                None => reply.error(ENOENT),
            }
        }
        None => reply.error(ENOENT),
    }
}

/// FUSE `readdir`.
///
/// A fresh stream (offset zero) re-runs the child-loading protocol and
/// rebuilds the entry buffer from the current children; the buffer is then
/// streamed through the node's entry cursor so later calls resume where the
/// kernel left off.
pub fn readdir(
    fs: &mut CommandFs,
    _req: &Request,
    ino: u64,
    _fh: u64,
    offset: i64,
    mut reply: ReplyDirectory,
) {
    debug!("readdir called for inode {} at offset {}", ino, offset);
    if offset == 0 {
        if let Err(err) = load::load_children(fs, ino) {
            error!("failed to load children for inode {}: {}", ino, err);
        }
        let Some(node) = fs.node(ino) else {
            reply.error(ENOENT);
            return;
        };
        let parent_ino = node.parent_ino;
        let mut entries = vec![
            DirEntry {
                ino,
                kind: FileType::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino: parent_ino,
                kind: FileType::Directory,
                name: "..".to_string(),
            },
        ];
        if let Some(dir) = node.dir_state() {
            for (name, &child_ino) in &dir.children {
                let kind = fs
                    .node(child_ino)
                    .map(Node::file_type)
                    .unwrap_or(FileType::RegularFile);
                entries.push(DirEntry {
                    ino: child_ino,
                    kind,
                    name: name.clone(),
                });
            }
        }
        let now = unix_now();
        if let Some(node) = fs.node_mut(ino) {
            node.times.atime = now;
            if let Some(dir) = node.dir_state_mut() {
                dir.set_entries(entries);
            }
        }
    }

    let Some(dir) = fs.node_mut(ino).and_then(Node::dir_state_mut) else {
        reply.error(ENOENT);
        return;
    };
    dir.seek(offset as usize);
    while dir.has_next() {
        let position = dir.position();
        let Some(entry) = dir.next_entry() else {
            break;
        };
        if reply.add(entry.ino, (position + 1) as i64, entry.kind, &entry.name) {
            // Kernel buffer full; the entry was not delivered.
            dir.seek(position);
            break;
        }
    }
    reply.ok();
}

/// FUSE `opendir`: eagerly loads children and serves the directory with
/// direct I/O, matching the file path.
pub fn opendir(fs: &mut CommandFs, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
    debug!("open called for directory inode {}", ino);
    if fs.node(ino).is_none() {
        reply.error(ENOENT);
        return;
    }
    if let Err(err) = load::load_children(fs, ino) {
        error!("failed to load children for inode {}: {}", ino, err);
    }
    reply.opened(0, FOPEN_DIRECT_IO);
}

/// FUSE `releasedir`: closes the entry stream.
pub fn releasedir(
    fs: &mut CommandFs,
    _req: &Request,
    ino: u64,
    _fh: u64,
    _flags: i32,
    reply: ReplyEmpty,
) {
    debug!("close called for directory inode {}", ino);
    if let Some(dir) = fs.node_mut(ino).and_then(Node::dir_state_mut) {
        dir.close();
    }
    reply.ok();
}

/// FUSE `open` on a file: a stale node re-runs the file-read command through
/// the pool before the open returns.
pub fn open(fs: &mut CommandFs, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
    debug!("open called for file inode {}", ino);
    match open_file(fs, ino) {
        Ok(()) => reply.opened(0, FOPEN_DIRECT_IO),
        Err(errno) => reply.error(errno),
    }
}

/// Materializes a stale file's content, blocking on the pool's completion
/// barrier. Command failures are logged and the node keeps whatever stdout
/// was produced; the kernel never sees the failure.
pub fn open_file(fs: &mut CommandFs, ino: u64) -> Result<(), libc::c_int> {
    let now = unix_now();
    let (template, state) = {
        let Some(node) = fs.node(ino) else {
            return Err(ENOENT);
        };
        if node.content().is_none() {
            // Not a file; nothing to materialize.
            return Ok(());
        }
        if !node.is_stale(now) {
            return Ok(());
        }
        let Some(template) = node.file_read_command() else {
            error!(
                "read command not provided for file '{}'",
                node.state.relative_path
            );
            return Ok(());
        };
        (template.to_string(), node.state.clone())
    };

    info!(
        "running command to get contents for {}/{}",
        state.mount_root_dir_path, state.relative_path
    );
    let content = match fs.pool().run_blocking(&template, &state) {
        Ok(output) => output,
        Err(CommandError::Exit { code, output }) => {
            error!(
                "file read command exited with {:?} for '{}'",
                code, state.relative_path
            );
            output
        }
        Err(err) => {
            error!(
                "file read command failed for '{}': {}",
                state.relative_path, err
            );
            Bytes::new()
        }
    };
    if let Some(node) = fs.node_mut(ino) {
        node.set_content(content);
        node.times.mtime = unix_now();
    }
    Ok(())
}

/// FUSE `read`: a clamped slice of the materialized content. Reading at or
/// beyond the end yields no data, never an error.
pub fn read(
    fs: &mut CommandFs,
    _req: &Request,
    ino: u64,
    _fh: u64,
    offset: i64,
    size: u32,
    _flags: i32,
    _lock_owner: Option<u64>,
    reply: ReplyData,
) {
    debug!("read called for inode {}", ino);
    let now = unix_now();
    let Some(node) = fs.node_mut(ino) else {
        reply.error(ENOENT);
        return;
    };
    node.times.atime = now;
    match node.content() {
        Some(content) => reply.data(slice_content(content, offset, size)),
        None => reply.data(&[]),
    }
}

pub fn slice_content(content: &[u8], offset: i64, size: u32) -> &[u8] {
    let start = offset.max(0) as usize;
    if start >= content.len() {
        return &[];
    }
    let end = (start + size as usize).min(content.len());
    &content[start..end]
}

/// FUSE `release` on a file: a stale node drops its content so the next open
/// re-fetches; a caching node keeps it for the rest of the TTL.
pub fn release(
    fs: &mut CommandFs,
    _req: &Request,
    ino: u64,
    _fh: u64,
    _flags: i32,
    _lock_owner: Option<u64>,
    _flush: bool,
    reply: ReplyEmpty,
) {
    debug!("release called for inode {}", ino);
    release_file(fs, ino);
    reply.ok();
}

pub fn release_file(fs: &mut CommandFs, ino: u64) {
    let now = unix_now();
    if let Some(node) = fs.node_mut(ino) {
        if node.content().is_some() && node.is_stale(now) {
            debug!("file content is stale, clearing cache");
            node.set_content(Bytes::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectoryConfig, FileConfig, MountConfig};
    use crate::fs::load::load_children;
    use fuser::FUSE_ROOT_ID;

    fn file_mount(file: FileConfig) -> CommandFs {
        let config = MountConfig {
            path: "/tmp/fusee-read-test".to_string(),
            read_command: Some("printf 'f'".to_string()),
            name_separator: Some("\n".to_string()),
            mode: 0o755,
            thread_count: 1,
            cache: false,
            cache_seconds: 0,
            directory: DirectoryConfig::default(),
            file,
        };
        let mut fs = CommandFs::new("test", config).unwrap();
        fs.start_pool();
        load_children(&mut fs, FUSE_ROOT_ID).unwrap();
        fs
    }

    fn file_ino(fs: &CommandFs) -> u64 {
        fs.node(FUSE_ROOT_ID)
            .unwrap()
            .dir_state()
            .unwrap()
            .children["f"]
    }

    #[test]
    fn slice_is_clamped_to_the_content_length() {
        let content = b"0123456789";
        assert_eq!(slice_content(content, 0, 4), b"0123");
        assert_eq!(slice_content(content, 8, 100), b"89");
        assert_eq!(slice_content(content, 10, 1), b"");
        assert_eq!(slice_content(content, 99, 1), b"");
        assert_eq!(slice_content(content, 0, 0), b"");
    }

    #[test]
    fn open_materializes_stale_content() {
        let mut fs = file_mount(FileConfig {
            read_command: Some("printf 'data for {{.Name}}'".to_string()),
            mode: 0o644,
            cache: false,
            cache_seconds: 0,
        });
        let ino = file_ino(&fs);

        open_file(&mut fs, ino).unwrap();

        let node = fs.node(ino).unwrap();
        assert_eq!(&node.content().unwrap()[..], b"data for f");
        assert!(node.times.mtime >= node.times.ctime);
        fs.shutdown();
    }

    #[test]
    fn open_keeps_partial_output_on_command_failure() {
        let mut fs = file_mount(FileConfig {
            read_command: Some("printf 'partial'; exit 2".to_string()),
            mode: 0o644,
            cache: false,
            cache_seconds: 0,
        });
        let ino = file_ino(&fs);

        open_file(&mut fs, ino).unwrap();

        assert_eq!(&fs.node(ino).unwrap().content().unwrap()[..], b"partial");
        fs.shutdown();
    }

    #[test]
    fn open_of_unknown_inode_is_enoent() {
        let mut fs = file_mount(FileConfig::default());
        assert_eq!(open_file(&mut fs, 0xdead_beef), Err(ENOENT));
        fs.shutdown();
    }

    #[test]
    fn release_clears_content_only_when_stale() {
        let mut fs = file_mount(FileConfig {
            read_command: Some("printf 'kept'".to_string()),
            mode: 0o644,
            cache: true,
            cache_seconds: 600,
        });
        let ino = file_ino(&fs);
        open_file(&mut fs, ino).unwrap();
        // Separate mtime from ctime so the TTL governs staleness.
        fs.node_mut(ino).unwrap().times.ctime -= 10;

        release_file(&mut fs, ino);
        assert_eq!(&fs.node(ino).unwrap().content().unwrap()[..], b"kept");

        // Expire the TTL; the next release drops the content.
        fs.node_mut(ino).unwrap().times.mtime = unix_now() - 601;
        release_file(&mut fs, ino);
        assert!(fs.node(ino).unwrap().content().unwrap().is_empty());
        fs.shutdown();
    }

    #[test]
    fn fresh_open_skips_the_read_command() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("reads.log");
        let mut fs = file_mount(FileConfig {
            read_command: Some(format!("echo read >> '{}' && printf 'once'", marker.display())),
            mode: 0o644,
            cache: true,
            cache_seconds: 600,
        });
        let ino = file_ino(&fs);

        open_file(&mut fs, ino).unwrap();
        fs.node_mut(ino).unwrap().times.ctime -= 10;
        open_file(&mut fs, ino).unwrap();

        let count = std::fs::read_to_string(&marker).unwrap().lines().count();
        assert_eq!(count, 1);
        assert_eq!(&fs.node(ino).unwrap().content().unwrap()[..], b"once");
        fs.shutdown();
    }
}

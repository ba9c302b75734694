//! The child-loading protocol shared by the mount root and discovered
//! directories.
//!
//! `load_children` is the bulk path behind readdir/opendir; `lookup_child`
//! the point path behind lookup. Both render the parent's directory-listing
//! template, execute it through the worker pool, split the output into
//! candidate names, and classify each candidate with a probe: the
//! directory-listing template run against the candidate's command state.
//! Probe exit 0 makes a directory child (carrying the probe stdout so the
//! child's first listing is free); any failure makes a file child.

use bytes::Bytes;
use log::{debug, error, info};
use std::sync::mpsc;
use thiserror::Error;

use super::CommandFs;
use super::node::{Node, NodeError, unix_now};
use crate::command::{CommandError, CommandRequest, CommandState};
use crate::config::{DirectoryConfig, FileConfig};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown inode {0}")]
    UnknownInode(u64),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

enum Listing {
    /// Output carried over from a classification probe or a point lookup.
    Carried(Bytes),
    /// The listing template must be rendered and executed.
    Fresh(String),
}

/// Classification outcome for one candidate name.
struct Candidate {
    state: CommandState,
    /// `Some(stdout)` when the probe succeeded (directory), `None` for files.
    probe_output: Option<Bytes>,
}

/// Bulk population of a parent's children.
///
/// A carried probe cache is consumed first, regardless of staleness, so the
/// classification run's output is reused exactly once. Otherwise a non-stale
/// parent's existing children are authoritative and no command runs. Control
/// returns to the caller only after every submitted classification probe has
/// completed.
pub fn load_children(fs: &mut CommandFs, parent_ino: u64) -> Result<(), LoadError> {
    let now = unix_now();
    let (source, parent_state, dir_config, file_config, separator) = {
        let parent = fs
            .node_mut(parent_ino)
            .ok_or(LoadError::UnknownInode(parent_ino))?;
        debug!(
            "load_children called on '{}/{}'",
            parent.state.mount_root_dir_path, parent.state.relative_path
        );
        let carried = parent.take_probe_cache();
        let source = if !carried.is_empty() {
            debug!("reusing carried listing output, not running command");
            parent.times.mtime = now;
            Listing::Carried(carried)
        } else if !parent.is_stale(now) {
            debug!("content is not yet stale, not running command");
            return Ok(());
        } else {
            parent.times.mtime = now;
            Listing::Fresh(parent.listing_command()?.to_string())
        };
        let separator = parent.name_separator()?.to_string();
        let Some((dir_config, file_config)) = parent.child_configs() else {
            return Ok(());
        };
        (source, parent.state.clone(), dir_config, file_config, separator)
    };

    let output = match source {
        Listing::Carried(bytes) => bytes,
        Listing::Fresh(template) => {
            info!(
                "running command to get dirents for {}/{}",
                parent_state.mount_root_dir_path, parent_state.relative_path
            );
            fs.pool().run_blocking(&template, &parent_state)?
        }
    };
    debug!("listing output is {:?}", String::from_utf8_lossy(&output));

    let names = split_names(&output, &separator);
    let candidates = classify(fs, &parent_state, &dir_config, names);
    for candidate in candidates {
        attach_candidate(fs, parent_ino, candidate, &dir_config, &file_config);
    }
    Ok(())
}

/// Point lookup of one named child.
///
/// A non-stale parent answers from its existing children. Otherwise the
/// listing runs through the pool, its raw output is parked in the parent's
/// probe cache for the next bulk load to reuse, and only the first matching
/// candidate is materialized.
pub fn lookup_child(fs: &mut CommandFs, parent_ino: u64, name: &str) -> Option<u64> {
    let now = unix_now();
    let (template, separator, parent_state, dir_config, file_config) = {
        let parent = fs.node(parent_ino)?;
        if !parent.is_stale(now) {
            if let Some(child) = parent
                .dir_state()
                .and_then(|dir| dir.children.get(name))
                .copied()
            {
                return Some(child);
            }
        }
        let template = match parent.listing_command() {
            Ok(template) => template.to_string(),
            Err(err) => {
                error!("cannot look up '{}': {}", name, err);
                return None;
            }
        };
        let separator = match parent.name_separator() {
            Ok(separator) => separator.to_string(),
            Err(err) => {
                error!("cannot look up '{}': {}", name, err);
                return None;
            }
        };
        let (dir_config, file_config) = parent.child_configs()?;
        (template, separator, parent.state.clone(), dir_config, file_config)
    };

    info!(
        "running command to look up '{}' under {}/{}",
        name, parent_state.mount_root_dir_path, parent_state.relative_path
    );
    let output = match fs.pool().run_blocking(&template, &parent_state) {
        Ok(output) => output,
        Err(err) => {
            error!("listing command failed: {}", err);
            return None;
        }
    };
    if let Some(parent) = fs.node_mut(parent_ino) {
        parent.times.mtime = now;
        parent.set_probe_cache(output.clone());
    }

    let names = split_names(&output, &separator);
    if let Some(candidate) = names.into_iter().find(|candidate| candidate == name) {
        let state = child_state(&parent_state, &candidate);
        let candidate = match probe_template(&dir_config) {
            Some(probe) => match fs.pool().run_blocking(&probe, &state) {
                Ok(probe_output) => Candidate {
                    state,
                    probe_output: Some(probe_output),
                },
                Err(err) => {
                    debug!(
                        "directory command failed against '{}', adding it as a file instead: {}",
                        candidate, err
                    );
                    Candidate {
                        state,
                        probe_output: None,
                    }
                }
            },
            None => Candidate {
                state,
                probe_output: None,
            },
        };
        attach_candidate(fs, parent_ino, candidate, &dir_config, &file_config);
    }

    fs.node(parent_ino)?
        .dir_state()?
        .children
        .get(name)
        .copied()
}

/// Runs one classification probe per candidate through the pool and waits for
/// all of them; probes may complete in any order. With no directory command
/// configured every candidate is a file and no probe runs.
fn classify(
    fs: &mut CommandFs,
    parent_state: &CommandState,
    dir_config: &DirectoryConfig,
    names: Vec<String>,
) -> Vec<Candidate> {
    let Some(probe) = probe_template(dir_config) else {
        return names
            .into_iter()
            .map(|name| Candidate {
                state: child_state(parent_state, &name),
                probe_output: None,
            })
            .collect();
    };

    let (tx, rx) = mpsc::channel();
    let mut submitted = 0;
    for name in &names {
        let state = child_state(parent_state, name);
        let completion_state = state.clone();
        let tx = tx.clone();
        fs.pool().submit(CommandRequest::new(
            probe.clone(),
            state,
            move |result| {
                let _ = tx.send((completion_state, result));
            },
        ));
        submitted += 1;
    }
    drop(tx);

    let mut candidates = Vec::with_capacity(submitted);
    for _ in 0..submitted {
        match rx.recv() {
            Ok((state, Ok(probe_output))) => candidates.push(Candidate {
                state,
                probe_output: Some(probe_output),
            }),
            Ok((state, Err(err))) => {
                debug!(
                    "directory command failed against '{}', adding it as a file instead: {}",
                    state.name, err
                );
                candidates.push(Candidate {
                    state,
                    probe_output: None,
                });
            }
            // Pool stopped; the remaining probes were dropped.
            Err(_) => break,
        }
    }
    candidates
}

fn attach_candidate(
    fs: &mut CommandFs,
    parent_ino: u64,
    candidate: Candidate,
    dir_config: &DirectoryConfig,
    file_config: &FileConfig,
) {
    let name = candidate.state.name.clone();
    match candidate.probe_output {
        Some(probe_output) => {
            fs.attach(
                parent_ino,
                Node::new_directory(
                    dir_config.clone(),
                    file_config.clone(),
                    candidate.state,
                    parent_ino,
                    probe_output,
                ),
            );
            debug!("added directory '{}'", name);
        }
        None => {
            fs.attach(
                parent_ino,
                Node::new_file(file_config.clone(), candidate.state, parent_ino),
            );
            debug!("added file '{}'", name);
        }
    }
}

fn probe_template(dir_config: &DirectoryConfig) -> Option<String> {
    dir_config
        .read_command
        .clone()
        .filter(|template| !template.is_empty())
}

/// Copies the parent's command state for a child: `name` becomes the
/// candidate and the relative path is extended, with no leading separator
/// when the parent is the mount root.
fn child_state(parent: &CommandState, name: &str) -> CommandState {
    let mut state = parent.clone();
    state.name = name.to_string();
    state.relative_path = if parent.relative_path.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.relative_path, name)
    };
    state
}

/// Splits listing output into candidate names: surrounding whitespace is
/// trimmed and empty tokens produce no child.
fn split_names(output: &[u8], separator: &str) -> Vec<String> {
    String::from_utf8_lossy(output)
        .split(separator)
        .map(str::trim)
        .filter(|name| {
            if name.is_empty() {
                debug!("skipping entry with an empty name");
                return false;
            }
            true
        })
        .map(str::to_string)
        .collect()
}

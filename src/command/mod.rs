//! Command pipeline: template rendering, shell execution, and the request
//! type consumed by the worker pool.
//!
//! A command template is plain text with the four named substitutions
//! `{{.MountName}}`, `{{.MountRootDirPath}}`, `{{.RelativePath}}` and
//! `{{.Name}}`, rendered against a [`CommandState`] and executed via
//! `sh -c`. Results are delivered to the submitter through a continuation
//! that fires exactly once.

use bytes::Bytes;
use log::debug;
use std::process;
use thiserror::Error;

pub mod pool;
pub mod runner;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("template rendering failed: {0}")]
    Template(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command exited with status {code:?}")]
    Exit { code: Option<i32>, output: Bytes },
    #[error("command dropped before execution")]
    Dropped,
}

pub type CommandResult = Result<Bytes, CommandError>;

/// The binding environment a template renders against.
///
/// Cloned, never shared, when descending into a child entry so that sibling
/// population cannot leak mutations across nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandState {
    pub mount_name: String,
    pub mount_root_dir_path: String,
    /// Path relative to the mount root; empty at the root node.
    pub relative_path: String,
    /// Last path component; empty at the root node.
    pub name: String,
}

/// Expands the four named substitutions in `template` against `state`.
///
/// Any `{{…}}` placeholder that is not one of the four known bindings, or a
/// `{{` with no closing `}}`, is a rendering error. Rendering the same
/// template against the same state always yields identical output.
pub fn render(template: &str, state: &CommandState) -> Result<String, CommandError> {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(CommandError::Template(format!(
                "unterminated placeholder near {:?}",
                &rest[start..]
            )));
        };
        match &after[..end] {
            ".MountName" | ".MountRootDirPath" | ".RelativePath" | ".Name" => {}
            unknown => {
                return Err(CommandError::Template(format!(
                    "unknown placeholder {{{{{}}}}}",
                    unknown
                )));
            }
        }
        rest = &after[end + 2..];
    }

    Ok(template
        .replace("{{.MountName}}", &state.mount_name)
        .replace("{{.MountRootDirPath}}", &state.mount_root_dir_path)
        .replace("{{.RelativePath}}", &state.relative_path)
        .replace("{{.Name}}", &state.name))
}

/// Renders `template` and runs it via `sh -c`, capturing stdout.
///
/// A non-zero exit status is an error carrying whatever stdout the command
/// produced before failing.
pub fn execute(template: &str, state: &CommandState) -> CommandResult {
    let rendered = render(template, state)?;
    debug!("running shell command: {}", rendered);
    let output = process::Command::new("sh")
        .arg("-c")
        .arg(&rendered)
        .output()
        .map_err(CommandError::Spawn)?;
    if !output.status.success() {
        debug!(
            "command failed with {:?}, stderr: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(CommandError::Exit {
            code: output.status.code(),
            output: Bytes::from(output.stdout),
        });
    }
    Ok(Bytes::from(output.stdout))
}

/// A unit of work for the pool: a template, the state to render it against,
/// and the continuation invoked exactly once with the outcome.
pub struct CommandRequest {
    template: String,
    state: CommandState,
    done: Box<dyn FnOnce(CommandResult) + Send>,
}

impl CommandRequest {
    pub fn new(
        template: String,
        state: CommandState,
        done: impl FnOnce(CommandResult) + Send + 'static,
    ) -> Self {
        Self {
            template,
            state,
            done: Box::new(done),
        }
    }

    pub(crate) fn run(self) {
        let result = execute(&self.template, &self.state);
        (self.done)(result);
    }
}

impl std::fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRequest")
            .field("template", &self.template)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CommandState {
        CommandState {
            mount_name: "music".to_string(),
            mount_root_dir_path: "/mnt/music".to_string(),
            relative_path: "albums/ok".to_string(),
            name: "ok".to_string(),
        }
    }

    #[test]
    fn render_substitutes_all_bindings() {
        let rendered = render(
            "ls {{.MountRootDirPath}}/{{.RelativePath}} # {{.MountName}} {{.Name}}",
            &state(),
        )
        .unwrap();
        assert_eq!(rendered, "ls /mnt/music/albums/ok # music ok");
    }

    #[test]
    fn render_is_deterministic() {
        let template = "echo {{.Name}} in {{.RelativePath}}";
        let first = render(template, &state()).unwrap();
        let second = render(template, &state()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn render_rejects_unknown_placeholder() {
        match render("echo {{.Nope}}", &state()) {
            Err(CommandError::Template(msg)) => assert!(msg.contains(".Nope")),
            other => panic!("expected template error, got {:?}", other),
        }
    }

    #[test]
    fn render_rejects_unterminated_placeholder() {
        assert!(matches!(
            render("echo {{.Name", &state()),
            Err(CommandError::Template(_))
        ));
    }

    #[test]
    fn execute_captures_stdout() {
        let output = execute("printf 'hello'", &state()).unwrap();
        assert_eq!(&output[..], b"hello");
    }

    #[test]
    fn execute_renders_state_into_command() {
        let output = execute("printf '%s' '{{.Name}}'", &state()).unwrap();
        assert_eq!(&output[..], b"ok");
    }

    #[test]
    fn execute_reports_exit_error_with_partial_output() {
        match execute("printf 'partial'; exit 3", &state()) {
            Err(CommandError::Exit { code, output }) => {
                assert_eq!(code, Some(3));
                assert_eq!(&output[..], b"partial");
            }
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[test]
    fn request_invokes_continuation_with_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let request = CommandRequest::new("printf 'done'".to_string(), state(), move |result| {
            tx.send(result).unwrap();
        });
        request.run();
        let result = rx.recv().unwrap().unwrap();
        assert_eq!(&result[..], b"done");
    }
}

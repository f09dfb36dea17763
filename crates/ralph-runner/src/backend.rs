//! Coding agent abstraction.
//!
//! An agent gets a text prompt and a working directory and edits the tree
//! in place. The loop only needs to know when it returned; whether the
//! attempt worked is decided by the gate pipeline afterwards.

use crate::subprocess::{run_cmd, run_cmd_with_stdin, shell_quote};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ralph_core::config::AgentSpec;
use ralph_core::requirement::RequirementId;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One dispatch of one iteration.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub requirement: RequirementId,
    pub iteration: u32,
}

/// Completion signal from an agent.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl AgentResponse {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code.is_none_or(|c| c == 0)
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` only when the agent could not be run at all.
    async fn dispatch(&self, request: &AgentRequest) -> Result<AgentResponse>;

    /// Check the agent is installed and runnable.
    async fn health_check(&self) -> Result<()>;
}

/// Placeholder replaced by the prompt text.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";
/// Placeholder replaced by the path of a temporary file holding the prompt.
pub const PROMPT_FILE_PLACEHOLDER: &str = "{prompt_file}";
/// Largest prompt passed inline as an argument. Linux rejects any single
/// argument over 128 KiB; larger prompts go to stdin instead.
pub const MAX_INLINE_PROMPT: usize = 64 * 1024;

/// A resolved agent command line and what to write to its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command_line: String,
    pub stdin: Option<String>,
}

/// Any CLI coding agent.
///
/// See [`AgentSpec`] for how the prompt is handed over.
pub struct CliAgentBackend {
    pub name: String,
    pub command: String,
    pub prompt_args: Vec<String>,
    pub timeout: Duration,
}

impl CliAgentBackend {
    pub fn from_spec(spec: &AgentSpec) -> Self {
        let name = std::path::Path::new(&spec.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.command.clone());
        Self {
            name,
            command: spec.command.clone(),
            prompt_args: spec.args.clone(),
            timeout: spec.timeout(),
        }
    }

    fn wants_prompt_file(&self) -> bool {
        self.prompt_args.iter().any(|a| a.contains(PROMPT_FILE_PLACEHOLDER))
    }

    /// Resolve placeholders for `prompt`. `prompt_file` must be given when
    /// the args reference `{prompt_file}`.
    pub fn invocation(&self, prompt: &str, prompt_file: Option<&Path>) -> Invocation {
        let inline = prompt.len() <= MAX_INLINE_PROMPT;
        let file_arg = prompt_file.map(|p| p.to_string_lossy().into_owned());
        let mut parts = vec![self.command.clone()];
        let mut delivered = false;

        for arg in &self.prompt_args {
            let mut arg = arg.clone();
            if arg.contains(PROMPT_FILE_PLACEHOLDER)
                && let Some(ref path) = file_arg
            {
                arg = arg.replace(PROMPT_FILE_PLACEHOLDER, path);
                delivered = true;
            }
            if arg.contains(PROMPT_PLACEHOLDER) {
                if !inline {
                    // Dropped; the prompt goes to stdin below.
                    continue;
                }
                arg = arg.replace(PROMPT_PLACEHOLDER, prompt);
                delivered = true;
            }
            if !arg.is_empty() && arg.chars().all(is_shell_safe) {
                parts.push(arg);
            } else {
                parts.push(shell_quote(&arg));
            }
        }

        Invocation {
            command_line: parts.join(" "),
            stdin: (!delivered).then(|| prompt.to_string()),
        }
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c)
}

#[async_trait]
impl AgentBackend for CliAgentBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: &AgentRequest) -> Result<AgentResponse> {
        tracing::info!(
            agent = %self.name,
            requirement = %request.requirement,
            iteration = request.iteration,
            prompt_len = request.prompt.len(),
            cwd = %request.cwd.display(),
            "invoking CLI agent"
        );

        // Lives until the agent exits.
        let prompt_file = if self.wants_prompt_file() {
            let file = tempfile::Builder::new()
                .prefix("ralph-prompt-")
                .suffix(".md")
                .tempfile()
                .context("failed to create prompt file")?;
            tokio::fs::write(file.path(), &request.prompt)
                .await
                .context("failed to write prompt file")?;
            Some(file)
        } else {
            None
        };

        let invocation = self.invocation(&request.prompt, prompt_file.as_ref().map(|f| f.path()));
        let inline_requested = self.prompt_args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER));
        if invocation.stdin.is_some() && inline_requested {
            tracing::warn!(
                agent = %self.name,
                prompt_len = request.prompt.len(),
                "prompt too large for an argument, sending it on stdin"
            );
        }

        let start = Instant::now();
        let output = run_cmd_with_stdin(
            &invocation.command_line,
            &request.cwd,
            self.timeout,
            invocation.stdin.map(String::into_bytes),
        )
        .await?;

        Ok(AgentResponse {
            output: output.combined(),
            exit_code: Some(output.exit_code),
            timed_out: output.timed_out,
            elapsed: start.elapsed(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        let cwd = std::env::current_dir()?;
        let output = run_cmd(
            &format!("command -v {}", shell_quote(&self.command)),
            &cwd,
            Duration::from_secs(5),
        )
        .await?;

        if output.success() {
            Ok(())
        } else {
            anyhow::bail!("{} CLI not available", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_backend() -> CliAgentBackend {
        CliAgentBackend {
            name: "printf".into(),
            command: "printf".into(),
            prompt_args: vec!["%s".into(), "{prompt}".into()],
            timeout: Duration::from_secs(5),
        }
    }

    fn request(dir: &Path, prompt: String) -> AgentRequest {
        AgentRequest {
            prompt,
            cwd: dir.to_path_buf(),
            requirement: RequirementId::new("REQ-1"),
            iteration: 1,
        }
    }

    #[test]
    fn default_spec_sends_the_prompt_on_stdin() {
        let backend = CliAgentBackend::from_spec(&AgentSpec::default());
        assert_eq!(backend.name(), "claude");
        let invocation = backend.invocation("fix it", None);
        assert_eq!(invocation.command_line, "claude -p --dangerously-skip-permissions");
        assert_eq!(invocation.stdin.as_deref(), Some("fix it"));
    }

    #[test]
    fn inline_placeholder_is_quoted() {
        let invocation = echo_backend().invocation("fix it", None);
        assert_eq!(invocation.command_line, "printf %s 'fix it'");
        assert!(invocation.stdin.is_none());
    }

    #[test]
    fn embedded_placeholder_is_quoted_whole() {
        let backend = CliAgentBackend {
            prompt_args: vec!["--message={prompt}".into()],
            ..echo_backend()
        };
        assert_eq!(backend.invocation("a b", None).command_line, "printf '--message=a b'");
    }

    #[test]
    fn oversized_inline_prompt_moves_to_stdin() {
        let prompt = "a".repeat(MAX_INLINE_PROMPT + 1);
        let invocation = echo_backend().invocation(&prompt, None);
        assert_eq!(invocation.command_line, "printf %s");
        assert_eq!(invocation.stdin.map(|s| s.len()), Some(prompt.len()));
    }

    #[test]
    fn prompt_file_placeholder_takes_the_path() {
        let backend = CliAgentBackend {
            command: "agent".into(),
            prompt_args: vec!["--prompt-file".into(), "{prompt_file}".into()],
            ..echo_backend()
        };
        let invocation = backend.invocation("fix it", Some(Path::new("/tmp/ralph-prompt-1.md")));
        assert_eq!(invocation.command_line, "agent --prompt-file /tmp/ralph-prompt-1.md");
        assert!(invocation.stdin.is_none());
    }

    #[tokio::test]
    async fn prompt_reaches_the_agent_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = "it's a \"test\" with $HOME and `ticks`";
        let response = echo_backend().dispatch(&request(dir.path(), prompt.into())).await.unwrap();
        assert!(response.success());
        assert_eq!(response.output, prompt);
    }

    #[tokio::test]
    async fn huge_prompt_is_delivered_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = "a".repeat(200_000);
        for args in [vec!["{prompt}"], vec![], vec!["{prompt_file}"]] {
            let backend = CliAgentBackend {
                name: "counter".into(),
                command: r#"sh -c 'if [ -n "$1" ]; then wc -c < "$1"; else wc -c; fi' counter"#
                    .into(),
                prompt_args: args.into_iter().map(String::from).collect(),
                timeout: Duration::from_secs(10),
            };
            let response = backend.dispatch(&request(dir.path(), prompt.clone())).await.unwrap();
            assert!(response.success(), "{}", response.output);
            assert_eq!(response.output.trim(), "200000");
        }
    }

    #[tokio::test]
    async fn health_check_detects_missing_binary() {
        let backend = CliAgentBackend {
            command: "definitely-not-an-agent-binary".into(),
            ..echo_backend()
        };
        assert!(backend.health_check().await.is_err());
        assert!(echo_backend().health_check().await.is_ok());
    }
}

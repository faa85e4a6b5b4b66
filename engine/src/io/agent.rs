//! Agent command construction.

use std::path::{Path, PathBuf};

use crate::io::config::AgentConfig;

const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Fully resolved agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    /// Substitute the prompt into the configured argument list.
    ///
    /// Every `{prompt}` occurrence is replaced; when none is present the prompt
    /// becomes the final argument.
    pub fn build(cfg: &AgentConfig, prompt: &str, workdir: &Path) -> Self {
        let mut substituted = false;
        let mut args: Vec<String> = cfg
            .args
            .iter()
            .map(|arg| {
                if arg.contains(PROMPT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(PROMPT_PLACEHOLDER, prompt)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(prompt.to_string());
        }
        Self {
            program: cfg.program.clone(),
            args,
            workdir: workdir.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments with the prompt elided, for logs and artifact headers.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|arg| {
            if arg.len() > 80 || arg.contains('\n') {
                format!("<{} bytes>", arg.len())
            } else {
                arg.clone()
            }
        }));
        parts.join(" ")
    }
}

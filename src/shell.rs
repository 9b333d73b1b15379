//! Which shell binary runs user commands, and with which arguments.

use crate::config::ShellConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: String,
    /// Start as a login shell so profile files set up PATH etc.
    pub login: bool,
}

impl ShellSpec {
    /// Config value first, then `$SHELL`, then the platform default.
    pub fn resolve(config: &ShellConfig) -> Self {
        let program = config
            .program
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(platform_shell)
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self {
            program,
            login: config.login,
        }
    }

    /// Arguments that run `command` once and exit.
    #[cfg(not(windows))]
    pub fn one_shot_args(&self, command: &str) -> Vec<String> {
        let flag = if self.login { "-lc" } else { "-c" };
        vec![flag.to_string(), command.to_string()]
    }

    #[cfg(windows)]
    pub fn one_shot_args(&self, command: &str) -> Vec<String> {
        vec![
            "-NoLogo".to_string(),
            "-NoProfile".to_string(),
            "-Command".to_string(),
            command.to_string(),
        ]
    }

    /// Arguments for a long-lived interactive shell.
    #[cfg(not(windows))]
    pub fn interactive_args(&self) -> Vec<String> {
        if self.login {
            vec!["-l".to_string()]
        } else {
            Vec::new()
        }
    }

    #[cfg(windows)]
    pub fn interactive_args(&self) -> Vec<String> {
        vec!["-NoLogo".to_string()]
    }
}

#[cfg(not(windows))]
const DEFAULT_SHELL: &str = "bash";
#[cfg(windows)]
const DEFAULT_SHELL: &str = "powershell.exe";

#[cfg(not(windows))]
fn platform_shell() -> Option<String> {
    std::env::var("SHELL").ok().filter(|s| !s.is_empty())
}

#[cfg(windows)]
fn platform_shell() -> Option<String> {
    std::env::var("COMSPEC").ok().filter(|s| !s.is_empty())
}

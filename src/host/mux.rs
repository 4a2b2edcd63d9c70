//! External session adapter: delegates windows to a detached tmux server
//! so they survive broker restarts and can be observed from other hosts.
//!
//! Logical windows map onto `session:index` targets. Attaching spawns a
//! local PTY running the attach command; that PTY becomes the byte pipe
//! and everything downstream treats it like a direct one.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Maximum length of a derived session name, prefix included.
const SESSION_NAME_MAX: usize = 30;

/// Handle to the external multiplexer server.
#[derive(Debug, Clone)]
pub struct MuxServer {
    program: String,
    prefix: String,
}

/// A live window enumerated from the external server.
#[derive(Debug, Clone)]
pub struct MuxWindow {
    pub index: u32,
    pub name: String,
    pub path: PathBuf,
}

impl MuxServer {
    pub fn new(program: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix: prefix.into(),
        }
    }

    /// Probe for the external tool; `None` when it is not runnable, in
    /// which case the broker falls back to direct PTYs.
    pub async fn detect(program: &str, prefix: &str) -> Option<Self> {
        let server = Self::new(program, prefix);
        match server.run(&["-V"]).await {
            Ok(_) => Some(server),
            Err(err) => {
                tracing::info!("external multiplexer unavailable: {err}");
                None
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the session name for a project path: the sanitized final
    /// path component behind the broker's prefix, capped at 30 characters
    /// total. Deterministic, so every broker instance maps the same
    /// project to the same session.
    pub fn session_name(&self, project_path: &Path) -> String {
        let base = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let mut sanitized: String = base
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        sanitized.truncate(SESSION_NAME_MAX.saturating_sub(self.prefix.len()));
        if sanitized.is_empty() {
            sanitized.push_str("project");
        }
        format!("{}{}", self.prefix, sanitized)
    }

    pub async fn has_session(&self, session: &str) -> bool {
        // '=' forces an exact session-name match instead of tmux's default
        // prefix matching.
        let target = format!("={session}");
        self.run(&["has-session", "-t", &target]).await.is_ok()
    }

    /// Create the session if it does not exist yet.
    pub async fn ensure_session(&self, session: &str, cwd: &Path) -> Result<()> {
        if self.has_session(session).await {
            return Ok(());
        }
        let cwd = cwd.to_string_lossy();
        match self
            .run(&["new-session", "-d", "-s", session, "-c", &cwd])
            .await
        {
            Ok(_) => Ok(()),
            // Lost a create race: the session exists now, join it.
            Err(err) if self.has_session(session).await => {
                tracing::debug!("joining existing session '{session}': {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Create a window in `session` running `cmd`, returning the index the
    /// server assigned. Indices may be non-contiguous after kills.
    pub async fn create_window(
        &self,
        session: &str,
        cwd: &Path,
        label: Option<&str>,
        env: &[(String, String)],
        cmd: &[String],
    ) -> Result<u32> {
        let cwd = cwd.to_string_lossy();
        let target = format!("={session}");
        // tmux joins trailing arguments with spaces, so hand it one
        // shell-quoted command string.
        let command_line = shell_join(cmd);
        let env_pairs: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let mut args = vec![
            "new-window",
            "-t",
            &target,
            "-c",
            &cwd,
            "-P",
            "-F",
            "#{window_index}",
        ];
        for pair in &env_pairs {
            args.push("-e");
            args.push(pair);
        }
        if let Some(label) = label {
            args.push("-n");
            args.push(label);
        }
        if !command_line.is_empty() {
            args.push(&command_line);
        }
        let out = self.run(&args).await?;
        out.trim()
            .parse::<u32>()
            .with_context(|| format!("unexpected window index {:?}", out.trim()))
    }

    /// Sessions owned by this broker, identified by the name prefix.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        // A server with no sessions (or no server at all) exits non-zero.
        let out = match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => out,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(out
            .lines()
            .filter(|line| line.starts_with(&self.prefix))
            .map(str::to_string)
            .collect())
    }

    /// Live windows in a session, with the pane's working directory so
    /// adopted windows keep a project path.
    pub async fn list_windows(&self, session: &str) -> Result<Vec<MuxWindow>> {
        let target = format!("={session}");
        let out = self
            .run(&[
                "list-windows",
                "-t",
                &target,
                "-F",
                "#{window_index}\t#{window_name}\t#{pane_current_path}",
            ])
            .await?;
        let mut windows = Vec::new();
        for line in out.lines() {
            let mut parts = line.splitn(3, '\t');
            let Some(index) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let name = parts.next().unwrap_or("").to_string();
            let path = PathBuf::from(parts.next().unwrap_or(""));
            windows.push(MuxWindow { index, name, path });
        }
        Ok(windows)
    }

    pub async fn window_exists(&self, session: &str, index: u32) -> bool {
        self.list_windows(session)
            .await
            .map(|windows| windows.iter().any(|w| w.index == index))
            .unwrap_or(false)
    }

    pub async fn kill_window(&self, session: &str, index: u32) -> Result<()> {
        let target = format!("={session}:{index}");
        self.run(&["kill-window", "-t", &target]).await.map(|_| ())
    }

    pub async fn kill_session(&self, session: &str) -> Result<()> {
        let target = format!("={session}");
        self.run(&["kill-session", "-t", &target]).await.map(|_| ())
    }

    /// Command line that attaches a local PTY to `session:index`.
    pub fn attach_cmd(&self, session: &str, index: u32) -> Vec<String> {
        vec![
            self.program.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("={session}:{index}"),
        ]
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let out = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;
        if !out.status.success() {
            bail!(
                "{} {} failed: {}",
                self.program,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Join argv elements into one shell command string, single-quoting each.
fn shell_join(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| format!("'{}'", arg.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> MuxServer {
        MuxServer::new("tmux", "mobile-")
    }

    #[test]
    fn session_name_uses_final_path_component() {
        assert_eq!(server().session_name(Path::new("/x/y")), "mobile-y");
        assert_eq!(
            server().session_name(Path::new("/home/dev/myapp")),
            "mobile-myapp"
        );
    }

    #[test]
    fn session_name_sanitizes_invalid_characters() {
        assert_eq!(
            server().session_name(Path::new("/tmp/My Project!")),
            "mobile-My-Project-"
        );
    }

    #[test]
    fn session_name_is_capped_at_thirty_characters() {
        let name = server().session_name(Path::new(
            "/tmp/an-extremely-long-project-directory-name",
        ));
        assert!(name.len() <= 30);
        assert!(name.starts_with("mobile-"));
    }

    #[test]
    fn session_name_handles_root_path() {
        assert_eq!(server().session_name(Path::new("/")), "mobile-project");
    }

    #[test]
    fn shell_join_quotes_each_argument() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo 'hi'".to_string()];
        assert_eq!(shell_join(&cmd), r"'sh' '-c' 'echo '\''hi'\'''");
    }

    #[test]
    fn shell_join_empty_is_empty() {
        assert_eq!(shell_join(&[]), "");
    }
}

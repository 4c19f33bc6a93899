//! Credential plumbing for remote git commands.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::gitops::error::{GitOpsError, Result};

/// Escapes a value for safe use in single-quoted shell strings.
/// Replaces single quotes with '\'' (end quote, escaped quote, start quote).
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

#[cfg(windows)]
fn escape_for_windows_batch(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() * 2);
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%%"),
            '^' | '&' | '|' | '<' | '>' | '(' | ')' | '"' => {
                escaped.push('^');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Deletes the askpass script when dropped so the token never outlives the command.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl AskpassCleanup {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub(crate) fn empty() -> Self {
        Self { path: None }
    }
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment for a single remote git command.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    /// Must outlive the git command.
    pub _cleanup: AskpassCleanup,
}

impl AuthEnv {
    fn anonymous() -> Self {
        Self {
            env_vars: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            _cleanup: AskpassCleanup::empty(),
        }
    }
}

/// Builds the environment for a remote command authenticated as `user` with `token`.
///
/// Git asks for the username and the password through the same askpass
/// program; the script answers the username prompt with `user` and every
/// other prompt with the token. Without a token the command runs
/// anonymously with terminal prompts disabled.
pub fn build_auth_env(user: &str, token: Option<&SecretString>) -> Result<AuthEnv> {
    let token = match token {
        Some(token) if !token.expose_secret().is_empty() => token,
        _ => return Ok(AuthEnv::anonymous()),
    };

    let temp_dir = std::env::temp_dir();
    let random_suffix = uuid::Uuid::new_v4().to_string();

    #[cfg(unix)]
    let (askpass_path, askpass_script) = {
        let path = temp_dir.join(format!(".git-askpass-{}.sh", random_suffix));
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  Username*) echo '{}' ;;\n  *) echo '{}' ;;\nesac\n",
            shell_escape_token(user),
            shell_escape_token(token.expose_secret())
        );
        (path, script)
    };

    #[cfg(windows)]
    let (askpass_path, askpass_script) = {
        let path = temp_dir.join(format!(".git-askpass-{}.bat", random_suffix));
        let script = format!(
            "@echo off\r\necho %1 | findstr /b \"Username\" >nul && (echo {}) || (echo {})\r\n",
            escape_for_windows_batch(user),
            escape_for_windows_batch(token.expose_secret())
        );
        (path, script)
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&askpass_path)?;
        std::io::Write::write_all(&mut file, askpass_script.as_bytes())?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(&askpass_path, &askpass_script)?;
    }

    let cleanup = AskpassCleanup::new(askpass_path.clone());

    let askpass_path_str = askpass_path
        .to_str()
        .ok_or_else(|| {
            GitOpsError::GitAuthFailed(
                "Temp directory path contains non-UTF8 characters".to_string(),
            )
        })?
        .to_string();

    Ok(AuthEnv {
        env_vars: vec![
            ("GIT_ASKPASS".to_string(), askpass_path_str),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
        _cleanup: cleanup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_env_without_token() {
        let auth = build_auth_env("alice", None).unwrap();
        assert_eq!(auth.env_vars.len(), 1);
        assert_eq!(auth.env_vars[0].0, "GIT_TERMINAL_PROMPT");
    }

    #[test]
    fn test_auth_env_empty_token_is_anonymous() {
        let token = SecretString::from(String::new());
        let auth = build_auth_env("alice", Some(&token)).unwrap();
        assert!(!auth.env_vars.iter().any(|(k, _)| k == "GIT_ASKPASS"));
    }

    #[cfg(unix)]
    #[test]
    fn test_askpass_script_answers_prompts() {
        let token = SecretString::from("s3cr'et".to_string());
        let auth = build_auth_env("alice", Some(&token)).unwrap();
        let script = auth
            .env_vars
            .iter()
            .find(|(k, _)| k == "GIT_ASKPASS")
            .map(|(_, v)| v.clone())
            .unwrap();

        let user = std::process::Command::new(&script)
            .arg("Username for 'https://example.com': ")
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&user.stdout).trim(), "alice");

        let pass = std::process::Command::new(&script)
            .arg("Password for 'https://alice@example.com': ")
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&pass.stdout).trim(), "s3cr'et");
    }

    #[test]
    fn test_askpass_removed_on_drop() {
        let token = SecretString::from("token".to_string());
        let auth = build_auth_env("alice", Some(&token)).unwrap();
        let path = auth
            .env_vars
            .iter()
            .find(|(k, _)| k == "GIT_ASKPASS")
            .map(|(_, v)| PathBuf::from(v))
            .unwrap();
        assert!(path.exists());
        drop(auth);
        assert!(!path.exists());
    }

    #[test]
    fn test_shell_escape_token() {
        assert_eq!(shell_escape_token("simple"), "simple");
        assert_eq!(shell_escape_token("it's"), "it'\\''s");
        assert_eq!(shell_escape_token("a'b'c"), "a'\\''b'\\''c");
    }
}

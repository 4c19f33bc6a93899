//! Git output parsing helpers.

use std::process::Output;

/// Formats a git error with both stdout and stderr for better debugging.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// Returns the first non-empty line of a command's stdout.
pub fn first_line(output: &Output) -> Option<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Extracts the branch name from `git symbolic-ref refs/remotes/origin/HEAD`.
pub fn parse_remote_head(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix("refs/remotes/origin/")
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

/// Splits `git ls-tree -r --name-only` output into paths, preserving git's sort order.
pub fn parse_tree_paths(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when fetch stderr says the branch does not exist on the remote.
pub fn is_missing_remote_ref(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("couldn't find remote ref") || lower.contains("could not find remote ref")
}

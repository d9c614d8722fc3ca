use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Current branch of the repository containing `dir`.
///
/// `None` outside a repository, on a detached HEAD, or when git is missing;
/// branch names are advisory so every failure is quiet.
pub async fn current_branch(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .await
        .map_err(|e| debug!(dir = %dir.display(), error = %e, "git not runnable"))
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}

//! Version control access.
//!
//! Signing hashes what version control has recorded rather than what happens to be on disk, so
//! that uncommitted edits never end up covered by a release signature.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use log::{debug, info};

use crate::store::MANIFEST_FILE;

/// The file set and file content tracked by a version control system.
pub trait Vcs {
    /// Lists every tracked path, relative to `root`.
    fn tracked_files(&self, root: &Path) -> Result<Vec<String>>;

    /// Returns the tracked content of `path`, or `None` if version control has no record of it.
    fn tracked_content(&self, root: &Path, path: &str) -> Result<Option<Vec<u8>>>;
}

/// How the release commit message is supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMessage {
    Inline(String),
    File(PathBuf),
}

/// [`Vcs`] backed by the `git` executable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git;

fn git(root: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(root).stdin(Stdio::null());
    cmd
}

#[context("Running git {}", args.join(" "))]
fn run(root: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = git(root)
        .args(args)
        .stderr(Stdio::inherit())
        .output()
        .context("spawning git")?;
    if !output.status.success() {
        bail!("git exited with {}", output.status);
    }
    Ok(output.stdout)
}

impl Vcs for Git {
    fn tracked_files(&self, root: &Path) -> Result<Vec<String>> {
        let stdout = run(root, &["ls-files", "-z"])?;
        let files = stdout
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| {
                String::from_utf8(name.to_vec()).with_context(|| {
                    format!(
                        "Tracked path {:?} is not valid UTF-8 and cannot be signed",
                        String::from_utf8_lossy(name)
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("git reports {} tracked files", files.len());
        Ok(files)
    }

    fn tracked_content(&self, root: &Path, path: &str) -> Result<Option<Vec<u8>>> {
        let output = git(root)
            .args(["cat-file", "--text", &format!(":{path}")])
            .stderr(Stdio::null())
            .output()
            .context("spawning git cat-file")?;
        Ok(output.status.success().then_some(output.stdout))
    }
}

impl Git {
    /// The name of the checked-out branch, or `None` on a detached HEAD.
    pub fn current_branch(&self, root: &Path) -> Result<Option<String>> {
        let output = git(root)
            .args(["symbolic-ref", "--short", "-q", "HEAD"])
            .output()
            .context("spawning git symbolic-ref")?;
        if !output.status.success() {
            return Ok(None);
        }
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!branch.is_empty()).then_some(branch))
    }

    /// Names of the configured remotes.
    pub fn remotes(&self, root: &Path) -> Result<Vec<String>> {
        let stdout = run(root, &["remote"])?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Commits the signature manifest, pushes the branch, then creates and pushes the release tag.
    #[context("Publishing release {version} to {remote}/{branch}")]
    pub fn publish(
        &self,
        root: &Path,
        remote: &str,
        branch: &str,
        message: &CommitMessage,
        version: &str,
    ) -> Result<()> {
        run(root, &["add", MANIFEST_FILE])?;
        match message {
            CommitMessage::Inline(msg) => run(root, &["commit", "-m", msg])?,
            CommitMessage::File(path) => {
                let path = path.to_string_lossy();
                run(root, &["commit", "--file", &path])?
            }
        };
        run(root, &["push", "-u", remote, branch])?;
        run(root, &["tag", version])?;
        run(root, &["push", "--tags"])?;
        info!("released {version} to {remote}/{branch}");
        Ok(())
    }
}

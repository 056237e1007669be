//! Shared fixtures for the integration tests: throwaway git repositories,
//! a scripted stand-in for the agent CLI and an in-memory session store.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use vibe_migrate::{
    config::Config,
    database::{create_memory_pool, sessions::SessionStore, sessions::SqliteSessionStore},
};

/// A git repository on `main` with one initial commit
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "--quiet"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git(&["config", "user.name", "Migration Test"]);
        repo.git(&["config", "user.email", "migration-test@example.com"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# frontend\n");
        repo.commit_all("Initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository, panicking with its output on failure
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .expect("git is installed");
        assert!(
            output.status.success(),
            "git {} failed: {}{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path().join(relative)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "--quiet", "-m", message]);
    }

    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }
}

/// Writes an executable script that behaves like the agent CLI.
///
/// Each invocation appends `fresh` or `continue` to `invocations.log` in
/// `dir`, writes `agent-output.txt` in its working directory and prints a
/// short stream-json conversation.
#[cfg(unix)]
pub fn fake_agent(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("invocations.log");
    let script = dir.join("fake-agent.sh");
    let body = format!(
        r#"#!/bin/sh
case " $* " in
  *" --continue "*) echo continue >> '{log}' ;;
  *) echo fresh >> '{log}' ;;
esac
echo "generated" > agent-output.txt
echo '{{"type":"system","subtype":"init"}}'
echo 'not json at all'
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Working on it"}}]}}}}'
echo '{{"type":"result","subtype":"success"}}'
"#,
        log = log.display()
    );
    std::fs::write(&script, body).expect("write fake agent");
    let mut permissions = std::fs::metadata(&script).expect("stat").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&script, permissions).expect("chmod");
    script
}

/// Writes an agent stand-in that ignores SIGTERM and sits in a long command.
///
/// It records `started` in `invocations.log`, prints one assistant line, then
/// sleeps before printing `too late`.
#[cfg(unix)]
pub fn slow_agent(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("invocations.log");
    let script = dir.join("slow-agent.sh");
    let body = format!(
        r#"#!/bin/sh
trap '' TERM
echo started >> '{log}'
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Thinking"}}]}}}}'
sleep 3
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"too late"}}]}}}}'
"#,
        log = log.display()
    );
    std::fs::write(&script, body).expect("write slow agent");
    let mut permissions = std::fs::metadata(&script).expect("stat").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&script, permissions).expect("chmod");
    script
}

/// Lines recorded by [`fake_agent`] and [`slow_agent`]
pub fn invocations(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("invocations.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Configuration pointing at `repo`, staging under `scratch`
pub fn test_config(repo: &Path, scratch: &Path, agent: &Path) -> Config {
    let mut config = Config::default();
    config.repository.path = repo.to_path_buf();
    config.repository.branch_prefix = "migration".to_string();
    config.agent.executable = agent.to_string_lossy().to_string();
    config.agent.unbuffered = false;
    config.agent.stop_grace_secs = 1;
    config.staging.temp_directory = scratch.join("staging");
    config.validation.typecheck_command = vec!["true".to_string()];
    config.validation.test_command = vec!["true".to_string()];
    config.validation.build_command = vec!["true".to_string()];
    config
}

pub async fn memory_store() -> Arc<dyn SessionStore> {
    let pool = create_memory_pool().await.expect("in-memory database");
    Arc::new(SqliteSessionStore::new(pool))
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

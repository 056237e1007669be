//! Git automation against real throwaway repositories

mod common;

use common::TestRepo;
use vibe_migrate::{
    config::{ConflictStrategy, RepositoryConfig},
    error::AppError,
    git::GitAutomation,
    logs::{LogBroadcaster, LogLevel},
};

fn automation(repo: &TestRepo, logs: LogBroadcaster) -> GitAutomation {
    let config = RepositoryConfig {
        path: repo.path().to_path_buf(),
        backend_path: None,
        default_branch: "main".to_string(),
        fallback_branch: "master".to_string(),
        remote: "origin".to_string(),
        branch_prefix: "migration".to_string(),
        conflict_strategy: ConflictStrategy::Theirs,
    };
    GitAutomation::new(config, logs)
}

#[tokio::test]
async fn branch_is_created_off_main_and_checked_out() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());

    let branch = git.create_branch("s1", "Invoice List!").await.unwrap();

    assert!(branch.starts_with("migration/invoice-list-"), "{}", branch);
    assert_eq!(repo.current_branch(), branch);
    assert_eq!(git.get_current_branch("s1").await.unwrap(), branch);
}

#[tokio::test]
async fn master_is_used_when_main_is_missing() {
    let repo = TestRepo::new();
    repo.git(&["branch", "-m", "main", "master"]);
    let git = automation(&repo, LogBroadcaster::new());

    assert_eq!(git.resolve_default_branch("s1").await.unwrap(), "master");
}

#[tokio::test]
async fn dirty_tree_branches_from_the_current_branch() {
    let repo = TestRepo::new();
    repo.git(&["checkout", "-b", "feature"]);
    repo.write("README.md", "# feature\n");
    repo.commit_all("feature work");
    // local edits that `git checkout main` would overwrite
    repo.write("README.md", "# uncommitted\n");

    let logs = LogBroadcaster::new();
    let mut events = logs.subscribe("s1");
    let git = automation(&repo, logs.clone());
    let branch = git.create_branch("s1", "dirty").await.unwrap();

    assert!(branch.starts_with("migration/dirty-"), "{}", branch);
    assert_eq!(repo.current_branch(), branch);
    repo.git(&["merge-base", "--is-ancestor", "feature", "HEAD"]);
    assert_eq!(repo.read("README.md"), "# uncommitted\n");

    let mut fell_back = false;
    while let Ok(event) = events.try_recv() {
        if event.message == "Could not check out a default branch, branching from feature" {
            fell_back = true;
        }
    }
    assert!(fell_back);
}

#[tokio::test]
async fn changed_files_and_diff_cover_committed_work() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());
    let branch = git.create_branch("s1", "counters").await.unwrap();

    repo.write("apps/new.ts", "export const x = 1;\n");
    repo.write("README.md", "# frontend v2\n");
    repo.commit_all("agent work");

    let files = git.get_changed_files("s1", &branch).await.unwrap();
    let mut summary: Vec<_> = files
        .iter()
        .map(|f| format!("{} {}", f.status, f.path))
        .collect();
    summary.sort();
    assert_eq!(summary, vec!["A apps/new.ts", "M README.md"]);

    let diff = git.get_diff("s1", &branch).await.unwrap();
    assert!(diff.contains("+export const x = 1;"));
}

#[tokio::test]
async fn merge_commits_leftovers_and_deletes_branch() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());
    let branch = git.create_branch("s1", "leftovers").await.unwrap();

    // uncommitted agent output
    repo.write("apps/page.tsx", "<Page />\n");

    let outcome = git
        .merge_branch("s1", &branch, "Merge session: leftovers", ConflictStrategy::Theirs)
        .await
        .unwrap();

    assert_eq!(outcome.into, "main");
    assert!(outcome.resolved_conflicts.is_empty());
    assert_eq!(repo.current_branch(), "main");
    assert_eq!(repo.read("apps/page.tsx"), "<Page />\n");
    assert!(repo.git(&["branch", "--list", &branch]).is_empty());

    let log = repo.git(&["log", "--format=%s", "-3"]);
    assert!(log.contains("Merge session: leftovers"));
    assert!(log.contains("Final changes before merge - Session: s1"));
}

#[tokio::test]
async fn conflicts_resolve_to_the_session_branch() {
    let repo = TestRepo::new();
    let logs = LogBroadcaster::new();
    let mut events = logs.subscribe("s1");
    let git = automation(&repo, logs.clone());

    let branch = git.create_branch("s1", "conflict").await.unwrap();
    repo.write("README.md", "# from the session\n");
    repo.commit_all("session edit");

    repo.git(&["checkout", "main"]);
    repo.write("README.md", "# from main\n");
    repo.commit_all("main edit");

    let outcome = git
        .merge_branch("s1", &branch, "Merge session: conflict", ConflictStrategy::Theirs)
        .await
        .unwrap();

    assert_eq!(outcome.resolved_conflicts, vec!["README.md".to_string()]);
    assert_eq!(repo.read("README.md"), "# from the session\n");
    let subject = repo.git(&["log", "--format=%s", "-1"]);
    assert_eq!(
        subject,
        "Merge session: conflict (with auto-resolved conflicts)"
    );

    let mut saw_git_line = false;
    while let Ok(event) = events.try_recv() {
        if event.level == LogLevel::Git && event.message.starts_with("Executing: git") {
            saw_git_line = true;
        }
    }
    assert!(saw_git_line);

    // the branch is gone, so a second merge is an error
    let again = git
        .merge_branch("s1", &branch, "again", ConflictStrategy::Theirs)
        .await;
    assert!(matches!(again, Err(AppError::ExternalTool { .. })));
}

#[tokio::test]
async fn abort_strategy_reports_conflicts_and_leaves_main_clean() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());

    let branch = git.create_branch("s1", "abort").await.unwrap();
    repo.write("README.md", "# session\n");
    repo.commit_all("session edit");
    repo.git(&["checkout", "main"]);
    repo.write("README.md", "# main\n");
    repo.commit_all("main edit");

    let result = git
        .merge_branch("s1", &branch, "Merge", ConflictStrategy::Abort)
        .await;

    match result {
        Err(AppError::MergeConflict { files }) => assert_eq!(files, vec!["README.md".to_string()]),
        other => panic!("expected merge conflict, got {:?}", other.map(|o| o.branch)),
    }
    assert_eq!(repo.read("README.md"), "# main\n");
    assert!(repo.git(&["status", "--porcelain"]).is_empty());
}

#[tokio::test]
async fn rollback_resets_the_current_branch() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());
    let _branch = git.create_branch("s1", "rollback").await.unwrap();
    let before = repo.git(&["rev-parse", "HEAD"]);

    repo.write("apps/bad.ts", "oops\n");
    repo.commit_all("bad change");
    git.rollback("s1", &before).await.unwrap();

    assert_eq!(repo.git(&["rev-parse", "HEAD"]), before);
    assert!(!repo.path().join("apps/bad.ts").exists());
}

#[tokio::test]
async fn unknown_ref_is_an_external_tool_error_with_output() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());

    match git.rollback("s1", "no-such-ref").await {
        Err(AppError::ExternalTool { message, output }) => {
            assert!(message.contains("git reset --hard no-such-ref"));
            assert!(!output.is_empty());
        }
        other => panic!("expected external tool error, got {:?}", other),
    }
}

#[tokio::test]
async fn delete_branch_discards_unmerged_work() {
    let repo = TestRepo::new();
    let git = automation(&repo, LogBroadcaster::new());
    let branch = git.create_branch("s1", "throwaway").await.unwrap();
    repo.write("apps/draft.ts", "draft\n");
    repo.commit_all("unmerged draft");

    git.delete_branch("s1", &branch).await.unwrap();

    assert_eq!(repo.current_branch(), "main");
    assert!(repo.git(&["branch", "--list", &branch]).is_empty());
    assert!(!repo.path().join("apps/draft.ts").exists());
}

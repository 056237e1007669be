use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    agent::{AgentSessionManager, CommandReceipt},
    config::Config,
    database::sessions::SessionStore,
    discovery::{TargetArea, TargetDiscovery},
    error::{AppError, Result},
    git::{ChangeCounts, ChangedFile, GitAutomation, MergeOutcome},
    instructions::{self, Brief},
    logs::LogBroadcaster,
    sessions::{Session, SessionState},
    staging::{FileCensus, FileStaging},
    validation::{ValidationReport, Validator},
};

pub const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub description: String,
    pub instructions: Option<String>,
    pub target_area: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub session: Session,
    pub is_active: bool,
    pub is_busy: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub session: Session,
    pub census: FileCensus,
}

#[derive(Debug, Serialize)]
pub struct MergeResult {
    pub session: Session,
    pub merge: MergeOutcome,
}

#[derive(Debug, Serialize)]
pub struct ValidationResult {
    pub session: Session,
    pub report: ValidationReport,
}

/// Composes staging, git, the agent and validation into the session lifecycle.
///
/// Every operation loads the session, acts, and persists. Failures of git or
/// staging while starting, uploading or merging leave the session `Failed`.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn SessionStore>,
    logs: LogBroadcaster,
    agent: AgentSessionManager,
    git: GitAutomation,
    staging: FileStaging,
    validator: Validator,
    discovery: TargetDiscovery,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<dyn SessionStore>, logs: LogBroadcaster) -> Self {
        let agent =
            AgentSessionManager::new(Arc::clone(&store), logs.clone(), config.agent.clone());
        let git = GitAutomation::new(config.repository.clone(), logs.clone());
        let staging = FileStaging::new(&config.staging, logs.clone());
        let validator = Validator::new(config.validation.clone(), logs.clone());
        let discovery =
            TargetDiscovery::new(&config.repository.path, config.validation.source_dir.clone());

        Self {
            config,
            store,
            logs,
            agent,
            git,
            staging,
            validator,
            discovery,
        }
    }

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        let description = request.description.trim();
        if description.is_empty() {
            return Err(AppError::BadRequest("Description is required".to_string()));
        }
        let target_area = request.target_area.filter(|t| !t.trim().is_empty());
        self.discovery.working_directory(target_area.as_deref())?;

        let session = Session::new(description, request.instructions, target_area);
        self.store.insert(&session).await?;

        info!(session_id = %session.id, "Session created");
        self.logs.info(&session.id, "Session created");
        Ok(session)
    }

    /// Save, unpack and census an uploaded archive for a fresh session.
    pub async fn upload_archive(
        &self,
        session_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<UploadResult> {
        let mut session = self.store.require(session_id).await?;
        session.transition_to(SessionState::Unpacking)?;
        session.archive_name = Some(file_name.to_string());
        self.store.update(&session).await?;

        let staged = async {
            let archive = self.staging.save_upload(session_id, file_name, bytes).await?;
            let unpacked = self.staging.unpack(session_id, &archive).await?;
            let census = self.staging.analyze(session_id, &unpacked).await?;
            Ok::<_, AppError>((unpacked, census))
        }
        .await;
        let (unpacked, census) = self.or_fail(session_id, "Upload failed", staged).await?;

        let mut session = self.store.require(session_id).await?;
        session.unpacked_path = Some(unpacked.to_string_lossy().to_string());
        session.transition_to(SessionState::Analyzing)?;
        self.store.update(&session).await?;

        Ok(UploadResult { session, census })
    }

    /// Create the session branch, brief the agent and open its conversation.
    pub async fn start(
        &self,
        session_id: &str,
        additional_instructions: Option<String>,
    ) -> Result<Session> {
        let mut session = self.store.require(session_id).await?;
        if !session.state.is_pre_run() || session.branch_name.is_some() {
            return Err(AppError::InvalidState(format!(
                "Session {} is {} and cannot be started",
                session_id, session.state
            )));
        }
        let working_directory = self
            .discovery
            .working_directory(session.target_area.as_deref())?;

        let branch = self
            .or_fail(
                session_id,
                "Failed to start",
                self.git.create_branch(session_id, &session.description).await,
            )
            .await?;
        session.assign_branch(branch)?;
        self.store.update(&session).await?;

        let census = match &session.unpacked_path {
            Some(path) => {
                let census = self.staging.analyze(session_id, Path::new(path)).await;
                Some(self.or_fail(session_id, "Failed to start", census).await?)
            }
            None => None,
        };
        let api_docs =
            instructions::load_api_docs(self.config.repository.backend_path.as_deref()).await;
        let brief = instructions::build(&Brief {
            description: &session.description,
            instructions: session.instructions.as_deref(),
            additional_instructions: additional_instructions.as_deref(),
            target_area: session.target_area.as_deref(),
            source_dir: &self.config.validation.source_dir,
            census,
            api_docs,
        });

        let started = self
            .agent
            .start(session_id, &brief, &working_directory.to_string_lossy())
            .await;
        self.or_fail(session_id, "Failed to start", started).await?;

        self.store.require(session_id).await
    }

    pub async fn submit_command(&self, session_id: &str, command: &str) -> Result<CommandReceipt> {
        if command.trim().is_empty() {
            return Err(AppError::BadRequest("Command is required".to_string()));
        }
        self.agent.submit(session_id, command).await
    }

    pub async fn stop(&self, session_id: &str) -> Result<Session> {
        self.agent.stop(session_id).await?;
        self.store.require(session_id).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<Session> {
        self.agent.resume(session_id).await?;
        self.store.require(session_id).await
    }

    /// Pause the agent if it is live, so nothing writes to the tree underneath us.
    async fn quiesce(&self, session_id: &str) -> Result<()> {
        if self.agent.is_active(session_id).await? {
            self.agent.stop(session_id).await?;
        }
        Ok(())
    }

    /// Run the checks against the repository and record the outcome.
    pub async fn validate(&self, session_id: &str) -> Result<ValidationResult> {
        self.quiesce(session_id).await?;

        let mut session = self.store.require(session_id).await?;
        if session.state != SessionState::Validating {
            session.transition_to(SessionState::Validating)?;
            self.store.update(&session).await?;
        }

        let report = self
            .validator
            .validate(session_id, &self.config.repository.path)
            .await;

        let mut session = self.store.require(session_id).await?;
        session.validated = report.passed;
        session.build_passed = report.build_passed;
        session.tests_passed = report.tests_passed;
        self.refresh_counters(&mut session).await;
        session.touch();
        self.store.update(&session).await?;

        Ok(ValidationResult { session, report })
    }

    /// Merge the session branch into the default branch.
    pub async fn merge(&self, session_id: &str, message: Option<String>) -> Result<MergeResult> {
        let session = self.store.require(session_id).await?;
        let Some(branch) = session.branch_name.clone() else {
            return Err(AppError::InvalidState(format!(
                "Session {} has no branch to merge",
                session_id
            )));
        };
        if !session.state.can_transition_to(SessionState::Merged) {
            return Err(AppError::InvalidState(format!(
                "Session {} is {} and cannot be merged",
                session_id, session.state
            )));
        }

        self.quiesce(session_id).await?;
        let mut session = self.store.require(session_id).await?;
        self.refresh_counters(&mut session).await;

        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Merge session: {}", session.description));
        let merged = self
            .git
            .merge_branch(
                session_id,
                &branch,
                &message,
                self.config.repository.conflict_strategy,
            )
            .await;
        let merge = self.or_fail(session_id, "Merge failed", merged).await?;

        let mut current = self.store.require(session_id).await?;
        current.files_created = session.files_created;
        current.files_modified = session.files_modified;
        current.files_deleted = session.files_deleted;
        current.transition_to(SessionState::Merged)?;
        self.store.update(&current).await?;

        self.logs.info(
            session_id,
            format!("Merged {} into {}", merge.branch, merge.into),
        );
        Ok(MergeResult {
            session: current,
            merge,
        })
    }

    /// Close the session without merging its branch.
    pub async fn complete(&self, session_id: &str) -> Result<Session> {
        self.quiesce(session_id).await?;
        let mut session = self.store.require(session_id).await?;
        session.transition_to(SessionState::Completed)?;
        self.store.update(&session).await?;
        self.logs.info(session_id, "Session completed");
        Ok(session)
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatus> {
        let is_active = self.agent.is_active(session_id).await?;
        let session = self.store.require(session_id).await?;
        Ok(SessionStatus {
            is_busy: self.agent.is_busy(session_id),
            is_active,
            session,
        })
    }

    pub async fn list_sessions(&self, limit: Option<i64>) -> Result<Vec<Session>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
        self.store.list(limit).await
    }

    pub async fn diff(&self, session_id: &str) -> Result<String> {
        let branch = self.require_branch(session_id).await?;
        self.git.get_diff(session_id, &branch).await
    }

    /// Files changed on the session branch. Refreshes the stored counters.
    pub async fn changed_files(&self, session_id: &str) -> Result<Vec<ChangedFile>> {
        let branch = self.require_branch(session_id).await?;
        let files = self.git.get_changed_files(session_id, &branch).await?;

        let mut session = self.store.require(session_id).await?;
        apply_counts(&mut session, ChangeCounts::tally(&files));
        self.store.update(&session).await?;
        Ok(files)
    }

    /// Hard-reset the session branch to `commit_ref`.
    pub async fn rollback(&self, session_id: &str, commit_ref: &str) -> Result<Session> {
        let branch = self.require_branch(session_id).await?;
        if commit_ref.trim().is_empty() {
            return Err(AppError::BadRequest("Commit reference is required".to_string()));
        }
        if self.agent.is_busy(session_id) {
            return Err(AppError::InvalidState(format!(
                "Session {} has an agent command in progress",
                session_id
            )));
        }
        let current = self.git.get_current_branch(session_id).await?;
        if current != branch {
            return Err(AppError::InvalidState(format!(
                "Repository is on {}, not the session branch {}",
                current, branch
            )));
        }

        self.git.rollback(session_id, commit_ref).await?;
        self.logs
            .info(session_id, format!("Rolled back {} to {}", branch, commit_ref));
        self.store.require(session_id).await
    }

    pub async fn list_targets(&self) -> Result<Vec<TargetArea>> {
        self.discovery.list().await
    }

    /// Remove staged uploads older than the session timeout.
    pub async fn cleanup_stale_uploads(&self) -> Result<usize> {
        let max_age = Duration::from_secs(self.config.staging.session_timeout_hours * 3600);
        self.staging.cleanup_old_sessions(max_age).await
    }

    async fn require_branch(&self, session_id: &str) -> Result<String> {
        let session = self.store.require(session_id).await?;
        session.branch_name.ok_or_else(|| {
            AppError::InvalidState(format!("Session {} has no branch yet", session_id))
        })
    }

    async fn refresh_counters(&self, session: &mut Session) {
        let Some(branch) = session.branch_name.clone() else {
            return;
        };
        match self.git.get_changed_files(&session.id, &branch).await {
            Ok(files) => apply_counts(session, ChangeCounts::tally(&files)),
            Err(e) => warn!(session_id = %session.id, error = %e, "Could not count changed files"),
        }
    }

    /// Pass `result` through, marking the session failed if it is an error.
    async fn or_fail<T>(&self, session_id: &str, context: &str, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let message = format!("{}: {}", context, err);
        error!(session_id = %session_id, "{}", message);
        self.logs.error(session_id, &message);

        match self.store.get(session_id).await {
            Ok(Some(mut session)) if !session.state.is_terminal() => {
                if self.agent.is_busy(session_id) || session.state == SessionState::Running {
                    if let Err(e) = self.agent.stop(session_id).await {
                        warn!(session_id = %session_id, error = %e, "Failed to stop agent");
                    }
                    if let Ok(Some(latest)) = self.store.get(session_id).await {
                        session = latest;
                    }
                }
                if session.fail(message).is_ok() {
                    if let Err(e) = self.store.update(&session).await {
                        error!(session_id = %session_id, error = %e, "Failed to persist failure");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => error!(session_id = %session_id, error = %e, "Failed to load session"),
        }
        Err(err)
    }
}

fn apply_counts(session: &mut Session, counts: ChangeCounts) {
    session.files_created = counts.created;
    session.files_modified = counts.modified;
    session.files_deleted = counts.deleted;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::SessionState;
use crate::error::{AppError, Result};

/// A migration session: one description, one branch, one agent conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub description: String,
    pub instructions: Option<String>,
    pub target_area: Option<String>,
    pub branch_name: Option<String>,
    pub conversation_id: Option<String>,
    pub working_directory: Option<String>,
    pub archive_name: Option<String>,
    pub unpacked_path: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub files_created: i64,
    pub files_modified: i64,
    pub files_deleted: i64,
    pub merged: bool,
    pub validated: bool,
    pub build_passed: bool,
    pub tests_passed: bool,
    pub error_message: Option<String>,
}

impl Session {
    pub fn new(
        description: impl Into<String>,
        instructions: Option<String>,
        target_area: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            instructions,
            target_area,
            branch_name: None,
            conversation_id: None,
            working_directory: None,
            archive_name: None,
            unpacked_path: None,
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            merged_at: None,
            files_created: 0,
            files_modified: 0,
            files_deleted: 0,
            merged: false,
            validated: false,
            build_passed: false,
            tests_passed: false,
            error_message: None,
        }
    }

    /// Move to `next`, applying the side effects of entering it.
    ///
    /// Entering `Running` allocates the conversation id on first entry and
    /// records `started_at`; entering `Merged` requires a branch; entering
    /// any terminal state records `completed_at`.
    pub fn transition_to(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "Session {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }

        let now = Utc::now();
        match next {
            SessionState::Running => {
                if self.state.is_pre_run() && self.branch_name.is_none() {
                    return Err(AppError::InvalidState(format!(
                        "Session {} has no branch and cannot start",
                        self.id
                    )));
                }
                self.conversation_id
                    .get_or_insert_with(|| Uuid::new_v4().to_string());
                self.started_at.get_or_insert(now);
            }
            SessionState::Merged => {
                if self.branch_name.is_none() {
                    return Err(AppError::InvalidState(format!(
                        "Session {} has no branch to merge",
                        self.id
                    )));
                }
                self.merged = true;
                self.merged_at = Some(now);
            }
            _ => {}
        }

        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record the session branch. Allowed once, before the agent starts.
    pub fn assign_branch(&mut self, branch_name: impl Into<String>) -> Result<()> {
        if let Some(existing) = &self.branch_name {
            return Err(AppError::InvalidState(format!(
                "Session {} already has branch {}",
                self.id, existing
            )));
        }
        if !self.state.is_pre_run() {
            return Err(AppError::InvalidState(format!(
                "Session {} is {} and can no longer take a branch",
                self.id, self.state
            )));
        }
        self.branch_name = Some(branch_name.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `Failed` and keep `message` for the status endpoint.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition_to(SessionState::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

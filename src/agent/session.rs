use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stream_json::{parse_line, LineOutcome, LineStats};
use crate::{
    config::AgentConfig,
    database::sessions::SessionStore,
    error::{AppError, Result},
    logs::{LogBroadcaster, LogLevel},
    process::{CommandSpec, ProcessRunner},
    sessions::SessionState,
};

/// Acknowledgement that a command was queued for a session's agent
#[derive(Debug, Clone, Serialize)]
pub struct CommandReceipt {
    pub session_id: String,
    pub conversation_id: String,
    pub sequence: u64,
    pub queued_at: DateTime<Utc>,
}

struct AgentCommand {
    prompt: String,
    sequence: u64,
}

/// In-memory bookkeeping for one session with a live conversation
struct SessionHandle {
    conversation_id: String,
    sender: mpsc::UnboundedSender<AgentCommand>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
    next_sequence: AtomicU64,
    worker: JoinHandle<()>,
}

/// Drives one agent conversation per session.
///
/// Each registered session owns a worker task that runs queued commands one
/// at a time, in submission order. Bookkeeping lives only in memory and is
/// rebuilt from the store when a running session is seen after a restart.
pub struct AgentSessionManager {
    store: Arc<dyn SessionStore>,
    logs: LogBroadcaster,
    config: AgentConfig,
    handles: DashMap<String, SessionHandle>,
    /// Sessions stopped through this manager. Never re-adopted until an
    /// explicit start or resume.
    stopped: DashSet<String>,
}

impl AgentSessionManager {
    pub fn new(store: Arc<dyn SessionStore>, logs: LogBroadcaster, config: AgentConfig) -> Self {
        Self {
            store,
            logs,
            config,
            handles: DashMap::new(),
            stopped: DashSet::new(),
        }
    }

    /// Begin a fresh conversation. The first command carries `instructions`.
    pub async fn start(
        &self,
        session_id: &str,
        instructions: &str,
        working_directory: &str,
    ) -> Result<()> {
        let mut session = self.store.require(session_id).await?;

        tokio::fs::create_dir_all(working_directory).await?;

        session.working_directory = Some(working_directory.to_string());
        session.transition_to(SessionState::Running)?;
        self.store.update(&session).await?;

        let conversation_id = session.conversation_id.clone().unwrap_or_default();
        self.stopped.remove(session_id);
        self.register(
            session_id,
            &conversation_id,
            PathBuf::from(working_directory),
            Some(instructions.to_string()),
            false,
        );

        info!(
            session_id = %session_id,
            conversation_id = %conversation_id,
            "Agent session started"
        );
        self.logs.info(session_id, "Agent session initialized");
        self.logs
            .info(session_id, format!("Working directory: {}", working_directory));
        Ok(())
    }

    /// Continue a paused session's conversation.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        let mut session = self.store.require(session_id).await?;
        let working_directory = session.working_directory.clone().ok_or_else(|| {
            AppError::InvalidState(format!(
                "Session {} has never been started",
                session_id
            ))
        })?;

        session.transition_to(SessionState::Running)?;
        self.store.update(&session).await?;

        let conversation_id = session.conversation_id.clone().unwrap_or_default();
        self.stopped.remove(session_id);
        self.register(
            session_id,
            &conversation_id,
            PathBuf::from(&working_directory),
            None,
            false,
        );
        self.logs.info(session_id, "Session resumed");
        Ok(())
    }

    /// Queue `command` for the session's agent and return immediately.
    pub async fn submit(&self, session_id: &str, command: &str) -> Result<CommandReceipt> {
        if !self.is_active(session_id).await? {
            return Err(AppError::NotFound(format!(
                "No active agent conversation for session '{}'",
                session_id
            )));
        }

        let handle = self.handles.get(session_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "No active agent conversation for session '{}'",
                session_id
            ))
        })?;

        let sequence = handle.next_sequence.fetch_add(1, Ordering::SeqCst);
        handle.pending.fetch_add(1, Ordering::SeqCst);
        let queued = handle.sender.send(AgentCommand {
            prompt: command.to_string(),
            sequence,
        });
        if queued.is_err() {
            handle.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::InvalidState(format!(
                "Agent worker for session '{}' is shutting down",
                session_id
            )));
        }

        debug!(session_id = %session_id, sequence, "Queued agent command");
        Ok(CommandReceipt {
            session_id: session_id.to_string(),
            conversation_id: handle.conversation_id.clone(),
            sequence,
            queued_at: Utc::now(),
        })
    }

    /// Cancel the in-flight command, drop queued ones, wait for the worker to
    /// finish and mark the session paused.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        // tombstone first so a concurrent is_active cannot re-adopt the
        // conversation while the worker winds down
        self.stopped.insert(session_id.to_string());
        if let Some((_, handle)) = self.handles.remove(session_id) {
            handle.cancel.cancel();
            drop(handle.sender);
            if let Err(e) = handle.worker.await {
                error!(session_id = %session_id, error = %e, "Agent worker panicked");
            }
        }

        let mut session = self.store.require(session_id).await?;
        if session.state != SessionState::Paused {
            session.transition_to(SessionState::Paused)?;
            self.store.update(&session).await?;
        }

        info!(session_id = %session_id, "Agent session stopped");
        self.logs.info(session_id, "Session stopped");
        Ok(())
    }

    /// Whether the session has a live conversation, re-adopting it from the
    /// store when the in-memory bookkeeping was lost.
    pub async fn is_active(&self, session_id: &str) -> Result<bool> {
        if self.handles.contains_key(session_id) {
            return Ok(true);
        }

        let Some(session) = self.store.get(session_id).await? else {
            return Ok(false);
        };
        let resumable = matches!(
            session.state,
            SessionState::Running | SessionState::Transforming
        );
        match (resumable, session.conversation_id, session.working_directory) {
            (true, Some(conversation_id), Some(working_directory)) => {
                let adopted = self.register(
                    session_id,
                    &conversation_id,
                    PathBuf::from(working_directory),
                    None,
                    true,
                );
                if adopted {
                    info!(
                        session_id = %session_id,
                        conversation_id = %conversation_id,
                        "Re-adopted agent conversation"
                    );
                }
                Ok(adopted)
            }
            _ => Ok(false),
        }
    }

    /// Whether a command is queued or executing for the session
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.handles
            .get(session_id)
            .map(|handle| handle.pending.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    fn register(
        &self,
        session_id: &str,
        conversation_id: &str,
        working_directory: PathBuf,
        instructions: Option<String>,
        adopt: bool,
    ) -> bool {
        let entry = match self.handles.entry(session_id.to_string()) {
            Entry::Occupied(_) => return true,
            Entry::Vacant(entry) => entry,
        };
        if adopt && self.stopped.contains(session_id) {
            debug!(session_id = %session_id, "Not re-adopting a stopped session");
            return false;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = AgentWorker {
            session_id: session_id.to_string(),
            working_directory,
            first_prompt_prefix: instructions.clone(),
            first: instructions.is_some(),
            config: self.config.clone(),
            logs: self.logs.clone(),
            cancel: cancel.clone(),
            pending: Arc::clone(&pending),
        };

        entry.insert(SessionHandle {
            conversation_id: conversation_id.to_string(),
            sender,
            cancel,
            pending,
            next_sequence: AtomicU64::new(1),
            worker: tokio::spawn(worker.run(receiver)),
        });
        true
    }
}

/// Executes one session's commands in order
struct AgentWorker {
    session_id: String,
    working_directory: PathBuf,
    first_prompt_prefix: Option<String>,
    first: bool,
    config: AgentConfig,
    logs: LogBroadcaster,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl AgentWorker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<AgentCommand>) {
        debug!(session_id = %self.session_id, "Agent worker started");

        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.execute(command).await;
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }

        let mut dropped = 0;
        while receiver.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            dropped += 1;
        }
        if dropped > 0 {
            info!(
                session_id = %self.session_id,
                dropped,
                "Discarded queued agent commands"
            );
        }
        debug!(session_id = %self.session_id, "Agent worker ended");
    }

    fn command_spec(&self, prompt: String) -> CommandSpec {
        let spec = if self.config.unbuffered {
            CommandSpec::new("stdbuf", &self.working_directory)
                .arg("-o0")
                .arg(&self.config.executable)
        } else {
            CommandSpec::new(&self.config.executable, &self.working_directory)
        };

        let mut spec = spec.args(["--print", "--verbose", "--output-format", "stream-json"]);
        if self.config.skip_permissions {
            spec = spec.arg("--dangerously-skip-permissions");
        }
        if !self.first {
            spec = spec.arg("--continue");
        }
        spec.arg(prompt)
    }

    async fn execute(&mut self, command: AgentCommand) {
        let prompt = match (&self.first_prompt_prefix, self.first) {
            (Some(instructions), true) => format!("{}\n\n{}", instructions, command.prompt),
            _ => command.prompt.clone(),
        };
        let spec = self.command_spec(prompt);

        info!(
            session_id = %self.session_id,
            sequence = command.sequence,
            continued = !self.first,
            "Running agent command"
        );
        self.logs
            .info(&self.session_id, format!("→ {}", command.prompt));

        let mut stats = LineStats::default();
        let session_id = &self.session_id;
        let logs = &self.logs;
        let result = ProcessRunner::run(&spec, &self.cancel, self.config.stop_grace(), |line| {
            match parse_line(line) {
                LineOutcome::Parsed(event) => match event.assistant_text() {
                    Some(text) => {
                        stats.forwarded += 1;
                        logs.send(session_id, LogLevel::Response, format!("← {}", text));
                    }
                    None => stats.suppressed += 1,
                },
                LineOutcome::Ignored => {}
                LineOutcome::Malformed(reason) => {
                    stats.malformed += 1;
                    debug!(session_id = %session_id, reason = %reason, "Skipping malformed agent line");
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                self.first = false;
                if outcome.cancelled {
                    self.logs.info(&self.session_id, "Command cancelled");
                } else if !outcome.success() {
                    let code = outcome
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    warn!(session_id = %self.session_id, exit_code = %code, "Agent command failed");
                    self.logs.error(
                        &self.session_id,
                        format!("Command failed with exit code: {}", code),
                    );
                }
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Failed to launch agent");
                self.logs
                    .error(&self.session_id, format!("Failed to launch agent: {}", e));
            }
        }

        info!(
            session_id = %self.session_id,
            sequence = command.sequence,
            forwarded = stats.forwarded,
            suppressed = stats.suppressed,
            malformed = stats.malformed,
            "Agent command finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{create_memory_pool, sessions::SqliteSessionStore};
    use crate::sessions::Session;

    fn agent_config(executable: &str) -> AgentConfig {
        AgentConfig {
            executable: executable.to_string(),
            skip_permissions: true,
            unbuffered: false,
            stop_grace_secs: 1,
        }
    }

    async fn manager() -> (AgentSessionManager, Arc<dyn SessionStore>) {
        let store: Arc<dyn SessionStore> =
            Arc::new(SqliteSessionStore::new(create_memory_pool().await.unwrap()));
        let manager =
            AgentSessionManager::new(Arc::clone(&store), LogBroadcaster::new(), agent_config("true"));
        (manager, store)
    }

    fn worker(first: bool, config: AgentConfig) -> AgentWorker {
        AgentWorker {
            session_id: "s1".into(),
            working_directory: PathBuf::from("/tmp"),
            first_prompt_prefix: None,
            first,
            config,
            logs: LogBroadcaster::new(),
            cancel: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn first_command_has_no_continue_flag() {
        let spec = worker(true, agent_config("claude")).command_spec("hello".into());
        assert_eq!(spec.program, "claude");
        assert_eq!(
            spec.args,
            vec![
                "--print",
                "--verbose",
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
                "hello"
            ]
        );
    }

    #[test]
    fn later_commands_continue_unbuffered() {
        let mut config = agent_config("claude");
        config.unbuffered = true;
        config.skip_permissions = false;
        let spec = worker(false, config).command_spec("again".into());
        assert_eq!(spec.program, "stdbuf");
        assert_eq!(spec.args[..2], ["-o0", "claude"]);
        assert!(spec.args.contains(&"--continue".to_string()));
        assert!(!spec
            .args
            .contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("again"));
    }

    #[tokio::test]
    async fn submit_without_conversation_is_not_found() {
        let (manager, store) = manager().await;
        let session = Session::new("demo", None, None);
        store.insert(&session).await.unwrap();

        let err = manager.submit(&session.id, "hello").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(manager.submit("unknown", "hello").await.is_err());
    }

    #[tokio::test]
    async fn running_session_is_re_adopted() {
        let (manager, store) = manager().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("demo", None, None);
        session.assign_branch("migration/demo-20240101-000000").unwrap();
        session.working_directory = Some(dir.path().to_string_lossy().to_string());
        session.transition_to(SessionState::Running).unwrap();
        store.insert(&session).await.unwrap();

        assert!(manager.is_active(&session.id).await.unwrap());
        let receipt = manager.submit(&session.id, "hello").await.unwrap();
        assert_eq!(Some(receipt.conversation_id), session.conversation_id);
        assert_eq!(receipt.sequence, 1);
    }

    #[tokio::test]
    async fn paused_session_is_not_re_adopted() {
        let (manager, store) = manager().await;
        let mut session = Session::new("demo", None, None);
        session.assign_branch("b").unwrap();
        session.working_directory = Some("/tmp".into());
        session.transition_to(SessionState::Running).unwrap();
        session.transition_to(SessionState::Paused).unwrap();
        store.insert(&session).await.unwrap();

        assert!(!manager.is_active(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn stop_discards_bookkeeping_and_pauses() {
        let (manager, store) = manager().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("demo", None, None);
        session.assign_branch("b").unwrap();
        store.insert(&session).await.unwrap();

        manager
            .start(&session.id, "brief", &dir.path().to_string_lossy())
            .await
            .unwrap();
        assert!(manager.is_active(&session.id).await.unwrap());

        manager.stop(&session.id).await.unwrap();
        assert!(!manager.is_busy(&session.id));
        assert!(!manager.is_active(&session.id).await.unwrap());
        assert!(manager.submit(&session.id, "late").await.is_err());

        session = store.require(&session.id).await.unwrap();
        assert_eq!(session.state, SessionState::Paused);
    }

    #[tokio::test]
    async fn stopped_session_stays_stopped_until_resumed() {
        let (manager, store) = manager().await;
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new("demo", None, None);
        session.assign_branch("b").unwrap();
        store.insert(&session).await.unwrap();
        manager
            .start(&session.id, "brief", &dir.path().to_string_lossy())
            .await
            .unwrap();
        manager.stop(&session.id).await.unwrap();

        // a store that still reports the session running must not revive it
        session = store.require(&session.id).await.unwrap();
        session.transition_to(SessionState::Running).unwrap();
        store.update(&session).await.unwrap();
        assert!(!manager.is_active(&session.id).await.unwrap());
        assert!(manager.submit(&session.id, "late").await.is_err());

        session.transition_to(SessionState::Paused).unwrap();
        store.update(&session).await.unwrap();
        manager.resume(&session.id).await.unwrap();
        assert!(manager.is_active(&session.id).await.unwrap());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use quill_config::Config;
use quill_model::{
    AssistantMessage, ContentBlock, Message, ModelClient, RequestOptions, StopReason,
    ThinkingLevel, TokenUsage, ToolResultMessage, UserMessage,
};
use quill_tools::{PendingActionStore, ToolRegistry};
use quill_transcript::{Entry, EntryId, EntryPayload, TranscriptStore};

use crate::compact::{over_threshold, run_compaction};
use crate::error::CoreError;
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::hooks::{HookDispatcher, SessionAction};
use crate::invoker::{InvokerConfig, ToolCallRequest, ToolInvoker};
use crate::scheduler::{Disposition, QueuedPrompt, Scheduler, SchedulerState};
use crate::session::{
    compute_stats, export_html, message_entries, visible_conversation, SessionInfo, SessionStats,
    TodoPhase,
};
use crate::turn::{stream_turn, RetryPolicy, TurnRequest};

pub const RESOLVE_REMINDER_TYPE: &str = "resolve-reminder";
const PENDING_RESULT_TYPE: &str = "pending-action-result";

// ─── Commands ─────────────────────────────────────────────────────────────────

enum Command {
    Prompt { text: String, attachments: Vec<ContentBlock> },
    Steer { text: String },
    FollowUp { text: String },
    QueueMessage { text: String },
    Abort,
    SetModel { client: Arc<dyn ModelClient>, reply: oneshot::Sender<String> },
    CycleModel { reply: oneshot::Sender<String> },
    SetThinkingLevel { level: ThinkingLevel },
    SetAutoCompaction { enabled: bool },
    Compact {
        instructions: Option<String>,
        reply: oneshot::Sender<Result<bool, CoreError>>,
    },
    NewSession { reply: oneshot::Sender<Result<String, CoreError>> },
    Branch {
        entry_id: EntryId,
        reply: oneshot::Sender<Result<String, CoreError>>,
    },
    SwitchSession {
        path: PathBuf,
        reply: oneshot::Sender<Result<String, CoreError>>,
    },
    RecordBash { command: String, output: String, exit_code: i32 },
    RecordPython { code: String, output: String, is_error: bool },
    SetTodoPhases { phases: Vec<TodoPhase> },
    SetCustomState { key: String, value: serde_json::Value },
    GetInfo { reply: oneshot::Sender<SessionInfo> },
    GetMessages { reply: oneshot::Sender<Vec<Message>> },
    GetEntries { reply: oneshot::Sender<Vec<Entry>> },
    GetStats { reply: oneshot::Sender<SessionStats> },
    ExportHtml { reply: oneshot::Sender<String> },
    Shutdown { reply: oneshot::Sender<()> },
}

// ─── Public handle ────────────────────────────────────────────────────────────

/// Builder for a [`SessionController`].
pub struct SessionBuilder {
    clients: Vec<Arc<dyn ModelClient>>,
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookDispatcher>,
    config: Config,
    cwd: PathBuf,
    session_file: Option<PathBuf>,
    system_prompt: Option<String>,
}

impl SessionBuilder {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            clients: vec![client],
            registry: Arc::new(ToolRegistry::new()),
            hooks: Arc::new(HookDispatcher::new()),
            config: Config::default(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            session_file: None,
            system_prompt: None,
        }
    }

    /// Additional clients reachable through `cycle_model`.
    pub fn with_extra_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.clients.push(client);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Persist the session to this file; opened for resume when it already
    /// exists.  Without it the session lives in memory only.
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn spawn(self) -> Result<SessionController, CoreError> {
        let transcript = match &self.session_file {
            Some(path) if path.exists() => TranscriptStore::open(path)?,
            Some(path) => TranscriptStore::create(path)?,
            None => TranscriptStore::in_memory(),
        };
        let bus = Arc::new(EventBus::new(self.config.session.event_buffer));
        let pending = Arc::new(PendingActionStore::new());
        let invoker = ToolInvoker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.hooks),
            Arc::clone(&pending),
            Arc::clone(&bus),
            InvokerConfig::from_config(&self.config.tools),
        );
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let root_cancel = CancellationToken::new();
        let auto_compaction = self.config.compaction.auto;
        let scheduler = Scheduler::new(&self.config.session);
        let session_dir = self
            .session_file
            .as_ref()
            .and_then(|p| p.parent().map(PathBuf::from));

        let actor = Controller {
            cmd_rx,
            bus: Arc::clone(&bus),
            transcript,
            scheduler,
            pending,
            invoker,
            registry: self.registry,
            hooks: self.hooks,
            clients: self.clients,
            active_client: 0,
            thinking: ThinkingLevel::default(),
            config: self.config,
            auto_compaction,
            system_prompt: self.system_prompt,
            cwd: self.cwd,
            session_dir,
            usage_total: TokenUsage::default(),
            turn_index: 0,
            created_at: Utc::now(),
            todo_phases: Vec::new(),
            custom_state: serde_json::Map::new(),
            running: None,
            pending_compact: None,
            continue_turn: false,
            reminder_pending: false,
            shutting_down: false,
            shutdown_reply: None,
            root_cancel: root_cancel.clone(),
        };
        let task = tokio::spawn(actor.run());
        Ok(SessionController { cmd_tx, bus, root_cancel, task: Some(task) })
    }
}

/// Handle to a running session: forwards commands to the controller task
/// and exposes the event stream.
pub struct SessionController {
    cmd_tx: mpsc::Sender<Command>,
    bus: Arc<EventBus>,
    root_cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn builder(client: Arc<dyn ModelClient>) -> SessionBuilder {
        SessionBuilder::new(client)
    }

    async fn send(&self, cmd: Command) -> Result<(), CoreError> {
        self.cmd_tx.send(cmd).await.map_err(|_| CoreError::ShuttingDown)
    }

    /// Subscribe to the ordered session event stream.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Submit a prompt.  Starts a turn when idle; while streaming the
    /// configured interrupt mode decides between steering and queueing.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send(Command::Prompt { text: text.into(), attachments: vec![] }).await
    }

    pub async fn prompt_with_attachments(
        &self,
        text: impl Into<String>,
        attachments: Vec<ContentBlock>,
    ) -> Result<(), CoreError> {
        self.send(Command::Prompt { text: text.into(), attachments }).await
    }

    /// Interrupt the in-flight turn; the message leads the next turn.
    pub async fn steer(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send(Command::Steer { text: text.into() }).await
    }

    /// Queue a message for after the current turn completes naturally.
    pub async fn follow_up(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send(Command::FollowUp { text: text.into() }).await
    }

    /// Push onto the follow-up queue unconditionally.
    pub async fn queue_message(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send(Command::QueueMessage { text: text.into() }).await
    }

    /// Cancel the in-flight turn without queueing anything.
    pub async fn abort(&self) -> Result<(), CoreError> {
        self.send(Command::Abort).await
    }

    /// Replace the model for subsequent turns; the in-flight turn is
    /// unaffected.  Returns the active model name.
    pub async fn set_model(&self, client: Arc<dyn ModelClient>) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetModel { client, reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    /// Rotate to the next configured model; returns its name.
    pub async fn cycle_model(&self) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CycleModel { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    pub async fn set_thinking_level(&self, level: ThinkingLevel) -> Result<(), CoreError> {
        self.send(Command::SetThinkingLevel { level }).await
    }

    pub async fn set_auto_compaction(&self, enabled: bool) -> Result<(), CoreError> {
        self.send(Command::SetAutoCompaction { enabled }).await
    }

    /// Compact now.  Returns `Ok(true)` when a new compaction entry was
    /// written, `Ok(false)` when the session was already compact.  Runs
    /// after the in-flight turn, if any.
    pub async fn compact(&self, instructions: Option<String>) -> Result<bool, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Compact { instructions, reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Start a fresh session; the old one is fully persisted (or discarded
    /// for in-memory sessions) first.  Returns the new session id.
    pub async fn new_session(&self) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::NewSession { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Branch from an entry of the current session into a new session
    /// seeded with the prefix `[0..=entry_id]`.
    pub async fn branch(&self, entry_id: EntryId) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Branch { entry_id, reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Resume a previously written session file.
    pub async fn switch_session(&self, path: impl Into<PathBuf>) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SwitchSession { path: path.into(), reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    /// Record a command the user executed directly.
    pub async fn record_bash_execution(
        &self,
        command: impl Into<String>,
        output: impl Into<String>,
        exit_code: i32,
    ) -> Result<(), CoreError> {
        self.send(Command::RecordBash {
            command: command.into(),
            output: output.into(),
            exit_code,
        })
        .await
    }

    pub async fn record_python_execution(
        &self,
        code: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Result<(), CoreError> {
        self.send(Command::RecordPython { code: code.into(), output: output.into(), is_error })
            .await
    }

    /// Replace the working-plan phases shown in session info.
    pub async fn set_todo_phases(&self, phases: Vec<TodoPhase>) -> Result<(), CoreError> {
        self.send(Command::SetTodoPhases { phases }).await
    }

    /// Attach a key to the session's free-form custom state.
    pub async fn set_custom_state(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.send(Command::SetCustomState { key: key.into(), value }).await
    }

    pub async fn info(&self) -> Result<SessionInfo, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetInfo { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    /// All message entries, in transcript order.
    pub async fn messages(&self) -> Result<Vec<Message>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetMessages { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    /// The full transcript, every entry kind included.
    pub async fn entries(&self) -> Result<Vec<Entry>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetEntries { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    pub async fn stats(&self) -> Result<SessionStats, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetStats { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    pub async fn export_html(&self) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ExportHtml { reply: tx }).await?;
        rx.await.map_err(|_| CoreError::ShuttingDown)
    }

    /// Graceful shutdown: cancels in-flight work, waits out the grace
    /// window, flushes the transcript, and joins the controller task.
    pub async fn shutdown(mut self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
        self.root_cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

// ─── Actor ────────────────────────────────────────────────────────────────────

struct TurnReport {
    turn_index: u64,
    message: AssistantMessage,
    tool_results: Vec<ToolResultMessage>,
    /// The turn's cancellation token fired; no continuation is scheduled.
    cancelled: bool,
}

struct RunningTurn {
    fut: Pin<Box<dyn Future<Output = TurnReport> + Send>>,
    cancel: CancellationToken,
}

enum LoopEvent {
    Cmd(Option<Command>),
    Turn(TurnReport),
}

struct Controller {
    cmd_rx: mpsc::Receiver<Command>,
    bus: Arc<EventBus>,
    transcript: TranscriptStore,
    scheduler: Scheduler,
    pending: Arc<PendingActionStore>,
    invoker: ToolInvoker,
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookDispatcher>,
    clients: Vec<Arc<dyn ModelClient>>,
    active_client: usize,
    thinking: ThinkingLevel,
    config: Config,
    auto_compaction: bool,
    system_prompt: Option<String>,
    cwd: PathBuf,
    session_dir: Option<PathBuf>,
    usage_total: TokenUsage,
    turn_index: u64,
    created_at: DateTime<Utc>,
    todo_phases: Vec<TodoPhase>,
    custom_state: serde_json::Map<String, serde_json::Value>,
    running: Option<RunningTurn>,
    pending_compact: Option<(Option<String>, oneshot::Sender<Result<bool, CoreError>>)>,
    /// The last turn stopped with `ToolUse`; the model must see its tool
    /// results, so the next turn starts without waiting for user input.
    continue_turn: bool,
    reminder_pending: bool,
    shutting_down: bool,
    shutdown_reply: Option<oneshot::Sender<()>>,
    root_cancel: CancellationToken,
}

impl Controller {
    async fn run(mut self) {
        self.emit_session_event();
        loop {
            let event = if let Some(run) = self.running.as_mut() {
                tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => LoopEvent::Cmd(cmd),
                    report = run.fut.as_mut() => LoopEvent::Turn(report),
                }
            } else {
                if self.shutting_down {
                    break;
                }
                LoopEvent::Cmd(self.cmd_rx.recv().await)
            };

            match event {
                LoopEvent::Turn(report) => {
                    self.running = None;
                    self.commit_turn(report);
                    self.after_turn().await;
                }
                LoopEvent::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                LoopEvent::Cmd(None) => self.begin_shutdown(None).await,
            }

            if self.shutting_down && self.running.is_none() {
                break;
            }
        }
        if let Err(e) = self.transcript.flush() {
            warn!(error = %e, "transcript flush failed during shutdown");
        }
        self.bus.close();
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }

    fn client(&self) -> Arc<dyn ModelClient> {
        Arc::clone(&self.clients[self.active_client])
    }

    fn emit_session_event(&self) {
        self.bus.emit(SessionEvent::Session {
            session_id: self.transcript.session_id().to_string(),
            session_file: self.transcript.path().map(PathBuf::from),
        });
    }

    /// Append an entry, surfacing persistence failures as events; the
    /// store's degraded state then refuses further mutation until reset.
    fn append(&mut self, payload: EntryPayload) -> Option<EntryId> {
        match self.transcript.append(payload) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "transcript append failed");
                self.bus.emit(SessionEvent::Error { message: e.to_string() });
                None
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Prompt { text, attachments } => {
                let prompt = QueuedPrompt::with_attachments(text, attachments);
                match self.scheduler.prompt(prompt.clone()) {
                    Disposition::StartNow => self.begin_user_turn(prompt).await,
                    Disposition::Steered => self.cancel_running(),
                    Disposition::Queued | Disposition::Rejected => {}
                }
            }
            Command::Steer { text } => {
                let prompt = QueuedPrompt::text(text);
                match self.scheduler.steer(prompt.clone()) {
                    Disposition::StartNow => self.begin_user_turn(prompt).await,
                    Disposition::Steered => self.cancel_running(),
                    _ => {}
                }
            }
            Command::FollowUp { text } => {
                let prompt = QueuedPrompt::text(text);
                if self.scheduler.follow_up(prompt.clone()) == Disposition::StartNow {
                    self.begin_user_turn(prompt).await;
                }
            }
            Command::QueueMessage { text } => {
                let _ = self.scheduler.queue_message(QueuedPrompt::text(text));
            }
            Command::Abort => self.cancel_running(),
            Command::SetModel { client, reply } => {
                let name = client.model().to_string();
                match self.clients.iter().position(|c| c.model() == client.model()) {
                    Some(idx) => self.active_client = idx,
                    None => {
                        self.clients.push(client);
                        self.active_client = self.clients.len() - 1;
                    }
                }
                let _ = reply.send(name);
            }
            Command::CycleModel { reply } => {
                self.active_client = (self.active_client + 1) % self.clients.len();
                let _ = reply.send(self.client().model().to_string());
            }
            Command::SetThinkingLevel { level } => self.thinking = level,
            Command::SetAutoCompaction { enabled } => self.auto_compaction = enabled,
            Command::Compact { instructions, reply } => {
                if self.running.is_some() {
                    // An in-flight turn defers compaction to its end.
                    self.pending_compact = Some((instructions, reply));
                } else {
                    let result = self.compact_now(instructions).await;
                    let _ = reply.send(result);
                }
            }
            Command::NewSession { reply } => {
                let result = self.new_session().await;
                let _ = reply.send(result);
            }
            Command::Branch { entry_id, reply } => {
                let result = self.branch(entry_id).await;
                let _ = reply.send(result);
            }
            Command::SwitchSession { path, reply } => {
                let result = self.switch_session(path).await;
                let _ = reply.send(result);
            }
            Command::RecordBash { command, output, exit_code } => {
                self.append(EntryPayload::message(Message::BashExecution {
                    command,
                    output,
                    exit_code,
                }));
            }
            Command::RecordPython { code, output, is_error } => {
                self.append(EntryPayload::message(Message::PythonExecution {
                    code,
                    output,
                    is_error,
                }));
            }
            Command::SetTodoPhases { phases } => self.todo_phases = phases,
            Command::SetCustomState { key, value } => {
                self.custom_state.insert(key, value);
            }
            Command::GetInfo { reply } => {
                let _ = reply.send(SessionInfo {
                    id: self.transcript.session_id().to_string(),
                    session_file: self.transcript.path().map(PathBuf::from),
                    cwd: self.cwd.clone(),
                    created_at: self.created_at,
                    todo_phases: self.todo_phases.clone(),
                    custom_state: self.custom_state.clone(),
                });
            }
            Command::GetMessages { reply } => {
                let _ = reply.send(message_entries(self.transcript.entries()));
            }
            Command::GetEntries { reply } => {
                let _ = reply.send(self.transcript.entries().to_vec());
            }
            Command::GetStats { reply } => {
                let _ = reply.send(compute_stats(
                    self.transcript.session_id(),
                    self.transcript.entries(),
                    self.usage_total,
                ));
            }
            Command::ExportHtml { reply } => {
                let _ = reply.send(export_html(
                    self.transcript.session_id(),
                    self.transcript.entries(),
                ));
            }
            Command::Shutdown { reply } => {
                // Shutdown is observable but not vetoable.
                let _ = self.hooks.dispatch_before(SessionAction::Shutdown, &self.bus).await;
                self.begin_shutdown(Some(reply)).await;
            }
        }
    }

    fn cancel_running(&mut self) {
        if let Some(run) = &self.running {
            run.cancel.cancel();
        }
    }

    async fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.shutting_down = true;
        self.scheduler.set_state(SchedulerState::ShuttingDown);
        self.shutdown_reply = reply;
        self.settle_running().await;
    }

    /// Cancel the in-flight turn and wait out the grace window; whatever it
    /// produced is committed, anything slower is abandoned.
    async fn settle_running(&mut self) {
        if let Some(mut run) = self.running.take() {
            run.cancel.cancel();
            let grace = Duration::from_secs(self.config.session.shutdown_grace_secs);
            match tokio::time::timeout(grace, run.fut.as_mut()).await {
                Ok(report) => self.commit_turn(report),
                Err(_) => warn!("abandoning in-flight turn after grace window"),
            }
        }
    }

    async fn begin_user_turn(&mut self, prompt: QueuedPrompt) {
        self.bus.emit(SessionEvent::AgentStart);
        self.append(EntryPayload::message(Message::User(UserMessage {
            content: prompt.blocks,
        })));
        self.start_turn().await;
    }

    /// Persist one finished turn: assistant message, tool results in
    /// completion order, `turn_end`, and — when deferred side effects are
    /// waiting — the resolve-reminder entry that forces the model to
    /// acknowledge them on the zero-latency turn that follows.
    fn commit_turn(&mut self, report: TurnReport) {
        self.usage_total.add(&report.message.usage);
        self.append(EntryPayload::message(Message::Assistant(report.message.clone())));
        for result in &report.tool_results {
            self.append(EntryPayload::message(Message::ToolResult(result.clone())));
        }
        self.continue_turn =
            report.message.stop_reason == StopReason::ToolUse && !report.cancelled;
        self.bus.emit(SessionEvent::TurnEnd {
            turn_index: report.turn_index,
            message: report.message,
            tool_results: report.tool_results,
        });

        if !self.pending.is_empty() {
            let labels = self.pending.labels();
            self.append(EntryPayload::Custom {
                custom_type: RESOLVE_REMINDER_TYPE.into(),
                data: serde_json::json!({
                    "text": format!(
                        "Deferred actions are waiting to be resolved: {}. \
                         Acknowledge them and continue.",
                        labels.join(", ")
                    ),
                    "labels": labels,
                }),
            });
            self.reminder_pending = true;
        }
    }

    /// Between-turns bookkeeping: deferred compaction first, then the next
    /// queued message (steering before follow-ups), then idle.
    async fn after_turn(&mut self) {
        if self.shutting_down {
            return;
        }
        if let Some((instructions, reply)) = self.pending_compact.take() {
            let result = self.compact_now(instructions).await;
            let _ = reply.send(result);
        }

        let next = self.scheduler.next_queued();
        if next.is_some() || self.reminder_pending || self.continue_turn {
            self.reminder_pending = false;
            self.continue_turn = false;
            if let Some(prompt) = next {
                self.append(EntryPayload::message(Message::User(UserMessage {
                    content: prompt.blocks,
                })));
            }
            self.start_turn().await;
        } else {
            self.scheduler.set_state(SchedulerState::Idle);
            self.bus.emit(SessionEvent::AgentEnd);
        }
    }

    /// Launch the next model turn.  Applies deferred actions, runs the
    /// automatic compaction gate, snapshots the visible conversation, and
    /// hands a fully-owned future to the event loop so commands keep
    /// flowing while the turn streams.
    async fn start_turn(&mut self) {
        self.apply_pending_actions();
        if self.auto_compaction {
            self.maybe_auto_compact().await;
        }

        let conversation = visible_conversation(self.transcript.entries());
        self.turn_index += 1;
        let turn_index = self.turn_index;

        let request = TurnRequest {
            client: self.client(),
            system_prompt: self.system_prompt.clone(),
            tools: self.registry.schemas(),
            conversation,
            options: RequestOptions {
                temperature: self.config.model.temperature,
                max_tokens: self.config.model.max_tokens,
                thinking: self.thinking,
                api_override: None,
            },
            retry: RetryPolicy::from_config(&self.config.retry),
        };

        let cancel = self.root_cancel.child_token();
        let turn_cancel = cancel.clone();
        let bus = Arc::clone(&self.bus);
        let invoker = self.invoker.clone();
        let cwd = self.cwd.clone();

        let fut = async move {
            let message = stream_turn(&request, turn_index, &bus, &turn_cancel).await;
            let tool_results = if message.stop_reason == StopReason::ToolUse {
                let calls: Vec<ToolCallRequest> = message
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, args)| ToolCallRequest {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: args.clone(),
                    })
                    .collect();
                invoker.dispatch_turn(calls, &cwd, &turn_cancel).await
            } else {
                Vec::new()
            };
            let cancelled = turn_cancel.is_cancelled();
            TurnReport { turn_index, message, tool_results, cancelled }
        };

        self.running = Some(RunningTurn { fut: Box::pin(fut), cancel });
        self.scheduler.set_state(SchedulerState::Streaming);
    }

    /// Drain and apply deferred side effects so the model sees their
    /// results in this turn's conversation.
    fn apply_pending_actions(&mut self) {
        for mut action in self.pending.drain() {
            let label = action.label.clone();
            let source = action.source_tool_name.clone();
            let data = match action.apply() {
                Ok(blocks) => serde_json::json!({
                    "label": label,
                    "source_tool": source,
                    "content": blocks,
                }),
                Err(e) => serde_json::json!({
                    "label": label,
                    "source_tool": source,
                    "error": e.to_string(),
                }),
            };
            self.append(EntryPayload::Custom {
                custom_type: PENDING_RESULT_TYPE.into(),
                data,
            });
        }
    }

    async fn maybe_auto_compact(&mut self) {
        let conversation = visible_conversation(self.transcript.entries());
        let client = self.client();
        let estimate = match client.count_tokens(&conversation).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "token estimate failed; skipping auto compaction");
                return;
            }
        };
        if !over_threshold(estimate, client.context_window(), self.config.compaction.threshold) {
            return;
        }
        if let Err(e) = self.compact_now(None).await {
            warn!(error = %e, "automatic compaction failed; session left unchanged");
            self.bus.emit(SessionEvent::Error { message: e.to_string() });
        }
    }

    /// Run one compaction pass.  `Ok(true)` when a new entry was written.
    async fn compact_now(&mut self, instructions: Option<String>) -> Result<bool, CoreError> {
        if let Some(decision) =
            self.hooks.dispatch_before(SessionAction::Compaction, &self.bus).await
        {
            return Err(CoreError::Compaction(
                decision.reason.unwrap_or_else(|| "cancelled by hook".into()),
            ));
        }
        let previous_state = self.scheduler.state();
        self.scheduler.set_state(SchedulerState::Compacting);
        self.bus.emit(SessionEvent::CompactionStart);

        let messages = self.visible_with_ids();
        let parent = self.transcript.last_compaction().cloned();
        let outcome = run_compaction(
            self.client(),
            &messages,
            parent.as_ref(),
            instructions.as_deref(),
            &self.config.compaction,
            &self.root_cancel,
        )
        .await;
        self.scheduler.set_state(previous_state);

        match outcome {
            Ok(Some(outcome)) => {
                self.append(EntryPayload::Compaction(outcome.record));
                self.bus.emit(SessionEvent::CompactionEnd {
                    tokens_before: outcome.tokens_before,
                    tokens_after: outcome.tokens_after,
                });
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The visible conversation paired with the transcript entry id backing
    /// each message; a prior summary is attributed to its compaction entry.
    fn visible_with_ids(&self) -> Vec<(EntryId, Message)> {
        let entries = self.transcript.entries();
        let last = entries.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Compaction(c) => Some((e.id, c)),
            _ => None,
        });
        let mut out = Vec::new();
        let min_id = match last {
            Some((entry_id, record)) => {
                out.push((
                    entry_id,
                    Message::CompactionSummary { summary: record.summary_text.clone() },
                ));
                Some(record.cut_point_entry_id)
            }
            None => None,
        };
        for entry in entries {
            if let Some(min) = min_id {
                if entry.id <= min {
                    continue;
                }
            }
            match &entry.payload {
                EntryPayload::Message { message, exclude_from_context } => {
                    if !exclude_from_context {
                        out.push((entry.id, message.clone()));
                    }
                }
                EntryPayload::Custom { custom_type, data } => {
                    out.push((
                        entry.id,
                        Message::Custom {
                            custom_type: custom_type.clone(),
                            data: data.clone(),
                        },
                    ));
                }
                _ => {}
            }
        }
        out
    }

    // ── Lifecycle transitions ─────────────────────────────────────────────────

    async fn new_session(&mut self) -> Result<String, CoreError> {
        if let Some(decision) =
            self.hooks.dispatch_before(SessionAction::NewSession, &self.bus).await
        {
            return Err(CoreError::Invalid(
                decision.reason.unwrap_or_else(|| "new session cancelled by hook".into()),
            ));
        }
        self.settle_running().await;
        self.transcript.flush()?;

        let fresh = match &self.session_dir {
            Some(dir) => TranscriptStore::create(
                dir.join(format!("quill-{}.jsonl", Uuid::new_v4())),
            )?,
            None => TranscriptStore::in_memory(),
        };
        self.replace_session(fresh)
    }

    async fn branch(&mut self, entry_id: EntryId) -> Result<String, CoreError> {
        if let Some(decision) = self.hooks.dispatch_before(SessionAction::Branch, &self.bus).await
        {
            return Err(CoreError::Invalid(
                decision.reason.unwrap_or_else(|| "branch cancelled by hook".into()),
            ));
        }
        self.settle_running().await;
        self.transcript.flush()?;

        let branch_path = self.transcript.path().map(|p| {
            let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("session");
            p.with_file_name(format!("{stem}-branch-{entry_id}.jsonl"))
        });
        let branch = self.transcript.branch_from(entry_id, branch_path)?;
        self.replace_session(branch)
    }

    async fn switch_session(&mut self, path: PathBuf) -> Result<String, CoreError> {
        if let Some(decision) =
            self.hooks.dispatch_before(SessionAction::SwitchSession, &self.bus).await
        {
            return Err(CoreError::Invalid(
                decision.reason.unwrap_or_else(|| "switch cancelled by hook".into()),
            ));
        }
        self.settle_running().await;
        self.transcript.flush()?;
        let store = TranscriptStore::open(&path)?;
        self.replace_session(store)
    }

    /// Swap in a new transcript and reset per-session state.  The outgoing
    /// session was flushed (or settled) by the caller, so all of its
    /// artifacts are durable before the new session becomes observable.
    fn replace_session(&mut self, store: TranscriptStore) -> Result<String, CoreError> {
        self.transcript = store;
        self.scheduler = Scheduler::new(&self.config.session);
        self.pending.drain();
        self.usage_total = TokenUsage::default();
        self.turn_index = 0;
        self.reminder_pending = false;
        self.continue_turn = false;
        self.pending_compact = None;
        self.created_at = Utc::now();
        self.todo_phases.clear();
        self.custom_state.clear();
        let id = self.transcript.session_id().to_string();
        self.emit_session_event();
        Ok(id)
    }
}

//! Editor-side session: debounced validation and execute-over-channel.
//!
//! Validation is last-initiated-wins. Each debounced call gets the next
//! sequence number; a call still running when a newer one starts is
//! aborted, and any result whose number is not the latest initiated is
//! discarded. Results are never ordered by arrival.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use codepad_core::{Diagnostic, Draft, ExecutionResult};
use codepad_eval::EvaluationEngine;

use crate::channel::{ChannelError, ChannelEvent, ChannelState, LiveChannel};
use crate::protocol::{ClientFrame, ServerFrame, ValidateRequest, ValidateResponse};

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Quiescence window before an edit is validated
    pub debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Anything that can compile a draft and report diagnostics.
#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate(&self, command: &str, classes: &str) -> Result<Vec<Diagnostic>, ChannelError>;
}

#[async_trait]
impl Validator for EvaluationEngine {
    async fn validate(&self, command: &str, classes: &str) -> Result<Vec<Diagnostic>, ChannelError> {
        Ok(EvaluationEngine::validate(self, command, classes).await)
    }
}

/// Validator that calls a remote `POST /validate` endpoint.
pub struct HttpValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpValidator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, command: &str, classes: &str) -> Result<Vec<Diagnostic>, ChannelError> {
        let request = ValidateRequest {
            command: command.to_string(),
            classes: classes.to_string(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(body.diagnostics)
    }
}

/// What the editor should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Diagnostics of the most recently initiated validation
    Diagnostics { seq: u64, diagnostics: Vec<Diagnostic> },
    /// The most recently initiated validation could not run
    ValidationFailed { seq: u64, message: String },
    /// An execution result pushed over the channel
    Result(ExecutionResult),
    /// The channel reported a transport problem
    TransportFault(String),
    /// The channel changed state
    Connection(ChannelState),
}

/// Per-editor coordinator.
pub struct SessionCoordinator {
    channel: LiveChannel,
    edits: mpsc::UnboundedSender<Draft>,
    latest: Arc<AtomicU64>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// Take over `channel`'s inbound events and start the debounce loop.
    pub fn new(config: SessionConfig, validator: Arc<dyn Validator>, mut channel: LiveChannel) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (edit_tx, edit_rx) = mpsc::unbounded_channel();
        let latest = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(debounce_loop(
            edit_rx,
            Duration::from_millis(config.debounce_ms),
            validator,
            event_tx.clone(),
            latest.clone(),
        )));
        if let Some(channel_rx) = channel.take_event_rx() {
            tasks.push(tokio::spawn(forward_channel_events(channel_rx, event_tx)));
        }

        Self {
            channel,
            edits: edit_tx,
            latest,
            event_rx: Some(event_rx),
            tasks,
        }
    }

    /// Record an edit; validation runs once edits go quiet.
    pub fn edit(&self, command: &str, classes: &str) {
        let _ = self.edits.send(Draft::new(command, classes));
    }

    /// Send the draft for execution, text unchanged. Blank commands are ignored.
    ///
    /// Returns whether anything was sent. The result arrives later as
    /// [`SessionEvent::Result`].
    pub async fn execute(&self, command: &str, classes: &str) -> Result<bool, ChannelError> {
        if command.trim().is_empty() {
            log::debug!("Ignoring execute of an empty command");
            return Ok(false);
        }
        self.channel.execute(command, classes).await?;
        Ok(true)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Sequence number of the most recently initiated validation.
    pub fn latest_seq(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> &LiveChannel {
        &self.channel
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn debounce_loop(
    mut edits: mpsc::UnboundedReceiver<Draft>,
    window: Duration,
    validator: Arc<dyn Validator>,
    events: mpsc::UnboundedSender<SessionEvent>,
    latest: Arc<AtomicU64>,
) {
    let mut pending: Option<Draft> = None;
    let mut deadline: Option<Instant> = None;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        let fire = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            edit = edits.recv() => match edit {
                Some(draft) => {
                    pending = Some(draft);
                    deadline = Some(Instant::now() + window);
                }
                None => break,
            },
            _ = fire => {
                deadline = None;
                let Some(draft) = pending.take() else { continue };
                let seq = latest.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(previous) = in_flight.take() {
                    previous.abort();
                }
                in_flight = Some(tokio::spawn(validate_one(
                    draft,
                    seq,
                    validator.clone(),
                    events.clone(),
                    latest.clone(),
                )));
            }
        }
    }

    if let Some(task) = in_flight {
        task.abort();
    }
}

async fn validate_one(
    draft: Draft,
    seq: u64,
    validator: Arc<dyn Validator>,
    events: mpsc::UnboundedSender<SessionEvent>,
    latest: Arc<AtomicU64>,
) {
    let outcome = validator.validate(&draft.content, &draft.classes).await;
    if latest.load(Ordering::SeqCst) != seq {
        log::trace!("Discarding superseded validation #{seq}");
        return;
    }
    let event = match outcome {
        Ok(diagnostics) => SessionEvent::Diagnostics { seq, diagnostics },
        Err(e) => SessionEvent::ValidationFailed {
            seq,
            message: e.to_string(),
        },
    };
    let _ = events.send(event);
}

async fn forward_channel_events(
    mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(event) = channel_rx.recv().await {
        let forwarded = match event {
            ChannelEvent::Frame(frame) => match frame.execution_result() {
                Some(result) => SessionEvent::Result(result),
                None => match frame {
                    ServerFrame::Error { message } => SessionEvent::TransportFault(message),
                    _ => continue,
                },
            },
            ChannelEvent::TransportFault(fault) => SessionEvent::TransportFault(fault),
            ChannelEvent::Connected => SessionEvent::Connection(ChannelState::Connected),
            ChannelEvent::Disconnected(_) => SessionEvent::Connection(ChannelState::Disconnected),
        };
        if events.send(forwarded).is_err() {
            break;
        }
    }
}

/// Frame a validation request for the live channel.
pub fn validate_frame(command: &str, classes: &str, seq: u64) -> ClientFrame {
    ClientFrame::Validate {
        command: command.to_string(),
        classes: classes.to_string(),
        seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Records calls; commands starting with `slow` take 300 ms.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Validator for Recording {
        async fn validate(&self, command: &str, _classes: &str) -> Result<Vec<Diagnostic>, ChannelError> {
            self.calls.lock().unwrap().push(command.to_string());
            if command.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if command == "offline" {
                return Err(ChannelError::Transport("connection refused".into()));
            }
            Ok(vec![Diagnostic::new(format!("checked {command}"))])
        }
    }

    fn coordinator(validator: Arc<Recording>, debounce_ms: u64) -> SessionCoordinator {
        let channel = LiveChannel::new(ChannelConfig::new("ws://127.0.0.1:9"));
        SessionCoordinator::new(SessionConfig { debounce_ms }, validator, channel)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_rapid_edits_validate_once() {
        let validator = Arc::new(Recording::default());
        let mut session = coordinator(validator.clone(), 100);
        let mut rx = session.take_event_rx().unwrap();

        for text in ["i", "in", "int", "int x", "int x = 1;"] {
            session.edit(text, "");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            next(&mut rx).await,
            SessionEvent::Diagnostics {
                seq: 1,
                diagnostics: vec![Diagnostic::new("checked int x = 1;")]
            }
        );
        assert_eq!(*validator.calls.lock().unwrap(), vec!["int x = 1;"]);
    }

    #[tokio::test]
    async fn test_last_initiated_wins() {
        let validator = Arc::new(Recording::default());
        let mut session = coordinator(validator.clone(), 20);
        let mut rx = session.take_event_rx().unwrap();

        session.edit("slow first", "");
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.edit("second", "");

        assert_eq!(
            next(&mut rx).await,
            SessionEvent::Diagnostics {
                seq: 2,
                diagnostics: vec![Diagnostic::new("checked second")]
            }
        );
        // The superseded call never renders.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.latest_seq(), 2);
        assert_eq!(validator.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_failure_is_reported() {
        let validator = Arc::new(Recording::default());
        let mut session = coordinator(validator, 10);
        let mut rx = session.take_event_rx().unwrap();

        session.edit("offline", "");
        assert!(matches!(
            next(&mut rx).await,
            SessionEvent::ValidationFailed { seq: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_blank_execute_is_ignored() {
        let session = coordinator(Arc::new(Recording::default()), 10);
        assert!(!session.execute("   \n\t", "class A {}").await.unwrap());
        assert_eq!(session.channel().state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_execute_surfaces_connect_failure() {
        let mut session = coordinator(Arc::new(Recording::default()), 10);
        let mut rx = session.take_event_rx().unwrap();

        assert!(session.execute("return 1;", "").await.is_err());
        assert!(matches!(next(&mut rx).await, SessionEvent::TransportFault(_)));
        assert_eq!(session.channel().state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_validate_frame() {
        assert_eq!(
            validate_frame("x", "y", 3),
            ClientFrame::Validate {
                command: "x".into(),
                classes: "y".into(),
                seq: 3
            }
        );
    }
}

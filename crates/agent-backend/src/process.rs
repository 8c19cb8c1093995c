//! Child-process backend
//!
//! Runs an agent CLI per session and talks to it over stdin/stdout using the
//! line protocol in `wire`. The session is considered open once the agent
//! prints `session_start`. A background reader task owns the child: it turns
//! stdout lines into events, forwards stderr to the log, and reports an
//! unexpected exit as a `Crashed` error on the event stream.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::event::BackendEvent;
use crate::hub::{EventHub, Subscription};
use crate::wire::{self, Inbound};
use crate::{Backend, BackendSession, BoxFuture, EnvOverrides};

/// How to launch the agent for one backend kind.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    pub kind: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Run sessions under the account pool's credential overrides.
    pub use_account_pool: bool,
    /// How long to wait for `session_start` after spawning.
    pub startup_timeout: Duration,
}

/// Backend that spawns one agent process per session.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }
}

impl Backend for ProcessBackend {
    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn uses_account_pool(&self) -> bool {
        self.config.use_account_pool
    }

    fn open_session(&self, env: EnvOverrides) -> BoxFuture<'_, Result<Arc<dyn BackendSession>>> {
        Box::pin(async move {
            let session = ProcessSession::spawn(&self.config, env).await?;
            Ok(Arc::new(session) as Arc<dyn BackendSession>)
        })
    }
}

struct ProcessSession {
    session_id: String,
    model: Arc<Mutex<Option<String>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    hub: EventHub,
    destroyed: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessSession {
    async fn spawn(config: &ProcessBackendConfig, env: EnvOverrides) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", config.command.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("agent stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("agent stdout not captured".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let kind = config.kind.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %kind, line = %line, "agent stderr");
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let (session_id, model) =
            match tokio::time::timeout(config.startup_timeout, wait_for_start(&mut lines)).await {
                Ok(Ok(started)) => started,
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    return Err(e);
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(Error::Spawn(format!(
                        "agent did not start a session within {}s",
                        config.startup_timeout.as_secs()
                    )));
                }
            };

        info!(
            backend = %config.kind,
            session_id = %session_id,
            model = model.as_deref().unwrap_or("default"),
            "agent session started"
        );

        let hub = EventHub::new();
        let model = Arc::new(Mutex::new(model));
        let destroyed = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(read_events(
            ReaderContext {
                kind: config.kind.clone(),
                hub: hub.clone(),
                model: model.clone(),
                destroyed: destroyed.clone(),
            },
            lines,
            child,
            kill_rx,
        ));

        Ok(Self {
            session_id,
            model,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            hub,
            destroyed,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Closed("session destroyed".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing to agent: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Io(format!("flushing agent stdin: {e}")))
    }
}

impl BackendSession for ProcessSession {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    fn model(&self) -> Option<String> {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn send(&self, prompt: &str) -> BoxFuture<'_, Result<()>> {
        let line = wire::Command::User { content: prompt }.to_line();
        Box::pin(self.write_line(line))
    }

    fn abort(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_line(wire::Command::Abort.to_line()))
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.stdin.lock().await.take();
            let kill_tx = self
                .kill_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(tx) = kill_tx {
                let _ = tx.send(());
            }
            debug!(session_id = %self.session_id, "agent session destroyed");
        })
    }
}

/// Read stdout until the agent announces its session.
async fn wait_for_start(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<(String, Option<String>)> {
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| Error::Spawn(format!("reading agent output: {e}")))?
            .ok_or_else(|| Error::Spawn("agent exited before starting a session".into()))?;

        match wire::parse_line(&line) {
            Some(Ok(Inbound::SessionStart { session_id, model })) => return Ok((session_id, model)),
            Some(Ok(other)) => debug!(?other, "ignoring event before session_start"),
            Some(Err(e)) => debug!(error = %e, line = %line, "ignoring unparseable startup line"),
            None => {}
        }
    }
}

struct ReaderContext {
    kind: String,
    hub: EventHub,
    model: Arc<Mutex<Option<String>>>,
    destroyed: Arc<AtomicBool>,
}

async fn read_events(
    ctx: ReaderContext,
    mut lines: Lines<BufReader<ChildStdout>>,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            // Fires on explicit destroy and when the session handle is dropped
            _ = &mut kill_rx => {
                let _ = child.kill().await;
                debug!(backend = %ctx.kind, "agent process killed");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => ctx.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    warn!(backend = %ctx.kind, error = %e, "failed reading agent output");
                    break;
                }
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into()),
        Err(e) => format!("unknown ({e})"),
    };

    if ctx.destroyed.load(Ordering::SeqCst) {
        return;
    }

    warn!(backend = %ctx.kind, code = %code, "agent process exited unexpectedly");
    ctx.hub.publish(BackendEvent::Error(Error::reported(
        ErrorKind::Crashed,
        format!("agent process exited with code {code}"),
    )));
}

impl ReaderContext {
    fn handle_line(&self, line: &str) {
        let inbound = match wire::parse_line(line) {
            Some(Ok(inbound)) => inbound,
            Some(Err(e)) => {
                warn!(backend = %self.kind, error = %e, "skipping unparseable agent line");
                return;
            }
            None => return,
        };

        if let Inbound::SessionStart { session_id, .. } = &inbound {
            debug!(backend = %self.kind, session_id = %session_id, "ignoring repeated session_start");
            return;
        }

        let Some(event) = inbound.into_event() else {
            return;
        };
        if let BackendEvent::ModelChanged { model } = &event {
            *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());
        }
        self.hub.publish(event);
    }
}

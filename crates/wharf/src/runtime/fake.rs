//! Deterministic in-memory runtime for tests.
//!
//! Behaves like a well-mannered daemon: containers move through
//! created/running/exited, every state change is published on the event
//! stream, `exec` spawns an echoing fake shell and every container reports
//! `127.0.0.1` as its address so port forwards can be exercised against
//! local listeners. Failures can be queued per operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::error::{RuntimeError, RuntimeResult};
use super::events::{DaemonAction, DaemonEvent};
use super::{
    ContainerInspect, ContainerRuntimeApi, CreateSpec, DaemonState, EventStream, ExecRequest,
    PtyControl, PtyProcess, TerminalSize,
};

/// Operations a failure can be queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    Exec,
    Events,
}

/// A failure to inject into the next call of an operation.
#[derive(Debug, Clone)]
pub enum FakeFailure {
    Unavailable,
    Conflict(String),
    Rejected(String),
    CommandFailed(String),
    /// Never answer (exercises call timeouts).
    Hang,
    /// Carry out the call, then never answer: the reply is lost on the way
    /// back. Honoured by `create`.
    LoseReply,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    state: DaemonState,
    spec: CreateSpec,
}

struct FakeExec {
    container_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    failures: HashMap<FakeOp, VecDeque<FakeFailure>>,
    calls: HashMap<FakeOp, usize>,
    lost_replies: HashSet<FakeOp>,
    subscribers: Vec<mpsc::UnboundedSender<DaemonEvent>>,
    execs: Vec<FakeExec>,
    last_resize: Option<TerminalSize>,
}

/// In-memory [`ContainerRuntimeApi`] implementation.
#[derive(Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A panicking test thread must not cascade into unrelated assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: FakeOp, failure: FakeFailure) {
        self.lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Number of times `op` has been called.
    pub fn calls(&self, op: FakeOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Daemon-side state of a container, `None` once removed.
    pub fn state_of(&self, container_id: &str) -> Option<DaemonState> {
        self.lock().containers.get(container_id).map(|c| c.state)
    }

    /// Spec the container was created with.
    pub fn spec_of(&self, container_id: &str) -> Option<CreateSpec> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Exec processes still running.
    pub fn live_execs(&self) -> usize {
        self.lock()
            .execs
            .iter()
            .filter(|e| !e.cancel.is_cancelled())
            .count()
    }

    pub fn last_resize(&self) -> Option<TerminalSize> {
        self.lock().last_resize
    }

    /// Stop a container behind the manager's back (crash, `docker stop`).
    pub fn simulate_exit(&self, container_id: &str, exit_code: i32) {
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.state = DaemonState::Exited;
        }
        Self::kill_execs(&mut state, container_id);
        Self::publish(
            &mut state,
            DaemonEvent::new(container_id, DaemonAction::Die).with_exit_code(exit_code),
        );
    }

    /// Start a container behind the manager's back.
    pub fn simulate_start(&self, container_id: &str) {
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.state = DaemonState::Running;
        }
        Self::publish(
            &mut state,
            DaemonEvent::new(container_id, DaemonAction::Start),
        );
    }

    /// Remove a container behind the manager's back.
    pub fn simulate_destroy(&self, container_id: &str) {
        let mut state = self.lock();
        state.containers.remove(container_id);
        Self::kill_execs(&mut state, container_id);
        Self::publish(
            &mut state,
            DaemonEvent::new(container_id, DaemonAction::Destroy),
        );
    }

    /// Make every exec process in the container exit.
    pub fn exit_execs(&self, container_id: &str) {
        let mut state = self.lock();
        Self::kill_execs(&mut state, container_id);
    }

    /// Publish an arbitrary event.
    pub fn emit(&self, event: DaemonEvent) {
        let mut state = self.lock();
        Self::publish(&mut state, event);
    }

    /// Drop every open event subscription (daemon restart).
    pub fn drop_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    fn kill_execs(state: &mut FakeState, container_id: &str) {
        for exec in state
            .execs
            .iter()
            .filter(|e| e.container_id == container_id)
        {
            exec.cancel.cancel();
        }
    }

    fn publish(state: &mut FakeState, event: DaemonEvent) {
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Count the call and pop a queued failure, if any.
    async fn enter(&self, op: FakeOp) -> RuntimeResult<()> {
        let failure = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            state.failures.get_mut(&op).and_then(|q| q.pop_front())
        };
        match failure {
            None => Ok(()),
            Some(FakeFailure::Unavailable) => Err(RuntimeError::Unavailable(
                "Cannot connect to the container daemon".to_string(),
            )),
            Some(FakeFailure::Conflict(msg)) => Err(RuntimeError::Conflict(msg)),
            Some(FakeFailure::Rejected(msg)) => Err(RuntimeError::Rejected(msg)),
            Some(FakeFailure::CommandFailed(msg)) => Err(RuntimeError::CommandFailed {
                command: format!("{op:?}").to_lowercase(),
                message: msg,
            }),
            Some(FakeFailure::Hang) => {
                futures::future::pending::<()>().await;
                Ok(())
            }
            Some(FakeFailure::LoseReply) => {
                self.lock().lost_replies.insert(op);
                Ok(())
            }
        }
    }

    /// Deliver a reply, unless it was set up to be lost.
    async fn reply<T>(&self, op: FakeOp, result: RuntimeResult<T>) -> RuntimeResult<T> {
        let lost = self.lock().lost_replies.remove(&op);
        if lost {
            futures::future::pending::<()>().await;
        }
        result
    }
}

struct FakePtyControl {
    cancel: CancellationToken,
    state: Arc<Mutex<FakeState>>,
}

impl PtyControl for FakePtyControl {
    fn resize(&self, size: TerminalSize) -> RuntimeResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::Pty("process exited".to_string()));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_resize = Some(size);
        Ok(())
    }

    fn kill(&self) -> RuntimeResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        self.enter(FakeOp::Create).await?;
        let result = {
            let mut state = self.lock();
            if state.containers.values().any(|c| c.name == spec.name) {
                Err(RuntimeError::Conflict(format!(
                    "the container name \"{}\" is already in use",
                    spec.name
                )))
            } else {
                let id = format!("{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                state.containers.insert(
                    id.clone(),
                    FakeContainer {
                        name: spec.name.clone(),
                        state: DaemonState::Created,
                        spec: spec.clone(),
                    },
                );
                Self::publish(&mut state, DaemonEvent::new(&id, DaemonAction::Create));
                Ok(id)
            }
        };
        self.reply(FakeOp::Create, result).await
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.enter(FakeOp::Start).await?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {container_id}")))?;
        if container.state != DaemonState::Running {
            container.state = DaemonState::Running;
            Self::publish(
                &mut state,
                DaemonEvent::new(container_id, DaemonAction::Start),
            );
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> RuntimeResult<()> {
        self.enter(FakeOp::Stop).await?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {container_id}")))?;
        if container.state == DaemonState::Running {
            container.state = DaemonState::Exited;
            Self::kill_execs(&mut state, container_id);
            Self::publish(
                &mut state,
                DaemonEvent::new(container_id, DaemonAction::Die).with_exit_code(143),
            );
            Self::publish(
                &mut state,
                DaemonEvent::new(container_id, DaemonAction::Stop),
            );
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> RuntimeResult<()> {
        self.enter(FakeOp::Remove).await?;
        let mut state = self.lock();
        if state.containers.remove(container_id).is_none() {
            return Err(RuntimeError::NotFound(format!(
                "no such container: {container_id}"
            )));
        }
        Self::kill_execs(&mut state, container_id);
        Self::publish(
            &mut state,
            DaemonEvent::new(container_id, DaemonAction::Destroy),
        );
        Ok(())
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> RuntimeResult<Option<ContainerInspect>> {
        self.enter(FakeOp::Inspect).await?;
        let state = self.lock();
        // Like the daemon, accept either an id or a name.
        let found = state.containers.get_key_value(container_id).or_else(|| {
            state
                .containers
                .iter()
                .find(|(_, c)| c.name == container_id)
        });
        Ok(found.map(|(id, c)| ContainerInspect {
            id: id.clone(),
            name: c.name.clone(),
            state: c.state,
            ip_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            labels: c.spec.labels.clone(),
        }))
    }

    async fn exec_attach(
        &self,
        container_id: &str,
        request: &ExecRequest,
    ) -> RuntimeResult<PtyProcess> {
        self.enter(FakeOp::Exec).await?;
        if request.command.is_empty() {
            return Err(RuntimeError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        {
            let mut state = self.lock();
            match state.containers.get(container_id) {
                Some(c) if c.state == DaemonState::Running => {}
                Some(_) => {
                    return Err(RuntimeError::Conflict(format!(
                        "container {container_id} is not running"
                    )));
                }
                None => {
                    return Err(RuntimeError::NotFound(format!(
                        "no such container: {container_id}"
                    )));
                }
            }
            state.execs.push(FakeExec {
                container_id: container_id.to_string(),
                cancel: cancel.clone(),
            });
            state.last_resize = Some(request.size);
        }

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(16);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(16);
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();

        // Echoing shell; "exit\n" ends it with status 0.
        let token = cancel.clone();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    _ = token.cancelled() => break Some(137),
                    chunk = input_rx.recv() => match chunk {
                        Some(chunk) if chunk.as_ref() == b"exit\n" => break Some(0),
                        Some(chunk) => {
                            if output_tx.send(chunk).await.is_err() {
                                break None;
                            }
                        }
                        None => break None,
                    },
                }
            };
            token.cancel();
            drop(output_tx);
            let _ = exit_tx.send(code);
        });

        Ok(PtyProcess {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: Box::new(FakePtyControl {
                cancel,
                state: Arc::clone(&self.state),
            }),
        })
    }

    async fn subscribe_events(&self) -> RuntimeResult<EventStream> {
        self.enter(FakeOp::Events).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }
}

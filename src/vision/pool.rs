//! Execution pool
//!
//! A fixed number of isolated contexts, each on its own thread with its own
//! handler, fed by a dispatcher thread. The dispatcher owns every piece of
//! mutable pool state; callers talk to it over channels only.
//!
//! Dispatch is FIFO: a context that becomes idle takes the oldest queued task
//! it may run. A context answering `error` fails only that task and returns
//! to the idle set. A task exceeding its deadline fails every in-flight task,
//! and all contexts are replaced by fresh ones that repeat the
//! `init`/`initialized` handshake. Late replies from replaced contexts are
//! discarded by generation.

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::context::{ContextFactory, ContextHandler, ContextRequest, ContextResponse, MessageType};
use super::error::{VisionError, VisionResult};
use super::resources::MemorySnapshot;
use crate::config::PoolSettings;

/// How long the dispatcher sleeps when nothing has a deadline
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle of one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initializing,
    Idle,
    Busy,
    Terminated,
}

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Empty,
    Initializing,
    Ready,
    Draining,
    Terminated,
}

/// Observable pool state
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub state: PoolState,
    pub contexts: Vec<ContextState>,
    /// Incremented every time the contexts are replaced
    pub generation: u64,
    pub queued: usize,
}

/// Pool sizing and deadlines
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub size: usize,
    pub task_timeout: Duration,
    pub init_timeout: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &PoolSettings, parallelism: usize) -> Self {
        Self {
            size: settings.resolved_size(parallelism),
            task_timeout: settings.task_timeout(),
            init_timeout: settings.init_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default(), 1)
    }
}

type Reply = Sender<VisionResult<ContextResponse>>;

struct Task {
    id: u64,
    request: ContextRequest,
    /// Only this context may run the task
    pin: Option<usize>,
    reply: Reply,
}

enum Command {
    Submit(Task),
    Reinitialize { cause: VisionError, reply: Sender<VisionResult<()>> },
    Shutdown,
}

/// Work item delivered to a context thread
struct ContextJob {
    task: Option<u64>,
    request: ContextRequest,
}

/// Reply from a context thread
struct Completion {
    generation: u64,
    index: usize,
    task: Option<u64>,
    response: ContextResponse,
}

/// Awaits the typed response of one submitted task
pub struct TaskHandle {
    id: u64,
    expected: MessageType,
    submitted_at: Instant,
    rx: Receiver<VisionResult<ContextResponse>>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Response type this task resolves with
    pub fn expected(&self) -> MessageType {
        self.expected
    }

    /// Block until the pool resolves the task
    pub fn wait(self) -> VisionResult<ContextResponse> {
        self.rx.recv().unwrap_or(Err(VisionError::PoolTerminated))
    }

    /// Block until the task resolves or `deadline` passes
    pub fn wait_until(self, deadline: Instant) -> VisionResult<ContextResponse> {
        match self.rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(VisionError::ContextTimeout(self.submitted_at.elapsed())),
            Err(RecvTimeoutError::Disconnected) => Err(VisionError::PoolTerminated),
        }
    }
}

/// Fixed-size pool of isolated execution contexts
pub struct ExecutionPool {
    commands: Sender<Command>,
    status: Arc<RwLock<PoolStatus>>,
    dispatcher: Option<JoinHandle<()>>,
    next_id: std::sync::atomic::AtomicU64,
    config: PoolConfig,
}

impl ExecutionPool {
    /// Spawn the contexts and wait for every init handshake
    pub fn start(factory: Arc<dyn ContextFactory>, config: PoolConfig) -> VisionResult<Self> {
        let config = PoolConfig {
            size: config.size.max(1),
            ..config
        };
        let status = Arc::new(RwLock::new(PoolStatus {
            state: PoolState::Empty,
            contexts: vec![ContextState::Uninitialized; config.size],
            generation: 0,
            queued: 0,
        }));

        let (commands, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let dispatcher = Dispatcher::new(factory, config, status.clone(), ready_tx);

        let handle = std::thread::Builder::new()
            .name("snaptext-pool".into())
            .spawn(move || dispatcher.run(command_rx))?;

        let pool = Self {
            commands,
            status,
            dispatcher: Some(handle),
            next_id: std::sync::atomic::AtomicU64::new(0),
            config,
        };

        // a stuck handshake is answered by the dispatcher's own init deadline
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(pool),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VisionError::PoolTerminated),
        }
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn status(&self) -> PoolStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> PoolState {
        self.status.read().state
    }

    /// Queue a task for the next free context
    pub fn submit(&self, request: ContextRequest) -> VisionResult<TaskHandle> {
        self.enqueue(request, None)
    }

    fn enqueue(&self, request: ContextRequest, pin: Option<usize>) -> VisionResult<TaskHandle> {
        if matches!(self.state(), PoolState::Draining | PoolState::Terminated) {
            return Err(VisionError::PoolTerminated);
        }

        let expected = request
            .message_type()
            .expected_response()
            .ok_or(VisionError::PoolTerminated)?;
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (reply, rx) = bounded(1);

        self.commands
            .send(Command::Submit(Task { id, request, pin, reply }))
            .map_err(|_| VisionError::PoolTerminated)?;

        Ok(TaskHandle {
            id,
            expected,
            submitted_at: Instant::now(),
            rx,
        })
    }

    /// Allocation counters summed over every context
    ///
    /// Terminated contexts are skipped.
    pub fn memory_info(&self) -> VisionResult<MemorySnapshot> {
        let live: Vec<usize> = self
            .status()
            .contexts
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != ContextState::Terminated)
            .map(|(index, _)| index)
            .collect();
        let handles = live
            .into_iter()
            .map(|index| self.enqueue(ContextRequest::GetMemoryInfo, Some(index)))
            .collect::<VisionResult<Vec<_>>>()?;

        let mut total = MemorySnapshot::default();
        for handle in handles {
            match handle.wait()? {
                ContextResponse::MemoryInfo(snapshot) => total = total.merge(snapshot),
                other => {
                    return Err(VisionError::Inference(format!(
                        "expected memoryInfo, got {}",
                        other.message_type()
                    )))
                }
            }
        }
        Ok(total)
    }

    /// Replace every context, failing in-flight tasks with `cause`
    ///
    /// Returns once the fresh contexts completed their handshake.
    pub fn reinitialize(&self, cause: VisionError) -> VisionResult<()> {
        let (reply, rx) = bounded(1);
        self.commands
            .send(Command::Reinitialize { cause, reply })
            .map_err(|_| VisionError::PoolTerminated)?;
        rx.recv().unwrap_or(Err(VisionError::PoolTerminated))
    }

    /// Drain in-flight work, fail queued tasks and stop every context
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                error!("Pool dispatcher panicked");
            }
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// In-flight task on a context
struct Pending {
    id: u64,
    expected: MessageType,
    reply: Reply,
}

struct Slot {
    state: ContextState,
    jobs: Option<Sender<ContextJob>>,
    thread: Option<JoinHandle<()>>,
    pending: Option<Pending>,
    deadline: Option<Instant>,
}

impl Slot {
    fn terminated() -> Self {
        Self {
            state: ContextState::Terminated,
            jobs: None,
            thread: None,
            pending: None,
            deadline: None,
        }
    }
}

struct Dispatcher {
    factory: Arc<dyn ContextFactory>,
    config: PoolConfig,
    status: Arc<RwLock<PoolStatus>>,
    state: PoolState,
    slots: Vec<Slot>,
    queue: VecDeque<Task>,
    generation: u64,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    /// Caller waiting for the current handshake round
    waiter: Option<Sender<VisionResult<()>>>,
    draining: bool,
}

impl Dispatcher {
    fn new(
        factory: Arc<dyn ContextFactory>,
        config: PoolConfig,
        status: Arc<RwLock<PoolStatus>>,
        ready: Sender<VisionResult<()>>,
    ) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            factory,
            config,
            status,
            state: PoolState::Empty,
            slots: Vec::new(),
            queue: VecDeque::new(),
            generation: 0,
            done_tx,
            done_rx,
            waiter: Some(ready),
            draining: false,
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        let done_rx = self.done_rx.clone();
        self.spawn_contexts();

        loop {
            if self.draining && self.slots.iter().all(|s| s.pending.is_none()) {
                break;
            }

            let command_rx = if self.draining { never() } else { commands.clone() };
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT);

            select! {
                recv(command_rx) -> command => match command {
                    Ok(command) => self.on_command(command),
                    Err(_) => self.begin_drain(),
                },
                recv(done_rx) -> completion => {
                    if let Ok(completion) = completion {
                        self.on_completion(completion);
                    }
                },
                default(timeout) => self.on_deadline(),
            }
        }

        self.finish();
    }

    fn spawn_contexts(&mut self) {
        self.set_state(PoolState::Initializing);
        let deadline = Instant::now() + self.config.init_timeout;

        let mut slots = Vec::with_capacity(self.config.size);
        for index in 0..self.config.size {
            let handler = self.factory.create(index);
            match spawn_context(index, self.generation, handler, self.done_tx.clone()) {
                Ok((jobs, thread)) => {
                    let init = ContextJob {
                        task: None,
                        request: ContextRequest::Init,
                    };
                    if jobs.send(init).is_err() {
                        slots.push(Slot::terminated());
                        continue;
                    }
                    slots.push(Slot {
                        state: ContextState::Initializing,
                        jobs: Some(jobs),
                        thread: Some(thread),
                        pending: None,
                        deadline: Some(deadline),
                    });
                }
                Err(e) => {
                    error!("Failed to spawn context {}: {}", index, e);
                    slots.push(Slot::terminated());
                }
            }
        }
        self.slots = slots;

        if self.slots.iter().all(|s| s.state == ContextState::Terminated) {
            self.fail_pool(VisionError::Io("no execution context could be started".into()));
            return;
        }
        self.publish();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit(task) => {
                if self.draining {
                    let _ = task.reply.send(Err(VisionError::PoolTerminated));
                    return;
                }
                debug!("Queued task {} ({})", task.id, task.request.message_type());
                self.queue.push_back(task);
                self.dispatch();
            }
            Command::Reinitialize { cause, reply } => {
                if self.draining {
                    let _ = reply.send(Err(VisionError::PoolTerminated));
                    return;
                }
                if let Some(previous) = self.waiter.replace(reply) {
                    let _ = previous.send(Err(cause.clone()));
                }
                info!("Reinitializing execution pool: {}", cause);
                self.replace_contexts(cause);
            }
            Command::Shutdown => self.begin_drain(),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        if completion.generation != self.generation {
            debug!(
                "Discarding {} from replaced context {} (generation {})",
                completion.response.message_type(),
                completion.index,
                completion.generation
            );
            return;
        }
        let Some(slot) = self.slots.get_mut(completion.index) else {
            return;
        };

        match slot.state {
            ContextState::Initializing => match completion.response {
                ContextResponse::Initialized => {
                    debug!("Context {} initialized", completion.index);
                    slot.state = ContextState::Idle;
                    slot.deadline = None;
                }
                ContextResponse::Error { message } => {
                    error!("Context {} failed to initialize: {}", completion.index, message);
                    self.fail_pool(VisionError::ModelLoad(message));
                    return;
                }
                other => {
                    let message = format!("unexpected {} during init", other.message_type());
                    self.fail_pool(VisionError::ModelLoad(message));
                    return;
                }
            },
            ContextState::Busy => {
                let pending = slot.pending.take();
                slot.state = ContextState::Idle;
                slot.deadline = None;

                match pending {
                    Some(pending) if Some(pending.id) == completion.task => {
                        let result = resolve(pending.expected, completion.response);
                        if let Err(e) = &result {
                            warn!("Task {} failed on context {}: {}", pending.id, completion.index, e);
                        }
                        let _ = pending.reply.send(result);
                    }
                    Some(pending) => {
                        let _ = pending.reply.send(Err(VisionError::Inference(
                            "context replied to a different task".into(),
                        )));
                    }
                    None => {}
                }
            }
            _ => return,
        }

        self.check_ready();
        self.dispatch();
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired: Vec<(usize, ContextState)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(i, s)| (i, s.state))
            .collect();

        for (index, state) in expired {
            match state {
                ContextState::Initializing => {
                    error!("Context {} did not finish its handshake", index);
                    self.fail_pool(VisionError::ContextTimeout(self.config.init_timeout));
                    return;
                }
                ContextState::Busy if self.draining => {
                    let slot = &mut self.slots[index];
                    if let Some(pending) = slot.pending.take() {
                        let _ = pending.reply.send(Err(VisionError::ContextTimeout(self.config.task_timeout)));
                    }
                    *slot = Slot::terminated();
                }
                ContextState::Busy => {
                    warn!("Context {} exceeded its {:?} deadline", index, self.config.task_timeout);
                    self.replace_contexts(VisionError::ContextTimeout(self.config.task_timeout));
                    return;
                }
                _ => {}
            }
        }
        self.publish();
    }

    /// Fail in-flight work and start a fresh generation of contexts
    ///
    /// The new generation is published before any in-flight task is failed.
    fn replace_contexts(&mut self, cause: VisionError) {
        let mut failed = Vec::new();
        for slot in &mut self.slots {
            failed.extend(slot.pending.take());
            // hung threads are detached; dropping the sender ends the rest
            *slot = Slot::terminated();
        }
        self.generation += 1;
        info!("Replacing execution contexts (generation {})", self.generation);
        self.spawn_contexts();

        for pending in failed {
            let _ = pending.reply.send(Err(cause.clone()));
        }
    }

    /// Move every idle context onto the oldest task it may run
    fn dispatch(&mut self) {
        if self.draining || self.state == PoolState::Terminated {
            return;
        }
        self.fail_orphaned_pins();

        for index in 0..self.slots.len() {
            if self.slots[index].state != ContextState::Idle {
                continue;
            }
            let Some(position) = self.queue.iter().position(|t| t.pin.map_or(true, |p| p == index)) else {
                continue;
            };
            let Some(task) = self.queue.remove(position) else {
                continue;
            };

            let expected = task
                .request
                .message_type()
                .expected_response()
                .unwrap_or(MessageType::Error);
            let job = ContextJob {
                task: Some(task.id),
                request: task.request,
            };

            let slot = &mut self.slots[index];
            let sent = slot.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
            if !sent {
                error!("Context {} is gone, failing task {}", index, task.id);
                let _ = task.reply.send(Err(VisionError::PoolTerminated));
                *slot = Slot::terminated();
                continue;
            }

            debug!("Dispatched task {} to context {}", task.id, index);
            slot.state = ContextState::Busy;
            slot.deadline = Some(Instant::now() + self.config.task_timeout);
            slot.pending = Some(Pending {
                id: task.id,
                expected,
                reply: task.reply,
            });
        }
        self.publish();
    }

    /// Fail queued tasks pinned to a context that will never run them
    fn fail_orphaned_pins(&mut self) {
        let slots = &self.slots;
        let (orphaned, queue): (VecDeque<Task>, VecDeque<Task>) = self.queue.drain(..).partition(|t| {
            t.pin
                .is_some_and(|p| slots.get(p).map_or(true, |s| s.state == ContextState::Terminated))
        });
        self.queue = queue;

        for task in orphaned {
            warn!("Context {:?} is terminated, failing pinned task {}", task.pin, task.id);
            let _ = task.reply.send(Err(VisionError::PoolTerminated));
        }
    }

    fn check_ready(&mut self) {
        if self.state != PoolState::Initializing {
            return;
        }
        if self.slots.iter().all(|s| s.state != ContextState::Initializing) {
            self.set_state(PoolState::Ready);
            if let Some(waiter) = self.waiter.take() {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.set_state(PoolState::Draining);
        for task in self.queue.drain(..) {
            let _ = task.reply.send(Err(VisionError::PoolTerminated));
        }
        self.publish();
    }

    /// Terminal failure: every task fails with `cause`
    fn fail_pool(&mut self, cause: VisionError) {
        for slot in &mut self.slots {
            if let Some(pending) = slot.pending.take() {
                let _ = pending.reply.send(Err(cause.clone()));
            }
            *slot = Slot::terminated();
        }
        for task in self.queue.drain(..) {
            let _ = task.reply.send(Err(cause.clone()));
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(cause));
        }
        self.draining = true;
        self.set_state(PoolState::Terminated);
    }

    fn finish(&mut self) {
        for slot in &mut self.slots {
            slot.jobs = None;
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(thread) = slot.thread.take() {
                if thread.join().is_err() {
                    warn!("Context {} panicked", index);
                }
            }
            slot.state = ContextState::Terminated;
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(VisionError::PoolTerminated));
        }
        self.set_state(PoolState::Terminated);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|s| s.deadline).min()
    }

    fn set_state(&mut self, state: PoolState) {
        if self.state != state {
            info!("Execution pool {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let mut status = self.status.write();
        status.state = self.state;
        status.contexts = self.slots.iter().map(|s| s.state).collect();
        status.generation = self.generation;
        status.queued = self.queue.len();
    }
}

/// Check a response against the type the task expects
fn resolve(expected: MessageType, response: ContextResponse) -> VisionResult<ContextResponse> {
    match response {
        ContextResponse::Error { message } => Err(VisionError::Inference(message)),
        response if response.message_type() == expected => Ok(response),
        other => Err(VisionError::Inference(format!(
            "expected {}, context replied {}",
            expected,
            other.message_type()
        ))),
    }
}

fn spawn_context(
    index: usize,
    generation: u64,
    mut handler: Box<dyn ContextHandler>,
    done: Sender<Completion>,
) -> std::io::Result<(Sender<ContextJob>, JoinHandle<()>)> {
    let (jobs, job_rx) = unbounded::<ContextJob>();

    let thread = std::thread::Builder::new()
        .name(format!("snaptext-ctx-{}-{}", generation, index))
        .spawn(move || {
            for job in job_rx {
                let response = handler.handle(job.request);
                let completion = Completion {
                    generation,
                    index,
                    task: job.task,
                    response,
                };
                if done.send(completion).is_err() {
                    break;
                }
            }
            debug!("Context {} (generation {}) stopped", index, generation);
        })?;

    Ok((jobs, thread))
}

//! The launch group: plain node processes and debug sessions supervised as
//! one unit.
//!
//! `ProcessGroup` owns every node process it spawned and the set of debug
//! sessions the host reported. Host notifications arrive on an inbox and are
//! handled one at a time. When the stop cascade fires, the group enters
//! `Stopping`, hands its members to a teardown task and ignores further stop
//! triggers until that task reports back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::command::{render, ParsedCommand};
use crate::config::LaunchRequest;
use crate::core_service::CoreService;
use crate::error::LaunchError;
use crate::host::{DebugHost, SessionId, TerminalId};
use crate::output::{colorize, sanitize_text, StreamKind, CAPTURE_ENV};
use crate::terminate::{terminate, ShutdownConfig, Terminable};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const INBOX_CAPACITY: usize = 256;

/// Identifier of a node process within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

/// Messages delivered to the group inbox.
#[derive(Debug)]
pub enum GroupEvent {
    /// The host started a debug session.
    SessionStarted(SessionId),
    /// The host reports a debug session has ended.
    SessionStopped(SessionId),
    /// The user closed a node terminal.
    TerminalClosed(TerminalId),
    /// A teardown task finished.
    TeardownFinished,
    /// Stop everything (host gone or Ctrl-C).
    Shutdown,
}

/// Cloneable sender side of the group inbox.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    tx: mpsc::Sender<GroupEvent>,
}

impl GroupHandle {
    pub fn from_sender(tx: mpsc::Sender<GroupEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: GroupEvent) {
        if self.tx.send(event).await.is_err() {
            log::debug!("launch group already finished, dropping event");
        }
    }
}

/// Stop-cascade and output policy, resolved from the launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPolicy {
    pub stop_all: bool,
    pub stop_core_after_debug: bool,
    pub stop_launched_nodes: bool,
    pub attach_terminals: bool,
    pub terminate_on_terminal_closed: bool,
}

impl From<&LaunchRequest> for GroupPolicy {
    fn from(request: &LaunchRequest) -> Self {
        Self {
            stop_all: request.stop_all,
            stop_core_after_debug: request.stop_core_after_debug,
            stop_launched_nodes: request.stop_launched_nodes,
            attach_terminals: request.attach_terminals_to_processes,
            terminate_on_terminal_closed: request.terminate_on_terminal_closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Idle,
    Active,
    Stopping,
}

/// What happened over the lifetime of a group.
#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    /// Completed teardown passes.
    pub teardowns: usize,
    /// Node failures, keyed by command line.
    pub failures: Vec<String>,
    /// Nodes that exited unsuccessfully on their own, with their status.
    pub abnormal_exits: Vec<String>,
}

struct ProcessRecord {
    name: String,
    command_line: String,
    process: Box<dyn Terminable>,
    terminal: Option<TerminalId>,
}

pub struct ProcessGroup {
    policy: GroupPolicy,
    shutdown: ShutdownConfig,
    host: Arc<dyn DebugHost>,
    core: Arc<dyn CoreService>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
    sessions: HashSet<SessionId>,
    terminals: HashMap<TerminalId, ProcessId>,
    phase: GroupPhase,
    next_id: u64,
    inbox_tx: mpsc::Sender<GroupEvent>,
    inbox: mpsc::Receiver<GroupEvent>,
    report: GroupReport,
}

impl ProcessGroup {
    pub fn new(
        policy: GroupPolicy,
        shutdown: ShutdownConfig,
        host: Arc<dyn DebugHost>,
        core: Arc<dyn CoreService>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        Self {
            policy,
            shutdown,
            host,
            core,
            processes: BTreeMap::new(),
            sessions: HashSet::new(),
            terminals: HashMap::new(),
            phase: GroupPhase::Idle,
            next_id: 0,
            inbox_tx,
            inbox,
            report: GroupReport::default(),
        }
    }

    /// A sender for host notifications.
    pub fn handle(&self) -> GroupHandle {
        GroupHandle::from_sender(self.inbox_tx.clone())
    }

    pub fn phase(&self) -> GroupPhase {
        self.phase
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Spawns a plain node process and takes ownership of it.
    ///
    /// `env` is the complete set of variables to add on top of the inherited
    /// environment. Output goes to a host terminal when the policy asks for
    /// one, and to the log otherwise.
    pub async fn spawn(
        &mut self,
        name: &str,
        command: &ParsedCommand,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessId, LaunchError> {
        let command_line = render(command);
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(self.policy.stop_launched_nodes);
        if self.policy.attach_terminals {
            cmd.envs(CAPTURE_ENV.iter().copied());
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        {
            // Kept nodes outlive our ends of their output pipes.
            let outlives_group = !self.policy.stop_launched_nodes;
            unsafe {
                cmd.pre_exec(move || {
                    let _ = libc::setpgid(0, 0);
                    if outlives_group {
                        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        log::info!("[{name}] started (pid {})", child.id().unwrap_or(0));

        let terminal = if self.policy.attach_terminals {
            match self.host.open_terminal(name).await {
                Ok(terminal) => Some(terminal),
                Err(err) => {
                    log::warn!("[{name}] no terminal, logging output instead: {err}");
                    None
                }
            }
        } else {
            None
        };

        let sink = match terminal {
            Some(terminal) => OutputSink::Terminal(Arc::clone(&self.host), terminal),
            None => OutputSink::Log,
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(
                name.to_string(),
                StreamKind::Stdout,
                stdout,
                sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                name.to_string(),
                StreamKind::Stderr,
                stderr,
                sink,
            ));
        }

        Ok(self.adopt(name, command_line, Box::new(child), terminal))
    }

    /// Takes ownership of an already running process.
    pub(crate) fn adopt(
        &mut self,
        name: &str,
        command_line: String,
        process: Box<dyn Terminable>,
        terminal: Option<TerminalId>,
    ) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        if let Some(terminal) = terminal {
            self.terminals.insert(terminal, id);
        }
        self.processes.insert(
            id,
            ProcessRecord {
                name: name.to_string(),
                command_line,
                process,
                terminal,
            },
        );
        self.activate();
        id
    }

    fn activate(&mut self) {
        if self.phase == GroupPhase::Idle {
            self.phase = GroupPhase::Active;
        }
    }

    /// Supervises the group until a teardown completes.
    pub async fn run(mut self) -> GroupReport {
        let mut exits = tokio::time::interval(EXIT_POLL_INTERVAL);
        exits.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = self.inbox.recv() => {
                    let Some(event) = event else { break };
                    if self.handle_event(event).await {
                        break;
                    }
                }
                _ = exits.tick() => self.poll_exits().await,
            }
        }
        self.report
    }

    /// Applies one inbox message. Returns true once a teardown has finished.
    async fn handle_event(&mut self, event: GroupEvent) -> bool {
        match event {
            GroupEvent::SessionStarted(session) => self.on_session_started(session),
            GroupEvent::SessionStopped(session) => self.on_session_stopped(session),
            GroupEvent::TerminalClosed(terminal) => self.on_terminal_closed(terminal),
            GroupEvent::Shutdown => {
                if self.phase == GroupPhase::Stopping {
                    log::debug!("shutdown requested while already stopping");
                } else {
                    log::info!("shutting down launch group");
                    self.begin_teardown();
                }
            }
            GroupEvent::TeardownFinished => {
                self.phase = GroupPhase::Idle;
                self.report.teardowns += 1;
                log::info!("launch group stopped");
                return true;
            }
        }
        false
    }

    fn on_session_started(&mut self, session: SessionId) {
        if self.phase == GroupPhase::Stopping {
            log::info!("debug session {session} started during teardown, stopping it");
            let host = Arc::clone(&self.host);
            tokio::spawn(async move {
                if let Err(err) = host.stop_session(&session).await {
                    log::warn!("failed to stop debug session {session}: {err}");
                }
            });
            return;
        }
        log::info!("debug session {session} started");
        self.sessions.insert(session);
        self.activate();
    }

    fn on_session_stopped(&mut self, session: SessionId) {
        if self.phase == GroupPhase::Stopping {
            log::debug!("debug session {session} stopped during teardown");
            return;
        }
        if !self.sessions.remove(&session) {
            log::debug!("ignoring stop of untracked debug session {session}");
            return;
        }
        log::info!("debug session {session} stopped");

        if self.policy.stop_all || self.sessions.is_empty() {
            self.begin_teardown();
        }
    }

    fn on_terminal_closed(&mut self, terminal: TerminalId) {
        let Some(id) = self.terminals.remove(&terminal) else {
            log::debug!("ignoring close of unknown terminal {}", terminal.0);
            return;
        };
        if !self.policy.terminate_on_terminal_closed {
            return;
        }
        let Some(mut record) = self.processes.remove(&id) else {
            return;
        };
        log::info!("[{}] terminal closed, stopping node", record.name);
        let shutdown = self.shutdown;
        tokio::spawn(async move {
            let outcome = terminate(record.process.as_mut(), shutdown, &record.name).await;
            log::info!("[{}] stopped ({outcome:?})", record.name);
        });
    }

    /// Moves every member out of the group and tears them down in the
    /// background. The group stays `Stopping` until the task reports back.
    fn begin_teardown(&mut self) {
        self.phase = GroupPhase::Stopping;
        let sessions: Vec<SessionId> = self.sessions.drain().collect();
        let processes: Vec<ProcessRecord> =
            std::mem::take(&mut self.processes).into_values().collect();
        self.terminals.clear();

        let host = Arc::clone(&self.host);
        let core = Arc::clone(&self.core);
        let policy = self.policy;
        let shutdown = self.shutdown;
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            teardown(host, core, policy, shutdown, sessions, processes).await;
            let _ = inbox.send(GroupEvent::TeardownFinished).await;
        });
    }

    async fn poll_exits(&mut self) {
        let mut exited = Vec::new();
        for (id, record) in self.processes.iter_mut() {
            match record.process.try_exit() {
                Ok(Some(status)) => exited.push((*id, Ok(status))),
                Ok(None) => {}
                Err(err) => exited.push((*id, Err(err))),
            }
        }

        for (id, result) in exited {
            let Some(record) = self.processes.remove(&id) else {
                continue;
            };
            if let Some(terminal) = record.terminal {
                self.terminals.remove(&terminal);
            }
            match result {
                Ok(status) if status.success() => log::info!("[{}] exited", record.name),
                Ok(status) => {
                    log::warn!("[{}] `{}` exited ({status})", record.name, record.command_line);
                    self.report
                        .abnormal_exits
                        .push(format!("{}: {status}", record.command_line));
                }
                Err(error) => {
                    log::error!("[{}] `{}` failed: {error}", record.name, record.command_line);
                    self.report
                        .failures
                        .push(format!("{}: {error}", record.command_line));
                }
            }
        }
    }
}

async fn teardown(
    host: Arc<dyn DebugHost>,
    core: Arc<dyn CoreService>,
    policy: GroupPolicy,
    shutdown: ShutdownConfig,
    sessions: Vec<SessionId>,
    processes: Vec<ProcessRecord>,
) {
    let stop_sessions = join_all(sessions.iter().map(|session| {
        let host = Arc::clone(&host);
        async move {
            if let Err(err) = host.stop_session(session).await {
                log::warn!("failed to stop debug session {session}: {err}");
            }
        }
    }));

    let stop_processes = async move {
        if policy.stop_launched_nodes {
            join_all(processes.into_iter().map(|mut record| async move {
                let outcome = terminate(record.process.as_mut(), shutdown, &record.name).await;
                log::info!("[{}] stopped ({outcome:?})", record.name);
            }))
            .await;
        } else if !processes.is_empty() {
            log::info!("leaving {} launched node(s) running", processes.len());
        }
    };

    tokio::join!(stop_sessions, stop_processes);

    if policy.stop_core_after_debug && core.status().await {
        log::info!("stopping ROS core");
        if let Err(err) = core.stop().await {
            log::warn!("failed to stop the ROS core: {err}");
        }
    }
}

#[derive(Clone)]
enum OutputSink {
    Terminal(Arc<dyn DebugHost>, TerminalId),
    Log,
}

async fn forward_output<R>(name: String, stream: StreamKind, reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                log::debug!("[{name}] {stream:?} closed: {err}");
                break;
            }
        }
        // Nodes are not bound to UTF-8; one bad byte must not end the capture.
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        match &sink {
            OutputSink::Terminal(host, terminal) => {
                // Keep draining even if the terminal is gone so the node never blocks.
                let _ = host.write_terminal(*terminal, &colorize(line)).await;
            }
            OutputSink::Log => match stream {
                StreamKind::Stdout => log::info!("[{name}] {}", sanitize_text(line)),
                StreamKind::Stderr => log::warn!("[{name}] {}", sanitize_text(line)),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_service::tests::FakeCore;
    use crate::debug_config::DebugConfiguration;
    use crate::terminate::ProcessSignal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeHost {
        pub refuse: bool,
        pub started: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<String>>,
        pub written: Mutex<Vec<(u64, String)>>,
        next_terminal: AtomicU64,
    }

    impl FakeHost {
        pub(crate) fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DebugHost for FakeHost {
        async fn start_session(&self, config: &DebugConfiguration) -> anyhow::Result<bool> {
            self.started.lock().unwrap().push(config.name().to_string());
            Ok(!self.refuse)
        }

        async fn stop_session(&self, session: &SessionId) -> anyhow::Result<()> {
            self.stopped.lock().unwrap().push(session.0.clone());
            Ok(())
        }

        async fn open_terminal(&self, _name: &str) -> anyhow::Result<TerminalId> {
            Ok(TerminalId(self.next_terminal.fetch_add(1, Ordering::SeqCst) + 1))
        }

        async fn write_terminal(&self, terminal: TerminalId, text: &str) -> anyhow::Result<()> {
            self.written.lock().unwrap().push((terminal.0, text.to_string()));
            Ok(())
        }

        async fn close_terminal(&self, _terminal: TerminalId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Node stand-in that exits on the first SIGINT.
    #[derive(Clone, Default)]
    pub(crate) struct FakeNode {
        pub signals: Arc<Mutex<Vec<ProcessSignal>>>,
        pub exited: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Terminable for FakeNode {
        fn send_signal(&mut self, signal: ProcessSignal) -> std::io::Result<()> {
            self.signals.lock().unwrap().push(signal);
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_exit(&mut self, _timeout: Duration) -> std::io::Result<bool> {
            Ok(self.exited.load(Ordering::SeqCst))
        }

        fn try_exit(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
            Ok(self
                .exited
                .load(Ordering::SeqCst)
                .then(std::process::ExitStatus::default))
        }
    }

    impl FakeNode {
        fn signal_count(&self) -> usize {
            self.signals.lock().unwrap().len()
        }
    }

    fn policy(stop_all: bool) -> GroupPolicy {
        GroupPolicy {
            stop_all,
            stop_core_after_debug: true,
            stop_launched_nodes: true,
            attach_terminals: false,
            terminate_on_terminal_closed: true,
        }
    }

    fn group(policy: GroupPolicy) -> (ProcessGroup, Arc<FakeHost>, Arc<FakeCore>) {
        let host = Arc::new(FakeHost::default());
        let core = Arc::new(FakeCore::running());
        let group = ProcessGroup::new(
            policy,
            ShutdownConfig::default(),
            Arc::clone(&host) as Arc<dyn DebugHost>,
            Arc::clone(&core) as Arc<dyn CoreService>,
        );
        (group, host, core)
    }

    fn session(id: &str) -> SessionId {
        SessionId(id.to_string())
    }

    fn adopt_nodes(group: &mut ProcessGroup, count: usize) -> Vec<FakeNode> {
        (0..count)
            .map(|i| {
                let node = FakeNode::default();
                group.adopt(
                    &format!("/node{i}"),
                    format!("/opt/ws/lib/node{i}"),
                    Box::new(node.clone()),
                    None,
                );
                node
            })
            .collect()
    }

    #[tokio::test]
    async fn last_session_stopping_tears_down_once() {
        let (mut group, _host, core) = group(policy(false));
        let nodes = adopt_nodes(&mut group, 2);
        for id in ["a", "b", "c"] {
            group.handle_event(GroupEvent::SessionStarted(session(id))).await;
        }
        assert_eq!(group.session_count(), 3);

        group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
        group.handle_event(GroupEvent::SessionStopped(session("b"))).await;
        assert_eq!(group.phase(), GroupPhase::Active);
        assert_eq!(group.process_count(), 2);
        assert!(nodes.iter().all(|node| node.signal_count() == 0));

        group.handle_event(GroupEvent::SessionStopped(session("c"))).await;
        assert_eq!(group.phase(), GroupPhase::Stopping);
        assert_eq!(group.process_count(), 0);

        let report = group.run().await;
        assert_eq!(report.teardowns, 1);
        for node in &nodes {
            assert_eq!(*node.signals.lock().unwrap(), vec![ProcessSignal::SigInt]);
        }
        assert_eq!(core.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_all_ignores_reentrant_stops() {
        let (mut group, host, core) = group(policy(true));
        let nodes = adopt_nodes(&mut group, 2);
        for id in ["a", "b", "c"] {
            group.handle_event(GroupEvent::SessionStarted(session(id))).await;
        }

        group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
        assert_eq!(group.phase(), GroupPhase::Stopping);
        group.handle_event(GroupEvent::SessionStopped(session("b"))).await;
        group.handle_event(GroupEvent::Shutdown).await;

        let report = group.run().await;
        assert_eq!(report.teardowns, 1);
        for node in &nodes {
            assert_eq!(node.signal_count(), 1);
        }
        let mut stopped = host.stopped.lock().unwrap().clone();
        stopped.sort();
        assert_eq!(stopped, vec!["b", "c"]);
        assert_eq!(core.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn untracked_session_stop_is_ignored() {
        let (mut group, host, _core) = group(policy(true));
        group.handle_event(GroupEvent::SessionStarted(session("a"))).await;
        group.handle_event(GroupEvent::SessionStopped(session("zzz"))).await;
        assert_eq!(group.phase(), GroupPhase::Active);
        assert_eq!(group.session_count(), 1);
        assert!(host.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn launched_nodes_survive_when_not_stopped() {
        let mut policy = policy(false);
        policy.stop_launched_nodes = false;
        policy.stop_core_after_debug = false;
        let (mut group, _host, core) = group(policy);
        let nodes = adopt_nodes(&mut group, 1);
        group.handle_event(GroupEvent::SessionStarted(session("a"))).await;
        group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
        let report = group.run().await;
        assert_eq!(report.teardowns, 1);
        assert_eq!(nodes[0].signal_count(), 0);
        assert_eq!(core.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn core_is_left_alone_when_not_running() {
        let (mut group, _host, core) = group(policy(false));
        core.running.store(false, Ordering::SeqCst);
        group.handle_event(GroupEvent::SessionStarted(session("a"))).await;
        group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
        group.run().await;
        assert_eq!(core.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closing_a_terminal_stops_only_its_node() {
        let (mut group, host, _core) = group(policy(true));
        let first = FakeNode::default();
        let second = FakeNode::default();
        group.adopt("/a", "/bin/a".into(), Box::new(first.clone()), Some(TerminalId(1)));
        group.adopt("/b", "/bin/b".into(), Box::new(second.clone()), Some(TerminalId(2)));
        group.handle_event(GroupEvent::SessionStarted(session("s"))).await;

        group.handle_event(GroupEvent::TerminalClosed(TerminalId(1))).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while first.signal_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(group.phase(), GroupPhase::Active);
        assert_eq!(group.process_count(), 1);
        assert_eq!(group.session_count(), 1);
        assert_eq!(second.signal_count(), 0);
        assert!(host.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_started_during_teardown_is_stopped() {
        let (mut group, host, _core) = group(policy(true));
        group.handle_event(GroupEvent::SessionStarted(session("a"))).await;
        group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
        group.handle_event(GroupEvent::SessionStarted(session("late"))).await;
        assert_eq!(group.session_count(), 0);
        group.run().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !host.stopped.lock().unwrap().iter().any(|id| id == "late") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn exited_nodes_leave_the_group() {
        let (mut group, _host, _core) = group(policy(false));
        let nodes = adopt_nodes(&mut group, 2);
        nodes[0].exited.store(true, Ordering::SeqCst);
        group.poll_exits().await;
        assert_eq!(group.process_count(), 1);
        assert_eq!(group.phase(), GroupPhase::Active);
        assert!(group.report.abnormal_exits.is_empty());
        assert!(group.report.failures.is_empty());
    }

    #[tokio::test]
    async fn kept_terminal_close_leaves_the_node_running() {
        let mut policy = policy(false);
        policy.terminate_on_terminal_closed = false;
        let (mut group, _host, _core) = group(policy);
        let first = FakeNode::default();
        let second = FakeNode::default();
        group.adopt("/a", "/bin/a".into(), Box::new(first.clone()), Some(TerminalId(1)));
        group.adopt("/b", "/bin/b".into(), Box::new(second.clone()), Some(TerminalId(2)));

        group.handle_event(GroupEvent::TerminalClosed(TerminalId(1))).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(group.phase(), GroupPhase::Active);
        assert_eq!(group.process_count(), 2);
        assert_eq!(first.signal_count(), 0);
        assert_eq!(second.signal_count(), 0);

        // A second close of the same terminal is unknown by now.
        group.handle_event(GroupEvent::TerminalClosed(TerminalId(1))).await;
        assert_eq!(group.process_count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_exit_is_reported_with_its_status() {
        let (mut group, _host, _core) = group(policy(false));
        let command = crate::command::parse_command(
            "/bin/sh -c 'exit 3'",
            crate::command::Platform::Unix,
        )
        .unwrap();
        group.spawn("/crasher", &command, &BTreeMap::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while group.process_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                group.poll_exits().await;
            }
        })
        .await
        .unwrap();
        assert!(group.report.failures.is_empty());
        assert_eq!(group.report.abnormal_exits.len(), 1);
        let exit = &group.report.abnormal_exits[0];
        assert!(exit.starts_with("/bin/sh"), "{exit}");
        assert!(exit.contains("exit status: 3"), "{exit}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_names_the_command() {
        let (mut group, _host, _core) = group(policy(false));
        let command = crate::command::parse_command(
            "/nonexistent/lib/talker __name:=talker",
            crate::command::Platform::Unix,
        )
        .unwrap();
        let err = group.spawn("/talker", &command, &BTreeMap::new()).await.unwrap_err();
        match err {
            LaunchError::Spawn { command, .. } => {
                assert!(command.starts_with("/nonexistent/lib/talker"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(group.phase(), GroupPhase::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_node_output_is_colored_into_its_terminal() {
        let mut policy = policy(false);
        policy.attach_terminals = true;
        policy.stop_core_after_debug = false;
        let (mut group, host, _core) = group(policy);
        let command = crate::command::parse_command(
            r#"/bin/sh -c "echo '[ WARN] low battery'; echo $PYTHONUNBUFFERED; exec sleep 30""#,
            crate::command::Platform::Unix,
        )
        .unwrap();
        group.spawn("/battery", &command, &BTreeMap::new()).await.unwrap();
        assert_eq!(group.process_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while host.written.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let written = host.written.lock().unwrap().clone();
        assert_eq!(written[0], (1, "\x1b[33m[ WARN] low battery\x1b[0m".to_string()));
        assert_eq!(written[1], (1, "1".to_string()));

        group.handle_event(GroupEvent::Shutdown).await;
        let report = tokio::time::timeout(Duration::from_secs(10), group.run())
            .await
            .unwrap();
        assert_eq!(report.teardowns, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_does_not_end_output_capture() {
        let mut policy = policy(false);
        policy.attach_terminals = true;
        policy.stop_core_after_debug = false;
        let (mut group, host, _core) = group(policy);
        let command = crate::command::parse_command(
            r#"/bin/sh -c "echo first; printf 'caf\351\n'; echo '[ WARN] after'; exec sleep 30""#,
            crate::command::Platform::Unix,
        )
        .unwrap();
        group.spawn("/cafe", &command, &BTreeMap::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while host.written.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let written = host.written.lock().unwrap().clone();
        assert_eq!(written[0], (1, "first".to_string()));
        assert_eq!(written[1], (1, "caf\u{FFFD}".to_string()));
        assert_eq!(written[2], (1, "\x1b[33m[ WARN] after\x1b[0m".to_string()));

        group.handle_event(GroupEvent::Shutdown).await;
        let report = tokio::time::timeout(Duration::from_secs(10), group.run())
            .await
            .unwrap();
        assert_eq!(report.teardowns, 1);
    }

    #[cfg(unix)]
    #[test]
    fn kept_node_outlives_the_runtime() {
        let pid_file = std::env::temp_dir().join(format!("rosdbg-kept-{}.pid", std::process::id()));
        let _ = std::fs::remove_file(&pid_file);
        let line = format!(
            "/bin/sh -c 'echo $$ > {}; while true; do echo tick; sleep 0.1; done'",
            pid_file.display()
        );
        let command =
            crate::command::parse_command(&line, crate::command::Platform::Unix).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let pid = runtime.block_on(async {
            let mut policy = policy(false);
            policy.stop_launched_nodes = false;
            policy.stop_core_after_debug = false;
            let (mut group, _host, _core) = group(policy);
            group.spawn("/ticker", &command, &BTreeMap::new()).await.unwrap();

            let pid = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Ok(text) = std::fs::read_to_string(&pid_file) {
                        if let Ok(pid) = text.trim().parse::<libc::pid_t>() {
                            return pid;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            group.handle_event(GroupEvent::SessionStarted(session("a"))).await;
            group.handle_event(GroupEvent::SessionStopped(session("a"))).await;
            let report = group.run().await;
            assert_eq!(report.teardowns, 1);
            pid
        });
        drop(runtime);
        let _ = std::fs::remove_file(&pid_file);

        // Several ticks land on closed pipes in this window.
        std::thread::sleep(Duration::from_secs(1));
        let mut status = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
            libc::waitpid(pid, &mut status, 0);
        }
        assert_eq!(reaped, 0, "node ended with wait status {status}");
    }
}

//! Liveness-gated lifecycle of the tail session, rotation watchdog, parser and
//! delivery children of one (host, log source) pair.
//!
//! `Supervisor::step` is the whole state machine and never blocks: it reaps exits,
//! applies the liveness verdict, escalates terminations past their grace period and
//! starts whatever should be running. The async loop around it lives in the runner.

use crate::config::{Config, ParserPolicy};
use crate::liveness::LivenessConsumer;
use crate::metrics::{CHILD_EXITS_TOTAL, CHILD_KILLS_TOTAL, CHILD_STARTS_TOTAL};
use crate::watchdog::RotationWatchdog;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

pub mod command;
pub mod plan;
pub mod process;

pub use command::{RoleCommands, TemplateContext};
pub use plan::SupervisionPlan;
pub use process::{ManagedProcess, ProcessLauncher, Role, ShellLauncher};

/// Parser and delivery first so they are listening before the tail publishes.
const START_ORDER: [Role; 4] = [Role::Parser, Role::Delivery, Role::Watchdog, Role::Tail];
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Stopped,
    Running,
    Terminating,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Used in logs, e.g. `jabbah2/ep`.
    pub name: String,
    pub grace_period: Duration,
    /// Random delay before the tail role may start again after it stopped.
    pub restart_jitter: (Duration, Duration),
    pub start_immediately: bool,
    pub parser_policy: ParserPolicy,
}

impl SupervisorSettings {
    pub fn live(config: &Config) -> Self {
        Self {
            name: format!("{}/{}", config.node.host, config.node.log_source),
            grace_period: config.grace_period(),
            restart_jitter: (
                Duration::from_secs(config.tail.restart_jitter_min_secs),
                Duration::from_secs(config.tail.restart_jitter_max_secs),
            ),
            start_immediately: config.tail.start_immediately,
            parser_policy: config.processes.parser_policy,
        }
    }
}

pub struct ChildProcessHandle {
    pub role: Role,
    pub name: String,
    pub command: String,
    process: Box<dyn ManagedProcess>,
    terminating: Option<Termination>,
}

#[derive(Debug, Clone, Copy)]
struct Termination {
    deadline: Instant,
    killed: bool,
}

impl ChildProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

struct RoleSlot {
    role: Role,
    command: Option<String>,
    handle: Option<ChildProcessHandle>,
    last_exit_code: Option<i32>,
}

pub struct Supervisor<L: ProcessLauncher> {
    settings: SupervisorSettings,
    launcher: L,
    slots: Vec<RoleSlot>,
    liveness: LivenessConsumer,
    watchdog: RotationWatchdog,
    next_tail_start: Option<Instant>,
    rotation_restart: bool,
}

impl<L: ProcessLauncher> Supervisor<L> {
    pub fn new(
        settings: SupervisorSettings,
        commands: RoleCommands,
        launcher: L,
        liveness: LivenessConsumer,
        now: Instant,
    ) -> Self {
        let slots = START_ORDER
            .iter()
            .map(|&role| RoleSlot {
                role,
                command: commands.get(role).map(str::to_string),
                handle: None,
                last_exit_code: None,
            })
            .collect();

        let mut supervisor = Self {
            settings,
            launcher,
            slots,
            liveness,
            watchdog: RotationWatchdog::new(),
            next_tail_start: None,
            rotation_restart: false,
        };
        if !supervisor.settings.start_immediately {
            supervisor.schedule_tail_restart(now);
        }
        supervisor
    }

    pub fn role_state(&self, role: Role) -> RoleState {
        match self.slot(role).and_then(|slot| slot.handle.as_ref()) {
            None => RoleState::Stopped,
            Some(handle) if handle.terminating.is_some() => RoleState::Terminating,
            Some(_) => RoleState::Running,
        }
    }

    pub fn handle(&self, role: Role) -> Option<&ChildProcessHandle> {
        self.slot(role).and_then(|slot| slot.handle.as_ref())
    }

    pub fn last_exit_code(&self, role: Role) -> Option<i32> {
        self.slot(role).and_then(|slot| slot.last_exit_code)
    }

    pub fn host_alive(&self) -> bool {
        self.liveness.host_alive()
    }

    pub fn next_tail_start(&self) -> Option<Instant> {
        self.next_tail_start
    }

    pub fn liveness_mut(&mut self) -> &mut LivenessConsumer {
        &mut self.liveness
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    /// Feed one line of watchdog output; a rotation restarts the tail session
    /// without waiting for the restart jitter.
    pub fn observe_watchdog_line(&mut self, line: &str, now: Instant) {
        if self.watchdog.observe_line(line).is_none() {
            return;
        }
        if self.role_state(Role::Tail) == RoleState::Running {
            info!(supervisor = %self.settings.name, "restarting tail session after rotation");
            self.rotation_restart = true;
            self.begin_terminate(Role::Tail, now);
        }
    }

    /// Evaluate every transition once.
    pub fn step(&mut self, now: Instant) {
        self.reap(now);

        let alive = self.liveness.tick(now);
        if !alive {
            self.begin_terminate(Role::Tail, now);
            self.begin_terminate(Role::Watchdog, now);
            if self.settings.parser_policy == ParserPolicy::TerminateWithTail {
                self.begin_terminate(Role::Parser, now);
                self.begin_terminate(Role::Delivery, now);
            }
        }

        self.escalate(now);

        if alive {
            for role in START_ORDER {
                if self.should_start(role, now) {
                    self.start(role, now);
                }
            }
        }
    }

    fn reap(&mut self, now: Instant) {
        let mut tail_stopped = false;
        for slot in &mut self.slots {
            let Some(handle) = slot.handle.as_mut() else {
                continue;
            };
            let code = match handle.process.try_wait() {
                Ok(Some(code)) => code,
                Ok(None) => continue,
                Err(err) => {
                    warn!(role = %slot.role, error = %err, "failed to poll child process");
                    continue;
                }
            };
            CHILD_EXITS_TOTAL.with_label_values(&[slot.role.as_str()]).inc();
            info!(
                role = %slot.role,
                name = %handle.name,
                exit_code = code,
                "child process exited"
            );
            slot.last_exit_code = Some(code);
            slot.handle = None;
            tail_stopped |= slot.role == Role::Tail;
        }

        if tail_stopped {
            if std::mem::take(&mut self.rotation_restart) {
                self.next_tail_start = None;
            } else {
                self.schedule_tail_restart(now);
            }
            if self.settings.parser_policy == ParserPolicy::TerminateWithTail {
                self.begin_terminate(Role::Parser, now);
                self.begin_terminate(Role::Delivery, now);
            }
        }
    }

    fn escalate(&mut self, now: Instant) {
        for slot in &mut self.slots {
            let Some(handle) = slot.handle.as_mut() else {
                continue;
            };
            let Some(termination) = handle.terminating.as_mut() else {
                continue;
            };
            if termination.killed || now < termination.deadline {
                continue;
            }
            warn!(
                role = %slot.role,
                name = %handle.name,
                pid = ?handle.process.id(),
                "child ignored graceful termination; force-killing"
            );
            if let Err(err) = handle.process.kill() {
                error!(role = %slot.role, error = %err, "failed to kill child process");
            }
            CHILD_KILLS_TOTAL.with_label_values(&[slot.role.as_str()]).inc();
            termination.killed = true;
        }
    }

    fn should_start(&self, role: Role, now: Instant) -> bool {
        let Some(slot) = self.slot(role) else {
            return false;
        };
        if slot.command.is_none() || slot.handle.is_some() {
            return false;
        }
        match role {
            Role::Tail => self.next_tail_start.map_or(true, |at| now >= at),
            _ => true,
        }
    }

    fn start(&mut self, role: Role, now: Instant) {
        let name = format!("{} {}", self.settings.name, role);
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.role == role) else {
            return;
        };
        let Some(command) = slot.command.clone() else {
            return;
        };

        match self.launcher.launch(role, &command) {
            Ok(process) => {
                CHILD_STARTS_TOTAL.with_label_values(&[role.as_str()]).inc();
                info!(role = %role, name = %name, pid = ?process.id(), "started child process");
                debug!(role = %role, command = %command, "child command line");
                slot.handle = Some(ChildProcessHandle {
                    role,
                    name,
                    command,
                    process,
                    terminating: None,
                });
                match role {
                    Role::Tail => self.next_tail_start = None,
                    Role::Watchdog => self.watchdog.reset(),
                    _ => {}
                }
            }
            Err(err) => {
                error!(role = %role, error = %err, "failed to start child process");
                if role == Role::Tail {
                    self.schedule_tail_restart(now);
                }
            }
        }
    }

    fn begin_terminate(&mut self, role: Role, now: Instant) {
        let deadline = now + self.settings.grace_period;
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.role == role) else {
            return;
        };
        let Some(handle) = slot.handle.as_mut() else {
            return;
        };
        if handle.terminating.is_some() {
            return;
        }
        debug!(role = %role, name = %handle.name, "terminating child process");
        if let Err(err) = handle.process.terminate() {
            warn!(role = %role, error = %err, "failed to send terminate signal");
        }
        handle.terminating = Some(Termination {
            deadline,
            killed: false,
        });
    }

    fn schedule_tail_restart(&mut self, now: Instant) {
        let delay = jitter(self.settings.restart_jitter);
        debug!(
            supervisor = %self.settings.name,
            delay_secs = delay.as_secs(),
            "tail session may restart after jitter"
        );
        self.next_tail_start = Some(now + delay);
    }

    fn slot(&self, role: Role) -> Option<&RoleSlot> {
        self.slots.iter().find(|slot| slot.role == role)
    }

    fn running(&self) -> usize {
        self.slots.iter().filter(|slot| slot.handle.is_some()).count()
    }

    /// Terminate every child, wait out the grace period, then force-kill leftovers.
    pub async fn shutdown(&mut self) {
        let now = Instant::now();
        for role in START_ORDER.iter().rev() {
            self.begin_terminate(*role, now);
        }
        let deadline = now + self.settings.grace_period;
        loop {
            self.reap(Instant::now());
            if self.running() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                self.escalate(Instant::now());
                self.reap(Instant::now());
                break;
            }
            sleep(SHUTDOWN_POLL).await;
        }
        info!(supervisor = %self.settings.name, remaining = self.running(), "supervisor stopped");
    }
}

fn jitter((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct FakeState {
        exit_code: Option<i32>,
        terminated: bool,
        killed: bool,
        /// Exit as soon as SIGTERM arrives.
        obeys_terminate: bool,
    }

    struct FakeProcess {
        state: Arc<Mutex<FakeState>>,
    }

    impl ManagedProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_wait(&mut self) -> Result<Option<i32>> {
            Ok(self.state.lock().expect("state").exit_code)
        }

        fn terminate(&mut self) -> Result<()> {
            let mut state = self.state.lock().expect("state");
            state.terminated = true;
            if state.obeys_terminate {
                state.exit_code = Some(143);
            }
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            let mut state = self.state.lock().expect("state");
            state.killed = true;
            state.exit_code = Some(137);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        obeys_terminate: bool,
        launched: Vec<(Role, Arc<Mutex<FakeState>>)>,
    }

    impl FakeLauncher {
        fn obedient() -> Self {
            Self {
                obeys_terminate: true,
                launched: Vec::new(),
            }
        }

        fn launches(&self, role: Role) -> usize {
            self.launched.iter().filter(|(r, _)| *r == role).count()
        }

        fn latest(&self, role: Role) -> Arc<Mutex<FakeState>> {
            self.launched
                .iter()
                .rev()
                .find(|(r, _)| *r == role)
                .map(|(_, state)| state.clone())
                .expect("role was launched")
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&mut self, role: Role, _command: &str) -> Result<Box<dyn ManagedProcess>> {
            let state = Arc::new(Mutex::new(FakeState {
                obeys_terminate: self.obeys_terminate,
                ..FakeState::default()
            }));
            self.launched.push((role, state.clone()));
            Ok(Box::new(FakeProcess { state }))
        }
    }

    fn commands(with_watchdog: bool) -> RoleCommands {
        RoleCommands {
            tail: "tail".to_string(),
            watchdog: with_watchdog.then(|| "watchdog".to_string()),
            parser: "parser".to_string(),
            delivery: None,
        }
    }

    fn settings(policy: ParserPolicy) -> SupervisorSettings {
        SupervisorSettings {
            name: "jabbah2/ep".to_string(),
            grace_period: Duration::from_secs(1),
            restart_jitter: (Duration::from_secs(60), Duration::from_secs(120)),
            start_immediately: true,
            parser_policy: policy,
        }
    }

    fn supervisor(launcher: FakeLauncher, policy: ParserPolicy, now: Instant) -> Supervisor<FakeLauncher> {
        let liveness = LivenessConsumer::new(
            "jabbah2",
            Duration::from_secs(5),
            Duration::from_secs(600),
            now,
        );
        Supervisor::new(settings(policy), commands(true), launcher, liveness, now)
    }

    #[test]
    fn alive_host_starts_every_role() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::obedient(), ParserPolicy::Drain, start);
        supervisor.step(start);

        for role in [Role::Tail, Role::Watchdog, Role::Parser] {
            assert_eq!(supervisor.role_state(role), RoleState::Running, "{role}");
        }
        assert_eq!(supervisor.role_state(Role::Delivery), RoleState::Stopped);
        let order: Vec<Role> = supervisor.launcher_mut().launched.iter().map(|(r, _)| *r).collect();
        assert_eq!(order, vec![Role::Parser, Role::Watchdog, Role::Tail]);
    }

    #[test]
    fn host_loss_stops_tail_and_recovery_restarts_it() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::obedient(), ParserPolicy::Drain, start);
        supervisor.step(start);

        let down = start + Duration::from_secs(1);
        supervisor.liveness_mut().observe(false, down);
        supervisor.step(down);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Terminating);

        // The fake exits on SIGTERM, so the next iteration reaps it.
        let reaped = down + Duration::from_millis(500);
        supervisor.liveness_mut().observe(false, reaped);
        supervisor.step(reaped);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);
        assert_eq!(supervisor.role_state(Role::Watchdog), RoleState::Stopped);
        assert_eq!(supervisor.role_state(Role::Parser), RoleState::Running);
        assert_eq!(supervisor.last_exit_code(Role::Tail), Some(143));

        // Still down after the jitter window has passed; nothing restarts.
        let later = reaped + Duration::from_secs(121);
        supervisor.liveness_mut().observe(false, later);
        supervisor.step(later);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);

        let back = later + Duration::from_secs(1);
        supervisor.liveness_mut().observe(true, back);
        supervisor.step(back);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Running);
        assert_eq!(supervisor.launcher_mut().launches(Role::Tail), 2);
    }

    #[test]
    fn stubborn_children_are_killed_after_the_grace_period() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::default(), ParserPolicy::Drain, start);
        supervisor.step(start);

        supervisor.liveness_mut().observe(false, start);
        supervisor.step(start);
        let tail = supervisor.launcher_mut().latest(Role::Tail);
        assert!(tail.lock().expect("state").terminated);

        supervisor.liveness_mut().observe(false, start + Duration::from_millis(999));
        supervisor.step(start + Duration::from_millis(999));
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Terminating);

        let past_grace = start + Duration::from_secs(1);
        supervisor.liveness_mut().observe(false, past_grace);
        supervisor.step(past_grace);
        assert!(tail.lock().expect("state").killed);

        supervisor.liveness_mut().observe(false, past_grace);
        supervisor.step(past_grace);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);
        assert_eq!(supervisor.last_exit_code(Role::Tail), Some(137));
    }

    #[test]
    fn tail_exit_waits_for_restart_jitter() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::obedient(), ParserPolicy::Drain, start);
        supervisor.step(start);

        supervisor.launcher_mut().latest(Role::Tail).lock().expect("state").exit_code = Some(255);
        let exited = start + Duration::from_secs(10);
        supervisor.step(exited);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);

        let next = supervisor.next_tail_start().expect("restart scheduled");
        assert!(next >= exited + Duration::from_secs(60));
        assert!(next <= exited + Duration::from_secs(120));

        supervisor.step(exited + Duration::from_secs(59));
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);
        supervisor.step(exited + Duration::from_secs(120));
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Running);
    }

    #[test]
    fn rotation_restarts_tail_without_jitter() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::obedient(), ParserPolicy::Drain, start);
        supervisor.step(start);

        supervisor.observe_watchdog_line("2024-03-01T10:00:00", start);
        supervisor.observe_watchdog_line("100", start);
        supervisor.observe_watchdog_line("not-an-inode", start);
        supervisor.observe_watchdog_line("100", start);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Running);

        supervisor.observe_watchdog_line("200", start);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Terminating);

        let next = start + Duration::from_secs(1);
        supervisor.step(next);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Running);
        assert_eq!(supervisor.launcher_mut().launches(Role::Tail), 2);
    }

    #[test]
    fn terminate_with_tail_policy_stops_the_parser() {
        let start = Instant::now();
        let mut supervisor =
            supervisor(FakeLauncher::obedient(), ParserPolicy::TerminateWithTail, start);
        supervisor.step(start);

        supervisor.launcher_mut().latest(Role::Tail).lock().expect("state").exit_code = Some(0);
        supervisor.step(start + Duration::from_secs(1));
        assert_eq!(supervisor.role_state(Role::Parser), RoleState::Terminating);
    }

    #[test]
    fn drain_policy_keeps_the_parser_while_host_is_down() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::obedient(), ParserPolicy::Drain, start);
        supervisor.step(start);

        supervisor.liveness_mut().observe(false, start);
        supervisor.step(start);
        assert_eq!(supervisor.role_state(Role::Parser), RoleState::Running);
    }

    #[test]
    fn delayed_start_respects_jitter() {
        let start = Instant::now();
        let liveness = LivenessConsumer::new("jabbah2", Duration::from_secs(5), Duration::from_secs(600), start);
        let mut settings = settings(ParserPolicy::Drain);
        settings.start_immediately = false;
        let mut supervisor =
            Supervisor::new(settings, commands(false), FakeLauncher::obedient(), liveness, start);

        supervisor.step(start);
        assert_eq!(supervisor.role_state(Role::Parser), RoleState::Running);
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Stopped);
        assert_eq!(supervisor.role_state(Role::Watchdog), RoleState::Stopped);

        supervisor.step(start + Duration::from_secs(120));
        assert_eq!(supervisor.role_state(Role::Tail), RoleState::Running);
    }

    #[tokio::test]
    async fn shutdown_stops_every_child() {
        let start = Instant::now();
        let mut supervisor = supervisor(FakeLauncher::default(), ParserPolicy::Drain, start);
        supervisor.step(start);
        supervisor.shutdown().await;

        for role in [Role::Tail, Role::Watchdog, Role::Parser] {
            assert_eq!(supervisor.role_state(role), RoleState::Stopped, "{role}");
            assert!(supervisor.launcher_mut().latest(role).lock().expect("state").killed);
        }
    }
}

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use devdeck_process::{ProcessMeta, ProcessRecord, ProcessRegistry, StoreError};
use futures_util::future::BoxFuture;
use tokio::{sync::Mutex, task::AbortHandle};
use tracing::{debug, error, info, warn};

use crate::os::{ProcessOs, SpawnRequest};

/// Re-spawns the logical command behind a polled process.
///
/// Returns the pid of the new generation, or `None` when nothing could be
/// started (which ends the polling chain).
pub trait Restartable: Send + Sync {
    fn restart(&self) -> BoxFuture<'_, Option<u32>>;
}

#[derive(Debug)]
struct PollTimer {
    token: u64,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct PollTable {
    active: bool,
    next_token: u64,
    timers: HashMap<u32, PollTimer>,
    /// Chains between "timer removed for a dead pid" and "re-armed or ended".
    restarting: usize,
}

impl PollTable {
    fn owns(&self, pid: u32, token: u64) -> bool {
        self.timers.get(&pid).is_some_and(|t| t.token == token)
    }

    fn insert(&mut self, pid: u32, abort: AbortHandle) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        if let Some(old) = self.timers.insert(pid, PollTimer { token, abort }) {
            old.abort.abort();
        }
        token
    }
}

/// Spawns, probes, kills and polls OS processes, keeping the registry in step.
///
/// Expected conditions (spawn failure, dead or unknown pids) never surface as
/// errors: spawns return `Option`, kills and poll setup return `bool`. Only
/// storage failures escape, from the listing calls.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<dyn ProcessRegistry>,
    os: Arc<dyn ProcessOs>,
    polls: Arc<Mutex<PollTable>>,
}

impl Supervisor {
    pub fn new(registry: Arc<dyn ProcessRegistry>, os: Arc<dyn ProcessOs>) -> Self {
        Self {
            registry,
            os,
            polls: Arc::new(Mutex::new(PollTable::default())),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ProcessRegistry> {
        &self.registry
    }

    pub fn start_process(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        meta: ProcessMeta,
    ) -> Option<u32> {
        let req = SpawnRequest {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        };
        let pid = match self.os.spawn(&req) {
            Ok(pid) => pid,
            Err(e) => {
                warn!(program, cwd = %cwd.display(), error = %e, "spawn failed");
                return None;
            }
        };

        let record = ProcessRecord::new(pid, meta);
        if let Err(e) = self.registry.save(&record) {
            error!(pid, error = %e, "process started but could not be recorded");
        }
        info!(
            pid,
            kind = %record.kind,
            name = %record.name,
            cwd = %cwd.display(),
            "process started"
        );
        Some(pid)
    }

    pub fn is_process_running(&self, pid: u32) -> bool {
        self.os.is_alive(pid)
    }

    /// Lists live records, deleting every record whose process is gone.
    pub fn list_active_processes(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let mut live = Vec::new();
        for record in self.registry.list_all()? {
            if self.os.is_alive(record.pid) {
                live.push(record);
            } else {
                debug!(pid = record.pid, name = %record.name, "pruning stale process record");
                self.registry.delete(record.pid)?;
            }
        }
        Ok(live)
    }

    fn active_where(
        &self,
        pred: impl Fn(&ProcessRecord) -> bool,
    ) -> Result<Vec<ProcessRecord>, StoreError> {
        Ok(self
            .list_active_processes()?
            .into_iter()
            .filter(|r| pred(r))
            .collect())
    }

    pub fn get_command_process(
        &self,
        command_id: &str,
    ) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self
            .active_where(|r| r.owner.command_id.as_deref() == Some(command_id))?
            .into_iter()
            .next())
    }

    pub fn get_project_processes(&self, project_id: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        self.active_where(|r| r.owner.project_id.as_deref() == Some(project_id))
    }

    pub fn get_app_processes(&self, app_id: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        self.active_where(|r| r.owner.app_id.as_deref() == Some(app_id))
    }

    pub fn get_server_processes(&self, server_id: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        self.active_where(|r| r.owner.server_id.as_deref() == Some(server_id))
    }

    pub fn get_tunnel_processes(&self, tunnel_id: &str) -> Result<Vec<ProcessRecord>, StoreError> {
        self.active_where(|r| r.owner.tunnel_id.as_deref() == Some(tunnel_id))
    }

    /// Depth-first over registered child pids, children before parents.
    /// Each pid comes with whether the registry tracks it.
    fn kill_order(&self, root: u32) -> Result<Vec<(u32, bool)>, StoreError> {
        let children: HashMap<u32, Vec<u32>> = self
            .registry
            .list_all()?
            .into_iter()
            .map(|r| (r.pid, r.child_pids))
            .collect();

        fn visit(
            pid: u32,
            children: &HashMap<u32, Vec<u32>>,
            seen: &mut HashSet<u32>,
            order: &mut Vec<u32>,
        ) {
            if !seen.insert(pid) {
                return;
            }
            for child in children.get(&pid).into_iter().flatten() {
                visit(*child, children, seen, order);
            }
            order.push(pid);
        }

        let mut order = Vec::new();
        visit(root, &children, &mut HashSet::new(), &mut order);
        Ok(order
            .into_iter()
            .map(|pid| (pid, children.contains_key(&pid)))
            .collect())
    }

    /// Kills `pid` and every registered descendant.
    ///
    /// Unknown or already-dead pids are not failures: the registry is cleaned
    /// either way and the call reports `true`. `false` means the registry could
    /// not be updated.
    pub async fn kill_process(&self, pid: u32) -> bool {
        let order = match self.kill_order(pid) {
            Ok(v) => v,
            Err(e) => {
                error!(pid, error = %e, "kill: read registry");
                return false;
            }
        };

        let mut ok = true;
        for (target, tracked) in order {
            ok &= self.kill_one(target, tracked).await;
        }
        ok
    }

    /// Only tracked pids get their process group signalled; an arbitrary pid
    /// may lead a group devdeck knows nothing about.
    async fn kill_one(&self, pid: u32, tracked: bool) -> bool {
        // The poll lock is held across cancel, signal and delete. A poll tick
        // takes the same lock, so it either runs before the timer is cancelled
        // or never observes this death at all.
        let mut polls = self.polls.lock().await;
        if let Some(timer) = polls.timers.remove(&pid) {
            timer.abort.abort();
            debug!(pid, "polling cancelled");
        }

        match self.os.terminate(pid, tracked) {
            Ok(()) => info!(pid, "sent terminate signal"),
            Err(e) => warn!(pid, error = %e, "terminate failed; process already gone?"),
        }

        match self.registry.delete(pid) {
            Ok(_) => true,
            Err(e) => {
                error!(pid, error = %e, "kill: delete registry entry");
                false
            }
        }
    }

    /// Marks polling as available. Idempotent.
    pub async fn start_polling(&self) {
        let mut polls = self.polls.lock().await;
        if polls.active {
            debug!("polling already active");
            return;
        }
        polls.active = true;
        debug!("polling started");
    }

    /// Cancels every outstanding timer and refuses new ones until
    /// [`Supervisor::start_polling`] is called again.
    pub async fn stop_polling(&self) {
        let mut polls = self.polls.lock().await;
        polls.active = false;
        let n = polls.timers.len();
        for (_, timer) in polls.timers.drain() {
            timer.abort.abort();
        }
        if n > 0 {
            info!(timers = n, "polling stopped; auto-restart disarmed");
        }
    }

    pub async fn stop_polling_for_process(&self, pid: u32) -> bool {
        let mut polls = self.polls.lock().await;
        match polls.timers.remove(&pid) {
            Some(timer) => {
                timer.abort.abort();
                debug!(pid, "polling cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether any auto-restart chain is alive, including one that is between
    /// generations and has no timer at the moment.
    pub async fn has_active_chains(&self) -> bool {
        let polls = self.polls.lock().await;
        !polls.timers.is_empty() || polls.restarting > 0
    }

    pub async fn active_poll_pids(&self) -> Vec<u32> {
        let polls = self.polls.lock().await;
        let mut pids: Vec<u32> = polls.timers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Whether a new generation may be armed. Requires the poll lock.
    fn can_arm(&self, polls: &PollTable, pid: u32) -> bool {
        if !polls.active {
            warn!(pid, "polling is stopped; auto-restart not armed");
            return false;
        }
        // No record means the pid was killed (here or by another invocation)
        // before its timer could be armed.
        match self.registry.get(pid) {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(pid, "not in registry; auto-restart not armed");
                false
            }
            Err(e) => {
                error!(pid, error = %e, "auto-restart: read registry");
                false
            }
        }
    }

    /// Polls `pid` every `interval` and calls `restart` when it dies.
    ///
    /// The chain follows the process across generations: each restarted pid is
    /// armed with the same interval and restart handle, and owns exactly one
    /// timer. Only works while this invocation is alive.
    pub async fn setup_polling_for_process(
        &self,
        pid: u32,
        interval: Duration,
        restart: Arc<dyn Restartable>,
    ) -> bool {
        if interval.is_zero() {
            warn!(pid, "zero poll interval; auto-restart not armed");
            return false;
        }
        let mut polls = self.polls.lock().await;
        if !self.can_arm(&polls, pid) {
            return false;
        }

        let token = polls.next_token.wrapping_add(1);
        let handle = tokio::spawn(self.clone().poll_chain(pid, token, interval, restart));
        let inserted = polls.insert(pid, handle.abort_handle());
        debug_assert_eq!(inserted, token);
        debug!(pid, interval_ms = interval.as_millis() as u64, "auto-restart armed");
        true
    }

    async fn poll_chain(
        self,
        mut pid: u32,
        mut token: u64,
        interval: Duration,
        restart: Arc<dyn Restartable>,
    ) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let abort = {
                let mut polls = self.polls.lock().await;
                if !polls.owns(pid, token) {
                    return;
                }

                match self.registry.touch(pid, Utc::now()) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Killed through another invocation; that is a stop, not a crash.
                        info!(pid, "record removed; auto-restart ends");
                        polls.timers.remove(&pid);
                        return;
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "poll: stamp registry record");
                        continue;
                    }
                }

                if self.os.is_alive(pid) {
                    continue;
                }
                let Some(timer) = polls.timers.remove(&pid) else {
                    return;
                };
                polls.restarting += 1;

                // Deleting under the lock: `false` means another invocation's
                // kill got there first, which is a stop, not a crash.
                match self.registry.delete(pid) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(pid, "record removed; auto-restart ends");
                        polls.restarting -= 1;
                        return;
                    }
                    Err(e) => warn!(pid, error = %e, "poll: delete stale record"),
                }
                timer.abort
            };

            warn!(pid, "process died; restarting");
            let new_pid = restart.restart().await;

            let mut polls = self.polls.lock().await;
            polls.restarting = polls.restarting.saturating_sub(1);
            let Some(new_pid) = new_pid else {
                warn!(pid, "restart produced no process; auto-restart ends");
                return;
            };
            if !self.can_arm(&polls, new_pid) {
                return;
            }
            token = polls.insert(new_pid, abort);
            info!(old_pid = pid, pid = new_pid, "restarted; auto-restart re-armed");
            pid = new_pid;
            drop(polls);
            ticker.reset();
        }
    }
}

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use devdeck_process::{
    App, Command, CommandKind, DirectCommand, OwnerRefs, ProcessMeta, Project, Step,
};
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::{
    settings::clamp_poll_interval_ms,
    store::JsonStore,
    supervisor::{Restartable, Supervisor},
    tunnel::TunnelSpawner,
};

/// `project.base_path` + `app.relative_path` + override; a relative override is
/// taken relative to the project/app directory, an absolute one replaces it.
pub fn resolve_working_dir(
    project: &Project,
    app: Option<&App>,
    working_dir: Option<&str>,
) -> PathBuf {
    let mut dir = project.base_path.clone();
    if let Some(rel) = app
        .and_then(|a| a.relative_path.as_deref())
        .filter(|s| !s.trim().is_empty())
    {
        dir = dir.join(rel);
    }
    match working_dir.map(str::trim).filter(|s| !s.is_empty()) {
        Some(o) if Path::new(o).is_absolute() => PathBuf::from(o),
        Some(o) => dir.join(o),
        None => dir,
    }
}

/// Turns command definitions into supervised processes.
#[derive(Clone)]
pub struct Orchestrator {
    supervisor: Supervisor,
    store: Arc<JsonStore>,
    tunnels: Arc<dyn TunnelSpawner>,
    default_poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        supervisor: Supervisor,
        store: Arc<JsonStore>,
        tunnels: Arc<dyn TunnelSpawner>,
        default_poll_interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            store,
            tunnels,
            default_poll_interval,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn run(&self, project: &Project, app: Option<&App>, command: &Command) -> Option<u32> {
        match &command.kind {
            CommandKind::Direct(_) => self.run_direct(project, app, command).await,
            CommandKind::Sequence { .. } => self.run_sequence(project, command, app).await,
        }
    }

    /// Resolution and spawn only; never arms polling.
    fn spawn_direct(
        &self,
        project: &Project,
        app: Option<&App>,
        command_id: &str,
        name: &str,
        direct: &DirectCommand,
    ) -> Option<u32> {
        let Some((program, args)) = direct.split_command_line() else {
            warn!(command_id, "empty command string");
            return None;
        };
        let cwd = resolve_working_dir(project, app, direct.working_dir.as_deref());
        let owner = OwnerRefs {
            project_id: Some(project.id.clone()),
            app_id: app.map(|a| a.id.clone()),
            command_id: Some(command_id.to_string()),
            ..OwnerRefs::default()
        };
        self.supervisor
            .start_process(&program, &args, &cwd, ProcessMeta::command(name, owner))
    }

    pub async fn run_direct(
        &self,
        project: &Project,
        app: Option<&App>,
        command: &Command,
    ) -> Option<u32> {
        let CommandKind::Direct(direct) = &command.kind else {
            warn!(command_id = %command.id, "not a direct command");
            return None;
        };

        let pid = self.spawn_direct(project, app, &command.id, &command.name, direct)?;

        if direct.auto_restart {
            // Per-command intervals get the same bounds as the configured default.
            let interval = direct
                .poll_interval_ms
                .map(|ms| Duration::from_millis(clamp_poll_interval_ms(ms)))
                .unwrap_or(self.default_poll_interval);
            let restart = Arc::new(DirectRestart {
                orchestrator: self.clone(),
                project: project.clone(),
                app: app.cloned(),
                command: command.clone(),
            });
            if !self
                .supervisor
                .setup_polling_for_process(pid, interval, restart)
                .await
            {
                warn!(pid, command_id = %command.id, "auto-restart requested but not armed");
            }
        }
        Some(pid)
    }

    /// Runs the steps in order, each to completion before the next.
    ///
    /// Steps that reference missing apps/commands/tunnels are skipped. Returns
    /// the first pid any step produced; later pids are only in the registry.
    pub async fn run_sequence(
        &self,
        project: &Project,
        command: &Command,
        context_app: Option<&App>,
    ) -> Option<u32> {
        let CommandKind::Sequence { steps } = &command.kind else {
            warn!(command_id = %command.id, "not a sequence command");
            return None;
        };
        info!(
            project = %project.name,
            command = %command.name,
            steps = steps.len(),
            "running sequence"
        );

        let mut first = None;
        for (idx, step) in steps.iter().enumerate() {
            let pid = self.run_step(project, command, context_app, step).await;
            debug!(step = idx, ?pid, "sequence step done");
            if first.is_none() {
                first = pid;
            }
        }
        first
    }

    async fn run_step(
        &self,
        project: &Project,
        sequence: &Command,
        context_app: Option<&App>,
        step: &Step,
    ) -> Option<u32> {
        match step {
            Step::Delay { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                None
            }
            Step::Tunnel {
                server_id,
                tunnel_id,
            } => self.tunnels.start_tunnel(server_id, tunnel_id),
            Step::AppCommand { app_id, command_id } => {
                let Some(app) = project.app(app_id) else {
                    warn!(app_id, "sequence step: unknown app; skipped");
                    return None;
                };
                let Some(command) = app.command(command_id) else {
                    warn!(app_id, command_id, "sequence step: unknown command; skipped");
                    return None;
                };
                if !matches!(command.kind, CommandKind::Direct(_)) {
                    warn!(app_id, command_id, "sequence step: nested sequence; skipped");
                    return None;
                }
                self.run_direct(project, Some(app), command).await
            }
            Step::Custom {
                command_string,
                working_dir,
            } => {
                let adhoc = Command {
                    id: sequence.id.clone(),
                    name: command_string.clone(),
                    kind: CommandKind::Direct(DirectCommand {
                        command_string: command_string.clone(),
                        working_dir: working_dir.clone(),
                        auto_restart: false,
                        poll_interval_ms: None,
                    }),
                };
                self.run_direct(project, context_app, &adhoc).await
            }
        }
    }
}

/// Restart handle for an auto-restarting direct command.
///
/// Each restart re-reads the command from the store so edits take effect on
/// the next generation; the captured copy is used when the definition is gone
/// from the store (ad-hoc commands never are in it).
struct DirectRestart {
    orchestrator: Orchestrator,
    project: Project,
    app: Option<App>,
    command: Command,
}

impl DirectRestart {
    fn current(&self) -> (Project, Option<App>, Command) {
        let fresh = match self.orchestrator.store.find_project(&self.project.id) {
            Ok(v) => v.filter(|p| p.id == self.project.id),
            Err(e) => {
                warn!(project_id = %self.project.id, error = %e, "restart: reload project");
                None
            }
        };
        let Some(project) = fresh else {
            return (self.project.clone(), self.app.clone(), self.command.clone());
        };

        let app = match &self.app {
            Some(a) => Some(project.app(&a.id).cloned().unwrap_or_else(|| a.clone())),
            None => None,
        };
        let command = project
            .command(app.as_ref().map(|a| a.id.as_str()), &self.command.id)
            .filter(|c| matches!(c.kind, CommandKind::Direct(_)))
            .cloned()
            .unwrap_or_else(|| self.command.clone());
        (project, app, command)
    }
}

impl Restartable for DirectRestart {
    fn restart(&self) -> BoxFuture<'_, Option<u32>> {
        Box::pin(async move {
            let (project, app, command) = self.current();
            let CommandKind::Direct(direct) = &command.kind else {
                return None;
            };
            if !direct.auto_restart {
                info!(command_id = %command.id, "auto-restart disabled in config; not restarting");
                return None;
            }
            self.orchestrator
                .spawn_direct(&project, app.as_ref(), &command.id, &command.name, direct)
        })
    }
}

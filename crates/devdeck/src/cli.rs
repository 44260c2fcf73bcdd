use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use devdeck_process::{App, Command, CommandKind, ProcessRecord, Project};
use tracing::info;

use crate::{
    orchestrator::Orchestrator,
    settings::Settings,
    store::JsonStore,
    supervisor::Supervisor,
    tunnel::TunnelSpawner,
};

#[derive(Parser, Debug)]
#[command(name = "devdeck")]
#[command(about = "Run and supervise project commands and SSH tunnels")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Mirror logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List live processes (dead entries are pruned)
    Ps {
        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        app: Option<String>,

        #[arg(long)]
        command: Option<String>,

        #[arg(long)]
        server: Option<String>,

        #[arg(long)]
        tunnel: Option<String>,
    },

    /// Show whether a pid is alive and what devdeck knows about it
    Status { pid: u32 },

    /// Kill processes and their recorded children
    Kill {
        #[arg(required = true)]
        pids: Vec<u32>,
    },

    /// Run a project or app command
    Run {
        /// Project id or name
        project: String,

        /// Command id or name
        command: String,

        /// App id or name the command belongs to
        #[arg(short, long)]
        app: Option<String>,

        /// Return immediately instead of hosting auto-restart
        #[arg(short, long)]
        detach: bool,
    },

    /// Start an SSH port-forward
    Tunnel {
        /// Server id or name
        server: String,

        /// Tunnel id or name
        tunnel: String,
    },

    /// List projects, apps and commands
    Projects,

    /// Show resolved settings and paths
    Config,
}

pub struct Runtime {
    pub settings: Settings,
    pub store: Arc<JsonStore>,
    pub supervisor: Supervisor,
    pub tunnels: Arc<dyn TunnelSpawner>,
    pub orchestrator: Orchestrator,
}

pub async fn dispatch(ctx: &Runtime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ps {
            project,
            app,
            command,
            server,
            tunnel,
        } => ps(
            ctx,
            &PsFilter {
                project,
                app,
                command,
                server,
                tunnel,
            },
        ),
        Commands::Status { pid } => status(ctx, pid),
        Commands::Kill { pids } => kill(ctx, &pids).await,
        Commands::Run {
            project,
            command,
            app,
            detach,
        } => run(ctx, &project, app.as_deref(), &command, detach).await,
        Commands::Tunnel { server, tunnel } => match ctx.tunnels.start_tunnel(&server, &tunnel) {
            Some(pid) => {
                println!("tunnel started (pid {pid})");
                Ok(())
            }
            None => bail!("could not start tunnel {tunnel} on {server}"),
        },
        Commands::Projects => projects(ctx),
        Commands::Config => {
            println!("data root:      {}", ctx.settings.data_root.display());
            println!("store:          {}", ctx.settings.store_path().display());
            println!("logs:           {}", ctx.settings.log_dir().display());
            println!(
                "poll interval:  {} ms",
                ctx.settings.default_poll_interval.as_millis()
            );
            println!("ssh:            {}", ctx.settings.ssh_program);
            println!(
                "ssh keepalive:  {} s",
                ctx.settings.ssh_server_alive_interval_secs
            );
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct PsFilter {
    project: Option<String>,
    app: Option<String>,
    command: Option<String>,
    server: Option<String>,
    tunnel: Option<String>,
}

impl PsFilter {
    fn matches(&self, r: &ProcessRecord) -> bool {
        let eq = |want: &Option<String>, have: &Option<String>| want.is_none() || want == have;
        eq(&self.project, &r.owner.project_id)
            && eq(&self.app, &r.owner.app_id)
            && eq(&self.command, &r.owner.command_id)
            && eq(&self.server, &r.owner.server_id)
            && eq(&self.tunnel, &r.owner.tunnel_id)
    }
}

fn ps(ctx: &Runtime, filter: &PsFilter) -> anyhow::Result<()> {
    let sup = &ctx.supervisor;
    // Narrow with the most specific filter, then apply the rest.
    let records: Vec<ProcessRecord> = match filter {
        PsFilter {
            command: Some(c), ..
        } => sup.get_command_process(c)?.into_iter().collect(),
        PsFilter { app: Some(a), .. } => sup.get_app_processes(a)?,
        PsFilter {
            tunnel: Some(t), ..
        } => sup.get_tunnel_processes(t)?,
        PsFilter {
            project: Some(p), ..
        } => sup.get_project_processes(p)?,
        PsFilter {
            server: Some(s), ..
        } => sup.get_server_processes(s)?,
        _ => sup.list_active_processes().context("list processes")?,
    };
    let rows: Vec<ProcessRecord> = records.into_iter().filter(|r| filter.matches(r)).collect();

    if rows.is_empty() {
        println!("no running processes");
        return Ok(());
    }
    println!("{:<8} {:<8} {:<20} {}", "PID", "KIND", "STARTED", "NAME");
    for r in rows {
        println!(
            "{:<8} {:<8} {:<20} {}",
            r.pid,
            r.kind.to_string(),
            r.start_time.format("%Y-%m-%d %H:%M:%S"),
            r.name
        );
    }
    Ok(())
}

fn status(ctx: &Runtime, pid: u32) -> anyhow::Result<()> {
    let alive = ctx.supervisor.is_process_running(pid);
    let record = ctx.supervisor.registry().get(pid)?;
    match (&record, alive) {
        (Some(r), true) => println!("{pid} running: {} ({})", r.name, r.kind),
        (Some(r), false) => println!("{pid} dead (stale entry for {}; `ps` prunes it)", r.name),
        (None, true) => println!("{pid} running (not managed by devdeck)"),
        (None, false) => println!("{pid} not running"),
    }
    if let Some(polled) = record.and_then(|r| r.last_polled_at) {
        println!("last polled {}", polled.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn kill(ctx: &Runtime, pids: &[u32]) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for &pid in pids {
        if ctx.supervisor.kill_process(pid).await {
            println!("killed {pid}");
        } else {
            failed.push(pid);
        }
    }
    if !failed.is_empty() {
        bail!("could not clean up {failed:?}");
    }
    Ok(())
}

fn find_by_key<'a>(commands: &'a [Command], key: &str) -> Option<&'a Command> {
    commands
        .iter()
        .find(|c| c.id == key)
        .or_else(|| commands.iter().find(|c| c.name.eq_ignore_ascii_case(key)))
}

fn find_app<'a>(project: &'a Project, key: &str) -> Option<&'a App> {
    project
        .app(key)
        .or_else(|| project.apps.iter().find(|a| a.name.eq_ignore_ascii_case(key)))
}

async fn run(
    ctx: &Runtime,
    project_key: &str,
    app_key: Option<&str>,
    command_key: &str,
    detach: bool,
) -> anyhow::Result<()> {
    let project = ctx
        .store
        .find_project(project_key)?
        .with_context(|| format!("unknown project {project_key}"))?;
    let app = match app_key {
        Some(k) => Some(find_app(&project, k).with_context(|| format!("unknown app {k}"))?),
        None => None,
    };
    let commands = app.map(|a| a.commands.as_slice()).unwrap_or(&project.commands);
    let command = find_by_key(commands, command_key)
        .with_context(|| format!("unknown command {command_key}"))?;

    let Some(pid) = ctx.orchestrator.run(&project, app, command).await else {
        bail!("{} started no process", command.name);
    };
    match &command.kind {
        CommandKind::Sequence { .. } => println!("{} started (first pid {pid})", command.name),
        CommandKind::Direct(_) => println!("{} started (pid {pid})", command.name),
    }

    if detach || !ctx.supervisor.has_active_chains().await {
        return Ok(());
    }
    println!("auto-restart active; Ctrl-C to stop supervising (processes keep running)");
    host_polling(&ctx.supervisor).await
}

/// Keeps this invocation alive while any auto-restart chain is armed.
async fn host_polling(supervisor: &Supervisor) -> anyhow::Result<()> {
    let mut check = tokio::time::interval(std::time::Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("wait for ctrl-c")?;
                info!("interrupted; leaving processes running");
                return Ok(());
            }
            _ = check.tick() => {
                if !supervisor.has_active_chains().await {
                    info!("no auto-restart chains left");
                    return Ok(());
                }
            }
        }
    }
}

fn projects(ctx: &Runtime) -> anyhow::Result<()> {
    let projects = ctx.store.get_all_projects()?;
    if projects.is_empty() {
        println!("no projects configured in {}", ctx.store.path().display());
        return Ok(());
    }
    for p in projects {
        println!("{} ({})  {}", p.name, p.id, p.base_path.display());
        for c in &p.commands {
            println!("  - {}", describe(c));
        }
        for a in &p.apps {
            println!("  {} ({})", a.name, a.id);
            for c in &a.commands {
                println!("    - {}", describe(c));
            }
        }
    }
    Ok(())
}

fn describe(c: &Command) -> String {
    match &c.kind {
        CommandKind::Direct(d) if d.auto_restart => {
            format!("{} ({}): {} [auto-restart]", c.name, c.id, d.command_string)
        }
        CommandKind::Direct(d) => format!("{} ({}): {}", c.name, c.id, d.command_string),
        CommandKind::Sequence { steps } => {
            format!("{} ({}): sequence of {} steps", c.name, c.id, steps.len())
        }
    }
}

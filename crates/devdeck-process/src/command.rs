use std::path::PathBuf;

/// A runnable action defined on a project or on one of its apps.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Direct(DirectCommand),
    Sequence { steps: Vec<Step> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirectCommand {
    pub command_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl DirectCommand {
    pub fn new(command_string: impl Into<String>) -> Self {
        Self {
            command_string: command_string.into(),
            ..Self::default()
        }
    }

    /// Splits the command line on whitespace into program and arguments.
    ///
    /// NOTE: there is no shell quoting. `echo "a b"` yields the arguments
    /// `"a` and `b"`. Commands that need a shell should say so explicitly
    /// (`sh -c ...` does not work either; wrap them in a script).
    pub fn split_command_line(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.command_string.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some((program, parts.collect()))
    }
}

/// One element of a sequence command.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Delay {
        ms: u64,
    },
    Tunnel {
        server_id: String,
        tunnel_id: String,
    },
    AppCommand {
        app_id: String,
        command_id: String,
    },
    Custom {
        command_string: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub base_path: PathBuf,
    #[serde(default)]
    pub apps: Vec<App>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Project {
    pub fn app(&self, app_id: &str) -> Option<&App> {
        self.apps.iter().find(|a| a.id == app_id)
    }

    /// Looks up a command on the given app, or on the project itself when no
    /// app is given.
    pub fn command(&self, app_id: Option<&str>, command_id: &str) -> Option<&Command> {
        match app_id {
            Some(app_id) => self.app(app_id)?.command(command_id),
            None => self.commands.iter().find(|c| c.id == command_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl App {
    pub fn command(&self, command_id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id == command_id)
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

/// An SSH host that tunnels are opened through.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

impl Server {
    pub fn tunnel(&self, tunnel_id: &str) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.id == tunnel_id)
    }

    /// `user@host`, or just `host` when no user is configured.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{user}@{}", self.host),
            _ => self.host.clone(),
        }
    }
}

/// A local port forward: `local_port` -> `remote_host:remote_port` as seen
/// from the server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    pub local_port: u16,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub remote_port: u16,
}

impl Tunnel {
    pub fn forward_spec(&self) -> String {
        format!("{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

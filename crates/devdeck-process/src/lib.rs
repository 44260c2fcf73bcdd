use chrono::{DateTime, Utc};

pub mod command;
pub mod registry;

pub use command::{App, Command, CommandKind, DirectCommand, Project, Server, Step, Tunnel};
pub use registry::{MemoryRegistry, ProcessRegistry, StoreError};

/// What a tracked process is for. Tunnels are SSH port-forwards, commands
/// are everything started from a project definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Tunnel,
    Command,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Tunnel => f.write_str("tunnel"),
            ProcessKind::Command => f.write_str("command"),
        }
    }
}

/// Back-references from a process to the definitions it was started from.
///
/// These are plain ids resolved through the config store on demand; a record
/// never owns the project/server it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwnerRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

/// Everything the caller knows about a process before it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMeta {
    pub kind: ProcessKind,
    pub name: String,
    pub owner: OwnerRefs,
    pub child_pids: Vec<u32>,
}

impl ProcessMeta {
    pub fn command(name: impl Into<String>, owner: OwnerRefs) -> Self {
        Self {
            kind: ProcessKind::Command,
            name: name.into(),
            owner,
            child_pids: Vec::new(),
        }
    }

    pub fn tunnel(name: impl Into<String>, server_id: &str, tunnel_id: &str) -> Self {
        Self {
            kind: ProcessKind::Tunnel,
            name: name.into(),
            owner: OwnerRefs {
                server_id: Some(server_id.to_string()),
                tunnel_id: Some(tunnel_id.to_string()),
                ..OwnerRefs::default()
            },
            child_pids: Vec::new(),
        }
    }
}

/// One tracked OS process.
///
/// NOTE: `pid` is a claim, not a guarantee. The registry may hold records for
/// processes that already exited; liveness is always re-probed before a record
/// is trusted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub kind: ProcessKind,
    #[serde(flatten)]
    pub owner: OwnerRefs,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub child_pids: Vec<u32>,
}

impl ProcessRecord {
    pub fn new(pid: u32, meta: ProcessMeta) -> Self {
        Self {
            pid,
            kind: meta.kind,
            owner: meta.owner,
            name: meta.name,
            start_time: Utc::now(),
            last_polled_at: None,
            child_pids: meta.child_pids,
        }
    }
}

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use devdeck_process::{
    App, Command, ProcessRecord, ProcessRegistry, Project, Server, StoreError, Tunnel,
    registry::{stamp_polled, upsert},
};

/// Everything devdeck persists, as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StoreDocument {
    pub projects: Vec<Project>,
    pub servers: Vec<Server>,
    pub processes: Vec<ProcessRecord>,
}

/// Exclusive advisory lock on `<store>.lock`, released on drop.
///
/// The data file itself is replaced by rename on every write, so the lock
/// lives on a sidecar file whose inode never changes.
struct StoreLock {
    _file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        lock_exclusive(&file).map_err(io_err)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// JSON-file config store.
///
/// Every call re-reads the file: other devdeck invocations write to it too,
/// and the process table in it is the only thing they share. Writers are
/// serialized across processes by a file lock; readers see whole documents
/// because each write lands by rename.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoreDocument, StoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(StoreDocument::default());
        }
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupted {
            path: self.path.clone(),
            source,
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    fn persist(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let data = serde_json::to_vec_pretty(doc)?;

        // Unique per write, created 0600.
        let mut tmp = tempfile::Builder::new()
            .prefix(".devdeck.")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(io_err)?;
        tmp.write_all(&data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Read-modify-write under the in-process mutex and the cross-process
    /// file lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut StoreDocument) -> T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let _lock = StoreLock::acquire(&self.lock_path())?;
        let mut doc = self.load()?;
        let out = f(&mut doc);
        self.persist(&doc)?;
        Ok(out)
    }

    pub fn get_all_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.load()?.projects)
    }

    /// Finds a project by id, falling back to a case-insensitive name match.
    pub fn find_project(&self, key: &str) -> Result<Option<Project>, StoreError> {
        let projects = self.get_all_projects()?;
        if let Some(p) = projects.iter().find(|p| p.id == key) {
            return Ok(Some(p.clone()));
        }
        Ok(projects
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(key)))
    }

    pub fn find_app(&self, project_id: &str, app_id: &str) -> Result<Option<App>, StoreError> {
        Ok(self
            .find_project(project_id)?
            .and_then(|p| p.app(app_id).cloned()))
    }

    pub fn find_command(
        &self,
        project_id: &str,
        app_id: Option<&str>,
        command_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        Ok(self
            .find_project(project_id)?
            .and_then(|p| p.command(app_id, command_id).cloned()))
    }

    pub fn get_all_servers(&self) -> Result<Vec<Server>, StoreError> {
        Ok(self.load()?.servers)
    }

    pub fn find_server(&self, key: &str) -> Result<Option<Server>, StoreError> {
        let servers = self.get_all_servers()?;
        if let Some(s) = servers.iter().find(|s| s.id == key) {
            return Ok(Some(s.clone()));
        }
        Ok(servers.into_iter().find(|s| s.name.eq_ignore_ascii_case(key)))
    }

    pub fn find_tunnel(
        &self,
        server_id: &str,
        tunnel_id: &str,
    ) -> Result<Option<(Server, Tunnel)>, StoreError> {
        let Some(server) = self.find_server(server_id)? else {
            return Ok(None);
        };
        let tunnel = server
            .tunnel(tunnel_id)
            .or_else(|| {
                server
                    .tunnels
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(tunnel_id))
            })
            .cloned();
        Ok(tunnel.map(|t| (server, t)))
    }
}

impl ProcessRegistry for JsonStore {
    fn list_all(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        Ok(self.load()?.processes)
    }

    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        self.update(|doc| upsert(&mut doc.processes, record))
    }

    fn delete(&self, pid: u32) -> Result<bool, StoreError> {
        self.update(|doc| {
            let before = doc.processes.len();
            doc.processes.retain(|r| r.pid != pid);
            doc.processes.len() != before
        })
    }

    fn touch(&self, pid: u32, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = StoreLock::acquire(&self.lock_path())?;
        let mut doc = self.load()?;
        if !stamp_polled(&mut doc.processes, pid, at) {
            return Ok(false);
        }
        self.persist(&doc)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devdeck_process::{CommandKind, DirectCommand, OwnerRefs, ProcessMeta};

    fn sample_doc() -> StoreDocument {
        StoreDocument {
            projects: vec![Project {
                id: "p1".to_string(),
                name: "Shop".to_string(),
                base_path: PathBuf::from("/work/shop"),
                apps: vec![App {
                    id: "api".to_string(),
                    name: "API".to_string(),
                    relative_path: Some("services/api".to_string()),
                    commands: vec![Command {
                        id: "run".to_string(),
                        name: "run".to_string(),
                        kind: CommandKind::Direct(DirectCommand::new("cargo run")),
                    }],
                }],
                commands: Vec::new(),
            }],
            servers: vec![Server {
                id: "s1".to_string(),
                name: "bastion".to_string(),
                host: "bastion.example.com".to_string(),
                port: 22,
                user: None,
                identity_file: None,
                tunnels: vec![Tunnel {
                    id: "t1".to_string(),
                    name: "postgres".to_string(),
                    local_port: 15432,
                    remote_host: "db.internal".to_string(),
                    remote_port: 5432,
                }],
            }],
            processes: Vec::new(),
        }
    }

    #[test]
    fn missing_file_is_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("devdeck.json"));
        assert_eq!(store.load().unwrap(), StoreDocument::default());
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devdeck.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonStore::open(&path);
        assert!(matches!(store.load(), Err(StoreError::Corrupted { .. })));
        assert!(store.list_all().is_err());
    }

    #[test]
    fn registry_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devdeck.json");
        let store = JsonStore::open(&path);

        let rec = ProcessRecord::new(4242, ProcessMeta::command("web", OwnerRefs::default()));
        store.save(&rec).unwrap();

        // A second handle on the same file sees the write, as another CLI run would.
        let other = JsonStore::open(&path);
        assert_eq!(other.get(4242).unwrap(), Some(rec.clone()));

        let mut polled = rec.clone();
        polled.last_polled_at = Some(chrono::Utc::now());
        other.save(&polled).unwrap();
        assert_eq!(store.list_all().unwrap(), vec![polled]);

        assert!(store.delete(4242).unwrap());
        assert!(!other.delete(4242).unwrap());
        assert!(other.list_all().unwrap().is_empty());

        let mut left: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["devdeck.json", "devdeck.json.lock"]);
    }

    #[cfg(unix)]
    #[test]
    fn store_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devdeck.json");
        let store = JsonStore::open(&path);
        store.update(|doc| *doc = sample_doc()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn concurrent_writers_on_separate_handles_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devdeck.json");

        // Two handles behave like two invocations: no shared in-process mutex.
        let workers: Vec<_> = (0..2u32)
            .map(|w| {
                let store = JsonStore::open(&path);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let rec = ProcessRecord::new(
                            w * 1000 + i + 1,
                            ProcessMeta::command("w", OwnerRefs::default()),
                        );
                        store.save(&rec).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let store = JsonStore::open(&path);
        assert_eq!(store.list_all().unwrap().len(), 200);
    }

    #[test]
    fn touch_does_not_resurrect_record_deleted_by_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devdeck.json");
        let poller = JsonStore::open(&path);
        let killer = JsonStore::open(&path);

        let rec = ProcessRecord::new(31, ProcessMeta::command("web", OwnerRefs::default()));
        poller.save(&rec).unwrap();
        assert!(poller.touch(31, chrono::Utc::now()).unwrap());
        assert!(killer.get(31).unwrap().unwrap().last_polled_at.is_some());

        assert!(killer.delete(31).unwrap());
        assert!(!poller.touch(31, chrono::Utc::now()).unwrap());
        assert!(killer.list_all().unwrap().is_empty());
    }

    #[test]
    fn lookups_resolve_by_id_or_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("devdeck.json"));
        store.update(|doc| *doc = sample_doc()).unwrap();

        assert_eq!(store.find_project("p1").unwrap().unwrap().name, "Shop");
        assert_eq!(store.find_project("shop").unwrap().unwrap().id, "p1");
        assert!(store.find_project("nope").unwrap().is_none());

        assert!(store.find_app("p1", "api").unwrap().is_some());
        assert!(store.find_command("p1", Some("api"), "run").unwrap().is_some());
        assert!(store.find_command("p1", None, "run").unwrap().is_none());

        let (server, tunnel) = store.find_tunnel("bastion", "postgres").unwrap().unwrap();
        assert_eq!(server.id, "s1");
        assert_eq!(tunnel.id, "t1");
        assert!(store.find_tunnel("s1", "missing").unwrap().is_none());
    }
}

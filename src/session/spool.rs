//! Directory-backed transport
//!
//! The remote channel is a spool tree laid out as
//!
//! ```text
//! <root>/
//!   └── <server_group>/
//!         ├── <file_type>/        # published files
//!         └── .restart/           # per-user restart positions
//!               └── <user>.<file_type>
//! ```
//!
//! A missing server group directory means the remote is unreachable and is
//! reported as IO_ERROR, so the engine's reconnect path is exercised exactly
//! as it would be against a network transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ConnectionSession, Credentials, SessionError, SessionFactory, SessionOption, TransactionId};
use crate::delivery::push::NotificationSource;
use crate::delivery::query::{QueryHit, QuerySubscription};
use crate::event::{FileEvent, Status};
use crate::pending::PendingItem;

/// No working directory was set before a transfer
pub const CODE_NO_WORKING_DIR: i32 = 10;
/// Writing the local copy failed
pub const CODE_LOCAL_WRITE: i32 = 11;
/// A transfer was requested with no active file type
pub const CODE_NO_FILE_TYPE: i32 = 12;

const RESTART_DIR: &str = ".restart";

/// Session factory over a spool root
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    root: PathBuf,
}

impl SpoolTransport {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Listener source for push mode
    pub fn notifications(
        &self,
        server_group: &str,
        file_type: &str,
        scan_interval: Duration,
        include_existing: bool,
    ) -> SpoolNotifications {
        SpoolNotifications::new(
            self.root.join(server_group).join(file_type),
            scan_interval,
            include_existing,
        )
    }

    /// Query subscription for query mode
    pub fn query(&self, server_group: &str, file_types: Vec<String>, scan_interval: Duration) -> SpoolQuery {
        SpoolQuery::new(self.root.join(server_group), server_group, file_types, scan_interval)
    }
}

#[async_trait]
impl SessionFactory for SpoolTransport {
    async fn login(
        &self,
        credentials: &Credentials,
        server_group: &str,
        file_type: Option<&str>,
    ) -> Result<Box<dyn ConnectionSession>, SessionError> {
        let group_dir = self.root.join(server_group);
        if !group_dir.is_dir() {
            return Err(SessionError::Connection(format!(
                "server group {} unreachable at {}",
                server_group,
                group_dir.display()
            )));
        }
        if let Some(ty) = file_type {
            if !group_dir.join(ty).is_dir() {
                return Err(SessionError::Login(format!("unknown file type {}", ty)));
            }
        }

        debug!(user = %credentials.user, server_group, "Spool login");
        Ok(Box::new(SpoolSession {
            group_dir,
            server_group: server_group.to_string(),
            user: credentials.user.clone(),
            file_type: file_type.map(str::to_string),
            working_dir: None,
            options: HashSet::new(),
            replication_root: None,
            position: Position::default(),
            results: VecDeque::new(),
            next_tx: 1,
            closed: false,
        }))
    }
}

pub struct SpoolSession {
    group_dir: PathBuf,
    server_group: String,
    user: String,
    file_type: Option<String>,
    working_dir: Option<PathBuf>,
    options: HashSet<SessionOption>,
    replication_root: Option<PathBuf>,
    /// How far `get_after` has delivered
    position: Position,
    results: VecDeque<FileEvent>,
    next_tx: TransactionId,
    closed: bool,
}

/// Newest delivered modification time, plus every name delivered at exactly
/// that time so later files sharing it are still picked up
#[derive(Debug, Clone, Default, PartialEq)]
struct Position {
    time: Option<DateTime<Utc>>,
    names: HashSet<String>,
}

impl Position {
    fn admits(&self, name: &str, modified: Option<DateTime<Utc>>) -> bool {
        match (self.time, modified) {
            (Some(t), Some(m)) => m > t || (m == t && !self.names.contains(name)),
            _ => true,
        }
    }

    fn advance(&mut self, name: &str, modified: DateTime<Utc>) {
        if self.time.map_or(true, |t| modified > t) {
            self.time = Some(modified);
            self.names.clear();
        }
        if self.time == Some(modified) {
            self.names.insert(name.to_string());
        }
    }

    /// Timestamp on the first line, one name per following line
    fn encode(&self) -> Option<String> {
        let time = self.time?;
        let mut names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        names.sort_unstable();
        let mut out = time.to_rfc3339();
        for name in names {
            out.push('\n');
            out.push_str(name);
        }
        Some(out)
    }

    fn decode(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let time = DateTime::parse_from_rfc3339(lines.next()?.trim()).ok()?.with_timezone(&Utc);
        Some(Self {
            time: Some(time),
            names: lines.filter(|l| !l.is_empty()).map(str::to_string).collect(),
        })
    }
}

struct RemoteFile {
    name: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
}

impl SpoolSession {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn enabled(&self, option: SessionOption) -> bool {
        self.options.contains(&option)
    }

    fn begin(&mut self) -> TransactionId {
        let tx = self.next_tx;
        self.next_tx += 1;
        tx
    }

    fn active_type(&self) -> &str {
        self.file_type.as_deref().unwrap_or("")
    }

    fn io_error(&self, name: Option<&str>) -> FileEvent {
        let message = format!("server group {} unreachable", self.server_group);
        match name {
            Some(n) => FileEvent::new(n, self.active_type(), &self.server_group, Status::IoError).with_message(message),
            None => FileEvent::failure(self.active_type(), &self.server_group, Status::IoError, &message),
        }
    }

    fn list_type(&self) -> std::io::Result<Vec<RemoteFile>> {
        let dir = self.group_dir.join(self.active_type());
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            files.push(RemoteFile {
                name,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                created: meta.created().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    fn describe(&self, name: &str) -> Option<RemoteFile> {
        let meta = fs::metadata(self.group_dir.join(self.active_type()).join(name)).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(RemoteFile {
            name: name.to_string(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: meta.created().ok().map(DateTime::<Utc>::from),
        })
    }

    fn destination_dir(&self) -> Option<PathBuf> {
        if self.enabled(SessionOption::Replicate) {
            if let Some(root) = &self.replication_root {
                return Some(root.join(&self.server_group).join(self.active_type()));
            }
        }
        self.working_dir.clone()
    }

    /// Transfer one file and describe the outcome
    fn transfer(&self, name: &str) -> FileEvent {
        let ty = self.active_type().to_string();
        if !self.group_dir.is_dir() {
            return self.io_error(Some(name));
        }
        if ty.is_empty() {
            return FileEvent::new(name, "", &self.server_group, Status::Other(CODE_NO_FILE_TYPE))
                .with_message("no active file type");
        }
        let Some(remote) = self.describe(name) else {
            return FileEvent::new(name, &ty, &self.server_group, Status::FileNotFound);
        };
        let event = FileEvent::new(name, &ty, &self.server_group, Status::Ok)
            .with_size(remote.size)
            .with_times(remote.modified, remote.created);

        let Some(dest_dir) = self.destination_dir() else {
            return FileEvent {
                status: Status::Other(CODE_NO_WORKING_DIR),
                ..event
            }
            .with_message("no working directory");
        };

        let source = self.group_dir.join(&ty).join(name);
        let dest = dest_dir.join(name);

        if dest.exists() {
            if self.enabled(SessionOption::Diff) && same_content(&source, &dest).unwrap_or(false) {
                return FileEvent {
                    status: Status::FileExists,
                    ..event
                }
                .with_local_path(dest)
                .with_message("local copy is identical");
            }
            if self.enabled(SessionOption::Version) {
                if let Err(e) = keep_version(&dest) {
                    return local_write_failure(event, &dest, e);
                }
            } else if !self.enabled(SessionOption::Replace) {
                return FileEvent {
                    status: Status::FileExists,
                    ..event
                }
                .with_local_path(dest);
            }
        }

        if let Err(e) = self.copy_into(&source, &dest_dir, name) {
            return local_write_failure(event, &dest, e);
        }

        let mut event = event.with_local_path(dest.clone());
        if self.enabled(SessionOption::Checksum) {
            match crc32_file(&dest) {
                Ok(sum) => event = event.with_checksum(sum),
                Err(e) => warn!(file = %name, error = %e, "Failed to checksum delivered file"),
            }
        }
        if self.enabled(SessionOption::Receipt) {
            event = event.with_receipt(uuid::Uuid::new_v4().to_string());
        }
        event
    }

    fn copy_into(&self, source: &Path, dest_dir: &Path, name: &str) -> std::io::Result<()> {
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);
        if self.enabled(SessionOption::SafeRead) {
            let partial = dest_dir.join(format!(".{}.part", name));
            fs::copy(source, &partial)?;
            fs::rename(&partial, &dest)?;
        } else {
            fs::copy(source, &dest)?;
        }
        Ok(())
    }

    fn restart_file(&self) -> PathBuf {
        self.group_dir
            .join(RESTART_DIR)
            .join(format!("{}.{}", self.user, self.active_type()))
    }

    fn load_restart_position(&self) -> Option<Position> {
        let content = fs::read_to_string(self.restart_file()).ok()?;
        Position::decode(&content)
    }

    fn save_restart_position(&self) {
        let Some(encoded) = self.position.encode() else {
            return;
        };
        let path = self.restart_file();
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, encoded));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to persist restart position");
        }
    }

    /// Transfer every listed file that passes `filter`
    fn transfer_matching<F>(&self, filter: F) -> Vec<FileEvent>
    where
        F: Fn(&RemoteFile) -> bool,
    {
        match self.list_type() {
            Ok(files) => files
                .into_iter()
                .filter(|f| filter(f))
                .map(|f| self.transfer(&f.name))
                .collect(),
            Err(_) if !self.group_dir.is_dir() => vec![self.io_error(None)],
            Err(e) => vec![FileEvent::failure(
                self.active_type(),
                &self.server_group,
                Status::Other(CODE_NO_FILE_TYPE),
                &e.to_string(),
            )],
        }
    }
}

#[async_trait]
impl ConnectionSession for SpoolSession {
    async fn get(&mut self, names: &[String]) -> Result<TransactionId, SessionError> {
        self.ensure_open()?;
        let events: Vec<FileEvent> = names.iter().map(|n| self.transfer(n)).collect();
        self.results.extend(events);
        Ok(self.begin())
    }

    async fn show(&mut self, names: &[String]) -> Result<TransactionId, SessionError> {
        self.ensure_open()?;
        for name in names {
            let event = match self.describe(name) {
                Some(remote) => FileEvent::new(name, self.active_type(), &self.server_group, Status::Ok)
                    .with_size(remote.size)
                    .with_times(remote.modified, remote.created),
                None if !self.group_dir.is_dir() => self.io_error(Some(name)),
                None => FileEvent::new(name, self.active_type(), &self.server_group, Status::FileNotFound),
            };
            self.results.push_back(event);
        }
        Ok(self.begin())
    }

    async fn get_after(
        &mut self,
        since: Option<DateTime<Utc>>,
        restart: bool,
    ) -> Result<TransactionId, SessionError> {
        self.ensure_open()?;
        if self.position.time.is_none() && restart {
            if let Some(saved) = self.load_restart_position() {
                self.position = saved;
            }
        }

        let events = match since {
            Some(t) => self.transfer_matching(|f| f.modified.map_or(true, |m| m > t)),
            None => {
                let position = &self.position;
                self.transfer_matching(|f| position.admits(&f.name, f.modified))
            }
        };

        let mut advanced = false;
        for event in events.iter().filter(|e| e.status.is_ok()) {
            if let (Some(name), Some(modified)) = (event.name.as_deref(), event.modified) {
                self.position.advance(name, modified);
                advanced = true;
            }
        }
        if advanced {
            self.save_restart_position();
        }

        self.results.extend(events);
        Ok(self.begin())
    }

    async fn get_before(&mut self, until: DateTime<Utc>) -> Result<TransactionId, SessionError> {
        self.ensure_open()?;
        let events = self.transfer_matching(|f| f.modified.map_or(false, |m| m < until));
        self.results.extend(events);
        Ok(self.begin())
    }

    async fn get_between(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TransactionId, SessionError> {
        self.ensure_open()?;
        let events = self.transfer_matching(|f| f.modified.map_or(false, |m| m > from && m < to));
        self.results.extend(events);
        Ok(self.begin())
    }

    fn pending_result_count(&self) -> usize {
        self.results.len()
    }

    async fn next_result(&mut self) -> Result<Option<FileEvent>, SessionError> {
        self.ensure_open()?;
        Ok(self.results.pop_front())
    }

    async fn change_file_type(&mut self, file_type: &str) -> Result<Status, SessionError> {
        self.ensure_open()?;
        if !self.group_dir.is_dir() {
            return Err(SessionError::Connection(format!("server group {} unreachable", self.server_group)));
        }
        if !self.group_dir.join(file_type).is_dir() {
            return Ok(Status::FileNotFound);
        }
        if self.file_type.as_deref() != Some(file_type) {
            self.file_type = Some(file_type.to_string());
            self.position = Position::default();
        }
        Ok(Status::Ok)
    }

    async fn set_option(&mut self, option: SessionOption, enabled: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        if enabled {
            self.options.insert(option);
        } else {
            self.options.remove(&option);
        }
        Ok(())
    }

    async fn set_replication_root(&mut self, root: &Path) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.replication_root = Some(root.to_path_buf());
        Ok(())
    }

    async fn change_working_dir(&mut self, dir: &Path) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !dir.is_dir() {
            return Err(SessionError::Protocol(format!("{} is not a directory", dir.display())));
        }
        self.working_dir = Some(dir.to_path_buf());
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.closed = true;
        self.results.clear();
        Ok(())
    }
}

fn local_write_failure(event: FileEvent, dest: &Path, error: std::io::Error) -> FileEvent {
    FileEvent {
        status: Status::Other(CODE_LOCAL_WRITE),
        ..event
    }
    .with_message(format!("failed to write {}: {}", dest.display(), error))
}

/// Move `path` aside to the first free `<name>.<n>`
fn keep_version(path: &Path) -> std::io::Result<()> {
    let mut n = 1u32;
    loop {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(format!(".{}", n));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            return fs::rename(path, candidate);
        }
        n += 1;
    }
}

fn same_content(a: &Path, b: &Path) -> std::io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(crc32_file(a)? == crc32_file(b)?)
}

/// CRC32 of a file as lowercase hex
pub fn crc32_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

/// Push-mode listener source that scans one file type directory
pub struct SpoolNotifications {
    dir: PathBuf,
    scan_interval: Duration,
    seen: HashSet<String>,
    batch: VecDeque<String>,
    primed: bool,
    include_existing: bool,
    closed: bool,
}

impl SpoolNotifications {
    fn new(dir: PathBuf, scan_interval: Duration, include_existing: bool) -> Self {
        Self {
            dir,
            scan_interval,
            seen: HashSet::new(),
            batch: VecDeque::new(),
            primed: false,
            include_existing,
            closed: false,
        }
    }

    fn scan(&mut self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut fresh: Vec<(Option<std::time::SystemTime>, String)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.metadata().map(|m| m.is_file()).unwrap_or(false))
            .map(|e| (e.metadata().ok().and_then(|m| m.modified().ok()), e.file_name().to_string_lossy().to_string()))
            .filter(|(_, name)| !name.starts_with('.') && !self.seen.contains(name))
            .collect();
        fresh.sort();

        let announce = self.primed || self.include_existing;
        for (_, name) in fresh {
            self.seen.insert(name.clone());
            if announce {
                self.batch.push_back(name);
            }
        }
        self.primed = true;
    }
}

#[async_trait]
impl NotificationSource for SpoolNotifications {
    async fn next(&mut self) -> Option<PendingItem> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(name) = self.batch.pop_front() {
                return Some(PendingItem::Name(name));
            }
            if self.primed {
                tokio::time::sleep(self.scan_interval).await;
            }
            self.scan();
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Query subscription over every (or the listed) file type in a server group
pub struct SpoolQuery {
    group_dir: PathBuf,
    server_group: String,
    file_types: Vec<String>,
    scan_interval: Duration,
    seen: HashSet<(String, String)>,
    batch: VecDeque<QueryHit>,
    id: Option<String>,
    primed: bool,
    closed: bool,
}

impl SpoolQuery {
    fn new(group_dir: PathBuf, server_group: &str, file_types: Vec<String>, scan_interval: Duration) -> Self {
        Self {
            group_dir,
            server_group: server_group.to_string(),
            file_types,
            scan_interval,
            seen: HashSet::new(),
            batch: VecDeque::new(),
            id: None,
            primed: false,
            closed: false,
        }
    }

    fn types(&self) -> Vec<String> {
        if !self.file_types.is_empty() {
            return self.file_types.clone();
        }
        fs::read_dir(&self.group_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .filter(|n| !n.starts_with('.'))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn scan(&mut self) {
        let mut fresh = Vec::new();
        for ty in self.types() {
            let Ok(entries) = fs::read_dir(self.group_dir.join(&ty)) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                let Ok(meta) = entry.metadata() else { continue };
                if name.starts_with('.') || !meta.is_file() || self.seen.contains(&(ty.clone(), name.clone())) {
                    continue;
                }
                let modified = meta.modified().ok().map(DateTime::<Utc>::from);
                fresh.push((modified, ty.clone(), name, meta.len()));
            }
        }
        fresh.sort();

        for (modified, ty, name, size) in fresh {
            self.seen.insert((ty.clone(), name.clone()));
            if self.primed {
                let event = FileEvent::new(&name, &ty, &self.server_group, Status::Ok)
                    .with_size(size)
                    .with_times(modified, None);
                self.batch.push_back(QueryHit {
                    file_type: ty,
                    name,
                    event: Some(event),
                });
            }
        }
        self.primed = true;
    }
}

#[async_trait]
impl QuerySubscription for SpoolQuery {
    async fn subscribe(&mut self) -> Result<String, SessionError> {
        if !self.group_dir.is_dir() {
            return Err(SessionError::Connection(format!("server group {} unreachable", self.server_group)));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.id = Some(id.clone());
        self.scan();
        Ok(id)
    }

    fn is_alive(&self) -> bool {
        self.id.is_some() && !self.closed
    }

    async fn next_hit(&mut self) -> Option<QueryHit> {
        loop {
            if !self.is_alive() {
                return None;
            }
            if let Some(hit) = self.batch.pop_front() {
                return Some(hit);
            }
            tokio::time::sleep(self.scan_interval).await;
            self.scan();
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

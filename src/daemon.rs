// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The zsysd daemon and its wire protocol.
//!
//! One JSON object per request over the unix socket; the reply is a stream
//! of `log` objects closed by exactly one `done` or `error` object, so a
//! long operation can narrate while it runs. Read-only requests share the
//! machine graph behind a read lock; mutating requests serialize on the
//! write lock for their whole duration.

use std::os::fd::FromRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing;

use crate::ZsysError;
use crate::cmdline::Cmdline;
use crate::config::Config;
use crate::libzfs::ZfsPool;
use crate::machines::boot::BootMenu;
use crate::machines::{Machines, boot, gc, states, users};
use crate::zfs::Zfs;

/// A client request. On the wire: `{"command": "...", ...fields}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    MachineList,
    MachineShow {
        machine: Option<String>,
    },
    EnsureBoot,
    CommitBoot,
    SaveSystemState {
        #[serde(default)]
        state_name: Option<String>,
    },
    SaveUserState {
        user: String,
        #[serde(default)]
        state_name: Option<String>,
    },
    RemoveState {
        state: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        dry_run: bool,
    },
    CreateUserData {
        user: String,
        home: String,
    },
    ChangeHomeOnUserData {
        home: String,
        new_home: String,
    },
    DissociateUser {
        user: String,
        #[serde(default)]
        remove_home: bool,
    },
    GarbageCollect {
        #[serde(default)]
        all: bool,
    },
}

impl Request {
    fn is_read_only(&self) -> bool {
        matches!(self, Request::MachineList | Request::MachineShow { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Request::MachineList => "machine-list",
            Request::MachineShow { .. } => "machine-show",
            Request::EnsureBoot => "ensure-boot",
            Request::CommitBoot => "commit-boot",
            Request::SaveSystemState { .. } => "save-system-state",
            Request::SaveUserState { .. } => "save-user-state",
            Request::RemoveState { .. } => "remove-state",
            Request::CreateUserData { .. } => "create-user-data",
            Request::ChangeHomeOnUserData { .. } => "change-home-on-user-data",
            Request::DissociateUser { .. } => "dissociate-user",
            Request::GarbageCollect { .. } => "garbage-collect",
        }
    }
}

/// One request plus its requested server-side log verbosity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub verbosity: u8,
    #[serde(flatten)]
    pub request: Request,
}

/// One element of the reply stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Log {
        level: String,
        message: String,
    },
    Done {
        result: serde_json::Value,
    },
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Vec<String>>,
    },
}

impl Reply {
    fn from_error(err: &ZsysError) -> Reply {
        let details = match err {
            ZsysError::NeedsConfirmation { dependencies, .. } => Some(dependencies.clone()),
            _ => None,
        };
        Reply::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            details,
        }
    }

    /// The inverse of [`Reply::from_error`], used by the client.
    fn into_error(kind: String, message: String, details: Option<Vec<String>>) -> ZsysError {
        match kind.as_str() {
            "not-found" => ZsysError::not_found("object", message),
            "already-exists" => ZsysError::already_exists(message),
            "invalid-argument" => ZsysError::invalid_argument(message),
            "integrity-violation" => ZsysError::integrity(message),
            "conflict" => ZsysError::conflict(message),
            "needs-confirmation" => {
                ZsysError::needs_confirmation(message, details.unwrap_or_default())
            }
            "unavailable" => ZsysError::unavailable(message),
            _ => ZsysError::internal(message),
        }
    }
}

/// The daemon-side service: the graph, its machine view and the loaded
/// configuration, with one handler per request.
pub struct Zsys {
    zfs: Zfs,
    machines: Machines,
    config: Config,
    cmdline: Cmdline,
    menu: Box<dyn BootMenu>,
}

impl Zsys {
    pub fn new(
        pool: Box<dyn ZfsPool>,
        config: Config,
        cmdline: Cmdline,
        menu: Box<dyn BootMenu>,
    ) -> Result<Zsys, ZsysError> {
        let zfs = Zfs::scan(pool)?;
        let machines = Machines::build(&zfs, &cmdline);
        Ok(Zsys {
            zfs,
            machines,
            config,
            cmdline,
            menu,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rescan the pools and rebuild the machine view.
    pub fn refresh(&mut self) -> Result<(), ZsysError> {
        self.zfs.rescan()?;
        self.machines = Machines::build(&self.zfs, &self.cmdline);
        Ok(())
    }

    pub fn handle(&mut self, request: &Request) -> Result<serde_json::Value, ZsysError> {
        if request.is_read_only() {
            self.query(request)
        } else {
            let result = self.mutate(request);
            // The view must follow the graph even after a failed operation:
            // a cancelled transaction may have been partially reverted.
            if let Err(err) = self.refresh() {
                tracing::warn!(%err, "refresh after mutation failed");
            }
            result
        }
    }

    /// Read-only requests; callers hold the read lock.
    pub fn query(&self, request: &Request) -> Result<serde_json::Value, ZsysError> {
        match request {
            Request::MachineList => {
                let machines: Vec<serde_json::Value> = self
                    .machines
                    .all
                    .values()
                    .map(|machine| {
                        json!({
                            "id": machine.id,
                            "zsys": machine.is_zsys,
                            "current": machine.current.as_ref().map(|s| &s.dataset_name),
                            "last_used": machine.current.as_ref().map(|s| s.last_used),
                            "history": machine.history.len(),
                            "users": machine.users.keys().collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                Ok(json!({ "machines": machines, "unmanaged": self.machines.unmanaged }))
            }
            Request::MachineShow { machine } => {
                let machine = match machine {
                    Some(id) => self
                        .machines
                        .all
                        .get(id)
                        .ok_or_else(|| ZsysError::not_found("machine", id))?,
                    None => self.machines.current_machine()?,
                };
                let history: Vec<serde_json::Value> = machine
                    .history
                    .values()
                    .map(|state| {
                        json!({
                            "id": state.id,
                            "dataset": state.dataset_name,
                            "snapshot": state.is_snapshot,
                            "last_used": state.last_used,
                        })
                    })
                    .collect();
                let users: serde_json::Value = machine
                    .users
                    .iter()
                    .map(|(name, states)| {
                        (
                            name.clone(),
                            json!(
                                states
                                    .iter()
                                    .map(|s| s.dataset_name.clone())
                                    .collect::<Vec<_>>()
                            ),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                Ok(json!({
                    "id": machine.id,
                    "zsys": machine.is_zsys,
                    "current": machine.current.as_ref().map(|s| &s.dataset_name),
                    "history": history,
                    "users": users,
                }))
            }
            _ => Err(ZsysError::internal(format!(
                "{} is not a read-only request",
                request.name()
            ))),
        }
    }

    fn mutate(&mut self, request: &Request) -> Result<serde_json::Value, ZsysError> {
        match request {
            Request::EnsureBoot => {
                let changed = boot::ensure_boot(&self.machines, &mut self.zfs)?;
                if changed {
                    self.menu.update()?;
                }
                Ok(json!({ "changed": changed }))
            }
            Request::CommitBoot => {
                let now = chrono::Utc::now().timestamp();
                let changed = boot::commit(&self.machines, &mut self.zfs, now)?;
                if changed {
                    self.menu.update()?;
                }
                Ok(json!({ "changed": changed }))
            }
            Request::SaveSystemState { state_name } => {
                let tag = states::create_system_snapshot(
                    &self.machines,
                    &mut self.zfs,
                    state_name.as_deref(),
                )?;
                Ok(json!({ "state": tag }))
            }
            Request::SaveUserState { user, state_name } => {
                let tag = states::create_user_snapshot(
                    &self.machines,
                    &mut self.zfs,
                    user,
                    state_name.as_deref(),
                )?;
                Ok(json!({ "state": tag }))
            }
            Request::RemoveState {
                state,
                user,
                force,
                dry_run,
            } => {
                let plan = states::remove_state(
                    &self.machines,
                    &mut self.zfs,
                    state,
                    user.as_deref(),
                    *force,
                    *dry_run,
                )?;
                Ok(json!({ "plan": plan.preview(), "dry_run": dry_run }))
            }
            Request::CreateUserData { user, home } => {
                users::create_user_data(&self.machines, &mut self.zfs, user, home)?;
                Ok(json!({}))
            }
            Request::ChangeHomeOnUserData { home, new_home } => {
                users::change_home_on_user_data(&self.machines, &mut self.zfs, home, new_home)?;
                Ok(json!({}))
            }
            Request::DissociateUser { user, remove_home } => {
                users::dissociate_user(&self.machines, &mut self.zfs, user, *remove_home)?;
                Ok(json!({}))
            }
            Request::GarbageCollect { all } => {
                let now = chrono::Utc::now().timestamp();
                let removed =
                    gc::collect(&self.machines, &mut self.zfs, &self.config, *all, now)?;
                Ok(json!({ "removed": removed }))
            }
            Request::MachineList | Request::MachineShow { .. } => self.query(request),
        }
    }
}

/// Serve requests until the idle timeout elapses or the process is asked to
/// stop. A supervisor-passed listener wins over the configured socket path.
pub async fn serve(zsys: Zsys, socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    use anyhow::Context;

    let idle = Duration::from_secs(zsys.config().general.timeout.max(1));
    let socket_path = socket_override.unwrap_or_else(|| zsys.config().socket_path());

    let (listener, bound_path) = match sd_notify::listen_fds()
        .ok()
        .and_then(|mut fds| fds.next())
    {
        Some(fd) => {
            tracing::info!(fd, "using supervisor-passed listener");
            // SAFETY: the supervisor hands us ownership of this descriptor.
            let std_listener = unsafe {
                std::os::unix::net::UnixListener::from_raw_fd(fd)
            };
            std_listener.set_nonblocking(true)?;
            (UnixListener::from_std(std_listener)?, None)
        }
        None => {
            // A stale socket from an unclean shutdown blocks the bind.
            let _ = std::fs::remove_file(&socket_path);
            let listener = UnixListener::bind(&socket_path)
                .with_context(|| format!("cannot bind '{}'", socket_path.display()))?;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
            tracing::info!(socket = %socket_path.display(), "listening");
            (listener, Some(socket_path))
        }
    };
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    let state = Arc::new(RwLock::new(zsys));
    let in_flight = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let state = Arc::clone(&state);
                let in_flight = Arc::clone(&in_flight);
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state).await {
                        tracing::warn!(%err, "connection failed");
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            _ = tokio::time::sleep(idle) => {
                // The countdown only runs while nothing is in flight; any
                // accepted connection restarts it by winning the select.
                if in_flight.load(Ordering::SeqCst) == 0 {
                    tracing::info!("stopping after idle timeout");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    if let Some(path) = bound_path {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<RwLock<Zsys>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                let reply = Reply::Error {
                    kind: "invalid-argument".to_string(),
                    message: format!("malformed request: {err}"),
                    details: None,
                };
                write_reply(&mut writer, &reply).await?;
                continue;
            }
        };

        tracing::debug!(command = envelope.request.name(), "handling request");
        if envelope.verbosity > 0 {
            let log = Reply::Log {
                level: "info".to_string(),
                message: format!("processing {}", envelope.request.name()),
            };
            write_reply(&mut writer, &log).await?;
        }

        let result = if envelope.request.is_read_only() {
            state.read().await.query(&envelope.request)
        } else {
            state.write().await.handle(&envelope.request)
        };
        let reply = match result {
            Ok(result) => Reply::Done { result },
            Err(err) => {
                tracing::warn!(command = envelope.request.name(), %err, "request failed");
                Reply::from_error(&err)
            }
        };
        write_reply(&mut writer, &reply).await?;
    }
    Ok(())
}

async fn write_reply(
    writer: &mut (impl AsyncWriteExt + Unpin),
    reply: &Reply,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(reply)?;
    payload.push(b'\n');
    writer.write_all(&payload).await
}

/// Blocking client used by the command-line front-end. Streams server logs
/// to stderr and returns the terminal result.
pub fn request(socket: &Path, envelope: &Envelope) -> Result<serde_json::Value, ZsysError> {
    use std::io::{BufRead, Write};

    let mut stream = std::os::unix::net::UnixStream::connect(socket).map_err(|err| {
        ZsysError::unavailable(format!(
            "cannot reach zsysd at '{}': {err}",
            socket.display()
        ))
    })?;
    let mut payload = serde_json::to_vec(envelope)
        .map_err(|err| ZsysError::internal(format!("cannot encode request: {err}")))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| ZsysError::unavailable(format!("cannot send request: {err}")))?;

    let reader = std::io::BufReader::new(stream);
    for line in reader.lines() {
        let line =
            line.map_err(|err| ZsysError::unavailable(format!("connection lost: {err}")))?;
        let reply: Reply = serde_json::from_str(&line)
            .map_err(|err| ZsysError::internal(format!("malformed reply: {err}")))?;
        match reply {
            Reply::Log { level, message } => eprintln!("[{level}] {message}"),
            Reply::Done { result } => return Ok(result),
            Reply::Error {
                kind,
                message,
                details,
            } => return Err(Reply::into_error(kind, message, details)),
        }
    }
    Err(ZsysError::unavailable("server closed the stream early"))
}

//! TCP server dispatching protocol commands to the loaded databases.
//!
//! Each connection gets its own handler task; the databases live behind a
//! mutex because operations on one instance are strictly serial. Fatal
//! engine errors drop the affected database handle and end the
//! connection; recoverable errors surface as `301` replies and the
//! connection continues.

use crate::protocol::{self, Command, QueryModifiers};
use anyhow::{Context, Result};
use imgsim_core::{
    avgl_difference, difference, load_file, stddev_limit, Database, DbError, DbMode, SimValue,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

struct DbEntry {
    db: Box<dyn Database>,
    path: PathBuf,
}

/// Shared server state: the database table and the shutdown signal.
pub struct ServerState {
    dbs: Mutex<Vec<Option<DbEntry>>>,
    shutdown: Notify,
    /// Whether maintenance commands (quit, rehash, saveas, load, drop)
    /// are allowed.
    maintenance: bool,
}

/// The command server.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind the listener and load the initial databases.
    pub async fn bind(
        addr: &str,
        files: &[PathBuf],
        mode: DbMode,
        maintenance: bool,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        tracing::info!(addr, "listening");

        let mut dbs = Vec::with_capacity(files.len());
        for path in files {
            let db = load_file(path, mode)
                .with_context(|| format!("cannot load {}", path.display()))?;
            tracing::info!(path = %path.display(), images = db.image_count(), "database ready");
            dbs.push(Some(DbEntry {
                db,
                path: path.clone(),
            }));
        }

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                dbs: Mutex::new(dbs),
                shutdown: Notify::new(),
                maintenance,
            }),
        })
    }

    /// Accept connections until a `quit` command shuts the server down.
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "connection accepted");
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    tracing::warn!(%peer, error = %e, "connection failed");
                                }
                                tracing::debug!(%peer, "connection closed");
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept failed"),
                    }
                }
                _ = self.state.shutdown.notified() => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Outcome of one command, for connection control flow.
enum Flow {
    Continue,
    CloseConnection,
    ShutdownServer,
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut out = BufWriter::new(write_half);
    let mut modifiers = QueryModifiers::default();

    loop {
        out.write_all(b"000 imgsim ready\n").await?;
        out.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        let reply = match protocol::parse(&line) {
            Ok(command) => {
                let mut dbs = state.dbs.lock().await;
                run_command(command, &mut dbs, &mut modifiers, &state)
            }
            Err(message) => CommandReply {
                lines: vec![format!("300 {message}")],
                flow: Flow::Continue,
            },
        };

        for line in &reply.lines {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await?;

        match reply.flow {
            Flow::Continue => {}
            Flow::CloseConnection => break,
            Flow::ShutdownServer => {
                state.shutdown.notify_waiters();
                break;
            }
        }
    }
    Ok(())
}

struct CommandReply {
    lines: Vec<String>,
    flow: Flow,
}

impl CommandReply {
    fn ok(lines: Vec<String>) -> Self {
        Self {
            lines,
            flow: Flow::Continue,
        }
    }

    fn one(line: String) -> Self {
        Self::ok(vec![line])
    }
}

fn result_rows(results: &[SimValue]) -> Vec<String> {
    let mut lines = Vec::with_capacity(results.len() + 1);
    lines.push(format!("101 matches={}", results.len()));
    for value in results {
        lines.push(format!(
            "200 {:08x} {} {} {}",
            value.id, value.score, value.width, value.height
        ));
    }
    lines
}

fn entry_at<'a>(
    dbs: &'a mut [Option<DbEntry>],
    dbid: usize,
) -> Result<&'a mut DbEntry, DbError> {
    dbs.get_mut(dbid)
        .and_then(|slot| slot.as_mut())
        .ok_or_else(|| DbError::Param(format!("dbid {dbid} out of range")))
}

fn run_command(
    command: Command,
    dbs: &mut Vec<Option<DbEntry>>,
    modifiers: &mut QueryModifiers,
    state: &ServerState,
) -> CommandReply {
    let maintenance = state.maintenance;
    let outcome = dispatch(command, dbs, modifiers, maintenance);
    match outcome {
        Ok(reply) => reply,
        Err((dbid, error)) => {
            if error.is_fatal() {
                // The instance is poisoned; drop the handle.
                if let Some(dbid) = dbid {
                    if let Some(slot) = dbs.get_mut(dbid) {
                        *slot = None;
                    }
                    tracing::error!(dbid, error = %error, "database dropped after fatal error");
                }
                CommandReply {
                    lines: vec![format!("302 {} {}", error.kind(), error)],
                    flow: Flow::CloseConnection,
                }
            } else {
                CommandReply::one(format!("301 {} {}", error.kind(), error))
            }
        }
    }
}

type DispatchResult = Result<CommandReply, (Option<usize>, DbError)>;

fn guard_maintenance(maintenance: bool) -> Result<(), (Option<usize>, DbError)> {
    if maintenance {
        Ok(())
    } else {
        Err((
            None,
            DbError::Usage {
                mode: "query-only",
                what: "maintenance commands",
            },
        ))
    }
}

fn dispatch(
    command: Command,
    dbs: &mut Vec<Option<DbEntry>>,
    modifiers: &mut QueryModifiers,
    maintenance: bool,
) -> DispatchResult {
    let fail = |dbid: usize| move |e: DbError| (Some(dbid), e);
    match command {
        Command::Nop => Ok(CommandReply::one("100 NOP.".into())),
        Command::Ping => Ok(CommandReply::one("100 Pong.".into())),
        Command::Done => Ok(CommandReply {
            lines: vec![],
            flow: Flow::CloseConnection,
        }),
        Command::Quit => {
            guard_maintenance(maintenance)?;
            Ok(CommandReply {
                lines: vec!["100 Done.".into()],
                flow: Flow::ShutdownServer,
            })
        }
        Command::DbList => {
            let mut lines = Vec::new();
            for (dbid, slot) in dbs.iter().enumerate() {
                if let Some(entry) = slot {
                    lines.push(format!("102 {} {}", dbid, entry.path.display()));
                }
            }
            Ok(CommandReply::ok(lines))
        }
        Command::List { dbid } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let lines = entry
                .db
                .image_ids()
                .into_iter()
                .map(|id| format!("100 {id:08x}"))
                .collect();
            Ok(CommandReply::ok(lines))
        }
        Command::ListInfo { dbid } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let infos = entry.db.image_infos().map_err(fail(dbid))?;
            let lines = infos
                .iter()
                .map(|info| format!("100 {:08x} {} {}", info.id, info.width, info.height))
                .collect();
            Ok(CommandReply::ok(lines))
        }
        Command::Count { dbid } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            Ok(CommandReply::one(format!(
                "101 count={}",
                entry.db.image_count()
            )))
        }
        Command::Has { dbid, id } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            Ok(CommandReply::one(format!(
                "100 {:08x}={}",
                id,
                entry.db.has_image(id) as u8
            )))
        }
        Command::Query {
            dbid,
            flags,
            numres,
            path,
        } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let opts = protocol::options_from_flags(flags, numres, modifiers);
            let planes =
                imgsim_core::load::planes_from_file(path.as_ref()).map_err(fail(dbid))?;
            let sig = imgsim_core::ImgData::from_planes(0, &planes);
            let mut results = entry.db.query(&sig, &opts).map_err(fail(dbid))?;
            if let Some(mindev) = modifiers.mindev {
                stddev_limit(&mut results, mindev);
            }
            modifiers.reset();
            Ok(CommandReply::ok(result_rows(&results)))
        }
        Command::Sim {
            dbid,
            flags,
            numres,
            id,
        } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let opts = protocol::options_from_flags(flags, numres, modifiers);
            let mut results = entry.db.query_by_id(id, &opts).map_err(fail(dbid))?;
            if let Some(mindev) = modifiers.mindev {
                stddev_limit(&mut results, mindev);
            }
            modifiers.reset();
            Ok(CommandReply::ok(result_rows(&results)))
        }
        Command::Add {
            dbid,
            id,
            width,
            height,
            path,
        } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let mut lines = Vec::new();
            if !entry.db.has_image(id) {
                lines.push(format!("100 Adding {path} = {dbid}:{id:08x}..."));
                let planes =
                    imgsim_core::load::planes_from_file(path.as_ref()).map_err(fail(dbid))?;
                entry.db.add_image(id, &planes).map_err(fail(dbid))?;
            }
            if let (Some(width), Some(height)) = (width, height) {
                entry
                    .db
                    .set_resolution(id, width, height)
                    .map_err(fail(dbid))?;
            }
            Ok(CommandReply::ok(lines))
        }
        Command::Remove { dbid, id } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            entry.db.remove_image(id).map_err(fail(dbid))?;
            Ok(CommandReply::one(format!("100 Removed {dbid}:{id:08x}.")))
        }
        Command::SetRes {
            dbid,
            id,
            width,
            height,
        } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            entry
                .db
                .set_resolution(id, width, height)
                .map_err(fail(dbid))?;
            Ok(CommandReply::one(format!(
                "100 Set {dbid}:{id:08x} = {width}:{height}."
            )))
        }
        Command::Diff { dbid, one, two } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let avgl = avgl_difference(entry.db.as_ref(), one, two).map_err(fail(dbid))?;
            let full = difference(entry.db.as_ref(), one, two, false).map_err(fail(dbid))?;
            Ok(CommandReply::one(format!(
                "100 {one:08x} {two:08x} diff={full} avgl={avgl}"
            )))
        }
        Command::Rehash { dbid } => {
            guard_maintenance(maintenance)?;
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            entry.db.rehash().map_err(fail(dbid))?;
            Ok(CommandReply::one(format!("100 Rehashed {dbid}.")))
        }
        Command::CoeffStats { dbid } => {
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            let stats = entry.db.coeff_stats().map_err(fail(dbid))?;
            let mut lines = vec![format!("100 Retrieving coefficient stats for {dbid}...")];
            lines.extend(
                stats
                    .iter()
                    .filter(|(_, size)| *size > 0)
                    .map(|(flat, size)| format!("100 {flat} {size}")),
            );
            Ok(CommandReply::ok(lines))
        }
        Command::SaveAs { dbid, path } => {
            guard_maintenance(maintenance)?;
            let entry = entry_at(dbs, dbid).map_err(|e| (None, e))?;
            entry.db.save(path.as_ref()).map_err(fail(dbid))?;
            Ok(CommandReply::one(format!("100 Saved {dbid} to {path}.")))
        }
        Command::Load { dbid, mode, path } => {
            guard_maintenance(maintenance)?;
            if dbs.get(dbid).map(|slot| slot.is_some()).unwrap_or(false) {
                return Err((None, DbError::Param(format!("dbid {dbid} already in use"))));
            }
            let mode = DbMode::from_name(&mode).map_err(|e| (None, e))?;
            let db = load_file(path.as_ref(), mode).map_err(|e| (None, e))?;
            if dbs.len() <= dbid {
                dbs.resize_with(dbid + 1, || None);
            }
            dbs[dbid] = Some(DbEntry {
                db,
                path: PathBuf::from(&path),
            });
            Ok(CommandReply::one(format!("100 Loaded {dbid} from {path}.")))
        }
        Command::Drop { dbid } => {
            guard_maintenance(maintenance)?;
            entry_at(dbs, dbid).map_err(|e| (None, e))?;
            dbs[dbid] = None;
            Ok(CommandReply::one(format!("100 Dropped DB {dbid}.")))
        }
        Command::QueryOptMask { and, xor } => {
            modifiers.mask = Some(imgsim_core::MaskFilter { and, xor });
            Ok(CommandReply::one(format!(
                "100 Using mask and={and} xor={xor}"
            )))
        }
        Command::QueryOptMindev { mindev } => {
            modifiers.mindev = Some(mindev);
            Ok(CommandReply::one(format!("100 Using mindev={mindev}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgsim_core::{create, ImgData, NUM_COEFS};

    fn block_sig(id: u64, block: usize) -> ImgData {
        let mut sig = [[0i32; NUM_COEFS]; 3];
        for (c, channel) in sig.iter_mut().enumerate() {
            for (k, slot) in channel.iter_mut().enumerate() {
                *slot = (1 + block * 150 + c * 50 + k) as i32;
            }
        }
        ImgData {
            id,
            sig,
            avglf: [0.5, 0.1, 0.1],
            width: 10,
            height: 10,
        }
    }

    fn test_dbs() -> Vec<Option<DbEntry>> {
        let mut db = create().unwrap();
        for n in 0..3u64 {
            db.add_signature(&block_sig(n, n as usize)).unwrap();
        }
        vec![Some(DbEntry {
            db,
            path: PathBuf::from("/tmp/test.db"),
        })]
    }

    fn run(command: Command, dbs: &mut Vec<Option<DbEntry>>) -> Vec<String> {
        let mut modifiers = QueryModifiers::default();
        dispatch(command, dbs, &mut modifiers, true)
            .map(|reply| reply.lines)
            .unwrap_or_else(|(_, e)| vec![format!("301 {} {}", e.kind(), e)])
    }

    #[test]
    fn test_count_and_list() {
        let mut dbs = test_dbs();
        assert_eq!(run(Command::Count { dbid: 0 }, &mut dbs), vec!["101 count=3"]);
        let list = run(Command::List { dbid: 0 }, &mut dbs);
        assert_eq!(list.len(), 3);
        assert!(list.contains(&"100 00000002".to_string()));
    }

    #[test]
    fn test_sim_returns_result_rows() {
        let mut dbs = test_dbs();
        let lines = run(
            Command::Sim {
                dbid: 0,
                flags: 0,
                numres: 3,
                id: 1,
            },
            &mut dbs,
        );
        assert_eq!(lines[0], "101 matches=3");
        assert!(lines[1].starts_with("200 00000001 "));
    }

    #[test]
    fn test_bad_dbid_is_param_error() {
        let mut dbs = test_dbs();
        let lines = run(Command::Count { dbid: 7 }, &mut dbs);
        assert!(lines[0].starts_with("301 param_error"));
    }

    #[test]
    fn test_remove_unknown_id_keeps_connection() {
        let mut dbs = test_dbs();
        let lines = run(Command::Remove { dbid: 0, id: 0x99 }, &mut dbs);
        assert!(lines[0].starts_with("301 invalid_id"));
        // The database is still there and usable.
        assert_eq!(run(Command::Count { dbid: 0 }, &mut dbs), vec!["101 count=3"]);
    }

    #[test]
    fn test_maintenance_guard() {
        let mut dbs = test_dbs();
        let mut modifiers = QueryModifiers::default();
        let denied = dispatch(Command::Rehash { dbid: 0 }, &mut dbs, &mut modifiers, false);
        assert!(matches!(denied, Err((None, DbError::Usage { .. }))));
    }
}

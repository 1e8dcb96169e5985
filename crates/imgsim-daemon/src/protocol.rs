//! The line-oriented command protocol.
//!
//! One command per line, space-separated arguments. Replies are numbered:
//! `000` greeting, `1xx` status, `2xx` data rows, `3xx` errors (`301`
//! recoverable with the error kind, `302` fatal). Query flags arrive as a
//! numeric bitmask for compatibility with existing clients.

use imgsim_core::{ImageId, MaskFilter, QueryOptions};

/// Query flag bits.
pub const FLAG_SKETCH: u32 = 0x01;
pub const FLAG_GRAYSCALE: u32 = 0x02;
pub const FLAG_UNIQUESET: u32 = 0x08;
pub const FLAG_NOCOMMON: u32 = 0x10;
pub const FLAG_FAST: u32 = 0x20;

/// Per-connection query modifiers set via `query_opt`, consumed by the
/// next query command.
#[derive(Debug, Default, Clone)]
pub struct QueryModifiers {
    pub mask: Option<MaskFilter>,
    pub mindev: Option<f32>,
}

impl QueryModifiers {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Parsed commands.
#[derive(Debug, PartialEq)]
pub enum Command {
    Quit,
    Done,
    Ping,
    Nop,
    DbList,
    List { dbid: usize },
    ListInfo { dbid: usize },
    Count { dbid: usize },
    Has { dbid: usize, id: ImageId },
    Query { dbid: usize, flags: u32, numres: usize, path: String },
    Sim { dbid: usize, flags: u32, numres: usize, id: ImageId },
    Add { dbid: usize, id: ImageId, width: Option<u32>, height: Option<u32>, path: String },
    Remove { dbid: usize, id: ImageId },
    SetRes { dbid: usize, id: ImageId, width: u32, height: u32 },
    Diff { dbid: usize, one: ImageId, two: ImageId },
    Rehash { dbid: usize },
    CoeffStats { dbid: usize },
    SaveAs { dbid: usize, path: String },
    Load { dbid: usize, mode: String, path: String },
    Drop { dbid: usize },
    QueryOptMask { and: u16, xor: u16 },
    QueryOptMindev { mindev: f32 },
}

/// Build engine query options from the wire flags.
pub fn options_from_flags(flags: u32, numres: usize, modifiers: &QueryModifiers) -> QueryOptions {
    QueryOptions {
        numres,
        sketch: flags & FLAG_SKETCH != 0,
        grayscale: flags & FLAG_GRAYSCALE != 0,
        uniqueset: flags & FLAG_UNIQUESET != 0,
        nocommon: flags & FLAG_NOCOMMON != 0,
        fast: flags & FLAG_FAST != 0,
        mask: modifiers.mask,
    }
}

fn parse_int<T: std::str::FromStr>(token: Option<&str>, what: &str) -> Result<T, String> {
    token
        .ok_or_else(|| format!("missing {what}"))?
        .parse()
        .map_err(|_| format!("bad {what}"))
}

/// Flags accept decimal or `0x` hex, like the C-style clients send them.
fn parse_flags(token: Option<&str>, what: &str) -> Result<u32, String> {
    let token = token.ok_or_else(|| format!("missing {what}"))?;
    if let Some(hex) = token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).map_err(|_| format!("bad {what}"))
    } else {
        token.parse().map_err(|_| format!("bad {what}"))
    }
}

/// Image ids travel in hex on the wire.
fn parse_id(token: Option<&str>, what: &str) -> Result<ImageId, String> {
    let token = token.ok_or_else(|| format!("missing {what}"))?;
    ImageId::from_str_radix(token.trim_start_matches("0x"), 16)
        .map_err(|_| format!("bad {what}"))
}

/// Split the final `id:path` (or `id w h:path`) argument form used by add.
fn split_spec(spec: &str) -> Result<(&str, &str), String> {
    spec.split_once(':')
        .ok_or_else(|| "expected <args>:<filename>".to_string())
}

/// Parse one command line.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut words = line.splitn(2, ' ');
    let command = words.next().unwrap_or("");
    let rest = words.next().unwrap_or("");
    let mut args = rest.split_whitespace();

    match command {
        "" => Ok(Command::Nop),
        "quit" => Ok(Command::Quit),
        "done" => Ok(Command::Done),
        "ping" => Ok(Command::Ping),
        "db_list" => Ok(Command::DbList),
        "list" => Ok(Command::List {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "list_info" => Ok(Command::ListInfo {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "count" => Ok(Command::Count {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "has" => Ok(Command::Has {
            dbid: parse_int(args.next(), "dbid")?,
            id: parse_id(args.next(), "imgid")?,
        }),
        "query" => {
            let dbid = parse_int(args.next(), "dbid")?;
            let flags = parse_flags(args.next(), "flags")?;
            let numres = parse_int(args.next(), "numres")?;
            let path: String = args.collect::<Vec<_>>().join(" ");
            if path.is_empty() {
                return Err("format: query <dbid> <flags> <numres> <filename>".into());
            }
            Ok(Command::Query {
                dbid,
                flags,
                numres,
                path,
            })
        }
        "sim" => Ok(Command::Sim {
            dbid: parse_int(args.next(), "dbid")?,
            flags: parse_flags(args.next(), "flags")?,
            numres: parse_int(args.next(), "numres")?,
            id: parse_id(args.next(), "imageId")?,
        }),
        "add" => {
            let dbid = parse_int(args.next(), "dbid")?;
            let spec = rest
                .split_once(' ')
                .map(|(_, s)| s)
                .ok_or("format: add <dbid> <imgid>[ <width> <height>]:<filename>")?;
            let (head, path) = split_spec(spec)?;
            let mut head_words = head.split_whitespace();
            let id = parse_id(head_words.next(), "imgid")?;
            let (width, height) = match (head_words.next(), head_words.next()) {
                (Some(w), Some(h)) => (
                    Some(w.parse().map_err(|_| "bad width")?),
                    Some(h.parse().map_err(|_| "bad height")?),
                ),
                (None, _) => (None, None),
                _ => return Err("width without height".into()),
            };
            Ok(Command::Add {
                dbid,
                id,
                width,
                height,
                path: path.to_string(),
            })
        }
        "remove" => Ok(Command::Remove {
            dbid: parse_int(args.next(), "dbid")?,
            id: parse_id(args.next(), "imgid")?,
        }),
        "set_res" => Ok(Command::SetRes {
            dbid: parse_int(args.next(), "dbid")?,
            id: parse_id(args.next(), "imgid")?,
            width: parse_int(args.next(), "width")?,
            height: parse_int(args.next(), "height")?,
        }),
        "diff" => Ok(Command::Diff {
            dbid: parse_int(args.next(), "dbid")?,
            one: parse_id(args.next(), "id1")?,
            two: parse_id(args.next(), "id2")?,
        }),
        "rehash" => Ok(Command::Rehash {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "coeff_stats" => Ok(Command::CoeffStats {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "saveas" => {
            let dbid = parse_int(args.next(), "dbid")?;
            let path: String = args.collect::<Vec<_>>().join(" ");
            if path.is_empty() {
                return Err("format: saveas <dbid> <file>".into());
            }
            Ok(Command::SaveAs { dbid, path })
        }
        "load" => {
            let dbid = parse_int(args.next(), "dbid")?;
            let mode = args.next().ok_or("missing mode")?.to_string();
            let path: String = args.collect::<Vec<_>>().join(" ");
            if path.is_empty() {
                return Err("format: load <dbid> <mode> <file>".into());
            }
            Ok(Command::Load { dbid, mode, path })
        }
        "drop" => Ok(Command::Drop {
            dbid: parse_int(args.next(), "dbid")?,
        }),
        "query_opt" => match args.next() {
            Some("mask") => Ok(Command::QueryOptMask {
                and: parse_int(args.next(), "mask AND")?,
                xor: parse_int(args.next(), "mask XOR")?,
            }),
            Some("mindev") => Ok(Command::QueryOptMindev {
                mindev: parse_int(args.next(), "stddev")?,
            }),
            _ => Err("unknown query option".into()),
        },
        other => Err(format!("unknown command: {other}")),
    }
}

//! imgsim - maintain and query image similarity databases.
//!
//! Usage:
//!   imgsim add <db>                    Read `id[ w h]:path` lines from stdin
//!   imgsim list <db>                   List all image ids
//!   imgsim count <db>                  Print the image count
//!   imgsim query <db> <image> [-n N]   Find images similar to a file
//!   imgsim sim <db> <id> [-n N]        Find images similar to a stored id
//!   imgsim diff <db> <id1> <id2>       Difference between two stored images
//!   imgsim rehash <db>                 Rebuild the buckets and save
//!   imgsim stats <db>                  Bucket occupancy statistics
//!   imgsim find-duplicates <db>        Cluster near-duplicate images

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgsim_core::{
    difference, find_duplicates, load, load_file, Database, DbMode, DupeOptions, ImageId,
    ImgData, QueryOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgsim")]
#[command(about = "Content-based image similarity database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add images listed on stdin as `id[ w h]:path` (ids in hex)
    Add { db: PathBuf },
    /// List all image ids
    List { db: PathBuf },
    /// Print the number of images
    Count { db: PathBuf },
    /// Find images similar to an image file
    Query {
        db: PathBuf,
        image: PathBuf,
        /// Maximum results
        #[arg(short, long, default_value_t = 16)]
        numres: usize,
        /// Treat the query as a hand-drawn sketch
        #[arg(long)]
        sketch: bool,
        /// Ignore color information
        #[arg(long)]
        grayscale: bool,
        /// Skip coefficients shared by over 10% of the database
        #[arg(long)]
        nocommon: bool,
    },
    /// Find images similar to a stored image id (hex)
    Sim {
        db: PathBuf,
        id: String,
        #[arg(short, long, default_value_t = 16)]
        numres: usize,
    },
    /// Content difference between two stored images
    Diff {
        db: PathBuf,
        id1: String,
        id2: String,
        /// Compare luminance only
        #[arg(long)]
        ignore_color: bool,
    },
    /// Rebuild the buckets from the signatures and save
    Rehash { db: PathBuf },
    /// Bucket occupancy statistics
    Stats { db: PathBuf },
    /// Cluster near-duplicate images
    FindDuplicates {
        db: PathBuf,
        /// Minimum score standard deviation for a match threshold
        #[arg(long, default_value_t = 10.0)]
        min_stddev: f32,
    },
}

fn parse_hex_id(token: &str) -> Result<ImageId> {
    ImageId::from_str_radix(token.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid image id: {token}"))
}

/// One stdin line of the bulk add format: `id[ w h]:path`.
fn parse_add_line(line: &str) -> Result<(ImageId, Option<(u32, u32)>, &str)> {
    let (head, path) = line
        .split_once(':')
        .context("expected `id[ w h]:path`")?;
    let mut words = head.split_whitespace();
    let id = parse_hex_id(words.next().context("missing image id")?)?;
    let dims = match (words.next(), words.next()) {
        (Some(w), Some(h)) => Some((
            w.parse().context("invalid width")?,
            h.parse().context("invalid height")?,
        )),
        (None, _) => None,
        _ => anyhow::bail!("width given without height"),
    };
    Ok((id, dims, path))
}

fn print_results(results: &[imgsim_core::SimValue]) {
    for value in results {
        println!(
            "{:08x} {} {} {}",
            value.id, value.score, value.width, value.height
        );
    }
}

fn cmd_add(db_path: &PathBuf) -> Result<()> {
    let mut db = load_file(db_path, DbMode::Alter)?;
    let stdin = std::io::stdin();

    let progress = ProgressBar::no_length();
    progress.set_style(ProgressStyle::with_template("{pos} images {msg}").unwrap());

    let mut added = 0u64;
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let (id, dims, path) = match parse_add_line(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("skipping line ({e}): {line}");
                continue;
            }
        };
        let outcome = (|| -> imgsim_core::Result<()> {
            if !db.has_image(id) {
                let planes = load::planes_from_file(path.as_ref())?;
                db.add_image(id, &planes)?;
            }
            if let Some((width, height)) = dims {
                db.set_resolution(id, width, height)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                added += 1;
                progress.inc(1);
            }
            Err(e) if !e.is_fatal() => eprintln!("{path}: {} {e}", e.kind()),
            Err(e) => return Err(e).context("database failure"),
        }
    }
    progress.finish_and_clear();
    db.save(db_path)?;
    println!("{added} images added");
    Ok(())
}

fn cmd_find_duplicates(db_path: &PathBuf, min_stddev: f32) -> Result<()> {
    let db = load_file(db_path, DbMode::ReadOnly)?;
    let clusters = find_duplicates(
        db.as_ref(),
        &DupeOptions {
            min_stddev,
            ..DupeOptions::default()
        },
    )?;
    for cluster in &clusters {
        print!("{:08x}", cluster.representative);
        for (id, score) in &cluster.members {
            print!(" {id:08x}:{score:.1}");
        }
        println!();
    }
    eprintln!("{} clusters", clusters.len());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match Cli::parse().command {
        Commands::Add { db } => cmd_add(&db)?,
        Commands::List { db } => {
            let db = load_file(&db, DbMode::Alter)?;
            for id in db.image_ids() {
                println!("{id:08x}");
            }
        }
        Commands::Count { db } => {
            let db = load_file(&db, DbMode::Simple)?;
            println!("{} images", db.image_count());
        }
        Commands::Query {
            db,
            image,
            numres,
            sketch,
            grayscale,
            nocommon,
        } => {
            let db = load_file(&db, DbMode::Simple)?;
            let planes = load::planes_from_file(&image)?;
            let sig = ImgData::from_planes(0, &planes);
            let opts = QueryOptions {
                numres,
                sketch,
                grayscale,
                nocommon,
                ..QueryOptions::default()
            };
            print_results(&db.query(&sig, &opts)?);
        }
        Commands::Sim { db, id, numres } => {
            let db = load_file(&db, DbMode::ReadOnly)?;
            let id = parse_hex_id(&id)?;
            print_results(&db.query_by_id(id, &QueryOptions::with_limit(numres))?);
        }
        Commands::Diff {
            db,
            id1,
            id2,
            ignore_color,
        } => {
            let db = load_file(&db, DbMode::ReadOnly)?;
            let one = parse_hex_id(&id1)?;
            let two = parse_hex_id(&id2)?;
            let diff = difference(db.as_ref(), one, two, ignore_color)?;
            println!("{one:08x} {two:08x} {diff}");
        }
        Commands::Rehash { db } => {
            let mut handle = load_file(&db, DbMode::Normal)?;
            handle.rehash()?;
            handle.save(&db)?;
        }
        Commands::Stats { db } => {
            let handle = load_file(&db, DbMode::Simple)?;
            let count = handle.image_count().max(1);
            for (flat, size) in handle.coeff_stats()? {
                if size == 0 {
                    continue;
                }
                let channel = flat / 32768;
                let sign = (flat / 16384) % 2;
                let magnitude = flat % 16384;
                println!(
                    "c={channel}\ts={sign}\ti={magnitude}\t{size} = {}%",
                    100 * size as usize / count
                );
            }
        }
        Commands::FindDuplicates { db, min_stddev } => cmd_find_duplicates(&db, min_stddev)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_line_forms() {
        let (id, dims, path) = parse_add_line("2a:/data/x.png").unwrap();
        assert_eq!(id, 0x2a);
        assert_eq!(dims, None);
        assert_eq!(path, "/data/x.png");

        let (id, dims, path) = parse_add_line("ff 1920 1080:/with space.jpg").unwrap();
        assert_eq!(id, 0xff);
        assert_eq!(dims, Some((1920, 1080)));
        assert_eq!(path, "/with space.jpg");
    }

    #[test]
    fn test_parse_add_line_rejects_garbage() {
        assert!(parse_add_line("no-colon-here").is_err());
        assert!(parse_add_line("zz qq:/x.png").is_err());
        assert!(parse_add_line("1 640:/x.png").is_err());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("ff").unwrap(), 255);
        assert_eq!(parse_hex_id("0x10").unwrap(), 16);
        assert!(parse_hex_id("not-hex").is_err());
    }
}

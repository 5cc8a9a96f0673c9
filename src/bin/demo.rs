//! ShardKV Demo Binary
//!
//! Runs an in-process cluster: every rank writes its slice of the key space,
//! reads back a strided share of all keys, and checkpoints. A second cluster
//! with a possibly different rank count then restarts from the checkpoint
//! and verifies every key again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::{Parser, ValueEnum};
use shardkv::{
    Config, Consistency, Context, Db, Level, Lookup, MemFabric, OpenOptions, Result, ShardError, Transport,
};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Sequential,
    Relaxed,
}

impl From<Mode> for Consistency {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sequential => Consistency::Sequential,
            Mode::Relaxed => Consistency::Relaxed,
        }
    }
}

/// ShardKV checkpoint/restart demo
#[derive(Parser, Debug)]
#[command(name = "shardkv-demo")]
#[command(about = "Checkpoint and restart a partitioned key-value store across in-process ranks")]
#[command(version)]
struct Args {
    /// Working directory (repositories and checkpoint)
    #[arg(short, long, default_value = "./shardkv_demo")]
    dir: PathBuf,

    /// Ranks writing the checkpoint
    #[arg(short, long, default_value = "4")]
    ranks: usize,

    /// Ranks restarting from the checkpoint
    #[arg(long, default_value = "3")]
    restart_ranks: usize,

    /// Keys written per rank
    #[arg(short, long, default_value = "1000")]
    keys: usize,

    /// Value size in bytes
    #[arg(long, default_value = "64")]
    value_size: usize,

    /// MemTable size limit in KB before freeze
    #[arg(short = 'm', long, default_value = "64")]
    memtable_kb: usize,

    /// Consistency mode for remote writes
    #[arg(short, long, value_enum, default_value = "relaxed")]
    consistency: Mode,
}

const DB_NAME: &str = "demo";

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("ShardKV demo v{}", shardkv::VERSION);
    tracing::info!("Working directory: {}", args.dir.display());

    let checkpoint = args.dir.join("checkpoint");
    let total = args.ranks * args.keys;

    let written = run_cluster(&args, args.ranks, "run", |ctx| write_phase(ctx, &args, &checkpoint));
    if let Err(e) = written {
        tracing::error!("Checkpoint run failed: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Checkpointed {} keys from {} ranks", total, args.ranks);

    let verified = run_cluster(&args, args.restart_ranks, "restart", |ctx| {
        restart_phase(ctx, &args, &checkpoint, total)
    });
    match verified {
        Ok(()) => tracing::info!("Restarted on {} ranks, all {} keys verified", args.restart_ranks, total),
        Err(e) => {
            tracing::error!("Restart run failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn config(args: &Args, repository: PathBuf) -> Config {
    Config::builder()
        .repository(repository)
        .memtable_size(args.memtable_kb * 1024)
        .consistency(args.consistency.into())
        .build()
}

/// Run `body` on `ranks` threads connected by one fabric
fn run_cluster<F>(args: &Args, ranks: usize, label: &str, body: F) -> Result<()>
where
    F: Fn(&Context) -> Result<()> + Sync,
{
    let repository = args.dir.join(label);
    let endpoints = MemFabric::new(ranks);
    let body = &body;

    thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let config = config(args, repository.clone());
                scope.spawn(move || -> Result<()> {
                    let transport: Arc<dyn Transport> = endpoint;
                    let ctx = Context::start(config, transport)?;
                    body(&ctx)?;
                    ctx.shutdown()
                })
            })
            .collect();

        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_| ShardError::Storage("rank thread panicked".to_string()))?
        })
    })
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:08}", i).into_bytes()
}

fn value(i: usize, size: usize) -> Vec<u8> {
    let mut v = format!("value-{}-", i).into_bytes();
    v.resize(size.max(v.len()), b'x');
    v
}

fn write_phase(ctx: &Context, args: &Args, checkpoint: &Path) -> Result<()> {
    let db = ctx.open(DB_NAME, OpenOptions::new().value_len(args.value_size))?;

    let start = ctx.rank() * args.keys;
    for i in start..start + args.keys {
        db.put(&key(i), &value(i, args.value_size))?;
    }
    db.barrier(Level::MemTable)?;
    verify(ctx, &db, ctx.size() * args.keys, args.value_size)?;

    db.checkpoint(checkpoint, false)?;
    tracing::info!(
        rank = ctx.rank(),
        generations = db.sstable_generation(),
        freezes = db.freezes(),
        migrations = db.migrations(),
        "rank checkpointed"
    );
    Ok(())
}

fn restart_phase(ctx: &Context, args: &Args, checkpoint: &Path, total: usize) -> Result<()> {
    let options = OpenOptions::new().value_len(args.value_size);
    let (db, _) = ctx.restart(checkpoint, DB_NAME, options, false)?;
    verify(ctx, &db, total, args.value_size)
}

/// Every rank reads the keys congruent to its rank
fn verify(ctx: &Context, db: &Db, total: usize, value_size: usize) -> Result<()> {
    for i in (ctx.rank()..total).step_by(ctx.size()) {
        match db.get(&key(i))? {
            Lookup::Found(v) if v == value(i, value_size) => {}
            other => {
                return Err(ShardError::Storage(format!(
                    "key {} read back as {:?}",
                    i,
                    other.into_value().map(|v| v.len())
                )))
            }
        }
    }
    Ok(())
}

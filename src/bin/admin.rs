use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embedstream::checkpoint::{CheckpointStore, FileCheckpoint};
use embedstream::config::{LogArgs, StoreArgs};
use embedstream::stream::StreamInfo;
use embedstream::{telemetry, DeadLetter, StreamId, StreamStore};

#[derive(Parser, Debug)]
#[command(
    name = "embedstream-admin",
    about = "Inspects and repairs pipeline streams and consumer groups"
)]
struct AdminCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Length, id range and group progress of one stream or all of them
    Info {
        /// Stream to describe (every stream when omitted)
        stream: Option<String>,
    },
    /// Pending entries of a group, oldest first
    Pending {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },
    /// Moves idle pending entries to another consumer
    Claim {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
        /// New owner
        consumer: String,
        /// Minimum idle time of the entries to move
        #[arg(long, default_value_t = 60_000)]
        min_idle_ms: u64,
        /// Claim every pending entry instead of the listed ids
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Entry ids (`<ms>-<seq>`)
        ids: Vec<StreamId>,
    },
    /// Recreates a group at cursor zero so every stored entry is delivered again
    Replay {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },
    /// Removes the oldest fully processed entries beyond `max_len`
    Trim {
        /// Stream name
        stream: String,
        /// Entries to keep
        #[arg(long)]
        max_len: u64,
    },
    /// Lists records of a dead-letter stream
    DeadLetters {
        /// Dead-letter stream name
        stream: String,
        /// Records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Forgets the producer checkpoint; the next producer run starts from its
    /// initial position
    ResetCheckpoint {
        /// Producer checkpoint file
        #[arg(
            long,
            env = "EMBEDSTREAM_CHECKPOINT",
            default_value = "producer.checkpoint"
        )]
        checkpoint: PathBuf,
    },
}

fn print_info(info: &StreamInfo) {
    let id = |id: Option<StreamId>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
    println!(
        "{}: length {} added {} first {} last {}",
        info.name,
        info.length,
        info.entries_added,
        id(info.first_id),
        id(info.last_id)
    );
    for group in &info.groups {
        println!(
            "  group {} cursor {} pending {} undelivered {} lag {}",
            group.name,
            group.cursor,
            group.pending,
            group.undelivered,
            group.lag()
        );
    }
}

fn execute(store: &StreamStore, command: Command) -> Result<()> {
    match command {
        Command::Info { stream } => {
            let names = match stream {
                Some(name) => vec![name],
                None => store.stream_names()?,
            };
            for name in names {
                print_info(&store.stream(name).info()?);
            }
        }
        Command::Pending { stream, group } => {
            let now_ms = store.now_ms();
            let pending = store.stream(stream).pending(&group)?;
            if pending.is_empty() {
                println!("no pending entries");
            }
            for entry in pending {
                println!(
                    "{} consumer {} idle {}ms deliveries {}",
                    entry.id,
                    entry.consumer,
                    entry.idle_ms(now_ms),
                    entry.delivery_count
                );
            }
        }
        Command::Claim {
            stream,
            group,
            consumer,
            min_idle_ms,
            all,
            ids,
        } => {
            let stream = store.stream(stream);
            let ids = if all {
                stream.pending(&group)?.into_iter().map(|entry| entry.id).collect()
            } else {
                ids
            };
            anyhow::ensure!(!ids.is_empty(), "pass entry ids or --all");
            let claimed =
                stream.claim(&group, &consumer, Duration::from_millis(min_idle_ms), &ids)?;
            for delivery in &claimed {
                println!("{} deliveries {}", delivery.id(), delivery.delivery_count);
            }
            println!("claimed {} of {} entries for {consumer}", claimed.len(), ids.len());
        }
        Command::Replay { stream, group } => {
            let stream = store.stream(stream);
            stream.recreate_group(&group)?;
            println!(
                "group {group} on {} will redeliver {} entries",
                stream.name(),
                stream.len()?
            );
        }
        Command::Trim { stream, max_len } => {
            let stream = store.stream(stream);
            let removed = stream.trim(max_len)?;
            println!("removed {removed} entries, {} remain", stream.len()?);
        }
        Command::DeadLetters { stream, limit } => {
            let entries = store.stream(stream).range(StreamId::ZERO, limit)?;
            if entries.is_empty() {
                println!("no dead letters");
            }
            for entry in entries {
                match entry.decode::<DeadLetter>() {
                    Ok(record) => println!(
                        "{} from {}/{} entry {} after {} deliveries: {}",
                        entry.id,
                        record.source_stream,
                        record.group,
                        record
                            .stream_id
                            .map_or_else(|| "-".to_string(), |id| id.to_string()),
                        record.delivery_count,
                        record.reason
                    ),
                    Err(_) => println!("{} (unreadable) {}", entry.id, entry.body),
                }
            }
        }
        Command::ResetCheckpoint { checkpoint } => {
            let file = FileCheckpoint::new(&checkpoint);
            match file.load()? {
                Some(position) => println!("forgetting resume position {position}"),
                None => println!("no checkpoint at {}", checkpoint.display()),
            }
            file.clear()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = AdminCli::parse();
    telemetry::init(&cli.log.log_level);
    let store = cli.store.open()?;
    let result = execute(&store, cli.command).context("admin command failed");
    store.close();
    result
}

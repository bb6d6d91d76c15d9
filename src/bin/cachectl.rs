//! Cache inspection and maintenance tool

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use blockcache::{Backend, Config, Enumerator};

#[derive(Parser)]
#[command(name = "cachectl", version, about = "Inspect and maintain a blockcache directory")]
struct Cli {
    /// Cache directory
    #[arg(short, long, default_value = "./blockcache_data")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print cache-wide counters
    Stats,
    /// Verify the index, every entry and the recency lists
    Check,
    /// List entries, newest first
    List {
        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Doom one entry by key
    Doom { key: String },
    /// Doom every entry
    Wipe,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> blockcache::Result<()> {
    let read_only = matches!(cli.command, Command::Stats | Command::Check | Command::List { .. });
    let cache = Backend::open(
        Config::builder()
            .cache_dir(&cli.dir)
            .read_only(read_only)
            .restart_on_failure(false)
            .build(),
    )?;

    match cli.command {
        Command::Stats => {
            let stats = cache.stats();
            println!("entries:      {}", stats.entry_count);
            println!("used bytes:   {}", stats.used_bytes);
            println!("max bytes:    {}", stats.max_bytes);
            println!("fullness:     {}/10", cache.size_group());
            println!("open handles: {}", stats.open_handles);
            println!(
                "lists:        no-use {} / low-use {} / high-use {}",
                stats.list_lengths[0], stats.list_lengths[1], stats.list_lengths[2]
            );
        }
        Command::Check => {
            let dirty = cache.self_check()?;
            if dirty == 0 {
                println!("ok");
            } else {
                println!("ok ({dirty} entries left dirty by an older session)");
            }
        }
        Command::List { limit } => {
            let mut iter = Enumerator::default();
            let mut shown = 0usize;
            while let Some(entry) = cache.open_next_entry(&mut iter)? {
                let sizes: Vec<u32> = (0..3).map(|s| entry.data_size(s)).collect();
                println!(
                    "{:>12}  {:?}  {}",
                    entry.last_used(),
                    sizes,
                    entry.key()?
                );
                shown += 1;
                if limit.is_some_and(|l| shown >= l) {
                    break;
                }
            }
            println!("{shown} entries");
        }
        Command::Doom { key } => {
            cache.doom_entry(&key)?;
            println!("doomed {key}");
        }
        Command::Wipe => {
            let before = cache.entry_count();
            cache.doom_all_entries()?;
            println!("doomed {before} entries");
        }
    }
    Ok(())
}

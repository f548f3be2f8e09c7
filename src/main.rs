use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sav_codec::interchange::{read_json_file, write_json_file};
use sav_codec::{find_save_files, read_save_file, verify_bytes, write_save_file, ParsedSave, Result, SavError, ToolConfig};

#[derive(Parser)]
#[command(name = "sav-codec", about = "Inspect, convert and resave factory game .sav files")]
struct Cli {
    /// JSON tool configuration (read/write options, thread count)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print header fields and per-level object counts
    Info {
        save: PathBuf,
    },
    /// Convert a save to its JSON interchange form
    ToJson {
        save: PathBuf,
        json: PathBuf,
    },
    /// Build a save from its JSON interchange form
    FromJson {
        json: PathBuf,
        save: PathBuf,
    },
    /// Decode and re-encode a save
    Resave {
        input: PathBuf,
        output: PathBuf,
        /// Advance the save time by one second so the game lists it as newest
        #[arg(long)]
        bump_time: bool,
    },
    /// Round-trip every .sav below a directory
    Verify {
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match cli.config.as_deref().map(ToolConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("bad config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Command::Info { save } => info_command(&save, &config),
        Command::ToJson { save, json } => read_save_file(&save, &config.read)
            .and_then(|parsed| write_json_file(&json, &parsed)),
        Command::FromJson { json, save } => {
            read_json_file(&json).and_then(|parsed| write_save_file(&save, &parsed, &config.write))
        }
        Command::Resave {
            input,
            output,
            bump_time,
        } => {
            let mut write = config.write.clone();
            if bump_time {
                write.bump_save_time_seconds = Some(write.bump_save_time_seconds.unwrap_or(1));
            }
            read_save_file(&input, &config.read).and_then(|parsed| write_save_file(&output, &parsed, &write))
        }
        Command::Verify { dir } => return verify_command(&dir, &config),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn info_command(path: &Path, config: &ToolConfig) -> Result<()> {
    let save = read_save_file(path, &config.read)?;
    print_info(&save);
    Ok(())
}

fn print_info(save: &ParsedSave) {
    let h = &save.header;
    println!("Session:        {}", h.session_name);
    println!("Map:            {} {}", h.map_name, h.map_options);
    println!(
        "Versions:       header {} / save {} / build {}",
        h.header_version, h.save_version, h.build_version
    );
    match h.saved_at() {
        Some(when) => println!("Saved at:       {when}"),
        None => println!("Saved at:       ticks {}", h.save_date_time),
    }
    println!("Play time:      {}s", h.play_duration_seconds);
    println!("Chunk size:     {}", save.max_chunk_size);
    println!("Grids:          {}", save.grids.len());
    for level in save.levels() {
        println!(
            "  {:<40} {:>7} objects {:>5} destroyed",
            level.display_name(),
            level.objects.len(),
            level.destroyed.len()
        );
    }
    println!("Objects:        {}", save.object_count());
}

fn verify_command(dir: &Path, config: &ToolConfig) -> ExitCode {
    let files = find_save_files(dir);
    if files.is_empty() {
        warn!("no .sav files under {}", dir.display());
        return ExitCode::SUCCESS;
    }
    info!("verifying {} saves", files.len());

    let run = || {
        files
            .par_iter()
            .map(|path| {
                let outcome = fs::read(path)
                    .map_err(SavError::from)
                    .and_then(|bytes| verify_bytes(&bytes, &config.read));
                match &outcome {
                    Ok(objects) => info!("ok   {} ({objects} objects)", path.display()),
                    Err(e) => error!("FAIL {}: {e}", path.display()),
                }
                outcome.is_ok()
            })
            .filter(|ok| !ok)
            .count()
    };
    let failed = match config.threads {
        Some(threads) => match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(run),
            Err(e) => {
                warn!("falling back to the global pool: {e}");
                run()
            }
        },
        None => run(),
    };

    if failed > 0 {
        error!("{failed} of {} saves failed", files.len());
        ExitCode::FAILURE
    } else {
        info!("all {} saves round-trip", files.len());
        ExitCode::SUCCESS
    }
}

pub mod actions;
pub mod allocator;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod itdb;
pub mod logging;
pub mod metadata;
pub mod models;
pub mod mount;
pub mod sync;
pub mod track_builder;

use clap::{Parser, Subcommand};
use commands::{AppState, ResetTarget, SyncRequest, EXIT_FAILURE};
use config::SyncConfig;
use models::MediaType;
use std::path::PathBuf;
use tracing::{debug, error};

/// Copy a music folder onto an iPod and index it in the device database.
#[derive(Parser)]
#[command(name = "podsync", version)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true, env = "PODSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Show debug output on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty database on the device.
    Init {
        /// Device root, or `auto`.
        mount: String,
        #[arg(long, default_value = "iPod")]
        name: String,
    },
    /// Sync every supported file under a directory.
    Sync {
        mount: String,
        dir: PathBuf,
        /// Treat every file as this media type.
        #[arg(long)]
        mediatype: Option<MediaType>,
    },
    /// Sync one file.
    SyncFile {
        mount: String,
        file: PathBuf,
        #[arg(long)]
        mediatype: Option<MediaType>,
    },
    /// Sync a directory with every file typed as the given media type.
    SyncFolderFiltered {
        mount: String,
        dir: PathBuf,
        media_type: MediaType,
    },
    /// List playlists and tracks.
    List {
        mount: String,
        #[arg(long)]
        json: bool,
    },
    /// Show device and library statistics.
    Info { mount: String },
    /// Remove all tracks of one media type, or everything with `all`.
    Reset {
        mount: String,
        target: ResetTarget,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Replace the database with its backup copy.
    RestoreBackup { mount: String },
    /// Delete the database backup.
    CleanBackup { mount: String },
}

fn dispatch(state: &AppState, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Init { mount, name } => commands::init(state, &mount, &name),
        Commands::Sync {
            mount,
            dir,
            mediatype,
        } => commands::sync(
            state,
            &mount,
            SyncRequest::Tree {
                dir,
                media_type: mediatype,
            },
        ),
        Commands::SyncFile {
            mount,
            file,
            mediatype,
        } => commands::sync(
            state,
            &mount,
            SyncRequest::File {
                path: file,
                media_type: mediatype,
            },
        ),
        Commands::SyncFolderFiltered {
            mount,
            dir,
            media_type,
        } => commands::sync(state, &mount, SyncRequest::Filtered { dir, media_type }),
        Commands::List { mount, json } => commands::list(state, &mount, json),
        Commands::Info { mount } => commands::info(state, &mount),
        Commands::Reset { mount, target, yes } => commands::reset(state, &mount, target, yes),
        Commands::RestoreBackup { mount } => commands::restore_backup(&mount),
        Commands::CleanBackup { mount } => commands::clean_backup(state, &mount),
    }
}

/// Parses the command line, runs one command and returns the process exit
/// code.
pub fn run() -> i32 {
    let cli = Cli::parse();

    let config = match SyncConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return EXIT_FAILURE;
        }
    };

    match logging::init_logging(&config, cli.verbose) {
        Ok(Some(path)) => debug!("Logging to {}", path.display()),
        Ok(None) => {}
        Err(e) => eprintln!("Warning: {:#}", e),
    }

    let state = AppState::new(config);
    match dispatch(&state, cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}

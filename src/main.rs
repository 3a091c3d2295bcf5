//! DAM Client Cache CLI
//!
//! Entry point for the `dam-cache` command-line tool.

use clap::{Parser, Subcommand};
use dam_client_cache::config::ServerConfig;
use dam_client_cache::exchange::ExchangeContext;
use dam_client_cache::search::{self, GrepMatch};
use dam_client_cache::{logging, server};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "dam-cache")]
#[command(about = "Changeset cache for disconnected DAM editors", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Path to config file (default: dam-cache.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Override the bind address
        #[arg(long, short = 'l')]
        listen: Option<String>,

        /// Write diagnostics to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Register unlinked folders and create their trees
    AddFolder {
        /// Folder keys to add to the pool
        #[arg(required = true)]
        folders: Vec<String>,

        /// Path to config file (default: dam-cache.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Index template ids found in the mirror tree
    Bulkmap {
        /// Path to config file (default: dam-cache.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Mirror root (default: mirror_path from config)
        #[arg(long, short = 'm')]
        mirror: Option<PathBuf>,
    },

    /// Find files by name inside a changeset
    Find {
        /// Folder key
        folder: String,

        /// Glob matched against file names, or relative paths if it has a '/'
        glob: String,

        /// Path to config file (default: dam-cache.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Search file contents inside a changeset
    Grep {
        /// Folder key
        folder: String,

        /// Regular expression
        regex: String,

        /// Path to config file (default: dam-cache.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            log_file,
        } => {
            run_serve(config, listen, log_file);
        }
        Commands::AddFolder { folders, config } => {
            run_add_folder(&folders, config);
        }
        Commands::Bulkmap { config, mirror } => {
            run_bulkmap(config, mirror);
        }
        Commands::Find {
            folder,
            glob,
            config,
            json,
        } => {
            run_find(&folder, &glob, config, json);
        }
        Commands::Grep {
            folder,
            regex,
            config,
            json,
        } => {
            run_grep(&folder, &regex, config, json);
        }
    }
}

fn load_config(config_path: Option<PathBuf>) -> ServerConfig {
    match ServerConfig::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    }
}

fn open_context(config: ServerConfig) -> ExchangeContext {
    match ExchangeContext::open(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error opening ledger: {}", e);
            process::exit(1);
        }
    }
}

fn changeset_root(config: &ServerConfig, folder: &str) -> PathBuf {
    let ctx = open_context(config.clone());
    match ctx.paths().changeset_root(folder) {
        Ok(root) if root.is_dir() => root,
        Ok(root) => {
            eprintln!("No changeset tree at {}", root.display());
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Invalid folder: {}", e);
            process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}

fn run_serve(config_path: Option<PathBuf>, listen: Option<String>, log_file: Option<PathBuf>) {
    let mut config = load_config(config_path);
    if let Some(listen) = listen {
        config.listen = listen;
    }

    if let Err(e) = logging::init(config.debug_logging, log_file.as_deref()) {
        eprintln!("Error opening log file: {}", e);
        process::exit(1);
    }

    let ctx = Arc::new(open_context(config));
    info!(
        changesets = %ctx.config().changeset_path.display(),
        ledger = %ctx.config().database_path.display(),
        "starting dam-cache"
    );

    match ctx.recover_uploads() {
        Ok(cleared) if !cleared.is_empty() => {
            info!(folders = ?cleared, "stale uploads cleared");
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error clearing stale uploads: {}", e);
            process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::serve(ctx)) {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}

fn run_add_folder(folders: &[String], config_path: Option<PathBuf>) {
    let ctx = open_context(load_config(config_path));

    let mut failed = false;
    for folder in folders {
        match ctx.register_folder(folder) {
            Ok(true) => println!("Added {}", folder),
            Ok(false) => println!("Already registered: {}", folder),
            Err(e) => {
                eprintln!("Error adding {}: {}", folder, e);
                failed = true;
            }
        }
    }

    if failed {
        process::exit(1);
    }
}

fn run_bulkmap(config_path: Option<PathBuf>, mirror: Option<PathBuf>) {
    let config = load_config(config_path);
    let Some(mirror) = mirror.or_else(|| config.mirror_path.clone()) else {
        eprintln!("No mirror path: pass --mirror or set mirror_path");
        process::exit(1);
    };

    let ctx = open_context(config);
    match search::index_mirror(ctx.ledger(), &mirror) {
        Ok(report) => {
            println!("Mirror: {}", mirror.display());
            println!("  Scanned: {}", report.scanned);
            println!("  Mapped:  {}", report.mapped);
            println!("  Skipped: {}", report.skipped);
        }
        Err(e) => {
            eprintln!("Error indexing mirror: {}", e);
            process::exit(1);
        }
    }
}

fn run_find(folder: &str, glob: &str, config_path: Option<PathBuf>, json_output: bool) {
    let config = load_config(config_path);
    let root = changeset_root(&config, folder);

    let found = match search::find_by_name(&root, glob) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("Search error: {}", e);
            process::exit(1);
        }
    };

    if json_output {
        print_json(&found);
    } else {
        for path in &found {
            println!("{}", path);
        }
    }
}

fn run_grep(folder: &str, regex: &str, config_path: Option<PathBuf>, json_output: bool) {
    let config = load_config(config_path);
    let root = changeset_root(&config, folder);

    let matches: Vec<GrepMatch> = match search::grep_tree(&root, regex) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("Search error: {}", e);
            process::exit(1);
        }
    };

    if json_output {
        print_json(&matches);
    } else {
        for m in &matches {
            println!("{}:{}: {}", m.path, m.line, m.text);
        }
    }
}

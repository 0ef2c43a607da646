//! Oidstore CLI - inspect and maintain object graph stores

use clap::{Parser, Subcommand};
use oidstore::config::{self, OidstoreConfig};
use oidstore::ui::{self, Icons};
use oidstore::{LoadTarget, Oid, Registry, RegistryOptions, TypeRegistry};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "oidstore")]
#[command(version = "0.1.0")]
#[command(about = "Identity-preserving object graph store - inspect roots, stats and garbage")]
#[command(long_about = r#"
Oidstore persists in-memory object graphs into a SQLite file and loads
them back with shared references and cycles intact.

Example usage:
  oidstore init --database ./data/store.db
  oidstore roots
  oidstore show doc --depth 2
  oidstore show @1004 --json
  oidstore gc
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress status output (tables and data are still printed)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create an empty store
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,

        /// Identifier recorded in the store metadata
        #[arg(long)]
        dbid: Option<String>,
    },

    /// List named roots
    Roots,

    /// Show row counts
    Stats,

    /// Load and print a root name or an oid (`@1004`)
    Show {
        target: String,

        /// Levels to load eagerly; -1 loads everything reachable
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        depth: i32,

        /// Print JSON instead of a repr
        #[arg(long)]
        json: bool,
    },

    /// Remove a root name (its rows go at the next gc)
    Unroot { name: String },

    /// Collect garbage unreachable from the roots
    Gc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.quiet {
        oidstore::output::set_quiet();
    }

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let loaded = config::load_config(cli.config.as_deref())?;
    let mut settings = loaded.unwrap_or_default();
    if let Some(database) = &cli.database {
        settings.database = database.clone();
    }

    match cli.command {
        Commands::Init { force, dbid } => {
            let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
            if dbid.is_some() {
                settings.dbid = dbid;
            }
            config::write_config(&config_path, &settings, force)?;
            let registry = open(&settings)?;
            registry.commit()?;
            registry.close()?;

            ui::success("Store initialized");
            ui::status(Icons::GEAR, "Config", &config_path.display().to_string());
            ui::status(Icons::DATABASE, "Database", &settings.database.display().to_string());
        }

        Commands::Roots => {
            let registry = open(&settings)?;
            let roots = registry.roots()?;
            if roots.is_empty() {
                ui::info("Roots", "none");
            } else if oidstore::output::is_quiet() {
                for (name, oid) in &roots {
                    ui::root_line(name, &oid.to_string());
                }
            } else {
                println!("{}", ui::roots_table(&roots));
            }
            registry.close()?;
        }

        Commands::Stats => {
            let registry = open(&settings)?;
            let stats = registry.stats()?;
            ui::header(&format!("Oidstore Statistics ({})", settings.database.display()));
            println!("{}", ui::stats_table(&stats));
            registry.close()?;
        }

        Commands::Show { target, depth, json } => {
            let registry = open(&settings)?;
            let target = match target.parse::<Oid>() {
                Ok(oid) => LoadTarget::Oid(oid),
                Err(_) => LoadTarget::Name(target),
            };
            let value = registry.load_depth(target, depth)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&value.to_json())?);
            } else {
                println!("{}", value.repr()?);
            }
            registry.close()?;
        }

        Commands::Unroot { name } => {
            let registry = open(&settings)?;
            if registry.remove_root(&name)? {
                registry.commit()?;
                ui::status(Icons::DEL, "Removed root", &name);
            } else {
                ui::warn(&format!("No root named '{}'", name));
            }
            registry.close()?;
        }

        Commands::Gc => {
            let registry = open(&settings)?;
            ui::section("Garbage collection");
            let report = registry.gc_collect()?;
            ui::summary_row("Marked:", &report.marked.to_string());
            ui::summary_row("Reclaimed:", &report.reclaimed.to_string());
            registry.close()?;
        }
    }

    Ok(())
}

/// Open the configured store; unknown object types load as generic instances
fn open(settings: &OidstoreConfig) -> anyhow::Result<Registry> {
    config::ensure_db_dir(&settings.database)?;
    let types = TypeRegistry::builder().instance_fallback(true).build();
    let options = RegistryOptions::from_config(settings).with_types(types);
    Ok(Registry::open_with(options)?)
}

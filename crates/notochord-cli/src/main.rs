//! Notochord command-line launcher.
//!
//! Thin wrapper over `notochord-core` for inspecting and seeding a store
//! from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use notochord_core::{FeatureStore, IdQuery, MatrixLayout, StoreConfig, WidgetRole};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "notochord")]
#[command(about = "Feature store for machine-learning pipelines")]
struct Args {
    /// Store database file
    #[arg(long, default_value = "notochord.db")]
    db: PathBuf,

    /// JSON file with store tunables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and its schema
    Init,

    /// Print feature ids for names in a feature set, creating missing ones
    Resolve {
        /// Feature set name
        feature_set: String,
        names: Vec<String>,
    },

    /// Add datasource indicator features for every widget
    Indicators,

    /// Stream a model's selected widgets as matrix chunks
    Stream {
        model: i64,
        #[arg(long, value_enum, default_value = "train")]
        role: RoleArg,
        /// Widgets per chunk; omit for a single chunk
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        sparse: bool,
        /// Print every row instead of a per-chunk summary
        #[arg(long)]
        rows: bool,
        /// Select every widget for the role before streaming
        #[arg(long)]
        all: bool,
    },

    /// Record or show a model metric
    Metric {
        model: i64,
        name: String,
        /// Value to store; omit to print the current value
        value: Option<f64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Train,
    Predict,
    Validate,
}

impl From<RoleArg> for WidgetRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Train => WidgetRole::TrainedOn,
            RoleArg::Predict => WidgetRole::PredictsOn,
            RoleArg::Validate => WidgetRole::ValidatedOn,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let store = FeatureStore::open_with_config(&args.db, config)
        .with_context(|| format!("Failed to open store {}", args.db.display()))?;

    match args.command {
        Command::Init => {
            info!("Store ready at {}", args.db.display());
        }
        Command::Resolve { feature_set, names } => {
            if names.is_empty() {
                bail!("no feature names given");
            }
            let namespace = store.widgets().ensure_feature_set(&feature_set, None)?;
            let ids = store.resolve(namespace, names.as_slice())?;
            for (name, id) in names.iter().zip(ids) {
                println!("{}\t{}", id, name);
            }
        }
        Command::Indicators => {
            let added = store.datasource_indicator()?;
            println!("{}", added);
        }
        Command::Stream {
            model,
            role,
            batch_size,
            sparse,
            rows,
            all,
        } => {
            let role = WidgetRole::from(role);
            if all {
                let added = store
                    .selection()
                    .assign(model, role, &IdQuery::all_widgets())?;
                info!("Selected {} more widgets as {}", added, role);
            }

            let layout = if sparse {
                MatrixLayout::Sparse
            } else {
                MatrixLayout::Dense
            };
            let stream = store
                .reader()
                .stream(model, role, batch_size, layout, false)?;
            let columns = stream.columns().to_vec();
            println!("columns\t{}", serde_json::to_string(&columns)?);

            for (index, chunk) in stream.enumerate() {
                let chunk = chunk?;
                let (nrows, ncols) = chunk.matrix.shape();
                println!("chunk {}\t{}x{}", index, nrows, ncols);
                if rows {
                    let dense = chunk.matrix.to_dense();
                    for (widget, row) in chunk.widget_ids.iter().zip(dense.rows()) {
                        println!("{}\t{}", widget, serde_json::to_string(&row.to_vec())?);
                    }
                }
            }
        }
        Command::Metric { model, name, value } => {
            let models = store.models();
            match value {
                Some(value) => {
                    models.set_metric(model, &name, value)?;
                    info!("Recorded {}={} for model {}", name, value, model);
                }
                None => match models.get_metric(model, &name)? {
                    Some(value) => println!("{}", value),
                    None => println!("-"),
                },
            }
        }
    }

    Ok(())
}

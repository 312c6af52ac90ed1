use clap::Parser;

/// TokMesh - distributed session and token service
///
/// Runs a single node: the session/token/auth services plus the cluster
/// layer (consensus state machine, discovery, shard rebalancing).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Optional TOML config file, merged under TOKMESH_* env vars
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

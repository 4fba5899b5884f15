pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use revbridge_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};
use revbridge_core::domain::hierarchy::{NodeId, ViewName};
use revbridge_core::pvm::leaf::CrossTermPolicy;
use revbridge_core::pvm::SubtreeFilter;

#[derive(Debug, Parser)]
#[command(
    name = "revbridge",
    about = "Price-volume-mix revenue attribution",
    long_about = "Decompose period-over-period revenue change into price, volume, and mix effects across hierarchy views.",
    after_help = "Examples:\n  revbridge attribute --input run.json\n  revbridge bridge --input run.json --view by_product --node TOTAL\n  revbridge check --input run.json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a revbridge.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Decompose every node of every view and print the report as JSON")]
    Attribute {
        #[arg(long, help = "JSON attribution request")]
        input: PathBuf,
        #[arg(long, requires = "node", help = "Restrict the run to one view")]
        view: Option<String>,
        #[arg(long, requires = "view", help = "Restrict the run to the subtree under this node")]
        node: Option<String>,
        #[arg(long, value_parser = parse_policy, help = "Cross-term attribution: price|volume")]
        cross_term: Option<CrossTermPolicy>,
        #[arg(long, help = "Run on a single thread")]
        sequential: bool,
        #[arg(long, help = "Skip the consistency validator")]
        no_verify: bool,
    },
    #[command(about = "Print the baseline-to-current revenue bridge for one node")]
    Bridge {
        #[arg(long, help = "JSON attribution request")]
        input: PathBuf,
        #[arg(long)]
        view: String,
        #[arg(long)]
        node: String,
    },
    #[command(about = "Validate hierarchy structure for every view without computing effects")]
    Check {
        #[arg(long, help = "JSON attribution request")]
        input: PathBuf,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
}

fn parse_policy(value: &str) -> Result<CrossTermPolicy, String> {
    value.parse()
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.config.clone());

    let load = |overrides: ConfigOverrides| LoadOptions {
        config_path: cli.config.clone(),
        require_file: cli.config.is_some(),
        overrides,
    };

    let result = match cli.command {
        Command::Attribute { ref input, ref view, ref node, cross_term, sequential, no_verify } => {
            let filter = match (view, node) {
                (Some(view), Some(node)) => {
                    Some(SubtreeFilter { view: ViewName::new(view), node: NodeId::new(node) })
                }
                _ => None,
            };
            let overrides = ConfigOverrides {
                cross_term_policy: cross_term,
                parallel: sequential.then_some(false),
                verify_consistency: no_verify.then_some(false),
                ..ConfigOverrides::default()
            };
            commands::attribute::run(input, filter, load(overrides))
        }
        Command::Bridge { ref input, ref view, ref node } => {
            let filter = SubtreeFilter { view: ViewName::new(view), node: NodeId::new(node) };
            commands::bridge::run(input, filter, load(ConfigOverrides::default()))
        }
        Command::Check { ref input } => commands::check::run(input),
        Command::Config => commands::config::run(load(ConfigOverrides::default())),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

// Logs go to stderr so stdout stays machine-readable. A config error here falls back to
// defaults and is reported again by the command itself.
fn init_logging(config_path: Option<PathBuf>) {
    use tracing::Level;

    let config = AppConfig::load(LoadOptions { config_path, ..LoadOptions::default() })
        .unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

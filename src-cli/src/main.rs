use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use plandent_core::{Config, ExtractionMode, PromptVariant};
use plandent_lib::cli::{self, ExtractOptions, ReplayOptions, RunOptions};
use plandent_lib::CliResult;

#[derive(Parser, Debug)]
#[command(name = "plandent")]
#[command(about = "Extract dental treatment plans from quotes with a generative model")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract a plan from a quote (PDF, image or text)
    Extract {
        file: PathBuf,
        /// Single request instead of a streamed response
        #[arg(long)]
        complete: bool,
        /// Retries for transient failures
        #[arg(long, default_value_t = 2)]
        retries: u32,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Stream a recorded model response through a session
    Replay {
        file: PathBuf,
        /// Bytes per replayed chunk
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Pretend the model hit its output limit
        #[arg(long)]
        truncated: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Reconcile a saved model output into a plan
    Reconcile {
        file: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show a saved plan
    Show { id: String },
    /// List saved plans
    List,
    /// Print an extraction prompt
    Prompt {
        #[arg(value_enum, default_value_t = VariantArg::Legacy)]
        variant: VariantArg,
        /// Print the output schema instead
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = VariantArg::Legacy)]
    variant: VariantArg,
    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Save the reconciled plan
    #[arg(long)]
    save: bool,
    #[arg(long)]
    doctor: Option<String>,
    #[arg(long)]
    title: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VariantArg {
    Legacy,
    Tasks,
}

impl From<VariantArg> for PromptVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Legacy => PromptVariant::Legacy,
            VariantArg::Tasks => PromptVariant::TaskBased,
        }
    }
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            variant: args.variant.into(),
            timeout: args.timeout.map(Duration::from_secs),
            save: args.save,
            doctor_id: args.doctor,
            title: args.title,
        }
    }
}

async fn dispatch(config: &Config, command: Command) -> CliResult<()> {
    match command {
        Command::Extract {
            file,
            complete,
            retries,
            run,
        } => {
            let mode = if complete {
                ExtractionMode::Complete
            } else {
                ExtractionMode::Streaming
            };
            let options = ExtractOptions {
                file,
                mode,
                retries,
                run: run.into(),
            };
            cli::extract(config, options).await
        }
        Command::Replay {
            file,
            chunk_size,
            truncated,
            run,
        } => {
            let options = ReplayOptions {
                file,
                chunk_size,
                truncated,
                run: run.into(),
            };
            cli::replay(config, options).await
        }
        Command::Reconcile { file, run } => cli::reconcile_file(config, &file, &run.into()).await,
        Command::Show { id } => cli::show(config, &id).await,
        Command::List => cli::list(config).await,
        Command::Prompt { variant, schema } => cli::prompt(variant.into(), schema),
    }
}

fn main() {
    let args = Cli::parse();

    if args.verbose {
        plandent_lib::init_logging(&["plandent=debug", "plandent_core=debug"]);
    } else {
        plandent_lib::init_logging(&["plandent=info", "plandent_core=info"]);
    }

    let config = Config::load_or_default();
    if let Err(e) = config.ensure_dirs() {
        tracing::error!("Failed to create data directories: {}", e);
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(dispatch(&config, args.command)) {
        tracing::error!("{}", e);
        if let Ok(line) = serde_json::to_string(&e) {
            println!("{}", line);
        }
        std::process::exit(e.exit_code());
    }
}

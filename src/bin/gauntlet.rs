use std::{
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use clap::{Parser, Subcommand, ValueEnum};
use gauntlet::{
    config::{CliOverrides, HarnessConfig},
    harness::{self, Harness, SCORECARD_FILE},
    prompter::HumanPrompter,
    judges::{calibrate, load_reference_set},
    report::{self, ReportFormat},
    scenario::TaskFamily,
    scenarios,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
    Md,
}

impl From<Format> for ReportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => ReportFormat::Json,
            Format::Csv => ReportFormat::Csv,
            Format::Md => ReportFormat::Markdown,
        }
    }
}

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(about = "Run, replay, grade and rank multi-turn LLM evaluation scenarios")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute scenarios across seeds and write traces plus a scorecard
    Run {
        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Model name: mock, scripted, or an OpenAI-compatible model id
        #[arg(long)]
        model: Option<String>,

        /// Scenario patterns: all, a family, a glob like tool_use/*, or an id (repeatable)
        #[arg(long)]
        scenarios: Vec<String>,

        #[arg(long)]
        seeds: Option<u64>,

        #[arg(long)]
        budget_tokens: Option<u64>,

        #[arg(long)]
        budget_turns: Option<usize>,

        #[arg(long)]
        temperature: Option<f32>,

        /// Trials (and adapter calls) in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Directory that receives run directories
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Play the user side of one scenario from the terminal
    Human {
        /// Scenario id, e.g. convergence/error_handling
        #[arg(long, short)]
        scenario: String,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory that receives run directories
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Re-derive a run's scorecard from its traces only
    Grade {
        #[arg(long)]
        run: String,

        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,
    },
    /// Render an existing scorecard to stdout
    Report {
        #[arg(long)]
        run: String,

        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,

        /// Scorecard file inside the run directory
        #[arg(long, default_value = SCORECARD_FILE)]
        file: String,

        #[arg(long, value_enum, default_value = "md")]
        format: Format,
    },
    /// List registered scenarios
    List {
        #[arg(long)]
        family: Option<String>,
    },
    /// Measure judge bias and variance against a reference set
    Calibrate {
        /// YAML or JSON list of reference cases
        #[arg(long)]
        reference: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            on_signal.cancel();
        }
    });
    cancel
}

fn load_config(path: Option<&PathBuf>) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gauntlet=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match args.command {
        Command::Run {
            config,
            model,
            scenarios,
            seeds,
            budget_tokens,
            budget_turns,
            temperature,
            concurrency,
            out: runs_dir,
        } => {
            let mut config = load_config(config.as_ref())?;
            config.apply_overrides(CliOverrides {
                model,
                scenarios: Some(scenarios),
                seeds,
                budget_tokens,
                budget_turns,
                temperature,
                concurrency,
                runs_dir,
            });
            let provider = harness::build_provider(&config.model)?;
            let harness = Harness::new(config)?.with_cancellation(cancel_on_interrupt());
            let outcome = harness.run(provider).await?;
            writeln!(out, "run {} -> {}", outcome.run_id, outcome.dir.display())?;
            writeln!(out, "{}", report::to_markdown(&outcome.scorecard))?;
            out.flush()?;
            if outcome.manifest.cancelled {
                std::process::exit(130);
            }
        }
        Command::Human {
            scenario,
            model,
            config,
            out: runs_dir,
        } => {
            let mut config = load_config(config.as_ref())?;
            config.apply_overrides(CliOverrides {
                model,
                runs_dir,
                ..CliOverrides::default()
            });
            let Some(selected) = scenarios::create(&scenario) else {
                eprintln!("Unknown scenario {scenario}.");
                std::process::exit(2);
            };
            let provider = harness::build_provider(&config.model)?;
            writeln!(out, "Interactive mode: {}", selected.config().name)?;
            writeln!(out, "{}", selected.config().description)?;
            writeln!(out, "Budget: {} tokens, {} turns\n", config.budget.tokens, config.budget.turns)?;
            out.flush()?;

            let harness = Harness::new(config)?.with_cancellation(cancel_on_interrupt());
            let run_id = format!("human-{}", harness::new_run_id());
            let outcome = harness
                .run_interactive(&run_id, &scenario, provider, Box::new(HumanPrompter::stdio()))
                .await?;

            writeln!(out, "\nResults:")?;
            for entry in &outcome.scorecard.entries {
                for (name, stats) in &entry.metrics {
                    writeln!(out, "  {name}: {:.4}", stats.median)?;
                }
            }
            for trial in &outcome.manifest.trials {
                writeln!(out, "Trace saved: {}", outcome.dir.join(&trial.trace).display())?;
            }
            out.flush()?;
        }
        Command::Grade { run, runs_dir } => {
            let outcome = harness::regrade(&runs_dir, &run).await?;
            writeln!(out, "wrote {}", outcome.path.display())?;
            for failure in &outcome.failures {
                writeln!(out, "replay failed: {} ({})", failure.trace.display(), failure.error)?;
            }
            out.flush()?;
            if !outcome.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Report {
            run,
            runs_dir,
            file,
            format,
        } => {
            let path = harness::run_dir(&runs_dir, &run).join(file);
            let scorecard = harness::load_scorecard(&path)?;
            writeln!(out, "{}", report::render(&scorecard, format.into())?)?;
            out.flush()?;
        }
        Command::List { family } => {
            let family = match family.as_deref() {
                Some(name) => match TaskFamily::parse(name) {
                    Some(family) => Some(family),
                    None => {
                        eprintln!("Unknown family {name}.");
                        std::process::exit(2);
                    }
                },
                None => None,
            };
            for scenario in scenarios::list(family) {
                let config = scenario.config();
                writeln!(out, "{:<32} {}", config.id, config.description)?;
            }
            out.flush()?;
        }
        Command::Calibrate { reference, config } => {
            let config = load_config(config.as_ref())?;
            let cases = load_reference_set(&reference)?;
            let ensemble = harness::calibration_ensemble(&config)?;
            let calibration = calibrate(&ensemble, &cases).await;
            writeln!(out, "{} reference cases", calibration.cases)?;
            writeln!(out, "{:<12} {:>6} {:>9} {:>9} {:>9}", "judge", "count", "bias", "variance", "mae")?;
            for judge in &calibration.judges {
                writeln!(
                    out,
                    "{:<12} {:>6} {:>9.4} {:>9.4} {:>9.4}",
                    judge.judge, judge.count, judge.bias, judge.variance, judge.mean_absolute_error
                )?;
            }
            out.flush()?;
        }
    }
    Ok(())
}

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use prscore::batch::{BatchManifest, SUMMARY_FILE_NAME, run_batch};
use prscore::evaluate::EvaluationConfig;
use prscore::io::GenotypeStore;
use prscore::output::{Delimiter, OutputFormat};
use prscore::pipeline::{EvaluationInputs, PipelineError, ScoringJob, run_evaluation, run_scoring_job};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "prscore",
    about = "Polygenic score calculation and goodness-of-fit evaluation for PLINK filesets"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Layout flags shared by commands that write or read a score artifact.
#[derive(Args)]
struct FormatArgs {
    /// Column delimiter of the score artifact
    #[arg(long, value_enum, default_value_t = Delimiter::Space)]
    delimiter: Delimiter,

    /// The score artifact has no header row
    #[arg(long)]
    no_header: bool,
}

impl FormatArgs {
    fn format(&self) -> OutputFormat {
        OutputFormat {
            delimiter: self.delimiter,
            header: !self.no_header,
        }
    }
}

#[derive(Args)]
struct EvaluateArgs {
    /// Score artifact produced by `prscore score`
    #[arg(value_name = "PROFILE")]
    profile: PathBuf,

    /// Whitespace-delimited `FID IID VALUE` outcome table; defaults to the PHENO column
    #[arg(long, value_name = "PATH")]
    phenotype: Option<PathBuf>,

    /// Number of bootstrap resamples
    #[arg(long, default_value = "1000")]
    resamples: usize,

    /// Confidence level of the bootstrap interval
    #[arg(long, default_value = "0.95")]
    confidence: f64,

    /// Seed of the bootstrap random number generator
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Outcome token treated as missing, in addition to NA and nan
    #[arg(long, value_name = "TOKEN", default_value = "-9", allow_hyphen_values = true)]
    missing_phenotype: String,

    #[command(flatten)]
    format: FormatArgs,

    /// Also write the result as JSON to this path
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score every sample of a genotype fileset with one weight table
    #[command(about = "Compute per-sample polygenic scores (outputs: a score artifact)")]
    Score {
        /// PLINK fileset prefix (`<prefix>.bed/.bim/.fam`)
        #[arg(value_name = "GENOTYPE_PREFIX")]
        genotypes: PathBuf,

        /// Tab-delimited `CHR SNP POS A1 A2 BETA` weight table without header
        #[arg(value_name = "WEIGHTS")]
        weights: PathBuf,

        /// Where to write the score artifact
        #[arg(long, value_name = "PATH")]
        out: PathBuf,

        #[command(flatten)]
        format: FormatArgs,
    },

    /// Relate a score artifact to an outcome
    #[command(about = "Bootstrap R², correlation and p-value of a score artifact")]
    Evaluate(EvaluateArgs),

    /// Run every job of a TOML batch manifest
    #[command(about = "Run a batch of scoring jobs (outputs: artifacts and batch_summary.json)")]
    Batch {
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Score {
            genotypes,
            weights,
            out,
            format,
        }) => run_score(genotypes, weights, out, format.format()),
        Some(Commands::Evaluate(args)) => run_evaluate(args),
        Some(Commands::Batch { manifest }) => run_batch_command(manifest),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Prefixes a pipeline failure with its category.
fn describe(e: PipelineError) -> Box<dyn Error> {
    format!("{}: {e}", e.kind()).into()
}

fn run_score(genotypes: PathBuf, weights: PathBuf, out: PathBuf, format: OutputFormat) -> CliResult {
    let overall_start = Instant::now();

    eprintln!("> Loading genotype fileset {}", genotypes.display());
    let store = GenotypeStore::open(&genotypes).map_err(|e| describe(e.into()))?;
    eprintln!(
        "> Found {} samples and {} variants.",
        store.samples.len(),
        store.variants.len()
    );

    let name = weights
        .file_stem()
        .map_or_else(|| "score".to_string(), |s| s.to_string_lossy().into_owned());
    let job = ScoringJob {
        name,
        weights,
        output: out,
        format,
    };
    let report = run_scoring_job(&store, &job).map_err(describe)?;

    eprint!("{}", report.matching);
    eprintln!(
        "> Score mean={:.4}, std={:.4}, range=[{:.4}, {:.4}]",
        report.scores.mean, report.scores.std, report.scores.min, report.scores.max
    );
    eprintln!(
        "\nSuccess! Wrote {} scores to {} in {:.2?}.",
        report.n_samples,
        report.output.display(),
        overall_start.elapsed()
    );
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> CliResult {
    let config = EvaluationConfig {
        resamples: args.resamples,
        confidence: args.confidence,
        seed: args.seed,
    };
    let inputs = EvaluationInputs {
        profile: args.profile,
        format: args.format.format(),
        phenotype: args.phenotype,
        missing_code: args.missing_phenotype,
    };

    eprintln!(
        "> Evaluating {} with {} bootstrap resamples (seed {})",
        inputs.profile.display(),
        config.resamples,
        config.seed
    );
    let result = run_evaluation(&inputs, &config).map_err(describe)?;
    print!("{result}");

    if let Some(path) = args.json {
        fs::write(&path, serde_json::to_string_pretty(&result)?)?;
        eprintln!("> Wrote {}", path.display());
    }
    Ok(())
}

fn run_batch_command(manifest_path: PathBuf) -> CliResult {
    let manifest = BatchManifest::load(&manifest_path)?;
    eprintln!(
        "> Running {} job(s) from {}",
        manifest.jobs.len(),
        manifest_path.display()
    );

    let summary = run_batch(&manifest)?;
    print!("{summary}");
    eprintln!(
        "> Summary written to {}",
        manifest.output_dir.join(SUMMARY_FILE_NAME).display()
    );

    if summary.is_success() {
        Ok(())
    } else {
        Err(format!("{} job(s) failed", summary.failed.len()).into())
    }
}

fn print_version_info() {
    println!("prscore {}", env!("CARGO_PKG_VERSION"));
    match option_env!("PRSCORE_RELEASE_TAG") {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }
}

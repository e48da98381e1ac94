use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_pipeline::config::{ConfigLoader, ResolvedConfig};
use beacon_pipeline::convert::ExternalConverter;
use beacon_pipeline::domain::{ScoringMode, Uid};
use beacon_pipeline::error::BeaconError;
use beacon_pipeline::loader::{self, LoaderKind};
use beacon_pipeline::output::{JsonOutput, LogSink};
use beacon_pipeline::pipeline::{ModelRequest, Pipeline, TaskGraph};
use beacon_pipeline::records::{JsonRecordStore, RecordStore};
use beacon_pipeline::remote::{JobPoller, PollBudget, QmeanHttpClient};
use beacon_pipeline::scoring::QualityScorer;
use beacon_pipeline::store::Workspace;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Ingest, score and convert protein structure models for a 3D-Beacons provider")]
#[command(version, author)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process and inspect models")]
    Model(ModelArgs),
}

#[derive(Args)]
struct ModelArgs {
    #[command(subcommand)]
    command: ModelCommand,
}

#[derive(Subcommand)]
enum ModelCommand {
    #[command(about = "Run the pipeline for one or more PDB files")]
    Add(AddArgs),
    #[command(about = "Show the record for a model")]
    Show(ShowArgs),
    #[command(about = "List all model records")]
    List,
    #[command(about = "Attach repository model data to a record")]
    LoadData(LoadDataArgs),
}

#[derive(Args)]
struct AddArgs {
    #[arg(long = "pdbfile", required = true, num_args = 1..)]
    pdbfiles: Vec<Utf8PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    /// Use this uid instead of the content hash (single input only).
    #[arg(long)]
    uid: Option<String>,

    #[arg(long, value_enum)]
    mode: Option<ScoringMode>,
}

#[derive(Args)]
struct ShowArgs {
    #[arg(long)]
    uid: String,
}

#[derive(Args)]
struct LoadDataArgs {
    #[arg(long)]
    loader: String,

    #[arg(long)]
    json: Utf8PathBuf,

    #[arg(long)]
    uid: String,

    /// Coordinates URI of the structure to pick; defaults to the first.
    #[arg(long)]
    coordinates: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(beacon) = report.downcast_ref::<BeaconError>() {
            return ExitCode::from(map_exit_code(beacon));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BeaconError) -> u8 {
    match error {
        BeaconError::InvalidUid(_)
        | BeaconError::InvalidStage(_)
        | BeaconError::UnknownLoader(_)
        | BeaconError::LoaderData(_)
        | BeaconError::ConfigRead(_)
        | BeaconError::ConfigParse(_)
        | BeaconError::Usage(_)
        | BeaconError::RecordNotFound(_) => 2,
        BeaconError::RemoteHttp(_)
        | BeaconError::RemoteService { .. }
        | BeaconError::UnknownJobStatus { .. }
        | BeaconError::PollTimeout { .. }
        | BeaconError::ScoringTool { .. }
        | BeaconError::ScoreParse(_)
        | BeaconError::Conversion { .. }
        | BeaconError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Model(args) => match args.command {
            ModelCommand::Add(args) => run_add(args, &config),
            ModelCommand::Show(args) => run_show(args, &config),
            ModelCommand::List => run_list(&config),
            ModelCommand::LoadData(args) => run_load_data(args, &config),
        },
    }
}

fn open_records(config: &ResolvedConfig) -> Result<JsonRecordStore, BeaconError> {
    JsonRecordStore::open(config.records_dir.clone())
}

fn build_requests(
    pdbfiles: Vec<Utf8PathBuf>,
    uid: Option<&str>,
) -> Result<Vec<ModelRequest>, BeaconError> {
    let uid_override = uid.map(str::parse::<Uid>).transpose()?;
    if uid_override.is_some() && pdbfiles.len() > 1 {
        return Err(BeaconError::Usage(
            "--uid can only be used with a single --pdbfile".to_string(),
        ));
    }
    Ok(pdbfiles
        .into_iter()
        .map(|source| match &uid_override {
            Some(uid) => ModelRequest::new(source).with_uid(uid.clone()),
            None => ModelRequest::new(source),
        })
        .collect())
}

fn run_add(args: AddArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let requests = build_requests(args.pdbfiles, args.uid.as_deref())?;

    let mode = args.mode.unwrap_or(config.scoring_mode);
    let transport = QmeanHttpClient::new(&config.qmean.submit_url)?;
    let poller = JobPoller::new(
        transport,
        PollBudget::new(config.qmean.poll_interval, config.qmean.poll_timeout),
    );
    let scorer = QualityScorer::new(
        mode,
        poller,
        config.qmean.contact_email.clone(),
        config.local_qmean.clone(),
    );
    let converter = ExternalConverter::new(config.converter.clone());
    let graph = TaskGraph::standard(Arc::new(scorer), Arc::new(converter))?;

    let records: Arc<dyn RecordStore> = Arc::new(open_records(config)?);
    let pipeline = Pipeline::new(Workspace::new(config.work_dir.clone()), records, graph);

    let cancel = pipeline.cancel_token().clone();
    ctrlc::set_handler(move || {
        warn!("interrupted, cancelling pending tasks and QMEAN polls");
        cancel.cancel();
    })
    .into_diagnostic()?;

    let workers = args.workers.unwrap_or(config.workers).max(1);
    info!(models = requests.len(), workers, mode = %mode, work_dir = %config.work_dir, "processing models");
    let results = pipeline.process_batch(&requests, workers, &LogSink);

    let mut reports = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) if report.is_success() => reports.push(report),
            Ok(report) => {
                warn!(uid = %report.uid, "model did not complete");
                reports.push(report);
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    JsonOutput::print_reports(&reports).into_diagnostic()?;

    if let Some(err) = first_error {
        return Err(err.into());
    }
    if let Some(failed) = reports.into_iter().find(|report| !report.is_success()) {
        failed.into_result()?;
        return Err(miette::Report::msg("one or more pipeline tasks did not complete"));
    }
    Ok(())
}

fn run_show(args: ShowArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let uid: Uid = args.uid.parse()?;
    let records = open_records(config)?;
    let record = records
        .get(&uid)?
        .ok_or_else(|| BeaconError::RecordNotFound(uid.to_string()))?;
    JsonOutput::print_record(&record).into_diagnostic()?;
    Ok(())
}

fn run_list(config: &ResolvedConfig) -> miette::Result<()> {
    let records = open_records(config)?;
    JsonOutput::print_records(&records.list()?).into_diagnostic()?;
    Ok(())
}

fn run_load_data(args: LoadDataArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let kind: LoaderKind = args.loader.parse()?;
    let uid: Uid = args.uid.parse()?;
    let records = open_records(config)?;
    let record = loader::load_model_data(
        &records,
        &uid,
        kind,
        &args.json,
        args.coordinates.as_deref(),
    )?;
    JsonOutput::print_record(&record).into_diagnostic()?;
    Ok(())
}

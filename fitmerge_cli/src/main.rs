use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use fitmerge::exercise::{rank_candidates, title_case};
use fitmerge::{
    decode_recording, read_rows_path, resolve_phase, suggest, validate_path, ExerciseResolver,
    FixedResolver, MappingTable, MergeConfig, MergeOutcome, MergePlan, MergeReport, Resolution,
    ScheduledMerge, SuggestionResolver, TimingMode, WeightUnit,
};
use fitparser::de::from_bytes;
use fitparser::profile::MesgNum;
use fitparser::Value as FitValue;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge Hevy workout exports into Garmin FIT recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge a Hevy CSV export into a FIT activity recording
    Merge(MergeArgs),
    /// Check that a FIT file decodes and looks like an activity
    Validate(ValidateArgs),
    /// Summarize the messages in FIT files
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct MergeArgs {
    /// FIT activity recording
    #[arg(value_hint = ValueHint::FilePath)]
    recording: PathBuf,

    /// Hevy workout CSV export
    #[arg(value_hint = ValueHint::FilePath)]
    workout: PathBuf,

    /// Merged FIT output path
    #[arg(short, long, default_value = "merged.fit", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Configuration JSON (mappings, CSV columns, settings)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Unit of the weights in the CSV
    #[arg(long, value_enum)]
    weight_unit: Option<WeightUnitOpt>,

    /// How to derive the workout duration
    #[arg(long, value_enum)]
    timing: Option<TimingOpt>,

    /// JSON object of exercise name -> Garmin display name for unmapped exercises
    #[arg(long, value_hint = ValueHint::FilePath)]
    mappings: Option<PathBuf>,

    /// Accept the suggested display name for every unmapped exercise
    #[arg(long, action = ArgAction::SetTrue)]
    accept_suggestions: bool,

    /// Write the configuration with the updated mapping table here
    #[arg(long, value_hint = ValueHint::FilePath)]
    save_mappings: Option<PathBuf>,

    /// Write the aggregated workout note here
    #[arg(long, value_hint = ValueHint::FilePath)]
    note_output: Option<PathBuf>,

    /// Write the JSON merge report here
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Show the scheduled sets without writing output
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// FIT file to check
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// FIT files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WeightUnitOpt {
    Kg,
    Lbs,
}

impl From<WeightUnitOpt> for WeightUnit {
    fn from(value: WeightUnitOpt) -> Self {
        match value {
            WeightUnitOpt::Kg => WeightUnit::Kilograms,
            WeightUnitOpt::Lbs => WeightUnit::Pounds,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TimingOpt {
    Exact,
    Estimate,
}

impl From<TimingOpt> for TimingMode {
    fn from(value: TimingOpt) -> Self {
        match value {
            TimingOpt::Exact => TimingMode::Exact,
            TimingOpt::Estimate => TimingMode::Estimate,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Merge(args) => args.verbose,
        Command::Validate(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Merge(args) => handle_merge(args),
        Command::Validate(args) => handle_validate(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn load_config(args: &MergeArgs) -> Result<MergeConfig> {
    let mut config = match &args.config {
        Some(path) => MergeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MergeConfig::default(),
    };
    if let Some(unit) = args.weight_unit {
        config.settings.weight_unit = unit.into();
    }
    if let Some(timing) = args.timing {
        config.settings.timing.mode = timing.into();
    }
    Ok(config)
}

fn load_resolution_file(path: &Path) -> Result<FixedResolver> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read mappings {}", path.display()))?;
    let choices: BTreeMap<String, String> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON object of name -> display name", path.display()))?;
    Ok(FixedResolver::new(choices))
}

fn resolver_for(args: &MergeArgs) -> Result<Box<dyn ExerciseResolver>> {
    if let Some(path) = &args.mappings {
        return Ok(Box::new(load_resolution_file(path)?));
    }
    if args.accept_suggestions {
        return Ok(Box::new(SuggestionResolver));
    }
    Ok(Box::new(PromptResolver::new(io::stdin().lock(), io::stderr())))
}

fn handle_merge(args: MergeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let data = fs::read(&args.recording)
        .with_context(|| format!("failed to read {}", args.recording.display()))?;
    let container = decode_recording(&data, &args.recording.to_string_lossy())
        .with_context(|| format!("failed to parse {}", args.recording.display()))?;
    let rows = read_rows_path(&args.workout)
        .with_context(|| format!("failed to read {}", args.workout.display()))?;
    info!(
        records = container.len(),
        rows = rows.len(),
        "loaded inputs"
    );

    let mut table = config.exercise_mappings.clone();
    let mut resolver = resolver_for(&args)?;
    let phase = MergePlan::begin(container, &rows, &config, &table);
    let Some(plan) = resolve_phase(phase, &mut table, resolver.as_mut())
        .context("exercise mapping failed")?
    else {
        warn!("merge cancelled, nothing written");
        return Ok(());
    };
    for warning in plan.warnings() {
        warn!(%warning, "workout input");
    }

    let scheduled = plan.schedule(&table)?;
    log_preview(&scheduled);
    if args.dry_run {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, scheduled.sets())?;
        writeln!(handle)?;
        info!("dry run, nothing written");
        return Ok(());
    }

    let (bytes, report) = match scheduled.finish() {
        MergeOutcome::Success { bytes, report } => (bytes, report),
        MergeOutcome::UserCancelled => {
            warn!("merge cancelled, nothing written");
            return Ok(());
        }
        MergeOutcome::Failure(err) => return Err(anyhow!(err).context("merge failed")),
    };

    fs::write(&args.output, &bytes)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Merged recording written: {}", args.output.display());
    for warning in &report.warnings {
        warn!("{warning}");
    }

    if let Some(path) = &args.note_output {
        write_note(path, &report)?;
    }
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Merge report written: {}", path.display());
    }
    if let Some(path) = &args.save_mappings {
        save_mappings(path, &config, table)?;
    }
    Ok(())
}

fn log_preview(scheduled: &ScheduledMerge) {
    let schedule = scheduled.schedule();
    let span = scheduled.span();
    info!(
        sets = schedule.len(),
        reps = schedule.total_reps(),
        exercises = schedule.exercise_count(),
        duration_s = span.duration_seconds,
        timing = ?span.source,
        "workout preview"
    );
    for entry in scheduled.summary() {
        info!(
            "  {}: {} sets, {} reps, max {:.1} {}",
            entry.exercise,
            entry.sets,
            entry.total_reps,
            entry.max_weight,
            schedule.weight_unit
        );
    }
}

fn write_note(path: &Path, report: &MergeReport) -> Result<()> {
    match &report.workout_note {
        Some(note) => {
            fs::write(path, note).with_context(|| format!("failed to write {}", path.display()))?;
            info!("Workout note written: {}", path.display());
        }
        None => info!("No set notes, skipping workout note"),
    }
    Ok(())
}

fn save_mappings(path: &Path, config: &MergeConfig, table: MappingTable) -> Result<()> {
    let mut updated = config.clone();
    updated.exercise_mappings = table;
    let json = updated.to_json_string()?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        mappings = updated.exercise_mappings.len(),
        "Configuration written: {}",
        path.display()
    );
    Ok(())
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let result = validate_path(&args.input);
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, &result)?;
    writeln!(handle)?;
    if !result.ok {
        bail!(
            "{} failed validation: {}",
            args.input.display(),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();

    for path in &args.inputs {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let fit =
            from_bytes(&data).with_context(|| format!("failed to parse {}", path.display()))?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut set_lines = Vec::new();
        let mut first_time: Option<i64> = None;
        let mut last_time: Option<i64> = None;

        for message in &fit {
            *counts.entry(message.kind().to_string()).or_insert(0) += 1;
            for field in message.fields() {
                if field.name() == "timestamp" {
                    if let FitValue::Timestamp(ts) = field.value() {
                        let seconds = ts.with_timezone(&Utc).timestamp();
                        first_time = Some(first_time.map_or(seconds, |t| t.min(seconds)));
                        last_time = Some(last_time.map_or(seconds, |t| t.max(seconds)));
                    }
                }
            }
            if message.kind() == MesgNum::Set {
                let fields: Vec<String> = message
                    .fields()
                    .iter()
                    .map(|f| format!("{}={}", f.name(), f.value()))
                    .collect();
                set_lines.push(fields.join(" "));
            }
        }

        report.push_str(&format!("FILE: {}\n", path.display()));
        report.push_str(&format!("  messages: {}\n", fit.len()));
        if let (Some(start), Some(end)) = (first_time, last_time) {
            report.push_str(&format!("  timespan_s: {}\n", end - start));
        }
        report.push_str("  kinds:\n");
        for (kind, count) in &counts {
            report.push_str(&format!("    - {}: {}\n", kind, count));
        }
        if !set_lines.is_empty() {
            report.push_str(&format!("  sets ({}):\n", set_lines.len()));
            for line in &set_lines {
                report.push_str(&format!("    - {}\n", line));
            }
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        print!("{report}");
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

/// Asks on a terminal for the display name of each unmapped exercise.
/// Enter accepts the suggestion, a number picks a listed candidate, `q`
/// or end of input cancels.
struct PromptResolver<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResolver<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, name: &str, available: &[String]) -> io::Result<Option<String>> {
        let candidates: Vec<&str> = rank_candidates(name, available)
            .into_iter()
            .take(5)
            .map(|(c, _)| c)
            .collect();
        let fallback = suggest(name, available).unwrap_or_else(|| title_case(name));

        writeln!(self.output, "No Garmin mapping for '{name}'.")?;
        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, candidate)?;
        }
        write!(
            self.output,
            "Display name [Enter = {fallback}, number, q = cancel]: "
        )?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let answer = line.trim();
        if answer.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        if answer.is_empty() {
            return Ok(Some(fallback));
        }
        if let Ok(pick) = answer.parse::<usize>() {
            if let Some(candidate) = pick.checked_sub(1).and_then(|i| candidates.get(i)) {
                return Ok(Some((*candidate).to_string()));
            }
        }
        Ok(Some(answer.to_string()))
    }
}

impl<R: BufRead, W: Write> ExerciseResolver for PromptResolver<R, W> {
    fn resolve_unmapped(&mut self, names: &BTreeSet<String>, available: &[String]) -> Resolution {
        let mut chosen = BTreeMap::new();
        for name in names {
            match self.ask(name, available) {
                Ok(Some(display)) => {
                    chosen.insert(name.clone(), display);
                }
                Ok(None) => return Resolution::Cancelled,
                Err(err) => {
                    warn!(error = %err, "prompt failed, cancelling");
                    return Resolution::Cancelled;
                }
            }
        }
        Resolution::Confirmed(chosen)
    }
}

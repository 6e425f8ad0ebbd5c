use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;

use pmcheck_belief::BeliefDatabase;
use pmcheck_cache::Granularity;
use pmcheck_error::PmcheckError;
use pmcheck_replay::{CandidateSet, ProcessExecutor, ReplayConfig, RunMode, Session};
use pmcheck_types::{OpId, Trace};
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXIT_REPORTED: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliOptions {
    trace: Option<PathBuf>,
    graphs: Vec<PathBuf>,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    validator: Option<PathBuf>,
    op_file: Option<PathBuf>,
    full_oracle: Option<PathBuf>,
    layout: Option<String>,
    candidates: Option<PathBuf>,
    mode: RunMode,
    workers: Option<usize>,
    timeout_secs: Option<u64>,
    granularity: Option<Granularity>,
    keep: bool,
    show_help: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let exit_code = run(std::env::args_os(), &mut stdout, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run<I, W, E>(args: I, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = write_usage(err);
            return EXIT_USAGE;
        }
    };

    if options.show_help {
        if write_usage(out).is_err() {
            return 1;
        }
        return 0;
    }

    match check(&options, out) {
        Ok(session_clean) => {
            if session_clean {
                0
            } else {
                EXIT_REPORTED
            }
        }
        Err(error) => {
            let _ = writeln!(err, "error: {error}");
            if let Some(hint) = error.suggestion() {
                let _ = writeln!(err, "hint: {hint}");
            }
            error.exit_code()
        }
    }
}

/// Merge file config and flags into the effective run configuration.
fn effective_config(options: &CliOptions) -> Result<ReplayConfig, PmcheckError> {
    let mut config = match &options.config {
        Some(path) => ReplayConfig::from_json_file(path)?,
        None => ReplayConfig::default(),
    };
    if let Some(dir) = &options.output {
        config.output_dir.clone_from(dir);
    }
    if let Some(path) = &options.validator {
        config.validator_program.clone_from(path);
    }
    if let Some(path) = &options.op_file {
        config.op_file.clone_from(path);
    }
    if let Some(path) = &options.full_oracle {
        config.full_oracle_file.clone_from(path);
    }
    if let Some(layout) = &options.layout {
        config.layout.clone_from(layout);
    }
    if let Some(workers) = options.workers {
        config.workers = workers;
    }
    if let Some(secs) = options.timeout_secs {
        config.timeout_secs = secs;
    }
    if let Some(granularity) = options.granularity {
        config.granularity = granularity;
    }
    if options.keep {
        config.keep_images = true;
    }
    config.validate()?;
    Ok(config)
}

/// Run the check; `Ok(true)` when nothing was reported.
fn check<W: Write>(options: &CliOptions, out: &mut W) -> Result<bool, PmcheckError> {
    let config = effective_config(options)?;
    let trace_path = options
        .trace
        .as_ref()
        .ok_or_else(|| PmcheckError::config("--trace is required"))?;
    let trace = Trace::load(trace_path)?;

    let session = match &options.candidates {
        Some(path) => {
            let candidates = CandidateSet::load(path, trace.tx_count())?;
            Session::from_candidates(config.clone(), trace, candidates)
        }
        None if options.graphs.is_empty() => {
            if options.mode == RunMode::All {
                return Err(PmcheckError::config(
                    "either --graph or --candidates is required",
                ));
            }
            Session::from_candidates(config.clone(), trace, CandidateSet::default())
        }
        None => {
            let beliefs = BeliefDatabase::from_files(&options.graphs)?;
            Session::from_beliefs(config.clone(), trace, beliefs)?
        }
    };

    let executor = ProcessExecutor::new(&config.core_dump_dir);
    let outcome = session.run(options.mode, &executor)?;
    info!(output = %config.output_dir.display(), "results in res/");
    write!(out, "{}", outcome.summary)?;
    writeln!(out, "{}", outcome.results.triage_line())?;
    Ok(outcome.results.is_clean())
}

#[allow(clippy::too_many_lines)]
fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut iter = args.into_iter();
    let _argv0 = iter.next();
    let mut options = CliOptions::default();

    while let Some(argument) = iter.next() {
        let arg = argument.to_string_lossy().into_owned();
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_owned(), Some(value.to_owned())),
            _ => (arg.clone(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            match &inline {
                Some(v) => Ok(v.clone()),
                None => iter
                    .next()
                    .map(|v| v.to_string_lossy().into_owned())
                    .ok_or_else(|| format!("missing argument for `{name}`")),
            }
        };

        match flag.as_str() {
            "-h" | "--help" => options.show_help = true,
            "--trace" => options.trace = Some(PathBuf::from(value("--trace")?)),
            "--graph" => options.graphs.push(PathBuf::from(value("--graph")?)),
            "--config" => options.config = Some(PathBuf::from(value("--config")?)),
            "--output" => options.output = Some(PathBuf::from(value("--output")?)),
            "--validator" => options.validator = Some(PathBuf::from(value("--validator")?)),
            "--op-file" => options.op_file = Some(PathBuf::from(value("--op-file")?)),
            "--full-oracle" => options.full_oracle = Some(PathBuf::from(value("--full-oracle")?)),
            "--layout" => options.layout = Some(value("--layout")?),
            "--candidates" => options.candidates = Some(PathBuf::from(value("--candidates")?)),
            "--pair" => {
                if options.mode != RunMode::All {
                    return Err(String::from("`--pair` cannot be combined with `--target`"));
                }
                let raw = value("--pair")?;
                let ids = parse_ids(&raw, "--pair", 2)?;
                options.mode = RunMode::Pair {
                    pre: OpId::new(ids[0]),
                    succ: OpId::new(ids[1]),
                };
            }
            "--target" => {
                if options.mode != RunMode::All {
                    return Err(String::from("`--target` cannot be combined with `--pair`"));
                }
                let raw = value("--target")?;
                let ids = parse_ids(&raw, "--target", 3)?;
                let tx = usize::try_from(ids[0])
                    .map_err(|_| format!("transaction index too large in `--target`: `{raw}`"))?;
                options.mode = RunMode::Target {
                    tx,
                    fence: OpId::new(ids[1]),
                    op: OpId::new(ids[2]),
                };
            }
            "--workers" => {
                let raw = value("--workers")?;
                let workers = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| format!("invalid worker count for `--workers`: `{raw}`"))?;
                options.workers = Some(workers);
            }
            "--timeout" => {
                let raw = value("--timeout")?;
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid seconds for `--timeout`: `{raw}`"))?;
                options.timeout_secs = Some(secs);
            }
            "--granularity" => {
                let raw = value("--granularity")?;
                let granularity = raw.parse::<Granularity>().map_err(|e| e.to_string())?;
                options.granularity = Some(granularity);
            }
            "--keep" => options.keep = true,
            other => return Err(format!("unknown option `{other}`")),
        }
    }

    if !options.show_help && options.trace.is_none() {
        return Err(String::from("`--trace` is required"));
    }
    Ok(options)
}

/// Parse `n` comma-separated integers.
fn parse_ids(raw: &str, flag: &str, n: usize) -> Result<Vec<u64>, String> {
    let ids = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("invalid ids for `{flag}`: `{raw}`"))?;
    if ids.len() != n {
        return Err(format!("`{flag}` expects {n} comma-separated ids, got `{raw}`"));
    }
    Ok(ids)
}

fn write_usage<W>(out: &mut W) -> io::Result<()>
where
    W: Write,
{
    writeln!(
        out,
        "Usage: pmcheck --trace FILE (--graph FILE... | --candidates FILE) [options]\n\
         \n\
         Options:\n\
         \x20 --config FILE              JSON replay configuration\n\
         \x20 --output DIR               images, oracles, outputs and res/\n\
         \x20 --validator PATH           recovery/verification program\n\
         \x20 --op-file PATH             workload operation file\n\
         \x20 --full-oracle PATH         output of the complete traced run\n\
         \x20 --layout S                 layout argument for the validator\n\
         \x20 --pair PRE,SUCC            test one candidate pair\n\
         \x20 --target TX,FENCE,OP       re-validate one crash plan\n\
         \x20 --workers N                per-transaction workers\n\
         \x20 --timeout SECS             validator timeout\n\
         \x20 --granularity G            cacheline | store | bucket:N\n\
         \x20 --keep                     keep crash images\n\
         \n\
         Exit status: 0 clean, 1 inconsistencies reported, 2 usage error.\n",
    )
}

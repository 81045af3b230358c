use std::{
    env,
    ffi::OsString,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use clap::Parser;
use log::{error, info};
use serde_json::{Map, Number, Value};
use training::{
    coordination::{launch_local_workers, GroupEnv, LocalGroup, ProcessGroup, SoloGroup, WorkerCommand},
    Trainer, TrainingConfig, TrainingError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("training failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed seq2seq training", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "N", help = "Number of workers; defaults to runtime.world_size")]
    workers: Option<usize>,

    #[arg(long, help = "Run the workers as threads of this process")]
    threads: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    if let Some(layout) = GroupEnv::from_env(&config.runtime.master_addr)? {
        info!("worker {} of {} joining {}", layout.rank, layout.world_size, layout.master_addr);
        let group = layout.connect()?;
        return run_worker(config, group, &shutdown_flag);
    }

    let workers = args.workers.unwrap_or(config.runtime.world_size);
    match workers {
        0 => Err(TrainingError::coordination("--workers must be at least 1")),
        1 => run_worker(config, Box::new(SoloGroup), &shutdown_flag),
        n if args.threads => run_threads(config, n, &shutdown_flag),
        n => {
            // Children see RANK in their environment and take the worker path.
            let forwarded: Vec<OsString> = env::args_os().skip(1).collect();
            let command = WorkerCommand::current_exe(forwarded, config.runtime.master_addr.clone())?;
            launch_local_workers(n, &command)
        }
    }
}

fn run_worker(
    config: TrainingConfig,
    group: Box<dyn ProcessGroup>,
    shutdown_flag: &AtomicBool,
) -> Result<(), TrainingError> {
    let mut trainer = Trainer::new(config, group)?;
    let summary = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    if let Some(best) = summary.best_score {
        info!(
            "best global score {best:.2} after {} annealing attempts",
            summary.annealing_attempts
        );
    }
    Ok(())
}

fn run_threads(
    config: TrainingConfig,
    world_size: usize,
    shutdown_flag: &Arc<AtomicBool>,
) -> Result<(), TrainingError> {
    info!("running {world_size} workers as threads");
    let handles: Vec<_> = LocalGroup::create(world_size)?
        .into_iter()
        .map(|group| {
            let config = config.clone();
            let flag = Arc::clone(shutdown_flag);
            thread::spawn(move || run_worker(config, Box::new(group), &flag))
        })
        .collect();

    let mut failures = Vec::new();
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("worker {rank} failed: {err}");
                failures.push(rank);
            }
            Err(_) => {
                error!("worker {rank} panicked");
                failures.push(rank);
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::coordination(format!(
            "workers {failures:?} did not finish successfully"
        )))
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::runtime(format!(
                        "invalid index in override path '{segment}': {err}"
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = target;
    for segment in parents {
        let entry = child(current, segment)?;
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    *child(current, last)? = new_value;
    Ok(())
}

/// The slot `segment` names inside `value`, created when absent.
fn child<'a>(value: &'a mut Value, segment: &PathSegment) -> Result<&'a mut Value, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    let Value::Object(map) = value else {
        return Err(TrainingError::runtime(format!(
            "override path segment '{}' points to non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);
    let Some(index) = segment.index else {
        return Ok(entry);
    };
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let Value::Array(array) = entry else {
        return Err(TrainingError::runtime(format!(
            "override path segment '{}' expects array value",
            segment.key
        )));
    };
    while array.len() <= index {
        array.push(Value::Null);
    }
    Ok(&mut array[index])
}

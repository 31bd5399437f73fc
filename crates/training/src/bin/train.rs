use std::{
    path::PathBuf,
    str::FromStr,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use serde_json::{Map, Number, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use training::{learn, orchestrator::install_termination_handler, TrainingConfig, TrainingError};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "SimCLR pretraining and downstream evaluation", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to the experiment config (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "DIR", help = "Checkpoint directory to load before training")]
    resume: Option<PathBuf>,

    #[arg(long, help = "Train a linear probe on the frozen backbone after pretraining")]
    linear_probe: bool,

    #[arg(long, help = "Fine-tune the whole network after pretraining")]
    fine_tuning: bool,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(resume) = args.resume {
        config.runtime.load_checkpoint = Some(resume);
    }
    if args.linear_probe {
        config.downstream.linear_probe = true;
    }
    if args.fine_tuning {
        config.downstream.fine_tuning = true;
    }
    config.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    install_termination_handler(shutdown.clone())?;

    let summary = learn(config, shutdown)?;
    if summary.interrupted {
        warn!(experiment = %summary.experiment_name, "run stopped on termination signal");
    }
    if let Some(path) = &summary.last_checkpoint {
        info!(checkpoint = %path.display(), "latest checkpoint");
    }
    Ok(())
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
        TrainingError::ConfigFormat(format!("invalid config after overrides: {err}"))
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

/// Sets `a.b.c` in a JSON object tree, creating intermediate objects.
fn set_value_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::ConfigFormat("override path must not be empty".into()));
    };

    let mut current = root;
    for segment in parents {
        let map = as_object(current, segment)?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    as_object(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn as_object<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Map<String, Value>, TrainingError> {
    value.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!(
            "override path segment '{segment}' points into a non-object value"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_paths_are_created_and_typed() -> Result<(), TrainingError> {
        let mut value = serde_json::json!({ "optimization": { "lr": 0.1 } });
        set_value_at_path(&mut value, "optimization.lr", parse_override_value("0.5"))?;
        set_value_at_path(&mut value, "runtime.epochs", parse_override_value("3"))?;
        set_value_at_path(&mut value, "downstream.linear_probe", parse_override_value("TRUE"))?;
        assert_eq!(value["optimization"]["lr"], serde_json::json!(0.5));
        assert_eq!(value["runtime"]["epochs"], serde_json::json!(3));
        assert_eq!(value["downstream"]["linear_probe"], serde_json::json!(true));
        Ok(())
    }

    #[test]
    fn scalar_parent_is_rejected() {
        let mut value = serde_json::json!({ "runtime": 1 });
        assert!(set_value_at_path(&mut value, "runtime.epochs", Value::Null).is_err());
        assert!(set_value_at_path(&mut value, "runtime..epochs", Value::Null).is_err());
    }
}

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{info, warn};

use crate::{config::LogFormat, metrics::MetricMap, TrainingError};

/// Fixed wait between dashboard connection attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(10);

const MAX_KEY_WIDTH: usize = 43;

/// One report: scalar values under a namespace, stamped with the step and epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub namespace: String,
    pub step: u64,
    pub epoch: u64,
    pub values: MetricMap,
}

impl Record {
    /// Flattened `{ns}/{key}` view including `{ns}/step` and `epoch`.
    pub fn entries(&self) -> BTreeMap<String, f64> {
        let mut entries: BTreeMap<String, f64> = self
            .values
            .iter()
            .map(|(key, value)| (format!("{}/{}", self.namespace, key), *value))
            .collect();
        entries.insert(format!("{}/step", self.namespace), self.step as f64);
        entries.insert("epoch".to_string(), self.epoch as f64);
        entries
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

pub trait MetricSink: Send {
    fn name(&self) -> &'static str;

    fn write(&mut self, record: &Record) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Metric reporting context for one run. Owned by the engine; fans every record out to its sinks.
pub struct RunLogger {
    run: String,
    sinks: Vec<Box<dyn MetricSink>>,
}

impl RunLogger {
    pub fn new(run: impl Into<String>, sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self {
            run: run.into(),
            sinks,
        }
    }

    /// Logger without sinks; reports are dropped.
    pub fn disabled() -> Self {
        Self::new("disabled", Vec::new())
    }

    /// Opens one sink per format under `dir`.
    pub fn open(
        run: impl Into<String>,
        formats: &[LogFormat],
        dir: &Path,
    ) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::Dashboard(format!("failed to create {}: {err}", dir.display()))
        })?;
        let mut sinks: Vec<Box<dyn MetricSink>> = Vec::with_capacity(formats.len());
        for format in formats {
            let sink: Box<dyn MetricSink> = match format {
                LogFormat::Stdout => Box::new(HumanSink::stdout()),
                LogFormat::Json => Box::new(JsonlSink::create(&dir.join("progress.jsonl"))?),
                LogFormat::Csv => Box::new(CsvSink::create(&dir.join("progress.csv"))?),
                LogFormat::Tensorboard => {
                    let sink = TensorBoardSink::create(&dir.join("tb"))?;
                    info!(path = %sink.path().display(), "tensorboard event file");
                    Box::new(sink)
                }
            };
            sinks.push(sink);
        }
        Ok(Self::new(run, sinks))
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    /// Runs sharing every name component but the last (the seed) land in one group.
    pub fn group(&self) -> &str {
        dashboard_group(&self.run)
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub fn log(
        &mut self,
        namespace: &str,
        values: &MetricMap,
        step: u64,
        epoch: u64,
    ) -> Result<(), TrainingError> {
        let record = Record {
            namespace: namespace.to_string(),
            step,
            epoch,
            values: values.clone(),
        };
        for sink in self.sinks.iter_mut() {
            sink.write(&record)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

pub fn dashboard_group(run: &str) -> &str {
    match run.rsplit_once('.') {
        Some((group, _)) => group,
        None => run,
    }
}

/// Calls `connect` until it succeeds, sleeping `backoff` after every failure.
/// Gives up only when `shutdown` is raised.
pub fn connect_with_retry<F>(
    mut connect: F,
    backoff: Duration,
    shutdown: &AtomicBool,
) -> Result<RunLogger, TrainingError>
where
    F: FnMut() -> Result<RunLogger, TrainingError>,
{
    let mut attempt = 1u64;
    loop {
        match connect() {
            Ok(logger) => {
                info!(run = logger.run(), group = logger.group(), attempt, "dashboard connected");
                return Ok(logger);
            }
            Err(err) => {
                warn!(%err, attempt, "dashboard connection failed; retrying in {:?}", backoff);
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            return Err(TrainingError::Dashboard(
                "interrupted while connecting to the dashboard".to_string(),
            ));
        }
        thread::sleep(backoff);
        attempt += 1;
    }
}

/// Keeps every record in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn namespace(&self, namespace: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.namespace == namespace)
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&mut self, record: &Record) -> Result<(), TrainingError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        Ok(Self {
            writer: BufWriter::new(open_append(path)?),
        })
    }
}

impl MetricSink for JsonlSink {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write(&mut self, record: &Record) -> Result<(), TrainingError> {
        let line = serde_json::to_string(&record.entries())?;
        writeln!(self.writer, "{line}").map_err(dashboard_io)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(dashboard_io)
    }
}

/// Long-format CSV (`namespace,step,epoch,key,value`) so namespaces with different keys share one file.
pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        let fresh = !path.exists();
        let mut writer = BufWriter::new(open_append(path)?);
        if fresh {
            writeln!(writer, "namespace,step,epoch,key,value").map_err(dashboard_io)?;
        }
        Ok(Self { writer })
    }
}

impl MetricSink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write(&mut self, record: &Record) -> Result<(), TrainingError> {
        for (key, value) in &record.values {
            writeln!(
                self.writer,
                "{},{},{},{},{}",
                record.namespace, record.step, record.epoch, key, value
            )
            .map_err(dashboard_io)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(dashboard_io)
    }
}

/// Boxed key/value table, one per record.
pub struct HumanSink {
    out: Box<dyn Write + Send>,
}

impl HumanSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

fn truncate_key(key: &str) -> String {
    if key.chars().count() > MAX_KEY_WIDTH {
        let head: String = key.chars().take(MAX_KEY_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        key.to_string()
    }
}

fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e5).contains(&magnitude) {
        format!("{value:.4}")
    } else {
        format!("{value:.3e}")
    }
}

pub(crate) fn render_table(entries: &BTreeMap<String, f64>) -> String {
    let rows: Vec<(String, String)> = entries
        .iter()
        .map(|(key, value)| (truncate_key(key), format_value(*value)))
        .collect();
    let key_width = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    let value_width = rows.iter().map(|(_, v)| v.chars().count()).max().unwrap_or(0);
    let dashes = "-".repeat(key_width + value_width + 7);

    let mut table = String::new();
    table.push_str(&dashes);
    table.push('\n');
    for (key, value) in rows {
        table.push_str(&format!("| {key:<key_width$} | {value:<value_width$} |\n"));
    }
    table.push_str(&dashes);
    table.push('\n');
    table
}

impl MetricSink for HumanSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn write(&mut self, record: &Record) -> Result<(), TrainingError> {
        let table = render_table(&record.entries());
        self.out.write_all(table.as_bytes()).map_err(dashboard_io)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.out.flush().map_err(dashboard_io)
    }
}

/// Scalars as TensorBoard event records, tagged `{ns}/{key}` at the record's step.
pub struct TensorBoardSink {
    writer: TensorBoardWriter,
}

impl TensorBoardSink {
    pub fn create(dir: &Path) -> Result<Self, TrainingError> {
        Ok(Self {
            writer: TensorBoardWriter::create(dir, 32)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

impl MetricSink for TensorBoardSink {
    fn name(&self) -> &'static str {
        "tensorboard"
    }

    fn write(&mut self, record: &Record) -> Result<(), TrainingError> {
        let step = record.step as i64;
        for (key, value) in &record.values {
            let tag = format!("{}/{}", record.namespace, key);
            self.writer.write_scalar(&tag, step, *value)?;
        }
        self.writer.write_scalar("epoch", step, record.epoch as f64)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()
    }
}

fn open_append(path: &Path) -> Result<File, TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(dashboard_io)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| TrainingError::Dashboard(format!("failed to open {}: {err}", path.display())))
}

fn dashboard_io(err: io::Error) -> TrainingError {
    TrainingError::Dashboard(err.to_string())
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::Dashboard(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::Dashboard(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::Dashboard(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&masked_crc32(&data).to_le_bytes()))
            .map_err(|err| {
                TrainingError::Dashboard(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(dashboard_io)?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample_metrics() -> MetricMap {
        let mut metrics = MetricMap::new();
        metrics.insert("loss".to_string(), 0.5);
        metrics
    }

    #[test]
    fn records_carry_step_and_epoch_keys() {
        let record = Record {
            namespace: "val".into(),
            step: 12,
            epoch: 3,
            values: sample_metrics(),
        };
        let entries = record.entries();
        assert_eq!(entries["val/loss"], 0.5);
        assert_eq!(entries["val/step"], 12.0);
        assert_eq!(entries["epoch"], 3.0);
    }

    #[test]
    fn memory_sink_is_shared_between_clones() -> Result<(), TrainingError> {
        let sink = MemorySink::new();
        let mut logger = RunLogger::new("abc.simclr.bigearthnet.seed00", vec![Box::new(sink.clone())]);
        logger.log("train", &sample_metrics(), 4, 0)?;
        logger.log("val", &sample_metrics(), 4, 0)?;
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.namespace("val")[0].step, 4);
        assert_eq!(logger.group(), "abc.simclr.bigearthnet");
        Ok(())
    }

    #[test]
    fn file_sinks_append_lines() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let mut logger = RunLogger::open(
            "run",
            &[LogFormat::Json, LogFormat::Csv, LogFormat::Tensorboard],
            dir.path(),
        )?;
        logger.log("train", &sample_metrics(), 1, 0)?;
        logger.log("train", &sample_metrics(), 2, 0)?;
        logger.flush()?;

        let jsonl = fs::read_to_string(dir.path().join("progress.jsonl"))?;
        assert_eq!(jsonl.lines().count(), 2);
        let first: BTreeMap<String, f64> = serde_json::from_str(
            jsonl.lines().next().unwrap_or_default(),
        )?;
        assert_eq!(first["train/step"], 1.0);

        let csv = fs::read_to_string(dir.path().join("progress.csv"))?;
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(2).unwrap_or_default().starts_with("train,2,0,loss,"));

        let tb_files = fs::read_dir(dir.path().join("tb"))?.count();
        assert_eq!(tb_files, 1);
        Ok(())
    }

    #[test]
    fn tensorboard_records_land_in_event_file() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let mut sink = TensorBoardSink::create(dir.path())?;
        assert!(sink.path().starts_with(dir.path()));
        let name = sink
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        assert!(name.starts_with("events.out.tfevents."));

        sink.write(&Record {
            namespace: "val".into(),
            step: 3,
            epoch: 1,
            values: sample_metrics(),
        })?;
        sink.flush()?;
        assert!(fs::metadata(sink.path())?.len() > 0);
        Ok(())
    }

    #[test]
    fn long_keys_are_truncated_in_tables() {
        let mut entries = BTreeMap::new();
        entries.insert("k".repeat(50), 1.0);
        let table = render_table(&entries);
        let row = table.lines().nth(1).unwrap_or_default();
        assert!(row.contains(&format!("{}...", "k".repeat(40))));
        assert!(!row.contains(&"k".repeat(41)));
    }

    #[test]
    fn retry_keeps_trying_until_connected() -> Result<(), TrainingError> {
        let attempts = AtomicUsize::new(0);
        let shutdown = AtomicBool::new(false);
        let logger = connect_with_retry(
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TrainingError::Dashboard("offline".into()))
                } else {
                    Ok(RunLogger::disabled())
                }
            },
            Duration::from_millis(1),
            &shutdown,
        )?;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(logger.sink_names().is_empty());
        Ok(())
    }
}

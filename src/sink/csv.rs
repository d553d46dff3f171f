use super::{SampleSink, SinkError};
use crate::labels::{Action, HandOption};
use crate::messages::StopReason;
use crate::sensor::SamplePair;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

/// Labels stamped on every row of a training session
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMetadata {
    pub action: Action,
    pub alias: String,
    pub user: String,
    pub hand: HandOption,
    pub samples_per_packet: usize,
}

impl TrainingMetadata {
    /// One CSV row: `timestamp,action,session,user,hand,samplesPerPacket,accX..gyroZ`
    pub fn row(&self, timestamp: u64, pair: &SamplePair) -> String {
        let [ax, ay, az, gx, gy, gz] = pair.to_array();
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            timestamp,
            self.action,
            self.alias,
            self.user,
            self.hand,
            self.samples_per_packet,
            ax,
            ay,
            az,
            gx,
            gy,
            gz
        )
    }
}

enum CsvCommand {
    Write(Vec<SamplePair>),
    Finalize { reply: oneshot::Sender<Result<u64>> },
}

struct OpenFile {
    path: PathBuf,
    tx: mpsc::UnboundedSender<CsvCommand>,
    error: Arc<Mutex<Option<String>>>,
    queued: u64,
}

/// Training session writer, one CSV file per session
///
/// Rows are formatted and written on a dedicated thread so the session task
/// never blocks on disk I/O. A write failure on that thread is reported on
/// the next `write_samples` call, so a session may have counted samples that
/// never reached the file. `finalize` compares the rows written against the
/// samples accepted and fails if any are missing.
pub struct CsvSink {
    dir: PathBuf,
    metadata: TrainingMetadata,
    file: Option<OpenFile>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>, metadata: TrainingMetadata) -> Self {
        Self {
            dir: dir.into(),
            metadata,
            file: None,
        }
    }

    pub fn metadata(&self) -> &TrainingMetadata {
        &self.metadata
    }

    /// Path of the file for the running session, if any
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|file| file.path.as_path())
    }

    /// Whether some session file in `dir` already carries `alias`
    pub fn alias_exists(dir: &Path, alias: &str) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };

        entries.flatten().any(|entry| {
            let path = entry.path();
            path.extension().is_some_and(|ext| ext == "csv")
                && path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.split_once('_'))
                    .is_some_and(|(_, existing)| existing == alias)
        })
    }

    fn create(&self) -> Result<(PathBuf, File)> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create sessions dir {:?}", self.dir))?;

        let path = self
            .dir
            .join(format!("{}_{}.csv", unix_seconds(), self.metadata.alias));
        let file =
            File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;

        Ok((path, file))
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn spawn_writer<W>(
    mut writer: W,
    metadata: TrainingMetadata,
    error: Arc<Mutex<Option<String>>>,
) -> mpsc::UnboundedSender<CsvCommand>
where
    W: Write + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut rows = 0u64;
        let mut failed = false;

        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                CsvCommand::Write(pairs) => {
                    if failed {
                        continue;
                    }
                    let timestamp = unix_seconds();
                    for pair in &pairs {
                        if let Err(e) = writeln!(writer, "{}", metadata.row(timestamp, pair)) {
                            tracing::error!("Failed to write CSV row: {}", e);
                            *error.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(e.to_string());
                            failed = true;
                            break;
                        }
                        rows += 1;
                    }
                }
                CsvCommand::Finalize { reply } => {
                    let result = writer
                        .flush()
                        .map(|_| rows)
                        .context("Failed to flush CSV file");
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    });

    tx
}

#[async_trait]
impl SampleSink for CsvSink {
    async fn open(&mut self) -> Result<(), StopReason> {
        if self.file.is_some() {
            tracing::warn!("CSV sink reopened without finalize, abandoning previous file");
            self.file = None;
        }

        if Self::alias_exists(&self.dir, &self.metadata.alias) {
            tracing::warn!("A session named {} already exists", self.metadata.alias);
            return Err(StopReason::CsvFileAlreadyExists);
        }

        let (path, file) = self.create().map_err(|e| {
            tracing::error!("{:#}", e);
            StopReason::CsvFileNotCreated
        })?;
        tracing::info!("CSV file created: {:?}", path);

        let error = Arc::new(Mutex::new(None));
        let tx = spawn_writer(BufWriter::new(file), self.metadata.clone(), error.clone());
        self.file = Some(OpenFile {
            path,
            tx,
            error,
            queued: 0,
        });
        Ok(())
    }

    fn write_samples(&mut self, samples: &[SamplePair]) -> Result<(), SinkError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Write("no session file open".into()))?;

        if let Some(e) = file
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(SinkError::Write(e));
        }

        file.tx
            .send(CsvCommand::Write(samples.to_vec()))
            .map_err(|_| SinkError::Write("CSV writer thread exited".into()))?;
        file.queued += samples.len() as u64;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        file.tx
            .send(CsvCommand::Finalize { reply })
            .map_err(|e| anyhow::anyhow!("Failed to send finalize command: {}", e))?;

        let rows = rx
            .await
            .map_err(|e| anyhow::anyhow!("Failed to receive finalize response: {}", e))??;

        if rows < file.queued {
            anyhow::bail!(
                "Only {} of {} samples reached {:?}",
                rows,
                file.queued,
                file.path
            );
        }

        if rows == 0 {
            std::fs::remove_file(&file.path)
                .with_context(|| format!("Failed to delete empty {:?}", file.path))?;
            tracing::info!("CSV file deleted: {:?}", file.path);
        } else {
            tracing::info!("CSV file closed with {} rows: {:?}", rows, file.path);
        }

        Ok(())
    }
}

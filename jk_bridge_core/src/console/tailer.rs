use std::{
    fmt::Write as _,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Local};
use event_loop::{try_get, Handled, Is, Message, MessageHandler};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
};

use super::RawLogLine;
use crate::{rcon::decode_latin1, state::BridgeState};

pub const IDLE_SLEEP: Duration = Duration::from_millis(100);
pub const MISSING_FILE_BACKOFF: Duration = Duration::from_secs(5);
/// Idle reads between checks for rollover or truncation.
const ROTATION_CHECK_EVERY: u32 = 20;

/// Where the active log lives. The file name may carry chrono specifiers
/// (`games-%Y-%m-%d.log`) and is re-resolved whenever the tailer reopens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPath {
    base: PathBuf,
    file_name: String,
}

impl LogPath {
    #[must_use]
    pub const fn new(base: PathBuf, file_name: String) -> Self {
        Self { base, file_name }
    }

    #[must_use]
    pub fn resolve(&self, now: DateTime<Local>) -> PathBuf {
        if !self.file_name.contains('%') {
            return self.base.join(&self.file_name);
        }

        let mut name = String::new();
        if write!(name, "{}", now.format(&self.file_name)).is_err() {
            tracing::warn!("Invalid date pattern in log file name {:?}", self.file_name);
            return self.base.join(&self.file_name);
        }
        self.base.join(name)
    }
}

/// Owns at most one background read loop. Dropping the tailer stops it.
pub struct LogTailer {
    sender: UnboundedSender<RawLogLine>,
    task: Option<(LogPath, JoinHandle<()>)>,
    idle: Duration,
    backoff: Duration,
}

impl LogTailer {
    #[must_use]
    pub const fn new(sender: UnboundedSender<RawLogLine>) -> Self {
        Self {
            sender,
            task: None,
            idle: IDLE_SLEEP,
            backoff: MISSING_FILE_BACKOFF,
        }
    }

    #[must_use]
    pub const fn with_timing(mut self, idle: Duration, backoff: Duration) -> Self {
        self.idle = idle;
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Does nothing if a loop is already running.
    pub fn start(&mut self, path: LogPath) {
        if self.is_running() {
            tracing::debug!("Log tailer already running.");
            return;
        }

        tracing::info!("Tailing {:?}", path.resolve(Local::now()));
        let handle = tokio::task::spawn(tail(
            path.clone(),
            self.sender.clone(),
            self.idle,
            self.backoff,
        ));
        self.task = Some((path, handle));
    }

    /// Aborting drops the file handle at the loop's current await point.
    pub fn stop(&mut self) {
        if let Some((_, handle)) = self.task.take() {
            handle.abort();
            tracing::debug!("Log tailer stopped.");
        }
    }

    pub fn restart(&mut self, path: LogPath) {
        self.stop();
        self.start(path);
    }

    #[must_use]
    pub fn path(&self) -> Option<&LogPath> {
        self.task.as_ref().map(|(path, _)| path)
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Reopen {
    FromStart,
    Stop,
}

async fn tail(
    path: LogPath,
    sender: UnboundedSender<RawLogLine>,
    idle: Duration,
    backoff: Duration,
) {
    // History is skipped only for the file that already exists at startup.
    let mut skip_history = true;
    let mut reported_missing = false;

    loop {
        let file_path = path.resolve(Local::now());
        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                if !reported_missing {
                    tracing::warn!("Couldn't open log file {file_path:?} ({e}), retrying.");
                    reported_missing = true;
                }
                skip_history = false;
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        reported_missing = false;

        match read_lines(file, &file_path, &path, skip_history, &sender, idle).await {
            Reopen::Stop => return,
            Reopen::FromStart => {
                skip_history = false;
                tokio::time::sleep(idle).await;
            }
        }
    }
}

async fn read_lines(
    file: File,
    file_path: &Path,
    path: &LogPath,
    skip_history: bool,
    sender: &UnboundedSender<RawLogLine>,
    idle: Duration,
) -> Reopen {
    let mut reader = BufReader::new(file);
    let mut position = if skip_history {
        match reader.seek(SeekFrom::End(0)).await {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!("Couldn't seek in {file_path:?}: {e}");
                return Reopen::FromStart;
            }
        }
    } else {
        0
    };

    let mut buf = Vec::new();
    let mut idle_reads = 0u32;
    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                idle_reads = idle_reads.wrapping_add(1);
                if idle_reads % ROTATION_CHECK_EVERY == 0 && replaced(file_path, path, position).await
                {
                    tracing::info!("Log file {file_path:?} was replaced, reopening.");
                    return Reopen::FromStart;
                }
                tokio::time::sleep(idle).await;
            }
            Ok(n) => {
                idle_reads = 0;
                position += n as u64;
                // A partial line stays in the buffer until the rest arrives.
                if buf.last() != Some(&b'\n') {
                    continue;
                }

                let line = decode_latin1(&buf);
                buf.clear();
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                if sender.send(RawLogLine(line.to_owned())).is_err() {
                    tracing::debug!("Log line receiver closed, stopping tailer.");
                    return Reopen::Stop;
                }
            }
            Err(e) => {
                tracing::warn!("Failed reading {file_path:?}: {e}");
                return Reopen::FromStart;
            }
        }
    }
}

/// Date rollover, deletion, or truncation.
async fn replaced(file_path: &Path, path: &LogPath, position: u64) -> bool {
    if path.resolve(Local::now()) != file_path {
        return true;
    }
    match tokio::fs::metadata(file_path).await {
        Ok(meta) => meta.len() < position,
        Err(_) => true,
    }
}

// Messages *************************

/// Restarts the tailer against the current settings.
#[derive(Debug, Clone, Copy)]
pub struct ReloadTailer;
impl<S> Message<S> for ReloadTailer {}

// Handlers *************************

pub struct TailerControl {
    tailer: LogTailer,
}

impl TailerControl {
    #[must_use]
    pub const fn new(tailer: LogTailer) -> Self {
        Self { tailer }
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for TailerControl
where
    IM: Is<ReloadTailer>,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        try_get::<ReloadTailer>(message)?;

        match state.settings.log_path() {
            Some(path) => self.tailer.restart(path),
            None => {
                tracing::warn!("Log base path not set, log monitoring is paused.");
                self.tailer.stop();
            }
        }
        Handled::none()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::TimeZone;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;

    const FAST: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(3);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("write log");
    }

    async fn next(rx: &mut UnboundedReceiver<RawLogLine>) -> Option<String> {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .ok()
            .flatten()
            .map(|RawLogLine(line)| line)
    }

    #[test]
    fn resolves_dated_names() {
        let path = LogPath::new("/srv/jka".into(), "games-%Y-%m-%d.log".into());
        let day = Local
            .with_ymd_and_hms(2024, 3, 9, 12, 0, 0)
            .single()
            .expect("valid date");
        assert_eq!(path.resolve(day), PathBuf::from("/srv/jka/games-2024-03-09.log"));

        let fixed = LogPath::new("/srv/jka".into(), "qconsole.log".into());
        assert_eq!(fixed.resolve(day), PathBuf::from("/srv/jka/qconsole.log"));
    }

    #[tokio::test]
    async fn skips_history_and_reads_new_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "old line\n");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        append(&file, "say: Kyle: hi\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("say: Kyle: hi"));
    }

    #[tokio::test]
    async fn starting_twice_runs_one_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        let path = LogPath::new(dir.path().into(), "qconsole.log".into());
        tailer.start(path.clone());
        tailer.start(path);
        assert!(tailer.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;

        append(&file, "once\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("once"));
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn waits_for_missing_file_and_reads_it_from_the_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        append(&dir.path().join("qconsole.log"), "first\nsecond\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("first"));
        assert_eq!(next(&mut rx).await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn partial_lines_wait_for_their_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        append(&file, "say: Kyle: hel");
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&file, "lo\r\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("say: Kyle: hello"));
    }

    #[tokio::test]
    async fn truncated_file_is_read_again_from_the_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "a long line of history the tailer skips past\n");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&file, "").expect("truncate log");
        tokio::time::sleep(Duration::from_millis(500)).await;

        append(&file, "fresh\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn deleted_file_is_reopened_when_it_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "history\n");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::remove_file(&file).expect("remove log");
        tokio::time::sleep(Duration::from_millis(500)).await;

        append(&file, "first\nsecond\n");
        assert_eq!(next(&mut rx).await.as_deref(), Some("first"));
        assert_eq!(next(&mut rx).await.as_deref(), Some("second"));
        assert!(tailer.is_running());
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("qconsole.log");
        append(&file, "");

        let (tx, mut rx) = unbounded_channel();
        let mut tailer = LogTailer::new(tx).with_timing(FAST, FAST);
        tailer.start(LogPath::new(dir.path().into(), "qconsole.log".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tailer.stop();
        assert!(!tailer.is_running());

        append(&file, "ignored\n");
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err());
    }
}

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::converter::ffmpeg::{self, ProgressTracker};
use crate::converter::{ConversionEvent, ConversionSettings, JobState, CANCELLED_MESSAGE};
use crate::errors::{AppError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A job event tagged with the job that produced it.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub event: ConversionEvent,
}

/// Runtime parameters shared by every job of a registry.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub ffmpeg_path: PathBuf,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    pub limiter: Option<Arc<Semaphore>>,
}

impl JobOptions {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            limiter: None,
        }
    }
}

enum Outcome {
    Succeeded,
    Cancelled,
    Failed(String),
}

/// One FFmpeg run for a single input file.
pub struct ConversionJob {
    id: Uuid,
    input: PathBuf,
    output: PathBuf,
    settings: ConversionSettings,
    options: JobOptions,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<JobMessage>,
}

/// Control side of a started job.
pub struct JobHandle {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<JobState>,
}

impl JobHandle {
    /// Requests cancellation; observed at the job's next poll tick.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> JobState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                log::error!("Conversion task {} panicked: {}", self.id, e);
                JobState::Failed
            }
        }
    }
}

impl ConversionJob {
    pub fn new(
        input: PathBuf,
        output: PathBuf,
        settings: ConversionSettings,
        options: JobOptions,
        events: mpsc::UnboundedSender<JobMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            input,
            output,
            settings,
            options,
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Moves the job onto its own task and returns immediately.
    pub fn start(self) -> JobHandle {
        let id = self.id;
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        JobHandle { id, cancel, task }
    }

    async fn run(self) -> JobState {
        let outcome = match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e.to_string()),
        };

        let (state, event) = match outcome {
            Outcome::Succeeded => {
                log::info!("Converted {:?} -> {:?}", self.input, self.output);
                self.emit(ConversionEvent::Progress { input: self.input.clone(), percent: 100 });
                (JobState::Succeeded, ConversionEvent::Succeeded {
                    input: self.input.clone(),
                    output: self.output.clone(),
                })
            }
            Outcome::Cancelled => {
                log::info!("{}: {:?}", CANCELLED_MESSAGE, self.input);
                (JobState::Cancelled, ConversionEvent::Cancelled { input: self.input.clone() })
            }
            Outcome::Failed(message) => {
                log::error!("Conversion of {:?} failed: {}", self.input, message);
                (JobState::Failed, ConversionEvent::Failed { input: self.input.clone(), message })
            }
        };

        self.emit(event);
        state
    }

    async fn execute(&self) -> Result<Outcome> {
        let ffmpeg_path = &self.options.ffmpeg_path;
        if !ffmpeg_path.is_file() {
            return Err(AppError::FfmpegNotFound(ffmpeg_path.display().to_string()));
        }

        let _permit = match &self.options.limiter {
            Some(limiter) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Outcome::Cancelled),
                permit = limiter.clone().acquire_owned() => Some(
                    permit.map_err(|e| AppError::Registry(format!("Job limiter closed: {}", e)))?,
                ),
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        log::debug!(
            "Starting FFmpeg for {:?} ({} Hz, {} channel(s))",
            self.input,
            self.settings.sample_rate,
            self.settings.channels()
        );

        let mut child = Command::new(ffmpeg_path)
            .args(ffmpeg::build_args(&self.input, &self.output, &self.settings))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| {
                AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "FFmpeg stderr was not captured",
                ))
            })?;

        self.emit(ConversionEvent::Started { input: self.input.clone() });

        let events = self.events.clone();
        let job_id = self.id;
        let input = self.input.clone();
        let reader = tokio::spawn(read_diagnostics(stderr, move |percent| {
            let _ = events.send(JobMessage {
                job_id,
                event: ConversionEvent::Progress { input: input.clone(), percent },
            });
        }));

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        let status = loop {
            ticker.tick().await;

            // checked before liveness so a cancelled job never reports success
            if self.cancel.is_cancelled() {
                terminate(&mut child).await;
                reader.abort();
                let _ = reader.await;
                return Ok(Outcome::Cancelled);
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if let Some(limit) = self.options.timeout {
                if started.elapsed() >= limit {
                    terminate(&mut child).await;
                    reader.abort();
                    let _ = reader.await;
                    return Ok(Outcome::Failed(format!(
                        "Conversion timed out after {} seconds",
                        limit.as_secs_f64()
                    )));
                }
            }
        };

        log::debug!("FFmpeg for {:?} exited with {}", self.input, status);

        let diagnostics = match reader.await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                log::warn!("Failed to read FFmpeg output for {:?}: {}", self.input, e);
                String::new()
            }
            Err(e) => {
                log::warn!("FFmpeg output reader for {:?} stopped: {}", self.input, e);
                String::new()
            }
        };

        if status.success() {
            Ok(Outcome::Succeeded)
        } else {
            Ok(Outcome::Failed(ffmpeg::extract_error_message(&diagnostics, status)))
        }
    }

    fn emit(&self, event: ConversionEvent) {
        if self.events.send(JobMessage { job_id: self.id, event }).is_err() {
            log::debug!("Event receiver for job {} is gone", self.id);
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill FFmpeg process: {}", e);
    }
}

/// Collects the whole stream while feeding `\r`/`\n` separated lines to a
/// [`ProgressTracker`].
async fn read_diagnostics<R, F>(mut stream: R, mut on_progress: F) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
    F: FnMut(u8),
{
    let mut tracker = ProgressTracker::new();
    let mut collected = Vec::new();
    let mut line = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);

        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                if !line.is_empty() {
                    if let Some(percent) = tracker.observe(&String::from_utf8_lossy(&line)) {
                        on_progress(percent);
                    }
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
    }

    if !line.is_empty() {
        if let Some(percent) = tracker.observe(&String::from_utf8_lossy(&line)) {
            on_progress(percent);
        }
    }

    Ok(String::from_utf8_lossy(&collected).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diagnostics_split_on_carriage_returns() {
        let stderr: &[u8] = b"  Duration: 00:00:10.00, start: 0.0\n\
            size=1kB time=00:00:02.00 x\rsize=2kB time=00:00:08.00 x\r";
        let mut seen = Vec::new();
        let text = read_diagnostics(stderr, |p| seen.push(p)).await.unwrap();
        assert_eq!(seen, vec![20, 80]);
        assert!(text.contains("Duration"));
    }

    #[tokio::test]
    async fn missing_binary_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = ConversionJob::new(
            PathBuf::from("b.mp3"),
            dir.path().join("b.wav"),
            ConversionSettings::default(),
            JobOptions::new(dir.path().join("bin").join("ffmpeg")),
            tx,
        );

        assert_eq!(job.start().wait().await, JobState::Failed);
        let message = rx.recv().await.unwrap();
        match message.event {
            ConversionEvent::Failed { input, message } => {
                assert_eq!(input, PathBuf::from("b.mp3"));
                assert!(message.contains("FFmpeg not found"), "{}", message);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::converter::testing::{fake_ffmpeg, fast_options, recorded_args};

        fn job(
            options: JobOptions,
            input: &str,
            output: PathBuf,
        ) -> (ConversionJob, mpsc::UnboundedReceiver<JobMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let settings = ConversionSettings::default();
            (ConversionJob::new(PathBuf::from(input), output, settings, options, tx), rx)
        }

        fn drain(rx: &mut mpsc::UnboundedReceiver<JobMessage>) -> Vec<ConversionEvent> {
            let mut events = Vec::new();
            while let Ok(message) = rx.try_recv() {
                events.push(message.event);
            }
            events
        }

        #[tokio::test]
        async fn success_passes_exact_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(dir.path(), "exit 0");
            let output = dir.path().join("a.wav");
            let (job, mut rx) = job(fast_options(ffmpeg), "a.wav", output.clone());

            assert_eq!(job.start().wait().await, JobState::Succeeded);

            let events = drain(&mut rx);
            assert_eq!(
                events,
                vec![
                    ConversionEvent::Started { input: PathBuf::from("a.wav") },
                    ConversionEvent::Progress { input: PathBuf::from("a.wav"), percent: 100 },
                    ConversionEvent::Succeeded {
                        input: PathBuf::from("a.wav"),
                        output: output.clone(),
                    },
                ]
            );

            let output = output.to_string_lossy().to_string();
            assert_eq!(
                recorded_args(dir.path()),
                vec![
                    "-i", "a.wav", "-ar", "8000", "-ac", "1",
                    "-acodec", "pcm_mulaw", "-f", "wav", "-y", output.as_str(),
                ]
            );
        }

        #[tokio::test]
        async fn non_zero_exit_reports_error_line() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(
                dir.path(),
                "echo 'Input #0, ogg' >&2\n\
                 echo '[ogg @ 0x55] Error parsing header' >&2\n\
                 echo 'Conversion failed!' >&2\n\
                 exit 1",
            );
            let (job, mut rx) = job(fast_options(ffmpeg), "d.ogg", dir.path().join("d.wav"));

            assert_eq!(job.start().wait().await, JobState::Failed);
            assert_eq!(
                drain(&mut rx),
                vec![
                    ConversionEvent::Started { input: PathBuf::from("d.ogg") },
                    ConversionEvent::Failed {
                        input: PathBuf::from("d.ogg"),
                        message: "[ogg @ 0x55] Error parsing header".to_string(),
                    },
                ]
            );
        }

        #[tokio::test]
        async fn progress_is_parsed_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(
                dir.path(),
                "echo '  Duration: 00:00:10.00, start: 0.000000' >&2\n\
                 echo 'size=1kB time=00:00:05.00 bitrate=8kbits/s' >&2\n\
                 exit 0",
            );
            let (job, mut rx) = job(fast_options(ffmpeg), "p.flac", dir.path().join("p.wav"));

            assert_eq!(job.start().wait().await, JobState::Succeeded);
            let percents: Vec<u8> = drain(&mut rx)
                .into_iter()
                .filter_map(|event| match event {
                    ConversionEvent::Progress { percent, .. } => Some(percent),
                    _ => None,
                })
                .collect();
            assert_eq!(percents, vec![50, 100]);
        }

        #[tokio::test]
        async fn cancel_kills_running_process() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(dir.path(), "exec sleep 10");
            let (job, mut rx) = job(fast_options(ffmpeg), "c.flac", dir.path().join("c.wav"));

            let handle = job.start();
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();

            let state = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
            assert_eq!(state, JobState::Cancelled);
            assert_eq!(
                drain(&mut rx),
                vec![
                    ConversionEvent::Started { input: PathBuf::from("c.flac") },
                    ConversionEvent::Cancelled { input: PathBuf::from("c.flac") },
                ]
            );
        }

        #[tokio::test]
        async fn queued_job_cancels_without_spawning() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(dir.path(), "exit 0");
            let mut options = fast_options(ffmpeg);
            options.limiter = Some(Arc::new(Semaphore::new(0)));
            let (job, mut rx) = job(options, "q.mp3", dir.path().join("q.wav"));

            let handle = job.start();
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();

            assert_eq!(handle.wait().await, JobState::Cancelled);
            assert_eq!(
                drain(&mut rx),
                vec![ConversionEvent::Cancelled { input: PathBuf::from("q.mp3") }]
            );
            assert!(!dir.path().join("args.txt").exists());
        }

        #[tokio::test]
        async fn hung_process_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_ffmpeg(dir.path(), "exec sleep 10");
            let mut options = fast_options(ffmpeg);
            options.timeout = Some(Duration::from_millis(200));
            let (job, mut rx) = job(options, "h.wav", dir.path().join("h_out.wav"));

            let state = tokio::time::timeout(Duration::from_secs(5), job.start().wait())
                .await
                .unwrap();
            assert_eq!(state, JobState::Failed);
            match drain(&mut rx).pop() {
                Some(ConversionEvent::Failed { message, .. }) => {
                    assert!(message.contains("timed out"), "{}", message)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}

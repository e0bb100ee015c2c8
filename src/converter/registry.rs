use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use uuid::Uuid;
use crate::converter::job::{
    ConversionJob, JobHandle, JobMessage, JobOptions, DEFAULT_POLL_INTERVAL,
};
use crate::converter::{BatchSummary, ConversionEvent, ConversionSettings, JobState};
use crate::errors::{AppError, Result};
use crate::utils::{output_path_for, unique_output_path};

/// Registry-wide knobs, usually built from [`crate::config::AppConfig`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub ffmpeg_path: PathBuf,
    /// `0` means no limit.
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
}

impl RegistryOptions {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            max_concurrent_jobs: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_timeout: None,
        }
    }

    fn job_options(&self) -> JobOptions {
        JobOptions {
            ffmpeg_path: self.ffmpeg_path.clone(),
            poll_interval: self.poll_interval,
            timeout: self.job_timeout,
            limiter: (self.max_concurrent_jobs > 0)
                .then(|| Arc::new(Semaphore::new(self.max_concurrent_jobs))),
        }
    }
}

enum RegistryCommand {
    Submit {
        input: PathBuf,
        output: PathBuf,
        settings: Option<ConversionSettings>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Cancel {
        input: PathBuf,
        reply: oneshot::Sender<Option<oneshot::Receiver<JobState>>>,
    },
    Clear {
        reply: oneshot::Sender<Vec<oneshot::Receiver<JobState>>>,
    },
    UpdateSettings {
        settings: ConversionSettings,
        reply: oneshot::Sender<Result<()>>,
    },
    Settings {
        reply: oneshot::Sender<ConversionSettings>,
    },
    ActiveJobs {
        reply: oneshot::Sender<Vec<(PathBuf, JobState)>>,
    },
}

struct ActiveJob {
    id: Uuid,
    state: JobState,
    handle: JobHandle,
    waiters: Vec<oneshot::Sender<JobState>>,
}

/// Owner of every in-flight conversion.
///
/// Runs as a single task: it is the only code that touches the job index.
/// Jobs report back through a channel and the shell talks to it through a
/// [`RegistryHandle`].
pub struct JobRegistry {
    jobs: HashMap<PathBuf, ActiveJob>,
    settings: ConversionSettings,
    job_options: JobOptions,
    job_tx: mpsc::UnboundedSender<JobMessage>,
    events: mpsc::UnboundedSender<ConversionEvent>,
    batch: Option<BatchSummary>,
    /// Output files handed out since the current batch began.
    claimed_outputs: HashSet<PathBuf>,
}

/// Cloneable front end of a running [`JobRegistry`].
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl JobRegistry {
    /// Starts the registry task. Events for the shell arrive on the returned
    /// receiver; the task exits once every handle is dropped and the remaining
    /// jobs have been cancelled.
    pub fn spawn(
        options: RegistryOptions,
        settings: ConversionSettings,
    ) -> Result<(RegistryHandle, mpsc::UnboundedReceiver<ConversionEvent>)> {
        settings.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let registry = JobRegistry {
            jobs: HashMap::new(),
            settings,
            job_options: options.job_options(),
            job_tx,
            events: event_tx,
            batch: None,
            claimed_outputs: HashSet::new(),
        };

        tokio::spawn(registry.run(command_rx, job_rx));

        Ok((RegistryHandle { commands: command_tx }, event_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RegistryCommand>,
        mut job_rx: mpsc::UnboundedReceiver<JobMessage>,
    ) {
        let mut accepting = true;

        loop {
            tokio::select! {
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        accepting = false;
                        if !self.jobs.is_empty() {
                            log::info!(
                                "Registry handles dropped, cancelling {} job(s)",
                                self.jobs.len()
                            );
                        }
                        for job in self.jobs.values() {
                            job.handle.cancel();
                        }
                    }
                },
                Some(message) = job_rx.recv() => self.handle_job_message(message),
            }

            if !accepting && self.jobs.is_empty() {
                break;
            }
        }

        log::debug!("Job registry stopped");
    }

    fn handle_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Submit { input, output, settings, reply } => {
                let settings = settings.unwrap_or(self.settings);
                let _ = reply.send(self.submit(input, output, settings));
            }
            RegistryCommand::Cancel { input, reply } => {
                let waiter = self.jobs.get_mut(&input).map(|job| {
                    log::info!("Cancelling conversion of {:?}", input);
                    job.handle.cancel();
                    let (tx, rx) = oneshot::channel();
                    job.waiters.push(tx);
                    rx
                });
                let _ = reply.send(waiter);
            }
            RegistryCommand::Clear { reply } => {
                log::info!("Clearing {} job(s)", self.jobs.len());
                let waiters: Vec<oneshot::Receiver<JobState>> = self
                    .jobs
                    .values_mut()
                    .map(|job| {
                        job.handle.cancel();
                        let (tx, rx) = oneshot::channel();
                        job.waiters.push(tx);
                        rx
                    })
                    .collect();
                let _ = reply.send(waiters);
            }
            RegistryCommand::UpdateSettings { settings, reply } => {
                let result = settings.validate().map(|_| {
                    log::info!(
                        "Settings updated: {} Hz, {}",
                        settings.sample_rate,
                        if settings.mono { "mono" } else { "stereo" }
                    );
                    self.settings = settings;
                });
                let _ = reply.send(result);
            }
            RegistryCommand::Settings { reply } => {
                let _ = reply.send(self.settings);
            }
            RegistryCommand::ActiveJobs { reply } => {
                let mut jobs: Vec<(PathBuf, JobState)> = self
                    .jobs
                    .iter()
                    .map(|(path, job)| (path.clone(), job.state))
                    .collect();
                jobs.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(jobs);
            }
        }
    }

    fn submit(
        &mut self,
        input: PathBuf,
        output: PathBuf,
        settings: ConversionSettings,
    ) -> Result<bool> {
        settings.validate()?;

        if self.jobs.contains_key(&input) {
            log::debug!("{:?} is already being converted, ignoring", input);
            return Ok(false);
        }

        if self.batch.is_none() {
            self.batch = Some(BatchSummary::new());
        }

        let claimed = &self.claimed_outputs;
        let resolved = unique_output_path(&input, output.clone(), |path| claimed.contains(path));
        if resolved != output {
            log::info!("{:?} is already an output of this batch, writing {:?}", output, resolved);
        }
        self.claimed_outputs.insert(resolved.clone());
        let output = resolved;

        let job = ConversionJob::new(
            input.clone(),
            output,
            settings,
            self.job_options.clone(),
            self.job_tx.clone(),
        );
        let id = job.id();
        log::info!("Queued conversion of {:?} (job {})", input, id);

        let handle = job.start();
        self.jobs.insert(input, ActiveJob {
            id,
            state: JobState::Queued,
            handle,
            waiters: Vec::new(),
        });
        Ok(true)
    }

    fn handle_job_message(&mut self, message: JobMessage) {
        let JobMessage { job_id, event } = message;
        let Some(input) = event.input().cloned() else {
            return;
        };

        let Some(job) = self.jobs.get_mut(&input).filter(|job| job.id == job_id) else {
            log::debug!("Dropping event from stale job {}", job_id);
            return;
        };

        if !event.is_terminal() {
            if matches!(event, ConversionEvent::Started { .. }) {
                job.state = JobState::Running;
            }
            self.forward(event);
            return;
        }

        self.finish(input, event);
    }

    fn finish(&mut self, input: PathBuf, event: ConversionEvent) {
        let Some(job) = self.jobs.remove(&input) else {
            return;
        };

        let batch = self.batch.get_or_insert_with(BatchSummary::new);
        let state = match &event {
            ConversionEvent::Succeeded { .. } => {
                batch.succeeded.push(input);
                JobState::Succeeded
            }
            ConversionEvent::Failed { message, .. } => {
                batch.failed.push((input, message.clone()));
                JobState::Failed
            }
            _ => {
                batch.cancelled.push(input);
                JobState::Cancelled
            }
        };

        self.forward(event);

        if self.jobs.is_empty() {
            if let Some(mut summary) = self.batch.take() {
                summary.finished_at = chrono::Utc::now();
                log::info!(
                    "Batch of {} complete: {} succeeded, {} failed, {} cancelled",
                    summary.total(),
                    summary.succeeded.len(),
                    summary.failed.len(),
                    summary.cancelled.len()
                );
                self.forward(ConversionEvent::BatchComplete(summary));
            }
            self.claimed_outputs.clear();
        }

        for waiter in job.waiters {
            let _ = waiter.send(state);
        }
    }

    fn forward(&self, event: ConversionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("No listener for conversion events");
        }
    }
}

impl RegistryHandle {
    fn send(&self, command: RegistryCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| AppError::Registry("Job registry is not running".to_string()))
    }

    async fn request<T>(&self, command: RegistryCommand, reply: oneshot::Receiver<T>) -> Result<T> {
        self.send(command)?;
        reply
            .await
            .map_err(|_| AppError::Registry("Job registry stopped before replying".to_string()))
    }

    /// Starts converting `input` to `output` with an explicit settings
    /// snapshot. Returns `false` when `input` already has a live job. An
    /// `output` already used in the current batch is renamed, see
    /// [`unique_output_path`].
    pub async fn submit(
        &self,
        input: PathBuf,
        output: PathBuf,
        settings: ConversionSettings,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        let command = RegistryCommand::Submit { input, output, settings: Some(settings), reply };
        self.request(command, rx).await?
    }

    /// Submits every path with the registry's current settings, writing
    /// results into `output_dir`. Returns how many jobs were created.
    pub async fn submit_batch(&self, inputs: &[PathBuf], output_dir: &Path) -> Result<usize> {
        let mut accepted = 0;
        for input in inputs {
            let (reply, rx) = oneshot::channel();
            let command = RegistryCommand::Submit {
                input: input.clone(),
                output: output_path_for(input, output_dir),
                settings: None,
                reply,
            };
            if self.request(command, rx).await?? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Cancels the job for `input` and waits until it has finished and left
    /// the registry. Returns `None` when no such job exists.
    pub async fn cancel(&self, input: impl Into<PathBuf>) -> Result<Option<JobState>> {
        let (reply, rx) = oneshot::channel();
        let command = RegistryCommand::Cancel { input: input.into(), reply };
        let waiter = self.request(command, rx).await?;
        match waiter {
            Some(waiter) => Ok(Some(waiter.await.map_err(|_| {
                AppError::Registry("Job registry stopped before the job finished".to_string())
            })?)),
            None => Ok(None),
        }
    }

    /// Cancels everything and waits until the registry is empty.
    pub async fn clear(&self) -> Result<Vec<JobState>> {
        let (reply, rx) = oneshot::channel();
        let waiters = self.request(RegistryCommand::Clear { reply }, rx).await?;
        let mut states = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            states.push(waiter.await.map_err(|_| {
                AppError::Registry("Job registry stopped before the job finished".to_string())
            })?);
        }
        Ok(states)
    }

    /// Settings for future submissions; running jobs keep their snapshot.
    pub async fn update_settings(&self, settings: ConversionSettings) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::UpdateSettings { settings, reply }, rx).await?
    }

    pub async fn settings(&self) -> Result<ConversionSettings> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Settings { reply }, rx).await
    }

    pub async fn active_jobs(&self) -> Result<Vec<(PathBuf, JobState)>> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::ActiveJobs { reply }, rx).await
    }
}

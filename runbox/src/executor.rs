use std::{sync::Arc, time::Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::{
    fs,
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    assemble, fetch,
    harvest::{self, Harvest},
    launch::{self, GuestRun},
    names::ExecutionId,
    pool::ContainerPool,
    service::{ExecuteRequest, ExecuteResult, ExecutionService, InputFile},
    settings::Settings,
    workspace::Workspace,
};

/// The execution engine: admission-controls requests, loans pool members,
/// owns the keep-alive loop. One per process.
pub(crate) struct Executor {
    settings: Arc<Settings>,
    pool: Arc<ContainerPool>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    initialized: Mutex<bool>,
}

impl Executor {
    #[must_use]
    pub(crate) fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        Self {
            pool: Arc::new(ContainerPool::new(Arc::clone(&settings))),
            semaphore: Arc::new(Semaphore::new(settings.max_workers)),
            settings,
            cancel: CancellationToken::new(),
            keepalive: Mutex::new(None),
            initialized: Mutex::new(false),
        }
    }

    /// Prepares stores, warms the pool and starts the keep-alive loop.
    /// Calling it again is a no-op.
    pub(crate) async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let runner = self.settings.runner;
        which::which(runner.to_string())
            .map_err(|e| anyhow!("No usable `{runner}` binary: {e}"))?;

        for dir in [
            &self.settings.image_store_path,
            &self.settings.file_store_path,
            &self.settings.workspace_base,
        ] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| anyhow!("Failed creating store dir {dir}: {e}"))?;
        }

        self.pool.ensure_warm().await;
        let mut keepalive = self.keepalive.lock().await;
        if keepalive.is_none() {
            *keepalive = Some(self.pool.keep_alive(self.cancel.clone()));
        }
        *initialized = true;
        info!("Executor ready: {} workers, image {}", self.settings.max_workers, self.settings.docker_image);
        Ok(())
    }

    /// The request path. Never fails: every component error comes back as a
    /// well-formed result with `stderr` set. The workspace is torn down and
    /// the pool member returned on every path.
    pub(crate) async fn execute(&self, request: ExecuteRequest) -> ExecuteResult {
        let started = Instant::now();
        let Ok(_permit) = self.semaphore.acquire().await else {
            return ExecuteResult::failed("Executor is shut down", 0.0);
        };

        let id = ExecutionId::random();
        debug!("Dispatching request {id}");

        // Self-heal before loaning, so a member lost since the last tick
        // does not cost this request its warm start.
        self.pool.ensure_warm().await;
        let member = self.pool.acquire().await;

        let ws = match Workspace::create(&self.settings.workspace_base, &id).await {
            Ok(ws) => ws,
            Err(e) => {
                if let Some(ref name) = member {
                    self.pool.release(name).await;
                }
                return ExecuteResult::failed(format!("{e:#}"), started.elapsed().as_secs_f64());
            }
        };

        let outcome = self.run_in_workspace(&id, &ws, member.as_deref(), &request).await;

        if let Some(ref name) = member {
            self.pool.release(name).await;
        }
        ws.teardown().await;

        let execution_time = started.elapsed().as_secs_f64();
        match outcome {
            Ok((run, harvest, inputs)) => ExecuteResult {
                stdout: run.stdout,
                stderr: run.stderr,
                execution_time,
                image_filename: harvest.image_filename,
                files: harvest.files,
                inputs,
            },
            Err(e) => {
                warn!("Request {id} failed before launch: {e:#}");
                ExecuteResult::failed(format!("{e:#}"), execution_time)
            }
        }
    }

    async fn run_in_workspace(
        &self,
        id: &ExecutionId,
        ws: &Workspace,
        member: Option<&str>,
        request: &ExecuteRequest,
    ) -> Result<(GuestRun, Harvest, Vec<InputFile>)> {
        let fetched =
            fetch::download_input_files(&self.settings, &ws.input_dir(), &request.files).await?;
        let has_inputs = !fetched.inputs.is_empty();

        ws.write_script(&assemble::assemble(&request.code)).await?;
        if has_inputs {
            ws.write_input_map(&fetched.map).await?;
        }

        let run = match member {
            Some(container) => {
                launch::run_pooled(&self.settings, ws, container, has_inputs).await
            }
            None => launch::run_one_shot(&self.settings, id, ws, has_inputs).await,
        };

        // Harvested regardless of the guest's exit status: a failed or
        // timed-out run may still have produced partial outputs.
        let harvest = harvest::collect_outputs(&self.settings, id, ws.output_dir()).await;
        Ok((run, harvest, fetched.inputs))
    }

    /// Stops the keep-alive loop, fails pending admissions and destroys the
    /// pool. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.semaphore.close();
        if let Some(handle) = self.keepalive.lock().await.take() {
            let _ = handle.await;
        }
        self.pool.shutdown().await;
        info!("Executor shut down");
    }
}

impl ExecutionService for Executor {
    async fn initialize(&self) -> Result<()> {
        Executor::initialize(self).await
    }

    async fn execute(&self, request: ExecuteRequest) -> ExecuteResult {
        Executor::execute(self, request).await
    }

    async fn shutdown(&self) {
        Executor::shutdown(self).await
    }
}

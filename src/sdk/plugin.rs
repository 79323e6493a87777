//! Plugin Runner
//!
//! Drives one plugin process: connects to the host, registers, and hands
//! each `StartProcess` and `ReEvaluate` to the [`Processor`] on its own task.
//! The stream stays open after `ResultsReady` so that items can be
//! re-evaluated; it ends when the host sends `ServerTerminate` or closes.

use crate::protocol::{
    ErrorMessage, OptimizationItem, PluginMessage, ReEvaluate, RegisterConfig, ResultsReady,
    ServerMessage, StartProcess, StreamSender,
};
use crate::sdk::error::{SdkError, SdkResult};
use crate::sdk::job_queue::{Job, JobQueue};
use crate::sdk::stream::connect;
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Default size of the job worker pool
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Plugin behaviour plugged into a [`PluginRunner`]
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Sent as the first message of the stream
    fn config(&self) -> RegisterConfig;

    async fn start_process(&self, request: StartProcess, ctx: ProcessContext) -> SdkResult<()>;

    async fn re_evaluate(&self, request: ReEvaluate, ctx: ProcessContext) -> SdkResult<()>;
}

/// Handle a processor uses to report back to the host
#[derive(Clone)]
pub struct ProcessContext {
    sender: StreamSender<PluginMessage>,
    jobs: Arc<JobQueue>,
}

impl ProcessContext {
    pub fn new(sender: StreamSender<PluginMessage>, jobs: Arc<JobQueue>) -> Self {
        Self { sender, jobs }
    }

    pub fn send_item(&self, item: OptimizationItem) -> SdkResult<()> {
        self.sender.send(PluginMessage::OptimizationItem(item))?;
        Ok(())
    }

    pub fn send_error(&self, error: impl Into<String>) -> SdkResult<()> {
        self.sender
            .send(PluginMessage::Error(ErrorMessage::new(error)))?;
        Ok(())
    }

    /// Declare the current invocation finished
    pub fn results_ready(&self) -> SdkResult<()> {
        self.sender
            .send(PluginMessage::ResultsReady(ResultsReady { ready: true }))?;
        Ok(())
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn submit(&self, job: impl Job) -> SdkResult<()> {
        self.jobs.push(job)
    }

    /// Send `ResultsReady` once every submitted job has finished
    pub fn finish_when_idle(&self) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            ctx.jobs.wait_until_idle().await;
            if let Err(e) = ctx.results_ready() {
                log::warn!("ProcessContext: could not send ResultsReady: {}", e);
            }
        })
    }
}

/// Arguments every plugin executable accepts
#[derive(Debug, Clone, Parser)]
#[command(about = "kaytu plugin")]
pub struct PluginArgs {
    /// Address of the host's plugin server
    #[arg(long)]
    pub server: Option<String>,
}

impl PluginArgs {
    pub fn server_addr(&self) -> SdkResult<&str> {
        self.server
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SdkError::MissingServerAddress)
    }
}

pub struct PluginRunner<P: Processor> {
    processor: Arc<P>,
    max_concurrent: usize,
}

impl<P: Processor> PluginRunner<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor: Arc::new(processor),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Serve the host at `server_addr` until it ends the stream
    pub async fn run(self, server_addr: &str) -> SdkResult<()> {
        let (_never, shutdown) = watch::channel(false);
        self.run_until(server_addr, shutdown).await
    }

    /// Like [`Self::run`], also stopping when `shutdown` turns true
    pub async fn run_until(
        self,
        server_addr: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> SdkResult<()> {
        let mut stream = connect(server_addr).await?;
        let config = self.processor.config();
        log::info!(
            "PluginRunner: registering '{}' v{} with {}",
            config.name,
            config.version,
            server_addr
        );
        stream
            .sender
            .send(PluginMessage::RegisterConfig(config))?;

        let jobs = Arc::new(JobQueue::new(self.max_concurrent, stream.sender.clone()));
        let ctx = ProcessContext::new(stream.sender.clone(), jobs.clone());
        let mut tasks = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("PluginRunner: processor task panicked");
                            let _ = ctx.send_error("plugin processor panicked");
                        }
                    }
                }
                msg = stream.reader.recv::<ServerMessage>() => match msg {
                    Ok(Some(ServerMessage::StartProcess(request))) => {
                        log::info!("PluginRunner: starting command '{}'", request.command);
                        let processor = self.processor.clone();
                        let ctx = ctx.clone();
                        tasks.spawn(async move {
                            if let Err(e) = processor.start_process(request, ctx.clone()).await {
                                log::warn!("PluginRunner: command failed: {}", e);
                                let _ = ctx.send_error(e.to_string());
                            }
                        });
                    }
                    Ok(Some(ServerMessage::ReEvaluate(request))) => {
                        log::debug!("PluginRunner: re-evaluating '{}'", request.id);
                        let processor = self.processor.clone();
                        let ctx = ctx.clone();
                        tasks.spawn(async move {
                            if let Err(e) = processor.re_evaluate(request, ctx.clone()).await {
                                log::warn!("PluginRunner: re-evaluation failed: {}", e);
                                let _ = ctx.send_error(e.to_string());
                            }
                        });
                    }
                    Ok(Some(ServerMessage::ServerTerminate(terminate))) => {
                        log::info!("PluginRunner: host ended the session: {}", terminate.reason);
                        break Ok(());
                    }
                    Ok(None) => {
                        log::info!("PluginRunner: host closed the stream");
                        break Ok(());
                    }
                    Err(e) if e.is_disconnect() => break Ok(()),
                    Err(e) => break Err(SdkError::from(e)),
                },
            }
        };

        tasks.abort_all();
        jobs.shutdown();
        stream.finish().await?;
        outcome
    }
}

// A dropped shutdown sender never stops the runner
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Parse [`PluginArgs`] from the command line and run `processor`
pub async fn serve<P: Processor>(processor: P) -> SdkResult<()> {
    let args = PluginArgs::parse();
    let addr = args.server_addr()?.to_string();
    PluginRunner::new(processor).run(&addr).await
}

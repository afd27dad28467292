//! Spawns one OS process per rank and waits for all of them.

use crate::distributed::group::Rendezvous;
use crate::error::{TrainingError, TrainingResult};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

/// Launches `world_size` copies of a worker program.
///
/// Each child receives the shared arguments followed by
/// `--rank <r> --world-size <W> --master-addr <addr> --master-port <port>`.
/// The first child to fail fails the launch, and the remaining children are
/// killed.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    world_size: usize,
    rendezvous: Rendezvous,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl WorkerLauncher {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, world_size: usize, rendezvous: Rendezvous) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            world_size,
            rendezvous,
            current_dir: None,
            timeout: None,
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe(world_size: usize, rendezvous: Rendezvous) -> TrainingResult<Self> {
        Ok(Self::new(std::env::current_exe()?, world_size, rendezvous))
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Kills every worker if the whole launch runs longer than `timeout`.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[must_use]
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    fn command(&self, rank: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--world-size")
            .arg(self.world_size.to_string())
            .arg("--master-addr")
            .arg(&self.rendezvous.master_addr)
            .arg("--master-port")
            .arg(self.rendezvous.master_port.to_string())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Spawns every rank and resolves once all of them exited successfully.
    pub async fn launch(&self) -> TrainingResult<()> {
        if self.world_size == 0 {
            return Err(TrainingError::distributed("world_size must be >= 1"));
        }

        match self.timeout {
            Some(limit) => {
                tokio::time::timeout(limit, self.spawn_and_wait()).await.map_err(|_| {
                    TrainingError::distributed(format!(
                        "workers did not finish within {limit:?}"
                    ))
                })?
            }
            None => self.spawn_and_wait().await,
        }
    }

    async fn spawn_and_wait(&self) -> TrainingResult<()> {
        let mut pending = FuturesUnordered::new();
        for rank in 0..self.world_size {
            let mut child = self.command(rank).spawn().map_err(|e| TrainingError::WorkerFailed {
                rank,
                status: format!("failed to spawn {}: {e}", self.program.display()),
            })?;
            info!(rank, pid = child.id(), "Spawned worker");
            pending.push(async move { (rank, child.wait().await) });
        }

        while let Some((rank, status)) = pending.next().await {
            match status {
                Ok(status) if status.success() => info!(rank, "Worker finished"),
                Ok(status) => {
                    error!(rank, %status, "Worker failed; stopping the remaining workers");
                    return Err(TrainingError::WorkerFailed { rank, status: status.to_string() });
                }
                Err(e) => {
                    return Err(TrainingError::WorkerFailed { rank, status: e.to_string() });
                }
            }
        }
        Ok(())
    }
}

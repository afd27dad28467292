use crate::distributed::group::{Communicator, Rendezvous, TcpProcessGroup};
use crate::error::TrainingResult;
use nuclear_models::Device;
use tracing::{info, warn};

/// Owns a joined process group for the lifetime of one worker.
///
/// Teardown happens exactly once: either through [`ProcessGroupSession::teardown`]
/// or, on any other exit path, when the session is dropped.
pub struct ProcessGroupSession<C: Communicator = TcpProcessGroup> {
    comm: C,
    device: Device,
    torn_down: bool,
}

impl ProcessGroupSession<TcpProcessGroup> {
    /// Joins the group as `rank` and selects that rank's device.
    pub fn setup(rank: usize, world_size: usize, rendezvous: &Rendezvous) -> TrainingResult<Self> {
        let comm = TcpProcessGroup::connect(rank, world_size, rendezvous)?;
        let device = device_for_rank(rank);
        info!(rank, world_size, device = ?device, "Process group session ready");
        Ok(Self::from_communicator(comm, device))
    }
}

impl<C: Communicator> ProcessGroupSession<C> {
    #[must_use]
    pub fn from_communicator(comm: C, device: Device) -> Self {
        Self { comm, device, torn_down: false }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn communicator_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    pub fn teardown(mut self) -> TrainingResult<()> {
        self.torn_down = true;
        self.comm.teardown()
    }

    /// Runs `work` inside the session, then tears it down whatever `work`
    /// returned. The first error wins.
    pub fn scope<T>(
        mut self,
        work: impl FnOnce(&mut Self) -> TrainingResult<T>,
    ) -> TrainingResult<T> {
        let result = work(&mut self);
        let released = self.teardown();
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }
}

impl<C: Communicator> Drop for ProcessGroupSession<C> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(e) = self.comm.teardown() {
            warn!(rank = self.comm.rank(), error = %e, "Process group teardown failed during drop");
        }
    }
}

/// `cuda:<rank>` when built with CUDA and that device exists, else CPU.
#[must_use]
pub fn device_for_rank(rank: usize) -> Device {
    match Device::cuda_if_available(rank) {
        Ok(device) => device,
        Err(e) => {
            warn!(rank, error = %e, "CUDA device unavailable; using CPU");
            Device::Cpu
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingCommunicator;
    use super::*;
    use crate::error::TrainingError;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_explicit_teardown_runs_once() {
        let comm = CountingCommunicator::default();
        let count = comm.teardowns.clone();
        let session = ProcessGroupSession::from_communicator(comm, Device::Cpu);
        session.teardown().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_tears_down() {
        let comm = CountingCommunicator::default();
        let count = comm.teardowns.clone();
        drop(ProcessGroupSession::from_communicator(comm, Device::Cpu));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_tears_down_once_on_error() {
        let comm = CountingCommunicator::default();
        let count = comm.teardowns.clone();
        let session = ProcessGroupSession::from_communicator(comm, Device::Cpu);
        let result: TrainingResult<()> =
            session.scope(|_| Err(TrainingError::Checkpoint("boom".to_string())));
        assert!(matches!(result, Err(TrainingError::Checkpoint(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_tears_down_once_on_panic() {
        let comm = CountingCommunicator::default();
        let count = comm.teardowns.clone();
        let session = ProcessGroupSession::from_communicator(comm, Device::Cpu);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _: TrainingResult<()> = session.scope(|_| panic!("worker crashed"));
        }));
        assert!(outcome.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_setup_rejects_bad_rank() {
        let result = ProcessGroupSession::setup(3, 2, &Rendezvous::default());
        assert!(matches!(result, Err(TrainingError::Distributed(_))));
    }
}

use std::{
    fmt,
    sync::atomic::{AtomicI32, Ordering},
};

/// Run state of an [`MqService`](crate::MqService).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WorkerStatus {
    Disposed = -1,
    Stopped = 0,
    Stopping = 1,
    Starting = 2,
    Started = 3,
}

impl TryFrom<i32> for WorkerStatus {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Disposed),
            0 => Ok(Self::Stopped),
            1 => Ok(Self::Stopping),
            2 => Ok(Self::Starting),
            3 => Ok(Self::Started),
            other => Err(other),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disposed => "Disposed",
            Self::Stopped => "Stopped",
            Self::Stopping => "Stopping",
            Self::Starting => "Starting",
            Self::Started => "Started",
        };
        f.write_str(name)
    }
}

/// Atomic holder of a [`WorkerStatus`].
///
/// Readers never take the service lock. `Disposed` is terminal.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicI32);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicI32::new(WorkerStatus::Stopped as i32))
    }

    pub(crate) fn current(&self) -> WorkerStatus {
        // only valid discriminants are ever stored
        WorkerStatus::try_from(self.0.load(Ordering::Acquire)).unwrap_or(WorkerStatus::Disposed)
    }

    /// Move from `from` to `to`, returning false if the status was not `from`.
    pub(crate) fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        self.0
            .compare_exchange(from as i32, to as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter the terminal state. Returns the previous status.
    pub(crate) fn dispose(&self) -> WorkerStatus {
        let previous = self
            .0
            .swap(WorkerStatus::Disposed as i32, Ordering::AcqRel);
        WorkerStatus::try_from(previous).unwrap_or(WorkerStatus::Disposed)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.current() == WorkerStatus::Disposed
    }
}

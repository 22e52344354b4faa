use std::sync::Arc;

use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{service::MqService, transport::MessageFactory};

/// Sending half of a wake channel, handed to transports.
///
/// Signals carry no data. When the channel is full a pass is already
/// pending, so the signal is dropped.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    sender: mpsc::Sender<()>,
}

impl WakeSignal {
    /// Ask for a drain pass.
    pub fn wake(&self) {
        if self.sender.try_send(()).is_err() {
            tracing::trace!("Drain pass already pending");
        }
    }
}

/// Receiving half of a wake channel.
#[derive(Debug)]
pub struct WakeReceiver {
    receiver: mpsc::Receiver<()>,
}

impl WakeReceiver {
    /// Wait for the next signal. `None` once every [`WakeSignal`] is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<(), TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drop every pending signal, returning how many were dropped.
    fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

/// Create a bounded wake channel.
pub fn wake_channel(capacity: usize) -> (WakeSignal, WakeReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (WakeSignal { sender }, WakeReceiver { receiver })
}

/// Background task running a drain pass whenever a wake signal arrives.
///
/// Signals received while a pass is running are coalesced into a single
/// follow-up pass. The task exits when the token is cancelled, when every
/// signal sender is dropped, or when the service is disposed.
pub struct WakeWorker {
    handle: JoinHandle<()>,
}

impl WakeWorker {
    pub fn spawn<F: MessageFactory>(
        service: Arc<MqService<F>>,
        mut receiver: WakeReceiver,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = receiver.recv() => {
                        if signal.is_none() {
                            tracing::debug!("Wake channel closed, stopping worker");
                            return;
                        }
                        let coalesced = receiver.drain();
                        tracing::trace!(coalesced, "Wake signal received");

                        if let Err(error) = service.start().await {
                            tracing::debug!(%error, "Service rejected the pass, stopping worker");
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Self { handle }
    }

    /// Wait for the worker to exit.
    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            tracing::error!(?error, "Wake worker panicked");
        }
    }
}

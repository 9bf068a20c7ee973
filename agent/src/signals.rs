//! Why the agent stops: the operator's signal, or the first fatal error a
//! subsystem task puts on the error bus. Either way the orchestrator runs
//! the same cancel-then-revert path; only the exit code differs.

use anyhow::Result;
use futures::{
    future::poll_fn,
    task::{Context, Poll},
};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;

pub enum Shutdown {
    /// SIGINT or SIGTERM; the job is over and the agent exits cleanly.
    Requested,
    /// A subsystem died; carried out of the orchestrator after revert.
    Fault(anyhow::Error),
}

/// Single wait-point for the orchestrator's select-on-first-error loop.
pub struct ShutdownListener {
    /// For Ctrl+C from a terminal
    sigint: Signal,
    /// For the job runner stopping the agent
    sigterm: Signal,
    /// Receiving half of the error bus every critical task reports into.
    faults: mpsc::Receiver<anyhow::Error>,
}

impl ShutdownListener {
    pub fn new(faults: mpsc::Receiver<anyhow::Error>) -> Result<Self> {
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;

        Ok(Self {
            sigint,
            sigterm,
            faults,
        })
    }

    /// Waits for SIGINT, SIGTERM, or the first fault on the error bus.
    pub async fn recv(&mut self) -> Shutdown {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Shutdown> {
        if self.sigint.poll_recv(cx).is_ready() || self.sigterm.poll_recv(cx).is_ready() {
            return Poll::Ready(Shutdown::Requested);
        }

        match self.faults.poll_recv(cx) {
            Poll::Ready(Some(error)) => Poll::Ready(Shutdown::Fault(error)),
            // Every sender lives in a critical task; a closed bus means they
            // all exited cleanly, which is as good as a stop request.
            Poll::Ready(None) => Poll::Ready(Shutdown::Requested),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn fault_on_the_bus_ends_the_wait() {
        let (tx, rx) = mpsc::channel(1);
        let mut shutdown = ShutdownListener::new(rx).unwrap();

        tx.send(anyhow!("sniffer died")).await.unwrap();

        match shutdown.recv().await {
            Shutdown::Fault(e) => assert_eq!(e.to_string(), "sniffer died"),
            Shutdown::Requested => panic!("expected a fault"),
        }
    }

    #[tokio::test]
    async fn closed_bus_counts_as_clean_stop() {
        let (tx, rx) = mpsc::channel::<anyhow::Error>(1);
        let mut shutdown = ShutdownListener::new(rx).unwrap();

        drop(tx);

        assert!(matches!(shutdown.recv().await, Shutdown::Requested));
    }
}

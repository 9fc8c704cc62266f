//! Host-side driver running a reliable stream over a frame transport.
//!
//! [`StreamLink`] owns a [`ReliableStream`] and pumps it from a
//! `tokio::select!` loop: application sends come in over a channel, frames
//! from the transport go into the state machine, and an interval supplies
//! the retransmission clock. The transport is a plain pair of frame
//! channels, so the same driver works over an in-memory pipe or a serial
//! port wrapped in the frame codec.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::Result;
use crate::protocol::stream::{ReliableStream, StreamConfig, StreamEvent};

/// Application handle to a running [`StreamLink`]
pub struct LinkHandle {
    send_tx: mpsc::Sender<Vec<u8>>,
    event_rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Queues a payload for reliable delivery
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.send_tx
            .send(payload)
            .await
            .map_err(|_| crate::core::Error::Disconnected)
    }

    /// Waits for the next session event
    pub async fn event(&mut self) -> Option<StreamEvent> {
        self.event_rx.recv().await
    }

    /// Waits for the next delivered payload, skipping other events
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        while let Some(ev) = self.event_rx.recv().await {
            match ev {
                StreamEvent::Received(d) => return Some(d),
                StreamEvent::Disconnected => return None,
                other => trace!(?other, "session event"),
            }
        }
        None
    }

    /// Stops the driver task
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Reliable stream driver
pub struct StreamLink;

impl StreamLink {
    /// Spawns a driver over a pair of frame channels.
    ///
    /// `frame_tx`/`frame_rx` carry raw stream frames to and from the peer;
    /// `tick` is the retransmission clock period.
    pub fn spawn(
        cfg: StreamConfig,
        frame_tx: mpsc::Sender<Vec<u8>>,
        frame_rx: mpsc::Receiver<Vec<u8>>,
        tick: Duration,
        initiate: bool,
    ) -> Result<LinkHandle> {
        let mut stream = ReliableStream::new(cfg)?;
        if initiate {
            stream.connect()?;
        }

        let (send_tx, send_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);

        let task = tokio::spawn(run_loop(stream, frame_tx, frame_rx, send_rx, event_tx, tick));
        Ok(LinkHandle { send_tx, event_rx, task })
    }

    /// Two directly coupled links, useful for tests and loopback setups
    pub fn pair(cfg: StreamConfig, tick: Duration) -> Result<(LinkHandle, LinkHandle)> {
        let (a_tx, b_rx) = mpsc::channel(64);
        let (b_tx, a_rx) = mpsc::channel(64);
        let a = StreamLink::spawn(cfg.clone(), a_tx, a_rx, tick, true)?;
        let b = StreamLink::spawn(cfg, b_tx, b_rx, tick, false)?;
        Ok((a, b))
    }
}

async fn run_loop(
    mut stream: ReliableStream,
    frame_tx: mpsc::Sender<Vec<u8>>,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<StreamEvent>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(payload) = send_rx.recv() => {
                if let Err(e) = stream.send(payload) {
                    debug!(error = %e, "send refused");
                }
            }
            frame = frame_rx.recv() => {
                match frame {
                    Some(f) => {
                        if let Err(e) = stream.handle_frame(&f) {
                            debug!(error = %e, "bad frame ignored");
                        }
                    }
                    None => {
                        debug!("transport closed");
                        stream.close();
                    }
                }
            }
            _ = interval.tick() => {
                stream.tick();
            }
        }

        while let Some(f) = stream.poll_frame() {
            if frame_tx.send(f).await.is_err() {
                stream.close();
                break;
            }
        }
        let mut done = false;
        while let Some(ev) = stream.poll_event() {
            if ev == StreamEvent::Disconnected {
                done = true;
            }
            if event_tx.send(ev).await.is_err() {
                return;
            }
        }
        if done {
            return;
        }
    }
}

//! Progress streamer: the single producer side of a request's event channel.

use manual_shared::{Step, StreamEvent};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Events buffered between the pipeline and the transport.
pub const CHANNEL_CAPACITY: usize = 32;

/// Ordered event emitter for one request.
///
/// Once the receiver is dropped (client disconnect) or a terminal event has
/// been sent, further events are discarded.
pub struct ProgressStreamer {
    tx: mpsc::Sender<StreamEvent>,
    start_time: Instant,
    emitted: usize,
    finished: bool,
}

/// Create a streamer and the receiver consumed by the transport layer.
pub fn channel() -> (ProgressStreamer, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ProgressStreamer::new(tx), rx)
}

impl ProgressStreamer {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            start_time: Instant::now(),
            emitted: 0,
            finished: false,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// True once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Send one event, waiting for buffer space. Returns false if the event
    /// was dropped.
    pub async fn emit(&mut self, event: StreamEvent) -> bool {
        if self.finished {
            debug!("Stream finished, dropping {}", event.format_debug());
            return false;
        }
        let terminal = event.is_terminal();
        info!("{} (+{}ms)", event.format_debug(), self.elapsed_ms());
        if self.tx.send(event).await.is_err() {
            debug!("Client disconnected, event dropped");
            return false;
        }
        self.emitted += 1;
        self.finished = terminal;
        true
    }

    pub async fn step_start(&mut self, step: Step) -> bool {
        self.emit(StreamEvent::step_start(step)).await
    }

    pub async fn step_complete(&mut self, step: Step) -> bool {
        self.emit(StreamEvent::step_complete(step)).await
    }

    pub async fn step_timeout(&mut self, step: Step) -> bool {
        self.emit(StreamEvent::step_timeout(step)).await
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{deck::DeckId, overlay::OverlayUpdate, CliftError, Result};

/// Direction for cycling through an ordered registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// Operator or network request, applied at the top of the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SelectScene {
        deck: DeckId,
        category: usize,
        index: usize,
    },
    SetCrossfade(f32),
    CycleEffect(Direction),
    SetEffectIntensity(f32),
    SetParameter {
        deck: DeckId,
        slot: usize,
        value: f32,
    },
    ToggleClockSource,
    SetTempo(f64),
    /// Starts or stops the transport. Shared with synced peers.
    SetPlaying(bool),
    ResetTransport,
    SetOverlay {
        deck: DeckId,
        update: OverlayUpdate,
    },
    Resize {
        width: usize,
        height: usize,
    },
}

/// Commands submitted together. A batch is always applied in full within a
/// single tick.
pub type CommandBatch = Vec<Command>;

/// Receiving side, owned by the scheduler.
#[derive(Debug)]
pub struct CommandQueue {
    rx: Receiver<CommandBatch>,
    tx: Sender<CommandBatch>,
    open: Arc<AtomicBool>,
}

impl CommandQueue {
    /// Creates an open queue holding at most `capacity` batches.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            rx,
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns a handle producers can clone freely.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
            overflow: self.rx.clone(),
            open: self.open.clone(),
        }
    }

    /// Takes everything queued so far, flattened in submission order.
    pub fn drain(&self) -> Vec<Command> {
        self.rx.try_iter().flatten().collect()
    }

    /// Stops accepting new commands. Already queued batches are discarded.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Cloneable handle used by input handlers and network listeners.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<CommandBatch>,
    overflow: Receiver<CommandBatch>,
    open: Arc<AtomicBool>,
}

impl CommandSender {
    /// Queues a single command as its own batch.
    pub fn send(&self, command: Command) -> Result<()> {
        self.send_batch(vec![command])
    }

    /// Queues several commands that must become visible in the same tick.
    /// When the queue is full the oldest pending batch is dropped.
    pub fn send_batch(&self, batch: CommandBatch) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(CliftError::Closed);
        }
        if batch.is_empty() {
            return Ok(());
        }

        match self.tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(batch)) => {
                if let Ok(dropped) = self.overflow.try_recv() {
                    warn!(commands = dropped.len(), "command queue full, dropped oldest batch");
                }
                self.tx.try_send(batch).map_err(|_| CliftError::Closed)
            }
            Err(TrySendError::Disconnected(_)) => Err(CliftError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_batches_in_order() {
        let queue = CommandQueue::new(8);
        let sender = queue.sender();
        sender.send(Command::SetCrossfade(0.25)).unwrap();
        sender
            .send_batch(vec![
                Command::CycleEffect(Direction::Forward),
                Command::SetTempo(128.0),
            ])
            .unwrap();

        assert_eq!(
            queue.drain(),
            vec![
                Command::SetCrossfade(0.25),
                Command::CycleEffect(Direction::Forward),
                Command::SetTempo(128.0),
            ]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn full_queue_drops_oldest_batch_whole() {
        let queue = CommandQueue::new(1);
        let sender = queue.sender();
        sender
            .send_batch(vec![Command::SetCrossfade(0.1), Command::SetCrossfade(0.2)])
            .unwrap();
        sender.send(Command::ResetTransport).unwrap();

        assert_eq!(queue.drain(), vec![Command::ResetTransport]);
    }

    #[test]
    fn closed_queue_rejects_commands() {
        let queue = CommandQueue::new(4);
        let sender = queue.sender();
        sender.send(Command::ToggleClockSource).unwrap();
        queue.close();

        assert!(matches!(
            sender.send(Command::ToggleClockSource),
            Err(CliftError::Closed)
        ));
        assert!(queue.drain().is_empty());
        assert!(!queue.is_open());
    }
}

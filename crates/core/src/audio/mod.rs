use std::{
    f32::consts::TAU,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{info, trace};

use crate::{
    config::AudioConfig,
    worker::{StopSignal, Worker},
    Result,
};

/// Bounded hand-off between the capture thread and the tick loop.
///
/// When the queue is full the oldest pending chunk is overwritten, so a
/// stalled tick loop never blocks the capture thread.
#[derive(Debug)]
pub struct AudioFeed {
    tx: Sender<Vec<f32>>,
    rx: Receiver<Vec<f32>>,
}

impl AudioFeed {
    /// Creates a feed holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Producer handle for a capture thread.
    pub fn producer(&self) -> AudioProducer {
        AudioProducer {
            tx: self.tx.clone(),
            overflow: self.rx.clone(),
        }
    }

    /// Takes every chunk queued so far without waiting.
    pub fn drain(&self) -> impl Iterator<Item = Vec<f32>> + '_ {
        self.rx.try_iter()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Cloneable sending side of an [`AudioFeed`].
#[derive(Debug, Clone)]
pub struct AudioProducer {
    tx: Sender<Vec<f32>>,
    overflow: Receiver<Vec<f32>>,
}

impl AudioProducer {
    /// Queues an interleaved chunk, dropping the oldest pending chunk when
    /// the queue is full.
    pub fn push(&self, chunk: Vec<f32>) {
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(chunk)) => {
                let _ = self.overflow.try_recv();
                trace!("audio queue full, overwrote oldest chunk");
                let _ = self.tx.try_send(chunk);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Copies `samples` into a new chunk and queues it.
    pub fn push_slice(&self, samples: &[f32]) {
        if !samples.is_empty() {
            self.push(samples.to_vec());
        }
    }
}

/// Synthetic stand-in for a capture device: a 440 Hz tone with a few
/// harmonics and a little noise, gated to pulse on every beat.
#[derive(Debug, Clone)]
pub struct TestSignal {
    sample_rate: f32,
    channels: usize,
    bpm: f32,
    phase: f32,
    frame: u64,
    noise: SmallRng,
}

impl TestSignal {
    /// Creates a signal for `config`'s sample rate and channel count, pulsing at `bpm`.
    pub fn new(config: &AudioConfig, bpm: f32) -> Self {
        Self {
            sample_rate: config.sample_rate.max(1) as f32,
            channels: config.channels.max(1),
            bpm: bpm.max(1.0),
            phase: 0.0,
            frame: 0,
            noise: SmallRng::seed_from_u64(0x2545_f491),
        }
    }

    /// Produces `frames` interleaved frames.
    pub fn next_chunk(&mut self, frames: usize) -> Vec<f32> {
        let beat_frames = (self.sample_rate * 60.0 / self.bpm) as u64;
        let step = TAU * 440.0 / self.sample_rate;
        let mut chunk = Vec::with_capacity(frames * self.channels);

        for _ in 0..frames {
            let into_beat = (self.frame % beat_frames.max(1)) as f32 / self.sample_rate;
            let envelope = 0.25 + 0.75 * (-into_beat * 12.0).exp();

            let mut sample = 0.3 * self.phase.sin();
            sample += 0.2 * (self.phase * 2.0).sin();
            sample += 0.1 * (self.phase * 3.0).sin();
            sample += 0.05 * (self.phase * 0.5).sin();
            sample += 0.02 * (self.noise.random::<f32>() - 0.5);
            sample *= envelope;

            chunk.extend(std::iter::repeat(sample).take(self.channels));

            self.phase += step;
            if self.phase > TAU * 2.0 {
                self.phase -= TAU * 2.0;
            }
            self.frame += 1;
        }
        chunk
    }
}

/// Runs a [`TestSignal`] in real time on a background thread.
pub fn spawn_test_signal(producer: AudioProducer, config: &AudioConfig, bpm: f32) -> Result<Worker> {
    let mut signal = TestSignal::new(config, bpm);
    let chunk_period = Duration::from_millis(10);
    let frames = (config.sample_rate as usize / 100).max(1);

    info!(bpm, "feeding synthetic test signal");
    Worker::spawn("clift-test-signal", move |stop: StopSignal| {
        let mut next = Instant::now();
        while !stop.is_stopped() {
            producer.push(signal.next_chunk(frames));
            next += chunk_period;
            let now = Instant::now();
            if next > now && !stop.sleep(next - now) {
                break;
            }
            if next + chunk_period < now {
                next = now;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_overwrites_oldest_chunk() {
        let feed = AudioFeed::new(2);
        let producer = feed.producer();
        producer.push(vec![1.0]);
        producer.push(vec![2.0]);
        producer.push(vec![3.0]);

        let drained: Vec<Vec<f32>> = feed.drain().collect();
        assert_eq!(drained, vec![vec![2.0], vec![3.0]]);
        assert_eq!(feed.pending(), 0);
    }

    #[test]
    fn empty_slices_are_not_queued() {
        let feed = AudioFeed::new(4);
        feed.producer().push_slice(&[]);
        assert_eq!(feed.pending(), 0);
    }

    #[test]
    fn test_signal_is_interleaved_and_bounded() {
        let mut signal = TestSignal::new(&AudioConfig::default(), 120.0);
        let chunk = signal.next_chunk(480);

        assert_eq!(chunk.len(), 960);
        assert!(chunk.chunks(2).all(|frame| frame[0] == frame[1]));
        assert!(chunk.iter().all(|sample| sample.abs() <= 1.0));
        assert!(chunk.iter().any(|sample| *sample != 0.0));
    }

    #[test]
    fn test_signal_worker_feeds_queue() {
        let feed = AudioFeed::new(64);
        let worker = spawn_test_signal(feed.producer(), &AudioConfig::default(), 120.0).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(worker.stop_and_join(Duration::from_secs(1)));

        assert!(feed.drain().count() > 0);
    }
}

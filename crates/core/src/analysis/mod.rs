use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use arc_swap::ArcSwap;
use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use tracing::{debug, trace};

use crate::{config::AudioConfig, Result};

/// Number of log-spaced bands in [`AudioFeatures::spectrum`].
pub const SPECTRUM_BANDS: usize = 64;
/// Slowest tempo the estimator reports.
pub const MIN_TEMPO_BPM: f32 = 60.0;
/// Fastest tempo the estimator reports.
pub const MAX_TEMPO_BPM: f32 = 200.0;

const BASS_BANDS: std::ops::Range<usize> = 0..SPECTRUM_BANDS / 8;
const MID_BANDS: std::ops::Range<usize> = SPECTRUM_BANDS / 8..SPECTRUM_BANDS / 2;
const TREBLE_BANDS: std::ops::Range<usize> = SPECTRUM_BANDS / 2..SPECTRUM_BANDS;
const MAX_INTERVAL_HISTORY: usize = 16;
/// Publishes without new samples before the audio flag drops.
const IDLE_PUBLISHES: u32 = 15;

/// Immutable snapshot of the audio features for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatures {
    /// Peak-normalised band magnitudes in [0, 1], lowest band first.
    pub spectrum: [f32; SPECTRUM_BANDS],
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    /// RMS of the last analysis window, in [0, 1].
    pub volume: f32,
    /// Smoothed tempo estimate, always within [60, 200] when present.
    pub bpm_estimate: Option<f32>,
    /// True in exactly one published snapshot per detected onset.
    pub beat_triggered: bool,
    /// How far the triggering window exceeded its threshold, in [0, 1].
    pub beat_intensity: f32,
    /// Stream time in seconds at the end of the last analysed window.
    pub time: f64,
    /// Samples have arrived recently.
    pub active: bool,
}

impl Default for AudioFeatures {
    fn default() -> Self {
        Self {
            spectrum: [0.0; SPECTRUM_BANDS],
            bass: 0.0,
            mid: 0.0,
            treble: 0.0,
            volume: 0.0,
            bpm_estimate: None,
            beat_triggered: false,
            beat_intensity: 0.0,
            time: 0.0,
            active: false,
        }
    }
}

/// Single-writer snapshot slot. Readers always observe a complete snapshot.
#[derive(Clone)]
pub struct FeatureSlot {
    inner: Arc<ArcSwap<AudioFeatures>>,
}

impl FeatureSlot {
    /// Creates a slot holding the zeroed default snapshot.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(AudioFeatures::default())),
        }
    }

    /// Replaces the snapshot and returns the published copy.
    pub fn publish(&self, features: AudioFeatures) -> Arc<AudioFeatures> {
        let features = Arc::new(features);
        self.inner.store(features.clone());
        features
    }

    /// Returns the latest complete snapshot.
    pub fn load(&self) -> Arc<AudioFeatures> {
        self.inner.load_full()
    }
}

impl Default for FeatureSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FeatureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSlot").finish()
    }
}

/// Turns interleaved PCM into spectral, level and beat features.
///
/// Samples are down-mixed to mono and collected into non-overlapping windows
/// of `window_size` frames. Every completed window updates the internal
/// state; [`publish`](Self::publish) freezes that state into a snapshot.
pub struct AudioFeatureExtractor {
    config: AudioConfig,
    slot: FeatureSlot,
    window: Vec<f32>,
    frame_sum: f32,
    frame_fill: usize,
    hann: Vec<f32>,
    fft: FftResources,
    band_ranges: Vec<(usize, usize)>,
    raw_bands: [f32; SPECTRUM_BANDS],
    bands: [f32; SPECTRUM_BANDS],
    peak: f32,
    volume: f32,
    average_volume: f32,
    processed_frames: u64,
    last_beat_at: Option<f64>,
    intervals: VecDeque<f64>,
    bpm_estimate: Option<f32>,
    pending_beat: Option<f32>,
    idle_publishes: u32,
}

impl AudioFeatureExtractor {
    /// Creates an extractor and plans its FFT for `config.window_size`.
    pub fn new(config: AudioConfig) -> Self {
        let size = config.window_size.max(2);
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let fft = FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        debug!(
            sample_rate = config.sample_rate,
            window = size,
            channels = config.channels,
            "audio feature extractor ready"
        );

        Self {
            window: Vec::with_capacity(size),
            frame_sum: 0.0,
            frame_fill: 0,
            hann: (0..size).map(|index| hann_value(index, size)).collect(),
            band_ranges: log_band_ranges(size / 2 + 1, SPECTRUM_BANDS),
            fft,
            raw_bands: [0.0; SPECTRUM_BANDS],
            bands: [0.0; SPECTRUM_BANDS],
            peak: config.min_peak,
            volume: 0.0,
            average_volume: 0.0,
            processed_frames: 0,
            last_beat_at: None,
            intervals: VecDeque::with_capacity(MAX_INTERVAL_HISTORY),
            bpm_estimate: None,
            pending_beat: None,
            idle_publishes: IDLE_PUBLISHES,
            slot: FeatureSlot::new(),
            config,
        }
    }

    /// Handle onto the published snapshots, shareable with other threads.
    pub fn slot(&self) -> FeatureSlot {
        self.slot.clone()
    }

    /// Feeds an interleaved chunk. Partial frames and partial windows carry
    /// over to the next call.
    pub fn ingest(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.idle_publishes = 0;

        let channels = self.config.channels.max(1);
        for sample in samples {
            self.frame_sum += if sample.is_finite() { *sample } else { 0.0 };
            self.frame_fill += 1;
            if self.frame_fill == channels {
                self.window.push(self.frame_sum / channels as f32);
                self.frame_sum = 0.0;
                self.frame_fill = 0;

                if self.window.len() == self.fft.size {
                    self.analyse_window()?;
                    self.window.clear();
                }
            }
        }
        Ok(())
    }

    /// Publishes the current state as a new snapshot. A beat detected since
    /// the previous publish is reported exactly once.
    pub fn publish(&mut self) -> Arc<AudioFeatures> {
        let beat = self.pending_beat.take();
        let features = AudioFeatures {
            spectrum: self.bands,
            bass: band_mean(&self.bands, BASS_BANDS),
            mid: band_mean(&self.bands, MID_BANDS),
            treble: band_mean(&self.bands, TREBLE_BANDS),
            volume: self.volume,
            bpm_estimate: self.bpm_estimate,
            beat_triggered: beat.is_some(),
            beat_intensity: beat.unwrap_or(0.0),
            time: self.stream_time(),
            active: self.idle_publishes < IDLE_PUBLISHES,
        };
        self.idle_publishes = self.idle_publishes.saturating_add(1);
        self.slot.publish(features)
    }

    /// Most recently published snapshot, or the zeroed default.
    pub fn current_features(&self) -> Arc<AudioFeatures> {
        self.slot.load()
    }

    /// Returns the current tempo estimate, always within [60, 200].
    pub fn bpm_estimate(&self) -> Option<f32> {
        self.bpm_estimate
    }

    fn stream_time(&self) -> f64 {
        self.processed_frames as f64 / self.config.sample_rate.max(1) as f64
    }

    fn analyse_window(&mut self) -> Result<()> {
        self.processed_frames += self.fft.size as u64;
        let time = self.stream_time();

        self.volume = compute_rms(&self.window).clamp(0.0, 1.0);
        self.compute_bands()?;
        self.detect_beat(time);
        self.average_volume += self.config.average_smoothing * (self.volume - self.average_volume);

        trace!(time, volume = self.volume, peak = self.peak, "analysed window");
        Ok(())
    }

    fn compute_bands(&mut self) -> Result<()> {
        let fft = &mut self.fft;
        for ((slot, sample), weight) in fft.input.iter_mut().zip(&self.window).zip(&self.hann) {
            *slot = sample * weight;
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 2.0 / fft.size as f32;
        for (band, (lo, hi)) in self.raw_bands.iter_mut().zip(&self.band_ranges) {
            let bins = &fft.spectrum[*lo..*hi];
            let sum: f32 = bins.iter().map(|bin| bin.norm() * scale).sum();
            *band = sum / bins.len() as f32;
        }

        let loudest = self.raw_bands.iter().copied().fold(0.0_f32, f32::max);
        self.peak = (self.peak * self.config.peak_decay)
            .max(loudest)
            .max(self.config.min_peak);

        for (normalised, raw) in self.bands.iter_mut().zip(&self.raw_bands) {
            *normalised = (raw / self.peak).clamp(0.0, 1.0);
        }
        Ok(())
    }

    fn detect_beat(&mut self, time: f64) {
        let threshold = self.average_volume * self.config.beat_threshold;
        if self.volume <= self.config.volume_floor || self.volume <= threshold {
            return;
        }

        let refractory = self.config.refractory().as_secs_f64();
        if let Some(last) = self.last_beat_at {
            if time - last < refractory {
                return;
            }
            self.record_interval(time - last);
        }

        let headroom = (1.0 - threshold).max(f32::EPSILON);
        let intensity = ((self.volume - threshold) / headroom).clamp(0.0, 1.0);
        self.last_beat_at = Some(time);
        self.pending_beat = Some(self.pending_beat.unwrap_or(0.0).max(intensity));
        debug!(time, intensity, "beat");
    }

    fn record_interval(&mut self, interval: f64) {
        let shortest = 60.0 / MAX_TEMPO_BPM as f64;
        let longest = 60.0 / MIN_TEMPO_BPM as f64;
        if !(shortest..=longest).contains(&interval) {
            trace!(interval, "ignoring implausible beat interval");
            return;
        }

        if self.intervals.len() == MAX_INTERVAL_HISTORY {
            self.intervals.pop_front();
        }
        self.intervals.push_back(interval);

        let average = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        let bpm = (60.0 / average) as f32;
        if (MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&bpm) {
            self.bpm_estimate = Some(bpm);
        }
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for AudioFeatureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFeatureExtractor")
            .field("window_size", &self.fft.size)
            .field("processed_frames", &self.processed_frames)
            .field("volume", &self.volume)
            .field("peak", &self.peak)
            .field("bpm_estimate", &self.bpm_estimate)
            .finish()
    }
}

/// Splits `bins` FFT bins (DC excluded) into `bands` contiguous,
/// logarithmically widening ranges.
fn log_band_ranges(bins: usize, bands: usize) -> Vec<(usize, usize)> {
    let top = (bins - 1).max(1) as f64;
    let mut ranges = Vec::with_capacity(bands);
    let mut lo = 1usize.min(bins - 1);

    for band in 0..bands {
        let edge = top.powf((band + 1) as f64 / bands as f64).round() as usize + 1;
        let start = lo.min(bins - 1);
        let end = if band + 1 == bands {
            bins
        } else {
            edge.max(start + 1).min(bins)
        };
        ranges.push((start, end.max(start + 1)));
        lo = end;
    }
    ranges
}

fn band_mean(bands: &[f32; SPECTRUM_BANDS], range: std::ops::Range<usize>) -> f32 {
    let len = range.len() as f32;
    bands[range].iter().sum::<f32>() / len
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

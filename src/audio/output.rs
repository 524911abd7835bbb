use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use tracing::warn;

use super::RenderError;

// ~250ms of stereo audio at 48kHz.
const RING_CAPACITY: usize = 48_000 / 2;
const DRAIN_CAP: Duration = Duration::from_secs(2);

type RingProducer = ringbuf::HeapProd<f32>;
type RingConsumer = ringbuf::HeapCons<f32>;

/// Output device fed through a lock-free ring buffer.
///
/// The cpal callback pops samples on the audio thread; `clear` makes the
/// callback drop whatever is still buffered before the next pop, so a
/// cancelled stream falls silent immediately.
pub(super) struct DeviceOutput {
    _stream: Stream,
    producer: Mutex<RingProducer>,
    sample_rate: u32,
    channels: u16,
    clear_flag: Arc<AtomicBool>,
}

impl DeviceOutput {
    pub(super) fn open() -> Result<Self, RenderError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| RenderError::Output("no output device available".to_string()))?;

        let config = device
            .default_output_config()
            .map_err(|err| RenderError::Output(err.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();

        let rb = HeapRb::<f32>::new(RING_CAPACITY);
        let (producer, consumer) = rb.split();

        let clear_flag = Arc::new(AtomicBool::new(false));

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                Self::build_stream::<f32>(&device, &config.into(), consumer, clear_flag.clone())?
            }
            cpal::SampleFormat::I16 => {
                Self::build_stream::<i16>(&device, &config.into(), consumer, clear_flag.clone())?
            }
            cpal::SampleFormat::U16 => {
                Self::build_stream::<u16>(&device, &config.into(), consumer, clear_flag.clone())?
            }
            format => {
                return Err(RenderError::Output(format!(
                    "unsupported sample format: {format:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|err| RenderError::Output(err.to_string()))?;

        Ok(Self {
            _stream: stream,
            producer: Mutex::new(producer),
            sample_rate,
            channels,
            clear_flag,
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut consumer: RingConsumer,
        clear_flag: Arc<AtomicBool>,
    ) -> Result<Stream, RenderError> {
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if clear_flag.swap(false, Ordering::SeqCst) {
                        while consumer.try_pop().is_some() {}
                    }
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                    }
                },
                move |err| {
                    warn!(target: "audio_render", %err, "output stream error");
                },
                None,
            )
            .map_err(|err| RenderError::Output(err.to_string()))
    }

    pub(super) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(super) fn channels(&self) -> u16 {
        self.channels
    }

    /// Push samples, waiting for ring space. Bails out once `cancel` is
    /// set so a stopped stream never blocks on a full buffer.
    pub(super) fn write_blocking(&self, samples: &[f32], cancel: &AtomicBool) {
        let mut remaining = samples;

        while !remaining.is_empty() {
            if cancel.load(Ordering::SeqCst) {
                return;
            }

            let mut written = 0;
            {
                let mut producer = self.producer.lock();
                for &sample in remaining {
                    if producer.try_push(sample).is_ok() {
                        written += 1;
                    } else {
                        break;
                    }
                }
            }

            if written > 0 {
                remaining = &remaining[written..];
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Let buffered samples play out after a natural end of stream,
    /// bounded so a wedged device cannot stall the session engine.
    pub(super) fn drain(&self, cancel: &AtomicBool) {
        let deadline = Instant::now() + DRAIN_CAP;

        while Instant::now() < deadline {
            if cancel.load(Ordering::SeqCst) {
                self.clear();
                return;
            }
            if self.producer.lock().occupied_len() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Drop buffered samples on the next audio callback.
    pub(super) fn clear(&self) {
        self.clear_flag.store(true, Ordering::SeqCst);
    }
}

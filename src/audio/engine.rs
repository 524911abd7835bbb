use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::output::DeviceOutput;
use super::{AudioRenderer, RenderError};

const CHUNK_CHANNEL_CAPACITY: usize = 64;
const RESAMPLE_CHUNK_FRAMES: usize = 1_024;
const THREAD_EXIT_CAP: Duration = Duration::from_secs(2);

/// Streaming decode-and-render engine: encoded bytes in, audible output
/// out.
///
/// Each stream gets a dedicated decode thread (symphonia pulls from a
/// blocking reader) that drives the output device; the async side only
/// moves chunks into the channel and flips flags. Backpressure from a
/// slow decode propagates to the network read through the bounded
/// channel.
pub struct StreamingRenderer {
    state: Mutex<Option<ActiveStream>>,
}

struct ActiveStream {
    chunk_tx: mpsc::Sender<Bytes>,
    cancel: Arc<AtomicBool>,
    decoder: Option<std::thread::JoinHandle<()>>,
}

impl StreamingRenderer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

impl Default for StreamingRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioRenderer for StreamingRenderer {
    async fn start_stream(&self) -> Result<(), RenderError> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.take() {
            retire(previous, true).await;
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let decoder = std::thread::Builder::new()
            .name("tunebox-decode".to_string())
            .spawn(move || decode_stream(chunk_rx, thread_cancel))
            .map_err(|err| RenderError::Output(err.to_string()))?;

        *state = Some(ActiveStream {
            chunk_tx,
            cancel,
            decoder: Some(decoder),
        });
        Ok(())
    }

    async fn push_chunk(&self, chunk: Bytes) -> Result<(), RenderError> {
        let chunk_tx = {
            let state = self.state.lock().await;
            state.as_ref().map(|active| active.chunk_tx.clone())
        };

        match chunk_tx {
            Some(tx) => tx.send(chunk).await.map_err(|_| RenderError::Closed),
            None => Err(RenderError::Closed),
        }
    }

    async fn finish_stream(&self) -> Result<(), RenderError> {
        if let Some(active) = self.state.lock().await.take() {
            retire(active, false).await;
        }
        Ok(())
    }

    async fn discard(&self) -> Result<(), RenderError> {
        if let Some(active) = self.state.lock().await.take() {
            retire(active, true).await;
        }
        Ok(())
    }
}

/// Close out a stream: signal cancellation, unblock the reader by dropping
/// the sender, and give the decode thread a bounded window to exit.
async fn retire(mut active: ActiveStream, cancelled: bool) {
    if cancelled {
        active.cancel.store(true, Ordering::SeqCst);
    }
    drop(active.chunk_tx);

    if let Some(handle) = active.decoder.take() {
        let join = tokio::task::spawn_blocking(move || handle.join());
        match timeout(THREAD_EXIT_CAP, join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(_))) => warn!(target: "audio_render", "decode thread panicked"),
            Ok(Err(err)) => warn!(target: "audio_render", %err, "failed to join decode thread"),
            Err(_) => warn!(target: "audio_render", "decode thread slow to exit, detaching"),
        }
    }
}

fn decode_stream(chunk_rx: mpsc::Receiver<Bytes>, cancel: Arc<AtomicBool>) {
    let reader = ChunkReader::new(chunk_rx, Arc::clone(&cancel));
    let source = ReadOnlySource::new(reader);
    let stream = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = match symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(err) => {
            if !cancel.load(Ordering::SeqCst) {
                warn!(target: "audio_render", %err, "failed to probe audio stream");
            }
            return;
        }
    };

    let mut format = probed.format;
    let Some(track) = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
    else {
        warn!(target: "audio_render", "no audio track in stream");
        return;
    };

    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let source_channels = track
        .codec_params
        .channels
        .map(|channels| channels.count())
        .unwrap_or(2)
        .max(1);

    let mut decoder = match symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
    {
        Ok(decoder) => decoder,
        Err(err) => {
            warn!(target: "audio_render", %err, "failed to create audio decoder");
            return;
        }
    };

    let output = match DeviceOutput::open() {
        Ok(output) => output,
        Err(err) => {
            warn!(target: "audio_render", %err, "audio output unavailable, dropping stream");
            return;
        }
    };

    let mut pipeline = match RenderPipeline::new(source_rate, source_channels, &output) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            warn!(target: "audio_render", %err, "failed to set up render pipeline");
            return;
        }
    };

    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        if cancel.load(Ordering::SeqCst) {
            output.clear();
            return;
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(err) => {
                warn!(target: "audio_render", %err, "failed to read audio packet");
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    let spec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;
                    sample_buf = Some(SampleBuffer::<f32>::new(capacity, spec));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    pipeline.render(buf.samples(), &output, &cancel);
                }
            }
            Err(SymphoniaError::DecodeError(err)) => {
                debug!(target: "audio_render", %err, "skipping undecodable packet");
            }
            Err(err) => {
                warn!(target: "audio_render", %err, "audio decode failed");
                break;
            }
        }
    }

    if cancel.load(Ordering::SeqCst) {
        output.clear();
    } else {
        pipeline.flush(&output, &cancel);
        output.drain(&cancel);
    }
}

/// Adapts decoded audio to the output device: resamples when the rates
/// differ and remaps the channel layout.
struct RenderPipeline {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<Vec<f32>>,
    source_channels: usize,
    device_channels: usize,
}

impl RenderPipeline {
    fn new(
        source_rate: u32,
        source_channels: usize,
        output: &DeviceOutput,
    ) -> Result<Self, RenderError> {
        let resampler = if source_rate != output.sample_rate() {
            Some(
                FastFixedIn::<f32>::new(
                    f64::from(output.sample_rate()) / f64::from(source_rate),
                    1.0,
                    PolynomialDegree::Cubic,
                    RESAMPLE_CHUNK_FRAMES,
                    source_channels,
                )
                .map_err(|err| RenderError::Decode(err.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self {
            resampler,
            pending: vec![Vec::new(); source_channels],
            source_channels,
            device_channels: output.channels() as usize,
        })
    }

    /// Feed interleaved source samples through to the device.
    fn render(&mut self, samples: &[f32], output: &DeviceOutput, cancel: &AtomicBool) {
        if self.resampler.is_none() {
            let mapped = remap_interleaved(samples, self.source_channels, self.device_channels);
            output.write_blocking(&mapped, cancel);
            return;
        }

        for frame in samples.chunks_exact(self.source_channels) {
            for (channel, &sample) in frame.iter().enumerate() {
                self.pending[channel].push(sample);
            }
        }
        self.process_pending(false, output, cancel);
    }

    /// Resample and emit the final partial chunk after end of stream.
    fn flush(&mut self, output: &DeviceOutput, cancel: &AtomicBool) {
        if self.resampler.is_some() {
            self.process_pending(true, output, cancel);
        }
    }

    fn process_pending(&mut self, flush: bool, output: &DeviceOutput, cancel: &AtomicBool) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };

        loop {
            if cancel.load(Ordering::SeqCst) {
                return;
            }

            let available = self.pending[0].len();
            if available < RESAMPLE_CHUNK_FRAMES {
                if !flush || available == 0 {
                    return;
                }
                // Pad the tail chunk with silence.
                for channel in self.pending.iter_mut() {
                    channel.resize(RESAMPLE_CHUNK_FRAMES, 0.0);
                }
            }

            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..RESAMPLE_CHUNK_FRAMES).collect())
                .collect();

            match resampler.process(&chunk, None) {
                Ok(resampled) => {
                    let interleaved = interleave(&resampled, self.device_channels);
                    output.write_blocking(&interleaved, cancel);
                }
                Err(err) => {
                    warn!(target: "audio_render", %err, "resample failed, dropping chunk");
                }
            }
        }
    }
}

/// Remap interleaved samples into the device channel layout, duplicating
/// or dropping source channels as needed.
fn remap_interleaved(samples: &[f32], source_channels: usize, device_channels: usize) -> Vec<f32> {
    if source_channels == device_channels {
        return samples.to_vec();
    }

    let frames = samples.len() / source_channels;
    let mut mapped = Vec::with_capacity(frames * device_channels);
    for frame in samples.chunks_exact(source_channels) {
        for device_channel in 0..device_channels {
            mapped.push(frame[device_channel.min(source_channels - 1)]);
        }
    }
    mapped
}

fn interleave(channels: &[Vec<f32>], device_channels: usize) -> Vec<f32> {
    let frames = channels.first().map(|channel| channel.len()).unwrap_or(0);
    if frames == 0 || channels.is_empty() {
        return Vec::new();
    }

    let mut interleaved = Vec::with_capacity(frames * device_channels);
    for frame in 0..frames {
        for device_channel in 0..device_channels {
            let source = &channels[device_channel.min(channels.len() - 1)];
            interleaved.push(source[frame]);
        }
    }
    interleaved
}

/// Blocking `Read` over the chunk channel. Returns end-of-file once the
/// sender is dropped or the stream is cancelled, which unblocks the
/// decoder exactly like a closed connection would.
struct ChunkReader {
    chunk_rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    cancel: Arc<AtomicBool>,
}

impl ChunkReader {
    fn new(chunk_rx: mpsc::Receiver<Bytes>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            chunk_rx,
            current: Bytes::new(),
            cancel,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.chunk_rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

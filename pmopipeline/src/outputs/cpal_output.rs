//! Sortie matérielle via cpal
//!
//! Adaptateur de référence du contrat backend : le périphérique est ouvert
//! dans `begin_playback`, chaque `process` tire un buffer du sink
//! `"input"` et le verse dans un tampon partagé avec le callback cpal, et
//! le callback publie le temps écoulé sur le provider d'horloge du stage.
//!
//! Le `cpal::Stream` n'étant pas `Send`, il vit dans un thread dédié
//! commandé par un channel, et se ferme à son drop.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::buffer_format::BufferFormat;
use crate::clock_provider::{ClockCapabilities, ClockProvider};
use crate::port::{PullError, Sink};
use crate::stage::{StageContext, StageLogic};

/// Tampon partagé entre le stage et le callback cpal
struct DeviceBuffer {
    /// Samples f32 entrelacés au format du périphérique
    samples: VecDeque<f32>,
    channels: usize,
    sample_rate: u32,
}

impl DeviceBuffer {
    fn new() -> Self {
        DeviceBuffer {
            samples: VecDeque::new(),
            channels: 2,
            sample_rate: 48_000,
        }
    }
}

/// Nombre de frames gardées en avance dans le tampon du périphérique
const TARGET_BUFFERED_FRAMES: usize = 4_096;

/// Sortie audio matérielle (périphérique par défaut du système)
pub struct CpalOutput {
    provider: Arc<ClockProvider>,
    device_buffer: Arc<Mutex<DeviceBuffer>>,
    stream_thread: Option<thread::JoinHandle<()>>,
    stream_stop: Option<std_mpsc::Sender<()>>,
    input: Option<Sink>,
    /// Scratch de conversion, redimensionné au premier buffer
    scratch: Vec<f32>,
}

impl CpalOutput {
    /// Capacités de cadence : de 1 ms à 1 s
    pub const CAPABILITIES: ClockCapabilities = ClockCapabilities::new(1_000_000, 1_000_000_000);

    /// Période par défaut : 10 ms
    pub const DEFAULT_PERIOD_NS: u64 = 10_000_000;

    pub fn new() -> Self {
        CpalOutput {
            provider: Arc::new(ClockProvider::new(
                Self::CAPABILITIES,
                Self::DEFAULT_PERIOD_NS,
            )),
            device_buffer: Arc::new(Mutex::new(DeviceBuffer::new())),
            stream_thread: None,
            stream_stop: None,
            input: None,
            scratch: Vec::new(),
        }
    }

    /// Provider d'horloge de la sortie
    pub fn provider(&self) -> Arc<ClockProvider> {
        Arc::clone(&self.provider)
    }

    fn open_device(&mut self) -> bool {
        let buffer = Arc::clone(&self.device_buffer);
        let provider = Arc::clone(&self.provider);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        // Thread dédié : le Stream cpal n'est pas Send.
        let handle = thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                error!("no output device available");
                return;
            };

            debug!(
                "using audio device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let config = match device.default_output_config() {
                Ok(config) => config,
                Err(err) => {
                    error!("failed to get output config: {err}");
                    return;
                }
            };

            let sample_rate = config.sample_rate().0;
            let channels = config.channels() as usize;
            {
                let mut shared = buffer.lock().unwrap();
                shared.channels = channels;
                shared.sample_rate = sample_rate;
            }

            debug!(
                "output config: {} channels, {} Hz, {:?}",
                channels,
                sample_rate,
                config.sample_format()
            );

            let data_buffer = Arc::clone(&buffer);
            let stream = match config.sample_format() {
                cpal::SampleFormat::I16 => device.build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let mut shared = data_buffer.lock().unwrap();
                        for sample in data.iter_mut() {
                            let value = shared.samples.pop_front().unwrap_or(0.0);
                            *sample = (value * 32_767.0).clamp(-32_768.0, 32_767.0) as i16;
                        }
                        let frames = data.len() / shared.channels.max(1);
                        provider.publish(frames as f64 / shared.sample_rate as f64);
                    },
                    move |err| error!("audio stream error: {err}"),
                    None,
                ),
                cpal::SampleFormat::F32 => device.build_output_stream(
                    &config.into(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut shared = data_buffer.lock().unwrap();
                        for sample in data.iter_mut() {
                            *sample = shared.samples.pop_front().unwrap_or(0.0);
                        }
                        let frames = data.len() / shared.channels.max(1);
                        provider.publish(frames as f64 / shared.sample_rate as f64);
                    },
                    move |err| error!("audio stream error: {err}"),
                    None,
                ),
                other => {
                    error!("unsupported device sample format: {other:?}");
                    return;
                }
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to build output stream: {err}");
                    return;
                }
            };

            if let Err(err) = stream.play() {
                error!("failed to start stream: {err}");
                return;
            }

            debug!("stream thread started");
            let _ = stop_rx.recv();
            debug!("stream thread exiting");
        });

        self.stream_thread = Some(handle);
        self.stream_stop = Some(stop_tx);
        true
    }

    fn close_device(&mut self) {
        if let Some(stop) = self.stream_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }

        let mut shared = self.device_buffer.lock().unwrap();
        shared.samples.clear();
    }

    fn buffered_frames(&self) -> usize {
        let shared = self.device_buffer.lock().unwrap();
        shared.samples.len() / shared.channels.max(1)
    }

    fn deliver(&mut self, mut buffer: crate::pool::ManagedBuffer) {
        let frames = buffer.available() as usize;
        let channels = buffer.format().channel_count() as usize;
        let device_channels = {
            let shared = self.device_buffer.lock().unwrap();
            shared.channels
        };

        self.scratch.resize(frames * channels, 0.0);
        buffer.read_interleaved::<f32>(&mut self.scratch);

        let mut shared = self.device_buffer.lock().unwrap();
        if channels == device_channels {
            shared.samples.extend(self.scratch.iter().copied());
        } else {
            // Adaptation minimale du nombre de canaux : duplication du
            // premier canal ou troncature.
            for frame in self.scratch.chunks(channels.max(1)) {
                for ci in 0..device_channels {
                    shared
                        .samples
                        .push_back(frame.get(ci).copied().unwrap_or(frame[0]));
                }
            }
        }
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl StageLogic for CpalOutput {
    fn begin_playback(&mut self) -> bool {
        self.open_device()
    }

    fn stopped_playback(&mut self) -> bool {
        self.close_device();
        if let Some(input) = &self.input {
            input.reset_format();
        }
        true
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) {
        if self.input.is_none() {
            self.input = ctx.sink("input");
        }
        let Some(input) = self.input.clone() else {
            warn!("cpal output: no sink named \"input\"");
            return;
        };
        if !input.is_linked() {
            warn!("cpal output: no source linked to input");
            return;
        }

        match ctx.pull(&mut *self, &input) {
            Ok(buffer) => {
                self.deliver(buffer);

                // Le tampon du périphérique a encore de la place : un cycle
                // de plus évite l'underrun au prochain callback.
                if self.buffered_frames() < TARGET_BUFFERED_FRAMES {
                    ctx.hint_process_more();
                }
            }
            Err(PullError::Cancelled) => debug!("cpal output: pull cancelled"),
            Err(err) => error!("cpal output: pull error: {err}"),
        }
    }

    fn reconfigure_input_format(&mut self, _sink: &Sink, format: &BufferFormat) -> bool {
        // Pas de rééchantillonnage à ce niveau : le flux est accepté tel
        // quel et lu à la cadence du périphérique.
        debug!("cpal output: accepting input format {format}");
        format.is_valid()
    }

    fn clock_provider(&self) -> Option<Arc<ClockProvider>> {
        Some(Arc::clone(&self.provider))
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close_device();
    }
}

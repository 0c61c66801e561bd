// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Synthetic capture producers standing in for the camera/microphone pipeline

use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::buffer::{AudioBuffer, SampleSink, VideoFrame};
use crate::config::SourceConfig;

/// Solid-colour BGRA frame whose hue shifts with the frame number
pub fn synthetic_frame(width: u32, height: u32, frame_number: u64) -> Vec<u8> {
    let shade = (frame_number % 256) as u8;
    let pixel = [shade, 255 - shade, 128, 255];
    pixel.repeat((width as usize) * (height as usize))
}

/// 440 Hz sine as interleaved little-endian i16
pub fn synthetic_pcm(sample_rate: u32, channels: u16, frames: usize, offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames * channels as usize * 2);
    for i in 0..frames {
        let t = (offset + i as u64) as f64 / sample_rate.max(1) as f64;
        let value = ((t * 440.0 * std::f64::consts::TAU).sin() * 0.2 * i16::MAX as f64) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// Running producer threads
pub struct SyntheticSource {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl SyntheticSource {
    /// Spawn one video and one audio thread feeding `sink`
    pub fn start(config: &SourceConfig, sink: SampleSink) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let clock = Instant::now();
        let mut threads = Vec::with_capacity(2);

        let video = {
            let running = running.clone();
            let sink = sink.clone();
            let (width, height) = (config.width, config.height);
            let interval = Duration::from_secs_f64(1.0 / config.video_fps.max(1) as f64);
            std::thread::Builder::new()
                .name("video-producer".into())
                .spawn(move || {
                    let mut frame_number = 0u64;
                    while running.load(Ordering::Relaxed) {
                        // Conversion happens here, outside the recorder
                        let data = synthetic_frame(width, height, frame_number);
                        sink.submit_video(VideoFrame {
                            timestamp_ns: clock.elapsed().as_nanos() as u64,
                            width,
                            height,
                            data: Bytes::from(data),
                        });
                        frame_number += 1;
                        std::thread::sleep(interval);
                    }
                    debug!("Video producer stopped after {} frames", frame_number);
                })
                .context("Failed to spawn video producer")?
        };
        threads.push(video);

        let audio = {
            let running = running.clone();
            let sample_rate = config.audio_sample_rate;
            let channels = config.audio_channels;
            let interval = Duration::from_millis(config.audio_buffer_ms.max(1));
            let frames = (sample_rate as u64 * interval.as_millis() as u64 / 1000) as usize;
            std::thread::Builder::new()
                .name("audio-producer".into())
                .spawn(move || {
                    let mut offset = 0u64;
                    while running.load(Ordering::Relaxed) {
                        let data = synthetic_pcm(sample_rate, channels, frames, offset);
                        sink.submit_audio(AudioBuffer {
                            timestamp_ns: clock.elapsed().as_nanos() as u64,
                            sample_rate,
                            channels,
                            data: Bytes::from(data),
                        });
                        offset += frames as u64;
                        std::thread::sleep(interval);
                    }
                    debug!("Audio producer stopped");
                })
                .context("Failed to spawn audio producer")?
        };
        threads.push(audio);

        info!(
            "Synthetic source started ({}x{} @ {} fps, {} Hz x{})",
            config.width, config.height, config.video_fps, config.audio_sample_rate, config.audio_channels
        );
        Ok(Self { running, threads })
    }

    /// Stop and join both threads
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

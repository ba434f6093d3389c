//! Synthesized notification chime.
//!
//! Two sine tones under one envelope: A5 for the first 80ms, then E5 until
//! 150ms. The gain ramps linearly to 0.3 over 10ms and decays exponentially
//! to 0.01 at the end. Hosts play the rendered PCM however they can.

use std::f32::consts::TAU;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tone {
    frequency: f32,
    start: f32,
    stop: f32,
}

/// The incoming-message alert tone.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTone {
    tones: [Tone; 2],
    attack: f32,
    peak_gain: f32,
    floor_gain: f32,
}

impl Default for AlertTone {
    fn default() -> Self {
        Self {
            tones: [
                Tone {
                    frequency: 880.0, // A5
                    start: 0.0,
                    stop: 0.08,
                },
                Tone {
                    frequency: 659.25, // E5
                    start: 0.08,
                    stop: 0.15,
                },
            ],
            attack: 0.01,
            peak_gain: 0.3,
            floor_gain: 0.01,
        }
    }
}

impl AlertTone {
    fn end(&self) -> f32 {
        self.tones.iter().map(|t| t.stop).fold(0.0, f32::max)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f32(self.end())
    }

    /// Envelope gain at `t` seconds.
    pub fn gain_at(&self, t: f32) -> f32 {
        let end = self.end();
        if t <= 0.0 || t >= end {
            return if t >= end { self.floor_gain } else { 0.0 };
        }
        if t < self.attack {
            return self.peak_gain * t / self.attack;
        }
        let progress = (t - self.attack) / (end - self.attack);
        self.peak_gain * (self.floor_gain / self.peak_gain).powf(progress)
    }

    /// Sample value at `t` seconds.
    pub fn sample_at(&self, t: f32) -> f32 {
        let gain = self.gain_at(t);
        self.tones
            .iter()
            .filter(|tone| t >= tone.start && t < tone.stop)
            .map(|tone| (TAU * tone.frequency * (t - tone.start)).sin() * gain)
            .sum()
    }

    /// Mono PCM samples in `[-1.0, 1.0]`.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate.max(1) as f32;
        let count = (self.end() * rate).round() as usize;
        (0..count).map(|i| self.sample_at(i as f32 / rate)).collect()
    }
}

//! Fixed-rate telemetry towards a single visualization consumer
//!
//! The sampler holds at most one subscriber. Connecting replaces any previous
//! subscriber and starts a fresh timer; disconnecting (explicitly, or by the
//! consumer dropping its receiver) cancels the timer.

use crate::domain::audio::AudioContext;
use crate::domain::pipeline::Pipeline;
use crate::domain::state::EffectState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

/// One sample of the active pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    /// dB, <= 0
    pub gain_reduction: f32,
    pub time_domain_data: Vec<f32>,
    pub frequency_data: Vec<u8>,
}

/// Sending half of a consumer connection
#[derive(Debug, Clone)]
pub struct Subscriber {
    sender: mpsc::Sender<TelemetryFrame>,
}

impl Subscriber {
    pub fn new(sender: mpsc::Sender<TelemetryFrame>) -> Self {
        Self { sender }
    }

    /// A connection and the receiver the consumer reads frames from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// What woke the sampler up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerEvent {
    Tick,
    Disconnected,
}

pub struct TelemetrySampler {
    period: Duration,
    subscriber: Option<Subscriber>,
    timer: Option<Interval>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl TelemetrySampler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            subscriber: None,
            timer: None,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_connected(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Attach a consumer, replacing the current one
    pub fn connect(&mut self, subscriber: Subscriber) {
        if self.subscriber.is_some() {
            info!("Telemetry consumer replaced");
        } else {
            info!(period_ms = self.period.as_millis() as u64, "Telemetry consumer connected");
        }

        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.timer = Some(timer);
        self.subscriber = Some(subscriber);
    }

    /// Detach the consumer and cancel the timer
    pub fn disconnect(&mut self) {
        if self.subscriber.take().is_some() {
            info!(sent = self.frames_sent, "Telemetry consumer disconnected");
        }
        self.timer = None;
    }

    /// Wait for the next tick or for the consumer to go away
    ///
    /// Pending forever while nobody is connected. Cancel safe.
    pub async fn next_event(&mut self) -> SamplerEvent {
        let (Some(timer), Some(subscriber)) = (self.timer.as_mut(), self.subscriber.as_ref())
        else {
            return std::future::pending().await;
        };

        tokio::select! {
            _ = timer.tick() => SamplerEvent::Tick,
            _ = subscriber.sender.closed() => SamplerEvent::Disconnected,
        }
    }

    /// Read the analyser and compressor of `pipeline`
    pub fn sample<C: AudioContext>(
        pipeline: &mut Pipeline<C>,
        state: &EffectState,
    ) -> TelemetryFrame {
        let context = pipeline.context_mut();
        let bins = context.analyser_bins();

        let mut time_domain_data = vec![0.0; bins];
        context.read_time_domain(&mut time_domain_data);
        let mut frequency_data = vec![0; bins];
        context.read_frequency(&mut frequency_data);

        let gain_reduction = if state.compressor.enabled {
            context.gain_reduction()
        } else {
            0.0
        };

        TelemetryFrame {
            gain_reduction,
            time_domain_data,
            frequency_data,
        }
    }

    /// Push one frame; a full channel drops it, a closed one disconnects
    pub fn emit(&mut self, frame: TelemetryFrame) -> bool {
        let Some(subscriber) = &self.subscriber else {
            return false;
        };

        match subscriber.sender.try_send(frame) {
            Ok(()) => {
                self.frames_sent += 1;
                trace!(sent = self.frames_sent, "Telemetry frame sent");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.frames_dropped += 1;
                debug!(dropped = self.frames_dropped, "Telemetry consumer lagging, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect();
                false
            }
        }
    }
}

//! Network clock.
//!
//! The server's clock is authoritative. Clients keep an offset from their
//! local clock: `target = net_time - receive_time + rtt / 2`. A warp jumps
//! straight to the target; otherwise [`NetworkClock::advance`] eases toward it.

use std::time::Duration;

use crate::core::{BitReader, BitWriter};
use crate::error::Result;

/// Fraction of the remaining offset error corrected per second.
const CORRECTION_RATE: f32 = 2.0;

#[derive(Debug, Clone, Default)]
pub struct NetworkClock {
    local_time: f32,
    offset: f32,
    target_offset: f32,
}

impl NetworkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local time since the engine started, in seconds.
    pub fn local_time(&self) -> f32 {
        self.local_time
    }

    pub fn network_time(&self) -> f32 {
        self.local_time + self.offset
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn target_offset(&self) -> f32 {
        self.target_offset
    }

    pub fn update_network_time(&mut self, net_time: f32, receive_time: f32, rtt: Duration, warp: bool) {
        self.target_offset = net_time - receive_time + rtt.as_secs_f32() / 2.0;
        if warp {
            self.offset = self.target_offset;
        }
    }

    /// Move local time forward and ease the offset toward its target.
    pub fn advance(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        self.local_time += dt;
        let step = (CORRECTION_RATE * dt).min(1.0);
        self.offset += (self.target_offset - self.offset) * step;
    }
}

/// Decode a time-sync payload into the clock.
pub fn handle_time_sync(
    clock: &mut NetworkClock,
    reader: &mut BitReader<'_>,
    receive_time: f32,
    rtt: Duration,
) -> Result<f32> {
    let net_time = reader.read_f32_packed()?;
    clock.update_network_time(net_time, receive_time, rtt, false);
    Ok(net_time)
}

pub fn write_time_sync(writer: &mut BitWriter, network_time: f32) {
    writer.write_f32_packed(network_time);
}

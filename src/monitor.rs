//! ==============================================================================
//! monitor.rs - serial angle feed
//! ==============================================================================
//!
//! the follower reports the latest angle as one integer per line
//! (`"<degrees>\n"`) at a fixed period. the plotting tool on the other end of
//! the serial port reads exactly that, so nothing else goes on this writer.
//!
//! ==============================================================================

use std::io::{self, Write};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AngleMonitor {
    period: Duration,
    last_emit_ms: Option<u64>,
}

impl AngleMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_emit_ms: None,
        }
    }

    /// Write `angle` if a period has passed since the last line. Returns
    /// whether a line was written.
    pub fn observe<W: Write>(&mut self, now_ms: u64, angle: f32, out: &mut W) -> io::Result<bool> {
        if let Some(last) = self.last_emit_ms {
            if now_ms.saturating_sub(last) < self.period.as_millis() as u64 {
                return Ok(false);
            }
        }
        if !angle.is_finite() {
            return Ok(false);
        }
        writeln!(out, "{}", angle.round() as i64)?;
        self.last_emit_ms = Some(now_ms);
        Ok(true)
    }
}

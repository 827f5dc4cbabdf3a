use std::time::{Duration, Instant};

/// RTCP feedback pacing, evaluated on every video RTP packet.
///
/// A REMB goes out every five seconds in steady state; while ramping up the
/// first four go out back to back at `bitrate/4`, `/3`, `/2`, `/1` so the
/// publisher climbs to the configured cap quickly. FIR+PLI pairs go out
/// every keyframe interval with an increasing FIR sequence number.
#[derive(Debug)]
pub struct FeedbackState {
    remb_startup: u32,
    remb_last: Instant,
    keyframe_request_last: Option<Instant>,
    fir_seq: u8,
}

const REMB_INTERVAL: Duration = Duration::from_secs(5);

impl Default for FeedbackState {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackState {
    pub fn new() -> Self {
        Self {
            remb_startup: 4,
            remb_last: Instant::now(),
            keyframe_request_last: None,
            fir_seq: 0,
        }
    }

    /// Returns the bitrate to advertise now, if a REMB is due.
    pub fn poll_remb(&mut self, bitrate: u32) -> Option<u32> {
        self.poll_remb_at(bitrate, Instant::now())
    }

    pub fn poll_remb_at(&mut self, bitrate: u32, now: Instant) -> Option<u32> {
        let rampup = self.remb_startup > 0;
        if !rampup && now.duration_since(self.remb_last) < REMB_INTERVAL {
            return None;
        }
        let mut bitrate = bitrate;
        if rampup {
            bitrate /= self.remb_startup;
            self.remb_startup -= 1;
        }
        self.remb_last = now;
        Some(bitrate)
    }

    /// Returns the FIR sequence number to use, if a keyframe request is due.
    pub fn poll_keyframe_request(&mut self, interval: Duration) -> Option<u8> {
        self.poll_keyframe_request_at(interval, Instant::now())
    }

    pub fn poll_keyframe_request_at(&mut self, interval: Duration, now: Instant) -> Option<u8> {
        let due = match self.keyframe_request_last {
            None => true,
            Some(last) => now.duration_since(last) >= interval,
        };
        if !due {
            return None;
        }
        self.fir_seq = self.fir_seq.wrapping_add(1);
        self.keyframe_request_last = Some(now);
        Some(self.fir_seq)
    }
}

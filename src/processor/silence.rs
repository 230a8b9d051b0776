/// Decides which frames reach the streamer when silence suppression is on.
///
/// Voice frames always pass. During silence one frame passes per
/// `interval_ms` of stream time so the server still sees the stream alive.
#[derive(Debug, Clone)]
pub struct SilenceGate {
    enabled: bool,
    interval_ms: u64,
    last_emit_ms: Option<u64>,
    suppressed: u64,
}

impl SilenceGate {
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        Self {
            enabled,
            interval_ms,
            last_emit_ms: None,
            suppressed: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn admit(&mut self, now_ms: u64, voice: bool) -> bool {
        if !self.enabled || voice {
            self.last_emit_ms = Some(now_ms);
            return true;
        }
        match self.last_emit_ms {
            Some(last) if now_ms.saturating_sub(last) < self.interval_ms => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last_emit_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_emit_ms = None;
    }
}

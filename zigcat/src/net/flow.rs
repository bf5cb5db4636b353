use hashbrown::HashMap;
use std::time::{Duration, Instant};

/// Hysteresis gate on the exec session's read submissions. Pauses once the
/// total buffered bytes reach the pause threshold and only resumes once they
/// fall back to the resume threshold.
#[derive(Debug)]
pub struct FlowGate {
    pause_threshold: usize,
    resume_threshold: usize,
    paused: bool,
}

impl FlowGate {
    /// Derives thresholds from fractions of the hard cap. A pause fraction
    /// that rounds to zero disables the gate. If rounding lands resume at or
    /// above pause, resume is forced down to `pause - max(1, pause / 4)`.
    pub fn from_fractions(max_total: usize, pause_fraction: f64, resume_fraction: f64) -> FlowGate {
        let pause = (pause_fraction * max_total as f64).round() as usize;
        let mut resume = (resume_fraction * max_total as f64).round() as usize;

        if pause > 0 && resume >= pause {
            resume = pause - (pause / 4).max(1);
        }

        FlowGate {
            pause_threshold: pause,
            resume_threshold: resume,
            paused: false,
        }
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn pause_threshold(&self) -> usize {
        self.pause_threshold
    }

    #[inline]
    pub fn resume_threshold(&self) -> usize {
        self.resume_threshold
    }

    /// Re-evaluates the gate against the current buffered total. Returns true
    /// if the paused flag changed. A single call moves the gate at most one
    /// way.
    pub fn update(&mut self, total_buffered: usize) -> bool {
        if self.pause_threshold == 0 {
            return false;
        }

        if !self.paused && total_buffered >= self.pause_threshold {
            self.paused = true;
            return true;
        }
        if self.paused && total_buffered <= self.resume_threshold {
            self.paused = false;
            return true;
        }
        false
    }
}

/// Graduated broker-level pressure, derived from the buffer pool's memory
/// usage fraction. Levels shorten the poll timeout and gate low-priority
/// sends.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum FlowLevel {
    Normal,
    Light,
    Moderate,
    Heavy,
    Emergency,
}

impl FlowLevel {
    pub fn from_usage(fraction: f64) -> FlowLevel {
        if fraction >= 0.90 {
            FlowLevel::Emergency
        } else if fraction >= 0.80 {
            FlowLevel::Heavy
        } else if fraction >= 0.65 {
            FlowLevel::Moderate
        } else if fraction >= 0.50 {
            FlowLevel::Light
        } else {
            FlowLevel::Normal
        }
    }

    /// Upper bound the level places on the broker poll timeout.
    pub fn poll_cap(self) -> Option<Duration> {
        match self {
            FlowLevel::Normal => None,
            FlowLevel::Light => Some(Duration::from_millis(500)),
            FlowLevel::Moderate => Some(Duration::from_millis(250)),
            FlowLevel::Heavy => Some(Duration::from_millis(100)),
            FlowLevel::Emergency => Some(Duration::from_millis(50)),
        }
    }

    /// Minimum client priority still allowed to receive relayed data.
    fn required_priority(self) -> u8 {
        match self {
            FlowLevel::Normal | FlowLevel::Light => 0,
            FlowLevel::Moderate => 1,
            FlowLevel::Heavy => 2,
            FlowLevel::Emergency => 3,
        }
    }
}

#[derive(Debug)]
struct ClientFlow {
    window_start: Instant,
    bytes_in_window: usize,
    pending_bytes: usize,
    throttle_count: u64,
    priority: u8,
}

pub const DEFAULT_CLIENT_PRIORITY: u8 = 2;

/// Per-client windowed byte budgets plus the graduated level. The broker asks
/// `should_send` before queueing relayed data for a client.
pub struct FlowManager {
    clients: HashMap<u64, ClientFlow>,
    level: FlowLevel,
    window: Duration,
    bytes_per_window: usize,
    max_pending: usize,
}

impl FlowManager {
    pub fn new(window: Duration, bytes_per_window: usize, max_pending: usize) -> FlowManager {
        FlowManager {
            clients: HashMap::new(),
            level: FlowLevel::Normal,
            window,
            bytes_per_window,
            max_pending,
        }
    }

    #[inline]
    pub fn level(&self) -> FlowLevel {
        self.level
    }

    pub fn update_level(&mut self, usage_fraction: f64) -> FlowLevel {
        self.level = FlowLevel::from_usage(usage_fraction);
        self.level
    }

    pub fn register_client(&mut self, id: u64, now: Instant) {
        self.clients.insert(
            id,
            ClientFlow {
                window_start: now,
                bytes_in_window: 0,
                pending_bytes: 0,
                throttle_count: 0,
                priority: DEFAULT_CLIENT_PRIORITY,
            },
        );
    }

    pub fn remove_client(&mut self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn set_priority(&mut self, id: u64, priority: u8) {
        if let Some(state) = self.clients.get_mut(&id) {
            state.priority = priority;
        }
    }

    /// Whether `size` bytes may be queued for `id` right now. False when the
    /// client is over its window budget, has too much already pending, or the
    /// current level outranks its priority.
    pub fn should_send(&mut self, id: u64, size: usize, now: Instant) -> bool {
        let level = self.level;
        let window = self.window;
        let budget = self.bytes_per_window;
        let max_pending = self.max_pending;

        let state = match self.clients.get_mut(&id) {
            Some(state) => state,
            None => return false,
        };

        if now.duration_since(state.window_start) >= window {
            state.window_start = now;
            state.bytes_in_window = 0;
        }

        if state.priority < level.required_priority() {
            state.throttle_count += 1;
            return false;
        }
        if state.pending_bytes.saturating_add(size) > max_pending {
            state.throttle_count += 1;
            return false;
        }
        if state.bytes_in_window.saturating_add(size) > budget {
            state.throttle_count += 1;
            return false;
        }

        true
    }

    /// Accounts bytes accepted into a client's write queue.
    pub fn record_queued(&mut self, id: u64, size: usize) {
        if let Some(state) = self.clients.get_mut(&id) {
            state.bytes_in_window = state.bytes_in_window.saturating_add(size);
            state.pending_bytes = state.pending_bytes.saturating_add(size);
        }
    }

    /// Accounts bytes drained out of a client's write queue onto the wire.
    pub fn record_sent(&mut self, id: u64, size: usize) {
        if let Some(state) = self.clients.get_mut(&id) {
            state.pending_bytes = state.pending_bytes.saturating_sub(size);
        }
    }

    pub fn throttle_count(&self, id: u64) -> u64 {
        self.clients.get(&id).map_or(0, |state| state.throttle_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_thresholds_derived_from_fractions() {
        let gate = FlowGate::from_fractions(1000, 0.5, 0.25);
        assert_eq!(gate.pause_threshold(), 500);
        assert_eq!(gate.resume_threshold(), 250);
    }

    #[test]
    fn test_gate_resume_forced_below_pause() {
        let gate = FlowGate::from_fractions(1000, 0.5, 0.7);
        assert_eq!(gate.pause_threshold(), 500);
        assert_eq!(gate.resume_threshold(), 500 - 125);
    }

    #[test]
    fn test_gate_tiny_cap_still_separates_thresholds() {
        let gate = FlowGate::from_fractions(4, 0.5, 0.5);
        assert_eq!(gate.pause_threshold(), 2);
        assert_eq!(gate.resume_threshold(), 1);
    }

    #[test]
    fn test_gate_zero_pause_disables() {
        let mut gate = FlowGate::from_fractions(1000, 0.0, 0.0);
        assert!(!gate.update(usize::max_value()));
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_gate_hysteresis() {
        let mut gate = FlowGate::from_fractions(1000, 0.5, 0.25);

        assert!(!gate.update(499));
        assert!(!gate.is_paused());

        assert!(gate.update(500));
        assert!(gate.is_paused());

        // Between resume and pause: still paused.
        assert!(!gate.update(400));
        assert!(gate.is_paused());

        assert!(gate.update(250));
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_gate_single_update_moves_one_way() {
        // A single update never both pauses and unpauses.
        let mut gate = FlowGate::from_fractions(1000, 0.5, 0.25);
        gate.update(600);
        assert!(gate.is_paused());
        let changed = gate.update(600);
        assert!(!changed);
        assert!(gate.is_paused());
    }

    #[test]
    fn test_levels_from_usage() {
        assert_eq!(FlowLevel::from_usage(0.1), FlowLevel::Normal);
        assert_eq!(FlowLevel::from_usage(0.55), FlowLevel::Light);
        assert_eq!(FlowLevel::from_usage(0.7), FlowLevel::Moderate);
        assert_eq!(FlowLevel::from_usage(0.85), FlowLevel::Heavy);
        assert_eq!(FlowLevel::from_usage(0.95), FlowLevel::Emergency);
    }

    #[test]
    fn test_level_poll_caps_tighten() {
        assert_eq!(FlowLevel::Normal.poll_cap(), None);
        assert_eq!(
            FlowLevel::Emergency.poll_cap(),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_manager_window_budget() {
        let mut flow = FlowManager::new(Duration::from_secs(1), 100, 1000);
        let now = Instant::now();
        flow.register_client(7, now);

        assert!(flow.should_send(7, 60, now));
        flow.record_queued(7, 60);
        flow.record_sent(7, 60);

        // Second send would exceed the window budget.
        assert!(!flow.should_send(7, 60, now));
        assert_eq!(flow.throttle_count(7), 1);

        // A fresh window resets the budget.
        let later = now + Duration::from_secs(2);
        assert!(flow.should_send(7, 60, later));
    }

    #[test]
    fn test_manager_pending_cap() {
        let mut flow = FlowManager::new(Duration::from_secs(1), 10_000, 100);
        let now = Instant::now();
        flow.register_client(1, now);

        flow.record_queued(1, 90);
        assert!(!flow.should_send(1, 20, now));

        flow.record_sent(1, 90);
        assert!(flow.should_send(1, 20, now));
    }

    #[test]
    fn test_manager_level_gates_priority() {
        let mut flow = FlowManager::new(Duration::from_secs(1), 10_000, 10_000);
        let now = Instant::now();
        flow.register_client(1, now);

        flow.update_level(0.95);
        assert_eq!(flow.level(), FlowLevel::Emergency);
        assert!(!flow.should_send(1, 10, now));

        flow.set_priority(1, 3);
        assert!(flow.should_send(1, 10, now));
    }

    #[test]
    fn test_manager_unknown_client_refused() {
        let mut flow = FlowManager::new(Duration::from_secs(1), 100, 100);
        assert!(!flow.should_send(42, 1, Instant::now()));
    }
}

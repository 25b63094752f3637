//! Paced egress queue
//!
//! The virtual endpoint produces bursty frame timing: browser-side
//! production drifts by ±10 ms and occasionally delivers coalesced
//! batches. Physical receivers play out of a shallow buffer, so the
//! fabric re-times those flows to an exact 20 ms cadence before they hit
//! the wire. Per-flow jitter buffering, in-window sequence reordering,
//! oldest-first drop past the cap, and round-robin fairness across
//! flows; at most one packet leaves per tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{MAX_BUFFER_SIZE, MAX_LATENCY_MS, PACKET_INTERVAL_MS, TIMING_HISTORY};
use crate::protocol::{
    DeviceId, FlowStats, PacerStats, Packet, Severity, TimingViolation, ViolationKind,
    VIRTUAL_DEVICE,
};
use crate::registry::DeviceRegistry;
use crate::stats::ServerStats;

pub const PACKET_INTERVAL: Duration = Duration::from_millis(PACKET_INTERVAL_MS);
const MAX_LATENCY: Duration = Duration::from_millis(MAX_LATENCY_MS);

/// Slack subtracted from the interval by the anti-burst guard
const ANTI_BURST_MARGIN: Duration = Duration::from_millis(2);
/// A head older than this lets the pacer ignore the anti-burst guard
const CATCHUP_AGE: Duration = Duration::from_millis(60);
/// Warm-up window: a lone fresh packet is held back until the pacer has
/// ever sent, a second packet arrives, or the head turns 20 ms old
const WARMUP_AGE: Duration = Duration::from_millis(PACKET_INTERVAL_MS);
/// Tick-to-tick drift beyond this is recorded as a violation
const DRIFT_TOLERANCE_MS: f64 = 10.0;
/// Queue depth above this raises a buildup violation
const BUILDUP_DEPTH: usize = 5;
const BUILDUP_REPORT_INTERVAL: Duration = Duration::from_secs(1);
/// Inter-send deltas outside this band are violations
const INTERVAL_LOW_MS: f64 = 15.0;
const INTERVAL_HIGH_MS: f64 = 25.0;
/// ... and outside this band they are critical
const INTERVAL_CRITICAL_LOW_MS: f64 = 10.0;
const INTERVAL_CRITICAL_HIGH_MS: f64 = 30.0;
/// Inter-send deltas summarized in stats
const STATS_WINDOW: usize = 20;
/// Ticks between periodic `timing_update` pushes (50 × 20 ms = 1 s)
const UPDATE_EVERY_TICKS: u64 = 50;

/// Timing notifications surfaced to bridge clients
#[derive(Debug, Clone)]
pub enum TimingEvent {
    Update(PacerStats),
    Violation(TimingViolation),
}

struct QueuedFrame {
    datagram: Bytes,
    sequence: u16,
    enqueued_at: Instant,
}

struct PacedFlow {
    source: DeviceId,
    target: DeviceId,
    queue: VecDeque<QueuedFrame>,
    last_send: Option<Instant>,
    sent: u64,
    dropped: u64,
    last_buildup_report: Option<Instant>,
}

impl PacedFlow {
    fn new(source: DeviceId, target: DeviceId) -> Self {
        Self {
            source,
            target,
            queue: VecDeque::with_capacity(MAX_BUFFER_SIZE + 1),
            last_send: None,
            sent: 0,
            dropped: 0,
            last_buildup_report: None,
        }
    }
}

struct Release {
    source: DeviceId,
    target: DeviceId,
    datagram: Bytes,
}

/// Synchronous pacer core. The async runner drives `tick` every 20 ms;
/// keeping the logic clock-parameterized makes it testable without
/// sleeping.
struct PacerQueue {
    flows: Vec<PacedFlow>,
    rr_index: usize,
    last_global_send: Option<Instant>,
    last_tick: Option<Instant>,
    /// True once any packet has ever been released
    started: bool,
    /// Last 100 inter-send deltas, milliseconds
    intervals_ms: VecDeque<f64>,
    /// Last 100 violations (diagnostic history)
    violations: VecDeque<TimingViolation>,
    /// Violations accumulated since the runner last drained them
    pending_violations: Vec<TimingViolation>,
    packets_sent: u64,
    packets_dropped: u64,
}

impl PacerQueue {
    fn new() -> Self {
        Self {
            flows: Vec::new(),
            rr_index: 0,
            last_global_send: None,
            last_tick: None,
            started: false,
            intervals_ms: VecDeque::with_capacity(TIMING_HISTORY),
            violations: VecDeque::with_capacity(TIMING_HISTORY),
            pending_violations: Vec::new(),
            packets_sent: 0,
            packets_dropped: 0,
        }
    }

    /// Queue one datagram on its flow. Returns how many frames the cap
    /// evicted (oldest first).
    fn enqueue(
        &mut self,
        source: DeviceId,
        target: DeviceId,
        datagram: Bytes,
        sequence: u16,
        now: Instant,
    ) -> usize {
        let idx = match self
            .flows
            .iter()
            .position(|f| f.source == source && f.target == target)
        {
            Some(idx) => idx,
            None => {
                debug!("paced flow created: {} -> {}", source, target);
                self.flows.push(PacedFlow::new(source, target));
                self.flows.len() - 1
            }
        };
        let flow = &mut self.flows[idx];
        flow.queue.push_back(QueuedFrame {
            datagram,
            sequence,
            enqueued_at: now,
        });

        let mut evicted = 0;
        while flow.queue.len() > MAX_BUFFER_SIZE {
            flow.queue.pop_front();
            flow.dropped += 1;
            evicted += 1;
        }
        self.packets_dropped += evicted as u64;

        Self::sort_by_sequence(&mut flow.queue);
        evicted
    }

    /// Nearest-neighbor reorder mod 2^16. The window is at most 10 deep,
    /// so the base is picked exactly: the element from which every other
    /// sequence lies the shortest distance ahead.
    fn sort_by_sequence(queue: &mut VecDeque<QueuedFrame>) {
        if queue.len() < 2 {
            return;
        }
        let base = queue
            .iter()
            .map(|f| f.sequence)
            .min_by_key(|&candidate| {
                queue
                    .iter()
                    .map(|f| f.sequence.wrapping_sub(candidate))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let mut frames: Vec<QueuedFrame> = queue.drain(..).collect();
        frames.sort_by_key(|f| f.sequence.wrapping_sub(base));
        queue.extend(frames);
    }

    fn push_violation(
        &mut self,
        kind: ViolationKind,
        flow: Option<String>,
        value: f64,
        severity: Severity,
    ) {
        let violation = TimingViolation {
            kind,
            flow,
            value,
            severity,
            timestamp_ms: epoch_ms(),
        };
        self.violations.push_back(violation.clone());
        while self.violations.len() > TIMING_HISTORY {
            self.violations.pop_front();
        }
        self.pending_violations.push(violation);
    }

    fn take_pending_violations(&mut self) -> Vec<TimingViolation> {
        std::mem::take(&mut self.pending_violations)
    }

    /// One pacer tick; releases at most one packet.
    fn tick(&mut self, now: Instant) -> Option<Release> {
        if let Some(last_tick) = self.last_tick {
            let drift_ms = (now.duration_since(last_tick).as_secs_f64() * 1000.0
                - PACKET_INTERVAL_MS as f64)
                .abs();
            let actively_sending =
                self.started && self.flows.iter().any(|f| !f.queue.is_empty());
            if drift_ms > DRIFT_TOLERANCE_MS && actively_sending {
                self.push_violation(
                    ViolationKind::IntervalDrift,
                    None,
                    drift_ms,
                    Severity::Warning,
                );
            }
        }
        self.last_tick = Some(now);

        if self.flows.is_empty() {
            return None;
        }

        let needs_catchup = self.flows.iter().any(|f| {
            f.queue
                .front()
                .map_or(false, |head| now.duration_since(head.enqueued_at) > CATCHUP_AGE)
        });

        if !needs_catchup {
            if let Some(last) = self.last_global_send {
                if now.duration_since(last) < PACKET_INTERVAL - ANTI_BURST_MARGIN {
                    return None;
                }
            }
        }

        let count = self.flows.len();
        for step in 0..count {
            let idx = (self.rr_index + step) % count;
            if self.flows[idx].queue.is_empty() {
                continue;
            }

            let depth = self.flows[idx].queue.len();
            let head_age = self.flows[idx]
                .queue
                .front()
                .map(|head| now.duration_since(head.enqueued_at))
                .unwrap_or_default();

            // Hold back an initial lone packet so playback does not start
            // on a single-frame buffer.
            if !self.started && depth < 2 && head_age < WARMUP_AGE {
                continue;
            }

            if depth > BUILDUP_DEPTH {
                let due = self.flows[idx]
                    .last_buildup_report
                    .map_or(true, |t| now.duration_since(t) >= BUILDUP_REPORT_INTERVAL);
                if due {
                    self.flows[idx].last_buildup_report = Some(now);
                    let label = flow_label(&self.flows[idx]);
                    self.push_violation(
                        ViolationKind::QueueBuildup,
                        Some(label),
                        depth as f64,
                        Severity::Warning,
                    );
                }
            }

            if head_age > MAX_LATENCY {
                let label = flow_label(&self.flows[idx]);
                self.push_violation(
                    ViolationKind::HighLatency,
                    Some(label),
                    head_age.as_secs_f64() * 1000.0,
                    Severity::Critical,
                );
            }

            if let Some(last) = self.last_global_send {
                let delta_ms = now.duration_since(last).as_secs_f64() * 1000.0;
                self.intervals_ms.push_back(delta_ms);
                while self.intervals_ms.len() > TIMING_HISTORY {
                    self.intervals_ms.pop_front();
                }
                if !(INTERVAL_LOW_MS..=INTERVAL_HIGH_MS).contains(&delta_ms) {
                    let severity = if !(INTERVAL_CRITICAL_LOW_MS..=INTERVAL_CRITICAL_HIGH_MS)
                        .contains(&delta_ms)
                    {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    };
                    let label = flow_label(&self.flows[idx]);
                    self.push_violation(
                        ViolationKind::PacketInterval,
                        Some(label),
                        delta_ms,
                        severity,
                    );
                }
            }

            let flow = &mut self.flows[idx];
            let frame = match flow.queue.pop_front() {
                Some(frame) => frame,
                None => continue,
            };
            flow.last_send = Some(now);
            flow.sent += 1;
            let source = flow.source;
            let target = flow.target;

            self.last_global_send = Some(now);
            self.started = true;
            self.packets_sent += 1;
            self.rr_index = (idx + 1) % count;
            return Some(Release {
                source,
                target,
                datagram: frame.datagram,
            });
        }

        self.rr_index = (self.rr_index + 1) % count;
        None
    }

    fn stats(&self, now: Instant) -> PacerStats {
        let window: Vec<f64> = self
            .intervals_ms
            .iter()
            .rev()
            .take(STATS_WINDOW)
            .copied()
            .collect();
        let (min, max, avg) = if window.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let min = window.iter().copied().fold(f64::INFINITY, f64::min);
            let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = window.iter().sum::<f64>() / window.len() as f64;
            (min, max, avg)
        };
        PacerStats {
            packets_sent: self.packets_sent,
            packets_dropped: self.packets_dropped,
            interval_min_ms: min,
            interval_max_ms: max,
            interval_avg_ms: avg,
            flows: self
                .flows
                .iter()
                .map(|f| FlowStats {
                    source: f.source,
                    target: f.target,
                    depth: f.queue.len(),
                    sent: f.sent,
                    dropped: f.dropped,
                    idle_ms: f
                        .last_send
                        .map(|t| now.duration_since(t).as_millis() as u64),
                })
                .collect(),
        }
    }
}

fn flow_label(flow: &PacedFlow) -> String {
    format!("{}->{}", flow.source, flow.target)
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Paced sender: the async shell around [`PacerQueue`] that owns the
/// socket handle and resolves target addresses at release time.
pub struct PacedSender {
    queue: Mutex<PacerQueue>,
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<ServerStats>,
    timing: broadcast::Sender<TimingEvent>,
}

impl PacedSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<DeviceRegistry>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let (timing, _) = broadcast::channel(256);
        Self {
            queue: Mutex::new(PacerQueue::new()),
            socket,
            registry,
            stats,
            timing,
        }
    }

    /// Only the virtual endpoint needs re-timing; physical endpoints are
    /// already the cadence source.
    pub fn should_pace(source: DeviceId, target: DeviceId) -> bool {
        source == VIRTUAL_DEVICE && target != VIRTUAL_DEVICE
    }

    pub fn enqueue(&self, packet: &Packet, target: DeviceId) {
        let evicted = self.queue.lock().unwrap().enqueue(
            packet.device_id,
            target,
            packet.encode(),
            packet.sequence,
            Instant::now(),
        );
        for _ in 0..evicted {
            self.stats.record_dropped();
        }
    }

    pub fn subscribe_timing(&self) -> broadcast::Receiver<TimingEvent> {
        self.timing.subscribe()
    }

    pub fn stats_snapshot(&self) -> PacerStats {
        self.queue.lock().unwrap().stats(Instant::now())
    }

    /// Recent violations, oldest first
    pub fn violation_history(&self) -> Vec<TimingViolation> {
        self.queue.lock().unwrap().violations.iter().cloned().collect()
    }

    /// Tick loop; exits on cancellation
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(PACKET_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (release, violations) = {
                let mut queue = self.queue.lock().unwrap();
                let release = queue.tick(Instant::now());
                (release, queue.take_pending_violations())
            };

            for violation in violations {
                warn!(
                    "timing violation: {:?} {} = {:.1}",
                    violation.kind,
                    violation.flow.as_deref().unwrap_or("-"),
                    violation.value
                );
                let _ = self.timing.send(TimingEvent::Violation(violation));
            }

            if let Some(release) = release {
                match self.registry.address_of(release.target) {
                    Some(addr) => match self.socket.send_to(&release.datagram, addr).await {
                        Ok(sent) => {
                            self.stats.record_routed();
                            self.stats.record_transmitted(sent);
                        }
                        Err(e) => {
                            warn!(
                                "paced send {} -> {} failed: {}",
                                release.source, release.target, e
                            );
                            self.stats.record_dropped();
                        }
                    },
                    None => {
                        debug!("paced target {} offline, frame dropped", release.target);
                        self.stats.record_dropped();
                    }
                }
            }

            ticks += 1;
            if ticks % UPDATE_EVERY_TICKS == 0 {
                let _ = self
                    .timing
                    .send(TimingEvent::Update(self.stats_snapshot()));
            }
        }
        info!("pacer stopped");
    }
}

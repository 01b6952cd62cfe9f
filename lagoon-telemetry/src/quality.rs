// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Connection Quality Scoring
//!
//! Ingests latency, error, and connection-lifecycle samples and produces an
//! advisory 0-100 score. The monitor never blocks or rejects anything; it
//! exists so adaptive callers can make policy decisions ("buffer updates
//! while the connection is poor").
//!
//! # Deductions
//!
//! - **Latency**: average over the window, tiered at 100/300/500/1000 ms
//! - **Jitter**: latency standard deviation
//! - **Packet loss**: estimated from the error-to-message ratio plus 2x
//!   each reconnection
//! - **Reconnections** and **errors**: frequency within the window
//! - **Uptime**: fraction of the window spent connected

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Trailing window over which samples are considered.
const WINDOW: Duration = Duration::from_secs(300);
/// No message for this long while claiming connected means stale.
const STALE_AFTER: Duration = Duration::from_secs(300);

const MAX_LATENCY_SAMPLES: usize = 100;
const MAX_ERROR_SAMPLES: usize = 20;
const MAX_EVENT_SAMPLES: usize = 100;
const MAX_MESSAGE_SAMPLES: usize = 1000;

/// Connection lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
}

/// Bucketed quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Terrible,
    /// Not enough data to score
    Unknown,
}

impl QualityLevel {
    fn from_score(score: u32) -> Self {
        match score {
            85..=100 => QualityLevel::Excellent,
            70..=84 => QualityLevel::Good,
            50..=69 => QualityLevel::Fair,
            30..=49 => QualityLevel::Poor,
            _ => QualityLevel::Terrible,
        }
    }
}

/// Result of one quality assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityAssessment {
    pub level: QualityLevel,
    /// 0-100; `None` when the level is [`QualityLevel::Unknown`]
    pub score: Option<u32>,
}

#[derive(Default)]
struct Window {
    latencies: VecDeque<(Instant, f64)>,
    errors: VecDeque<Instant>,
    events: VecDeque<(Instant, ConnectionEvent)>,
    messages: VecDeque<Instant>,
    last_message: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        let horizon = now.checked_sub(WINDOW);
        let expired = |at: Instant| horizon.map(|h| at < h).unwrap_or(false);
        while self.latencies.front().map_or(false, |(at, _)| expired(*at)) {
            self.latencies.pop_front();
        }
        while self.errors.front().map_or(false, |at| expired(*at)) {
            self.errors.pop_front();
        }
        while self.events.front().map_or(false, |(at, _)| expired(*at)) {
            self.events.pop_front();
        }
        while self.messages.front().map_or(false, |at| expired(*at)) {
            self.messages.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.latencies.is_empty()
            && self.errors.is_empty()
            && self.events.is_empty()
            && self.messages.is_empty()
    }
}

/// Bounded sliding-window monitor of connection health.
///
/// Samples older than five minutes are evicted, and each sample kind is also
/// capped by count (latency 100, errors 20, events 100), oldest first.
pub struct ConnectionQualityMonitor {
    window: Mutex<Window>,
}

impl Default for ConnectionQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionQualityMonitor {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window::default()),
        }
    }

    pub fn record_latency(&self, millis: f64) {
        self.record_latency_at(Instant::now(), millis);
    }

    pub fn record_error(&self) {
        self.record_error_at(Instant::now());
    }

    pub fn record_event(&self, event: ConnectionEvent) {
        self.record_event_at(Instant::now(), event);
    }

    /// Record receipt of any server message; feeds loss estimation and
    /// staleness detection.
    pub fn record_message(&self) {
        self.record_message_at(Instant::now());
    }

    /// Score the current window.
    pub fn assess(&self, is_connected: bool) -> QualityAssessment {
        self.assess_at(Instant::now(), is_connected)
    }

    fn record_latency_at(&self, now: Instant, millis: f64) {
        let mut w = self.window.lock();
        w.prune(now);
        w.latencies.push_back((now, millis));
        while w.latencies.len() > MAX_LATENCY_SAMPLES {
            w.latencies.pop_front();
        }
    }

    fn record_error_at(&self, now: Instant) {
        let mut w = self.window.lock();
        w.prune(now);
        w.errors.push_back(now);
        while w.errors.len() > MAX_ERROR_SAMPLES {
            w.errors.pop_front();
        }
    }

    fn record_event_at(&self, now: Instant, event: ConnectionEvent) {
        debug!(?event, "connection event");
        let mut w = self.window.lock();
        w.prune(now);
        w.events.push_back((now, event));
        while w.events.len() > MAX_EVENT_SAMPLES {
            w.events.pop_front();
        }
    }

    fn record_message_at(&self, now: Instant) {
        let mut w = self.window.lock();
        w.prune(now);
        w.messages.push_back(now);
        while w.messages.len() > MAX_MESSAGE_SAMPLES {
            w.messages.pop_front();
        }
        w.last_message = Some(now);
    }

    fn assess_at(&self, now: Instant, is_connected: bool) -> QualityAssessment {
        let mut w = self.window.lock();
        w.prune(now);

        if w.is_empty() {
            return QualityAssessment {
                level: QualityLevel::Unknown,
                score: None,
            };
        }

        let mut score: i64 = 100;
        score -= latency_deduction(&w.latencies);
        score -= jitter_deduction(&w.latencies);
        score -= loss_deduction(&w);
        score -= reconnect_deduction(&w.events);
        score -= error_deduction(&w.errors);
        score -= uptime_deduction(&w.events, now, is_connected);

        let mut score = score.clamp(0, 100) as u32;
        let mut level = QualityLevel::from_score(score);

        let stale = w
            .last_message
            .map_or(false, |last| now.duration_since(last) > STALE_AFTER);
        if !is_connected || stale {
            // Disconnected or stale caps the level at Poor; a Terrible
            // window stays Terrible.
            if matches!(
                level,
                QualityLevel::Excellent | QualityLevel::Good | QualityLevel::Fair
            ) {
                level = QualityLevel::Poor;
                score = score.min(49);
            }
        }

        QualityAssessment {
            level,
            score: Some(score),
        }
    }
}

fn latency_deduction(latencies: &VecDeque<(Instant, f64)>) -> i64 {
    if latencies.is_empty() {
        return 0;
    }
    let avg = latencies.iter().map(|(_, ms)| ms).sum::<f64>() / latencies.len() as f64;
    match avg {
        avg if avg > 1000.0 => 40,
        avg if avg > 500.0 => 25,
        avg if avg > 300.0 => 15,
        avg if avg > 100.0 => 5,
        _ => 0,
    }
}

fn jitter_deduction(latencies: &VecDeque<(Instant, f64)>) -> i64 {
    if latencies.len() < 2 {
        return 0;
    }
    let n = latencies.len() as f64;
    let mean = latencies.iter().map(|(_, ms)| ms).sum::<f64>() / n;
    let variance = latencies
        .iter()
        .map(|(_, ms)| (ms - mean) * (ms - mean))
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();
    match stddev {
        s if s > 200.0 => 15,
        s if s > 100.0 => 10,
        s if s > 50.0 => 5,
        _ => 0,
    }
}

/// Estimated packet loss: errors relative to delivered messages, with each
/// reconnection counted twice.
fn loss_deduction(w: &Window) -> i64 {
    let reconnects = w
        .events
        .iter()
        .filter(|(_, e)| *e == ConnectionEvent::Reconnected)
        .count();
    let lost = w.errors.len() + 2 * reconnects;
    if lost == 0 {
        return 0;
    }
    let total = (w.messages.len() + w.errors.len()).max(1);
    let ratio = lost as f64 / total as f64;
    match ratio {
        r if r >= 0.10 => 30,
        r if r >= 0.05 => 20,
        r if r >= 0.01 => 10,
        _ => 0,
    }
}

fn reconnect_deduction(events: &VecDeque<(Instant, ConnectionEvent)>) -> i64 {
    let reconnects = events
        .iter()
        .filter(|(_, e)| *e == ConnectionEvent::Reconnected)
        .count();
    match reconnects {
        n if n >= 5 => 20,
        n if n >= 3 => 10,
        n if n >= 1 => 5,
        _ => 0,
    }
}

fn error_deduction(errors: &VecDeque<Instant>) -> i64 {
    match errors.len() {
        n if n >= 10 => 20,
        n if n >= 5 => 10,
        n if n >= 1 => 5,
        _ => 0,
    }
}

/// Fraction of the window spent disconnected, walked from the lifecycle
/// events. The window is assumed connected before its first event.
fn uptime_deduction(
    events: &VecDeque<(Instant, ConnectionEvent)>,
    now: Instant,
    is_connected: bool,
) -> i64 {
    if events.is_empty() {
        return if is_connected { 0 } else { 15 };
    }
    let start = now.checked_sub(WINDOW).unwrap_or(events[0].0);
    let mut down = Duration::ZERO;
    let mut down_since: Option<Instant> = None;
    for (at, event) in events {
        match event {
            ConnectionEvent::Disconnected => {
                if down_since.is_none() {
                    down_since = Some(*at);
                }
            }
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => {
                if let Some(since) = down_since.take() {
                    down += at.duration_since(since);
                }
            }
        }
    }
    if let Some(since) = down_since {
        down += now.duration_since(since);
    }
    let span = now.duration_since(start).max(Duration::from_secs(1));
    let uptime = 1.0 - (down.as_secs_f64() / span.as_secs_f64()).min(1.0);
    match uptime {
        u if u < 0.50 => 30,
        u if u < 0.80 => 15,
        u if u < 0.95 => 5,
        _ => 0,
    }
}

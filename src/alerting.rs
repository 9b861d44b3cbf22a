use crate::consumer::Consumer;
use crate::error::IngestError;
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::{Reading, Timestamp};
use chrono::Duration;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Delivery failure reported by a [`Notifier`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("notification failed: {detail}")]
pub struct NotifyError {
    pub detail: String,
}

impl NotifyError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Outbound text channel (chat bot, SMS gateway, stdout).
///
/// Retries, if any, belong to the implementation.
pub trait Notifier: Send + Sync + std::fmt::Debug {
    fn send_text(&self, text: &str) -> Result<(), NotifyError>;
}

/// Writes every message to stdout, one message per write.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", text)
            .and_then(|_| out.flush())
            .map_err(|e| NotifyError::new(e.to_string()))
    }
}

/// Alerts when a sensor reads at or below its minimum.
///
/// All breaches of one reading go out as a single newline-joined message. Notifier failures
/// are reported through events and never fail `consume`: the alert is independent of whatever
/// other consumers did with the reading.
///
/// With a cooldown, a breach within `cooldown` of the last delivered alert (measured on reading
/// timestamps) is suppressed. The last delivery instant is injected at construction and read
/// back with [`ThresholdAlertConsumer::last_notified`], so it can outlive the process.
#[derive(Debug)]
pub struct ThresholdAlertConsumer {
    thresholds: BTreeMap<String, f64>,
    notifier: Arc<dyn Notifier>,
    cooldown: Option<Duration>,
    last_notified: Mutex<Option<Timestamp>>,
    events: Arc<dyn PipelineEventListener>,
}

impl ThresholdAlertConsumer {
    pub fn new(thresholds: BTreeMap<String, f64>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            thresholds,
            notifier,
            cooldown: None,
            last_notified: Mutex::new(None),
            events: noop_event_listener(),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration, last_notified: Option<Timestamp>) -> Self {
        self.cooldown = Some(cooldown);
        self.last_notified = Mutex::new(last_notified);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn PipelineEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    /// Timestamp of the reading that triggered the last delivered alert.
    pub fn last_notified(&self) -> Result<Option<Timestamp>, IngestError> {
        Ok(*self.last_notified.lock()?)
    }

    /// Alert text for `reading`, or `None` when no sensor breaches its minimum.
    pub fn alert_text(&self, reading: &Reading) -> Option<String> {
        let lines: Vec<String> = self
            .thresholds
            .iter()
            .filter_map(|(name, &minimum)| {
                let value = reading.value(name)?;
                (value <= minimum).then(|| {
                    format!(
                        "{} is {} degrees, which is {} degrees lower than threshold {}!",
                        name,
                        value,
                        minimum - value,
                        minimum
                    )
                })
            })
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

impl Consumer for ThresholdAlertConsumer {
    fn consume(&self, reading: &Reading) -> Result<(), IngestError> {
        let Some(text) = self.alert_text(reading) else {
            return Ok(());
        };

        let mut last = self.last_notified.lock()?;
        if let (Some(cooldown), Some(last_sent)) = (self.cooldown, *last) {
            // A window ending past the representable range never elapses.
            let cooling = match last_sent.checked_add_signed(cooldown) {
                Some(until) => reading.timestamp() < until,
                None => true,
            };
            if cooling {
                self.events.on_event(PipelineEvent::AlertSuppressed {
                    timestamp: reading.timestamp(),
                    last_sent,
                });
                return Ok(());
            }
        }

        match self.notifier.send_text(&text) {
            Ok(()) => {
                *last = Some(reading.timestamp());
                pipeline_metrics::record_alert_sent();
                self.events.on_event(PipelineEvent::AlertSent {
                    timestamp: reading.timestamp(),
                    message: text,
                });
            }
            Err(e) => self.events.on_event(PipelineEvent::AlertFailed {
                timestamp: reading.timestamp(),
                error: e.to_string(),
            }),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "threshold-alert"
    }
}

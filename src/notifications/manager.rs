//! Alert manager with per-key cooldown

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::channels::webhook::{WebhookChannel, WebhookConfig};
use super::channels::{Channel, ChannelResult};
use super::{Alert, AlertKind, AlertSeverity, AlertTarget};

const HISTORY_LIMIT: usize = 256;

type AlertKey = (AlertTarget, AlertKind);

#[derive(Default)]
struct AlertState {
    /// Firing alerts by key
    active: HashMap<AlertKey, Alert>,

    /// Last time each key fired; cleared on resolve
    last_fired: HashMap<AlertKey, DateTime<Utc>>,

    /// Fired and resolved alerts, newest last
    history: VecDeque<Alert>,
}

/// Coordinates alert cooldown, lifecycle and delivery
pub struct AlertManager {
    channels: Vec<Arc<dyn Channel>>,
    state: Mutex<AlertState>,
    cooldown: Duration,
}

impl AlertManager {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            channels: Vec::new(),
            state: Mutex::new(AlertState::default()),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Add a notification channel
    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channels.push(channel);
    }

    /// Add a webhook channel with URL and optional bearer token
    pub fn add_webhook_channel(&mut self, url: &str, token: Option<&str>) -> ChannelResult<()> {
        let mut config = WebhookConfig::new(url);
        if let Some(token) = token {
            config = config.with_auth_token(token);
        }
        self.add_channel(Arc::new(WebhookChannel::new(config)?));
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fire an alert unless the same key fired within the cooldown window.
    /// Returns the alert that was delivered, if any.
    pub async fn raise(
        &self,
        target: AlertTarget,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let key = (target.clone(), kind);

        let alert = {
            let mut state = self.state();
            if let Some(&last) = state.last_fired.get(&key) {
                if now - last < self.cooldown {
                    tracing::debug!(alert_target = %target, kind = kind.as_str(), "Alert suppressed by cooldown");
                    return None;
                }
            }

            let alert = Alert::new(target, kind, severity, message, now);
            state.last_fired.insert(key.clone(), now);
            state.active.insert(key, alert.clone());
            push_history(&mut state.history, alert.clone());
            alert
        };

        self.deliver(&alert).await;
        Some(alert)
    }

    /// Resolve a firing alert and reset its cooldown
    pub async fn resolve(
        &self,
        target: &AlertTarget,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let key = (target.clone(), kind);

        let alert = {
            let mut state = self.state();
            state.last_fired.remove(&key);
            let mut alert = state.active.remove(&key)?;
            alert.resolve(now);
            push_history(&mut state.history, alert.clone());
            alert
        };

        self.deliver(&alert).await;
        Some(alert)
    }

    async fn deliver(&self, alert: &Alert) {
        for channel in &self.channels {
            match channel.send(alert).await {
                Ok(status) if status.success => {}
                Ok(status) => tracing::warn!(channel = channel.name(), %status, "Alert delivery failed"),
                Err(e) => tracing::error!(channel = channel.name(), error = %e, "Failed to send alert to channel"),
            }
        }
    }

    /// Currently firing alerts
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state().active.values().cloned().collect();
        alerts.sort_by_key(|a| a.fired_at);
        alerts
    }

    pub fn is_firing(&self, target: &AlertTarget, kind: AlertKind) -> bool {
        self.state().active.contains_key(&(target.clone(), kind))
    }

    /// Recent alert events, oldest first
    pub fn history(&self) -> Vec<Alert> {
        self.state().history.iter().cloned().collect()
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(alert);
}

//! Channel that writes alerts to the tracing log

use async_trait::async_trait;

use super::{Channel, ChannelResult, DeliveryStatus};
use crate::notifications::{Alert, AlertSeverity, AlertStatus};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> ChannelResult<DeliveryStatus> {
        let target = alert.target.to_string();
        match (alert.status, alert.severity) {
            (AlertStatus::Resolved, _) => tracing::info!(
                alert_id = %alert.id,
                alert_target = %target,
                kind = alert.kind.as_str(),
                "Alert resolved"
            ),
            (AlertStatus::Firing, AlertSeverity::Critical) => tracing::error!(
                alert_id = %alert.id,
                alert_target = %target,
                kind = alert.kind.as_str(),
                message = %alert.message,
                "Alert fired"
            ),
            (AlertStatus::Firing, _) => tracing::warn!(
                alert_id = %alert.id,
                alert_target = %target,
                kind = alert.kind.as_str(),
                message = %alert.message,
                "Alert fired"
            ),
        }

        Ok(DeliveryStatus::success(self.name()))
    }
}

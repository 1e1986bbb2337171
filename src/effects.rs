//! Side effects that run after a state change has been committed.

use std::sync::Arc;

use crate::domain::events::DomainEvent;
use crate::notify::{Notification, Notifier};

#[derive(Clone, Debug)]
pub enum Effect {
    Notify(Notification),
    Publish(DomainEvent),
}

/// Executes effects best-effort. Failures are logged and never returned.
#[derive(Clone)]
pub struct EffectRunner {
    notifier: Arc<dyn Notifier>,
    nats: Option<async_nats::Client>,
}

impl EffectRunner {
    pub fn new(notifier: Arc<dyn Notifier>, nats: Option<async_nats::Client>) -> Self {
        Self { notifier, nats }
    }

    pub async fn run(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(n) => {
                    if let Err(e) = self.notifier.send(&n).await {
                        tracing::warn!(to = %n.to, subject = %n.subject, error = %e, "notification failed");
                    }
                }
                Effect::Publish(event) => self.publish(&event).await,
            }
        }
    }

    async fn publish(&self, event: &DomainEvent) {
        let Some(nats) = &self.nats else { return };
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(subject = event.subject(), error = %e, "event encoding failed");
                return;
            }
        };
        if let Err(e) = nats.publish(event.subject().to_string(), payload.into()).await {
            tracing::warn!(subject = event.subject(), error = %e, "event publish failed");
        }
    }
}

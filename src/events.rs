use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::controller::ProxyMode;
use crate::service_config::ServiceConfig;

/// Everything that travels over the bus.
///
/// The first group are requests handled by the dispatcher; the last two are status broadcasts
/// for observers such as a tray or UI.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ProxyModeChange(ProxyMode),
    ProxyStart,
    ProxyStop,
    /// `None` builds the config from the persisted template and outbound.
    CoreStart(Option<ServiceConfig>),
    CoreStop,
    CoreCheck,
    PacUserRulesUpdate(String),
    /// New block-list source text, plain or base64 encoded.
    PacBaseRulesUpdate(String),
    ProxyStatusChanged { active: bool, mode: ProxyMode },
    CoreStatusChanged(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ProxyModeChange,
    ProxyStart,
    ProxyStop,
    CoreStart,
    CoreStop,
    CoreCheck,
    PacUserRulesUpdate,
    PacBaseRulesUpdate,
    ProxyStatus,
    CoreStatus,
}

impl CoreEvent {
    pub fn topic(&self) -> Topic {
        match self {
            CoreEvent::ProxyModeChange(_) => Topic::ProxyModeChange,
            CoreEvent::ProxyStart => Topic::ProxyStart,
            CoreEvent::ProxyStop => Topic::ProxyStop,
            CoreEvent::CoreStart(_) => Topic::CoreStart,
            CoreEvent::CoreStop => Topic::CoreStop,
            CoreEvent::CoreCheck => Topic::CoreCheck,
            CoreEvent::PacUserRulesUpdate(_) => Topic::PacUserRulesUpdate,
            CoreEvent::PacBaseRulesUpdate(_) => Topic::PacBaseRulesUpdate,
            CoreEvent::ProxyStatusChanged { .. } => Topic::ProxyStatus,
            CoreEvent::CoreStatusChanged(_) => Topic::CoreStatus,
        }
    }

    /// Requests are acted on by the dispatcher; everything else is informational.
    pub fn is_request(&self) -> bool {
        !matches!(self.topic(), Topic::ProxyStatus | Topic::CoreStatus)
    }
}

pub type Handler = Arc<dyn Fn(&CoreEvent) -> anyhow::Result<()> + Send + Sync>;

/// Process-wide typed pub/sub.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(Option<Topic>, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&CoreEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.subscribers.write().push((Some(topic), handler));
    }

    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&CoreEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.subscribers.write().push((None, handler));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Calls matching handlers synchronously, in subscription order.
    ///
    /// The list is snapshotted first, so a handler may publish or subscribe. A failing or
    /// panicking handler is logged and the remaining handlers still run.
    pub fn publish(&self, event: &CoreEvent) {
        let topic = event.topic();
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .iter()
            .filter(|(t, _)| t.map_or(true, |t| t == topic))
            .map(|(_, h)| Arc::clone(h))
            .collect();
        log::debug!("[EVENTS] {:?} -> {} handler(s)", topic, handlers.len());
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("[EVENTS] Handler for {:?} failed: {:#}", topic, e),
                Err(_) => log::error!("[EVENTS] Handler for {:?} panicked", topic),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn handlers_run_in_order_for_their_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.subscribe(Topic::CoreStatus, move |_| {
                seen.lock().push(tag);
                Ok(())
            });
        }
        let other = seen.clone();
        bus.subscribe(Topic::ProxyStatus, move |_| {
            other.lock().push("proxy");
            Ok(())
        });
        bus.publish(&CoreEvent::CoreStatusChanged(true));
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        bus.subscribe_all(|_| anyhow::bail!("nope"));
        bus.subscribe_all(|_| panic!("boom"));
        let c = count.clone();
        bus.subscribe_all(move |_| {
            *c.lock() += 1;
            Ok(())
        });
        bus.publish(&CoreEvent::CoreCheck);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn handlers_may_publish() {
        let bus = Arc::new(EventBus::new());
        let got = Arc::new(Mutex::new(None));
        let inner = Arc::downgrade(&bus);
        bus.subscribe(Topic::CoreCheck, move |_| {
            if let Some(bus) = inner.upgrade() {
                bus.publish(&CoreEvent::CoreStatusChanged(false));
            }
            Ok(())
        });
        let g = got.clone();
        bus.subscribe(Topic::CoreStatus, move |e| {
            if let CoreEvent::CoreStatusChanged(running) = e {
                *g.lock() = Some(*running);
            }
            Ok(())
        });
        bus.publish(&CoreEvent::CoreCheck);
        assert_eq!(*got.lock(), Some(false));
    }

    #[test]
    fn broadcasts_are_not_requests() {
        assert!(CoreEvent::ProxyStart.is_request());
        assert!(!CoreEvent::ProxyStatusChanged { active: true, mode: ProxyMode::Pac }.is_request());
    }
}

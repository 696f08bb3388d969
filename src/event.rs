use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::cluster::types::ContainerDescriptor;

/// Control events exchanged between the supervisor and its host application.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Request one new container, optionally carrying the container being
    /// replaced so the scheduler can prefer its node.
    NewContainerRequest {
        replaced_container: Option<ContainerDescriptor>,
    },
    /// Stop the given containers.
    ContainerShutdownRequest {
        containers: Vec<ContainerDescriptor>,
    },
    /// Shut the application master down.
    ApplicationMasterShutdownRequest,
}

/// In-process typed publish/subscribe channel.
///
/// Delivery enqueues onto each subscriber's channel in registration order,
/// so ordering is preserved per publisher and a subscriber may publish from
/// inside its own handler without deadlocking.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ControlEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; events published after this call are delivered
    /// on the returned channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ControlEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, dropping any whose
    /// receiver has gone away.
    pub fn publish(&self, event: ControlEvent) {
        self.lock_subscribers()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ControlEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

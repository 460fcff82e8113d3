//! Notification collaborator.
//!
//! Presentation is owned elsewhere; this module only names the notifications
//! the core raises and dismisses.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Notification slots raised or dismissed by pod operations
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationId {
    PodFault,
    PodNotAttached,
    PodSuspended,
    TimeOutOfSync,
    TbrAlerts,
    UncertainSmb,
    UncertainBolus,
    FailedUpdateProfile,
    ProfileSetOk,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Info,
    Urgent,
    /// Blocking alarm dialog
    Alarm,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    pub urgency: Urgency,
    pub sound: bool,
}

impl Notification {
    pub fn urgent(id: NotificationId, message: impl Into<String>, sound: bool) -> Self {
        Self {
            id,
            message: message.into(),
            urgency: Urgency::Urgent,
            sound,
        }
    }
}

/// Sink for user-facing notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
    fn dismiss(&self, id: NotificationId);
    /// Progress of a user-requested bolus
    fn bolus_progress(&self, delivered: f64, requested: f64, percent: u8);
    /// The pod reported a fault and has stopped delivering
    fn pod_fault(&self, fault_code: Option<u8>);
}

/// Notifier that only logs
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::warn!(
            "[{:?}/{:?}] {}",
            notification.id,
            notification.urgency,
            notification.message
        );
    }

    fn dismiss(&self, id: NotificationId) {
        tracing::debug!("Dismissed notification {:?}", id);
    }

    fn bolus_progress(&self, delivered: f64, requested: f64, percent: u8) {
        tracing::info!("Bolus delivered so far: {delivered:.2}/{requested:.2} U ({percent}%)");
    }

    fn pod_fault(&self, fault_code: Option<u8>) {
        tracing::error!("Pod fault: {:?}", fault_code);
    }
}

/// Events captured by [`RecordingNotifier`]
#[derive(Clone, Debug, PartialEq)]
pub enum NotifierEvent {
    Notified(Notification),
    Dismissed(NotificationId),
    Progress { delivered: f64, percent: u8 },
    PodFault(Option<u8>),
}

/// Notifier that records every call, for tests and the CLI summary
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn notified(&self, id: NotificationId) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, NotifierEvent::Notified(n) if n.id == id))
    }

    pub fn dismissed(&self, id: NotificationId) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, NotifierEvent::Dismissed(d) if *d == id))
    }

    fn push(&self, event: NotifierEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.push(NotifierEvent::Notified(notification));
    }

    fn dismiss(&self, id: NotificationId) {
        self.push(NotifierEvent::Dismissed(id));
    }

    fn bolus_progress(&self, delivered: f64, _requested: f64, percent: u8) {
        self.push(NotifierEvent::Progress { delivered, percent });
    }

    fn pod_fault(&self, fault_code: Option<u8>) {
        self.push(NotifierEvent::PodFault(fault_code));
    }
}

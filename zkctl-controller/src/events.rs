//! External events and the per-unit command channel.

use crate::actions::{ActionOutput, OperatorAction};
use crate::quorum::DesiredMembership;
use crate::status::ControllerStatus;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use zkctl_core::{Result, TlsDesired, UnitId};

/// Something the controller is asked to rotate.
#[derive(Clone, PartialEq, Eq)]
pub enum RotationRequest {
    /// Rotate a managed account; a missing secret is generated or, when a
    /// rotation is already open, the pending one is announced again
    Credential {
        username: String,
        secret: Option<String>,
    },
    /// Install an operator key on one unit
    PrivateKey { unit: UnitId, key_pem: String },
    /// Renew every certificate now
    CertificateRenewal,
}

impl fmt::Debug for RotationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationRequest::Credential { username, secret } => f
                .debug_struct("Credential")
                .field("username", username)
                .field("secret", &secret.as_ref().map(|_| "<redacted>"))
                .finish(),
            RotationRequest::PrivateKey { unit, .. } => f
                .debug_struct("PrivateKey")
                .field("unit", unit)
                .finish_non_exhaustive(),
            RotationRequest::CertificateRenewal => write!(f, "CertificateRenewal"),
        }
    }
}

/// External events; each one triggers a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MembershipChanged(DesiredMembership),
    ConfigChanged {
        options: BTreeMap<String, String>,
        tls: TlsDesired,
    },
    RelationBroken { unit: UnitId },
    RotationRequested(RotationRequest),
    /// The platform installed a new server version; requesting the
    /// previous one rolls back a failed upgrade
    UpgradeRequested { version: String },
    HealthTick,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MembershipChanged(_) => "membership-changed",
            Event::ConfigChanged { .. } => "config-changed",
            Event::RelationBroken { .. } => "relation-broken",
            Event::RotationRequested(_) => "rotation-requested",
            Event::UpgradeRequested { .. } => "upgrade-requested",
            Event::HealthTick => "health-tick",
        }
    }
}

/// FIFO of events waiting for a pass.
///
/// Only the newest queued event is merged with: an equal event is dropped,
/// and an event carrying whole desired state replaces a tail of its kind.
/// Anything else keeps its arrival order. Health ticks carry nothing, so a
/// tick already waiting anywhere absorbs a new one.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the event was merged into a queued one.
    pub fn push(&mut self, event: Event) -> bool {
        if event == Event::HealthTick && self.events.contains(&event) {
            return false;
        }

        if let Some(last) = self.events.back_mut() {
            let supersedes = matches!(
                (&*last, &event),
                (Event::MembershipChanged(_), Event::MembershipChanged(_))
                    | (Event::ConfigChanged { .. }, Event::ConfigChanged { .. })
                    | (Event::UpgradeRequested { .. }, Event::UpgradeRequested { .. })
            );
            if *last == event || supersedes {
                *last = event;
                return false;
            }
        }

        self.events.push_back(event);
        true
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Messages accepted by a running controller.
#[derive(Debug)]
pub enum ControllerCommand {
    Event(Event),
    Action(OperatorAction, oneshot::Sender<Result<ActionOutput>>),
    GetStatus(oneshot::Sender<ControllerStatus>),
    Shutdown,
}

pub type ControllerCommandSender = mpsc::UnboundedSender<ControllerCommand>;
pub type ControllerCommandReceiver = mpsc::UnboundedReceiver<ControllerCommand>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_dropped() {
        let mut queue = EventQueue::new();
        assert!(queue.push(Event::HealthTick));
        assert!(queue.push(Event::RelationBroken {
            unit: UnitId::new(2)
        }));
        assert!(!queue.push(Event::RelationBroken {
            unit: UnitId::new(2)
        }));
        assert!(!queue.push(Event::HealthTick));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_newer_membership_replaces_tail() {
        let mut queue = EventQueue::new();
        queue.push(Event::HealthTick);
        queue.push(Event::MembershipChanged(DesiredMembership::voters(0..3)));
        assert!(!queue.push(Event::MembershipChanged(DesiredMembership::voters(0..5))));

        assert_eq!(queue.pop(), Some(Event::HealthTick));
        assert_eq!(
            queue.pop(),
            Some(Event::MembershipChanged(DesiredMembership::voters(0..5)))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_arrival_order_is_kept() {
        let mut queue = EventQueue::new();
        let grown = Event::MembershipChanged(DesiredMembership::voters(0..4));
        let broken = Event::RelationBroken {
            unit: UnitId::new(3),
        };
        assert!(queue.push(grown.clone()));
        assert!(queue.push(broken.clone()));
        assert!(queue.push(grown.clone()));

        assert_eq!(queue.pop(), Some(grown.clone()));
        assert_eq!(queue.pop(), Some(broken));
        assert_eq!(queue.pop(), Some(grown));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rotation_secrets_are_redacted() {
        let event = Event::RotationRequested(RotationRequest::Credential {
            username: "super".to_string(),
            secret: Some("hunter2".to_string()),
        });
        let printed = format!("{:?}", event);
        assert!(printed.contains("super"));
        assert!(!printed.contains("hunter2"));
    }
}

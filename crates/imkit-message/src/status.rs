use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use imkit_core::{ImError, ImResult};

/// Delivery state of an outgoing message.
///
/// `None → Sending → Sent → Delivered`, or `Sending → Failed`. `Delivered`
/// and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    None,
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::None, Self::Sending)
                | (Self::Sending, Self::Sent)
                | (Self::Sending, Self::Failed)
                | (Self::Sent, Self::Delivered)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct DeliveryState {
    status: MessageStatus,
    delivered_at: Option<DateTime<Utc>>,
}

/// Delivery state shared by all clones of one message, so the session layer
/// can advance it after `send` has handed the message back.
#[derive(Debug, Clone, Default)]
pub(crate) struct Delivery(Arc<RwLock<DeliveryState>>);

impl Delivery {
    pub(crate) fn with_status(status: MessageStatus) -> Self {
        Self(Arc::new(RwLock::new(DeliveryState {
            status,
            delivered_at: None,
        })))
    }

    pub(crate) fn status(&self) -> MessageStatus {
        self.0.read().status
    }

    pub(crate) fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.0.read().delivered_at
    }

    pub(crate) fn restore_delivered_at(&self, at: Option<DateTime<Utc>>) {
        self.0.write().delivered_at = at;
    }

    pub(crate) fn advance(&self, next: MessageStatus) -> ImResult<()> {
        let mut state = self.0.write();
        if !state.status.can_transition_to(next) {
            return Err(ImError::InvalidMessageState {
                expected: expected_before(next),
                actual: state.status.as_str(),
            });
        }
        state.status = next;
        Ok(())
    }

    pub(crate) fn mark_delivered(&self, at: DateTime<Utc>) -> ImResult<()> {
        let mut state = self.0.write();
        if !state.status.can_transition_to(MessageStatus::Delivered) {
            return Err(ImError::InvalidMessageState {
                expected: "sent",
                actual: state.status.as_str(),
            });
        }
        state.status = MessageStatus::Delivered;
        state.delivered_at = Some(at);
        Ok(())
    }
}

fn expected_before(next: MessageStatus) -> &'static str {
    match next {
        MessageStatus::Sending => "none",
        MessageStatus::Sent | MessageStatus::Failed => "sending",
        MessageStatus::Delivered => "sent",
        MessageStatus::None => "nothing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MessageStatus; 5] = [
        MessageStatus::None,
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Failed,
    ];

    #[test]
    fn test_terminal_states_never_regress() {
        for terminal in [MessageStatus::Delivered, MessageStatus::Failed] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_happy_path() {
        let delivery = Delivery::default();
        delivery.advance(MessageStatus::Sending).unwrap();
        delivery.advance(MessageStatus::Sent).unwrap();
        delivery.mark_delivered(Utc::now()).unwrap();
        assert_eq!(delivery.status(), MessageStatus::Delivered);
        assert!(delivery.delivered_at().is_some());
    }

    #[test]
    fn test_failed_cannot_be_resent_in_place() {
        let delivery = Delivery::default();
        delivery.advance(MessageStatus::Sending).unwrap();
        delivery.advance(MessageStatus::Failed).unwrap();
        let err = delivery.advance(MessageStatus::Sending).unwrap_err();
        assert!(matches!(
            err,
            ImError::InvalidMessageState { actual: "failed", .. }
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let delivery = Delivery::default();
        let other = delivery.clone();
        delivery.advance(MessageStatus::Sending).unwrap();
        assert_eq!(other.status(), MessageStatus::Sending);
    }
}

//! Ack consistency: does the peer's ack confirm the topic we last sent?
//!
//! Diagnostic only. A mismatch is logged and never changes what the node does next;
//! lost or duplicated datagrams produce mismatches in normal operation.

use crate::protocol::{Packet, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCheck {
    Confirmed,
    Mismatch { sent: Topic, confirmed: Topic },
}

impl AckCheck {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, AckCheck::Confirmed)
    }
}

/// Compare the ack in `incoming` with the topic of `outgoing`.
pub fn check_ack(outgoing: &Packet, incoming: &Packet) -> AckCheck {
    let confirmed = incoming.ack.topic();
    if confirmed == outgoing.topic {
        AckCheck::Confirmed
    } else {
        AckCheck::Mismatch {
            sent: outgoing.topic,
            confirmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckTopic, Payload};

    fn p(topic: Topic, ack: AckTopic) -> Packet {
        Packet::new(topic, ack, Payload::empty())
    }

    #[test]
    fn matching_ack_confirms() {
        let sent = p(Topic::WifiSsid, AckTopic::ReceivedHandshake);
        let reply = p(Topic::WifiSsid, AckTopic::ReceivedWifiSsid);
        assert!(check_ack(&sent, &reply).is_confirmed());
    }

    #[test]
    fn stale_ack_is_reported() {
        let sent = p(Topic::WifiPassword, AckTopic::ReceivedWifiSsid);
        let reply = p(Topic::WifiSsid, AckTopic::ReceivedWifiSsid);
        assert_eq!(
            check_ack(&sent, &reply),
            AckCheck::Mismatch {
                sent: Topic::WifiPassword,
                confirmed: Topic::WifiSsid
            }
        );
    }
}

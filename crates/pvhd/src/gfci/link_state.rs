//! Link state machine, free of I/O.
//!
//! ```text
//! CONNECTING ──exchange ok──▶ UP ──miss──▶ DEGRADED ──max misses──▶ DOWN
//!                             ▲               │                      │
//!                             └──exchange ok──┘                      │
//!        transport lost (any state) ─────────────────────────────────▶│
//! DOWN stays DOWN through reconnect attempts until an exchange succeeds.
//! ```

use pvh_core::LinkState;

#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: LinkState,
    missed: u32,
    max_missed: u32,
}

impl LinkStateMachine {
    pub fn new(max_missed: u32) -> Self {
        Self {
            state: LinkState::Connecting,
            missed: 0,
            max_missed: max_missed.max(1),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn set_max_missed(&mut self, max_missed: u32) {
        self.max_missed = max_missed.max(1);
    }

    /// Transport connected. The reported state only leaves DOWN once a
    /// heartbeat exchange succeeds.
    pub fn on_connected(&mut self) -> Option<(LinkState, LinkState)> {
        self.missed = 0;
        match self.state {
            LinkState::Down => None,
            _ => self.enter(LinkState::Connecting),
        }
    }

    /// A heartbeat was answered by an ACK with the same sequence number.
    pub fn on_exchange_ok(&mut self) -> Option<(LinkState, LinkState)> {
        self.missed = 0;
        self.enter(LinkState::Up)
    }

    /// A heartbeat went unanswered for a full interval.
    pub fn on_heartbeat_missed(&mut self) -> Option<(LinkState, LinkState)> {
        self.missed = self.missed.saturating_add(1);
        if self.missed >= self.max_missed {
            return self.enter(LinkState::Down);
        }
        match self.state {
            LinkState::Up => self.enter(LinkState::Degraded),
            _ => None,
        }
    }

    /// EOF or I/O error on the connection.
    pub fn on_transport_lost(&mut self) -> Option<(LinkState, LinkState)> {
        self.enter(LinkState::Down)
    }

    fn enter(&mut self, next: LinkState) -> Option<(LinkState, LinkState)> {
        let from = self.state;
        self.state = next;
        (from != next).then_some((from, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_exchange_brings_link_up() {
        let mut link = LinkStateMachine::new(3);
        assert_eq!(link.on_connected(), None);
        assert_eq!(
            link.on_exchange_ok(),
            Some((LinkState::Connecting, LinkState::Up))
        );
    }

    #[test]
    fn test_miss_degrades_and_exchange_recovers() {
        let mut link = LinkStateMachine::new(3);
        link.on_exchange_ok();
        assert_eq!(
            link.on_heartbeat_missed(),
            Some((LinkState::Up, LinkState::Degraded))
        );
        assert_eq!(link.on_heartbeat_missed(), None);
        assert_eq!(
            link.on_exchange_ok(),
            Some((LinkState::Degraded, LinkState::Up))
        );
        assert_eq!(link.missed(), 0);
    }

    #[test]
    fn test_max_consecutive_misses_is_down() {
        let mut link = LinkStateMachine::new(3);
        link.on_exchange_ok();
        link.on_heartbeat_missed();
        link.on_heartbeat_missed();
        assert_eq!(
            link.on_heartbeat_missed(),
            Some((LinkState::Degraded, LinkState::Down))
        );
    }

    #[test]
    fn test_down_persists_through_reconnect() {
        let mut link = LinkStateMachine::new(3);
        link.on_exchange_ok();
        link.on_transport_lost();
        assert_eq!(link.on_connected(), None);
        assert_eq!(link.state(), LinkState::Down);
        assert_eq!(
            link.on_exchange_ok(),
            Some((LinkState::Down, LinkState::Up))
        );
    }

    #[test]
    fn test_connecting_without_answer_goes_down() {
        let mut link = LinkStateMachine::new(2);
        assert_eq!(link.on_heartbeat_missed(), None);
        assert_eq!(
            link.on_heartbeat_missed(),
            Some((LinkState::Connecting, LinkState::Down))
        );
    }
}

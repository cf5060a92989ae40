use tracing::trace;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionRole {
    /// The side that connects, and reconnects after a loss
    Initiator,
    /// The side that accepted the connection, and waits for the peer to reconnect
    Acceptor,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectState {
    Init,
    Lost,
    Reconnected,
    PassiveWaiting,
    PassiveTimeoutCalled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectEvent {
    /// A read or write on the connection's current socket failed
    LossDetected { role: ConnectionRole, passive_reconnect_enabled: bool },
    ActiveRetrySucceeded,
    ActiveRetriesExhausted,
    PassiveTimerFired,
    /// A freshly accepted connection takes over from this one. Loss is final: a connection
    ///  whose loss was notified cannot be taken over.
    Replaced,
    /// Sending stayed queued or suspended for longer than the configured maximum
    BackpressureTimeout,
    /// The peer announced that it closes the connection on purpose
    GracefulClose,
    /// A new association was added to an initiator's channel whose connection is down
    NewAssociation,
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectAction {
    Ignore,
    /// Run the initiator's reconnect: the backoff loop after a loss, or a single attempt for a
    ///  new association
    RetryActive,
    /// Arm the passive reconnect timer and wait for the peer
    AwaitPassive,
    /// Notify the channel's loss
    DeclareLost,
    NotifyReconnected,
    /// Transfer the channel to the replacing connection, notifying 'reconnected' if the
    ///  channel was known to be down
    HandOver { notify_reconnected: bool },
    Close,
}

/// The reconnect state of a single connection. All state changes go through [Self::on_event],
///  which is called with the connection's reconnect lock held. This is where the invariant
///  'loss is notified at most once' lives: [ReconnectAction::DeclareLost] is only returned when
///  no loss was notified since the connection was last (re)established.
#[derive(Debug)]
pub struct ReconnectMachine {
    state: ReconnectState,
    loss_notified: bool,
    closed: bool,
}

impl Default for ReconnectMachine {
    fn default() -> Self {
        ReconnectMachine {
            state: ReconnectState::Init,
            loss_notified: false,
            closed: false,
        }
    }
}

impl ReconnectMachine {
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_healthy(&self) -> bool {
        matches!(self.state, ReconnectState::Init | ReconnectState::Reconnected)
    }

    fn declare_lost(&mut self, new_state: ReconnectState) -> ReconnectAction {
        self.state = new_state;
        if self.loss_notified {
            ReconnectAction::Ignore
        }
        else {
            self.loss_notified = true;
            ReconnectAction::DeclareLost
        }
    }

    pub fn on_event(&mut self, event: ReconnectEvent) -> ReconnectAction {
        let action = self.transition(event);
        trace!("reconnect state machine: {:?} -> {:?} / {:?}", event, self.state, action);
        action
    }

    fn transition(&mut self, event: ReconnectEvent) -> ReconnectAction {
        use ReconnectAction::*;
        use ReconnectEvent::*;
        use ReconnectState::*;

        if self.closed {
            return Ignore;
        }

        match event {
            LossDetected { role, passive_reconnect_enabled } => {
                if !self.is_healthy() {
                    return Ignore;
                }
                match (role, passive_reconnect_enabled) {
                    (ConnectionRole::Initiator, _) => RetryActive,
                    (ConnectionRole::Acceptor, true) => {
                        self.state = PassiveWaiting;
                        AwaitPassive
                    }
                    (ConnectionRole::Acceptor, false) => self.declare_lost(Lost),
                }
            }
            ActiveRetrySucceeded => {
                if self.is_healthy() || self.state == Lost {
                    self.state = Reconnected;
                    self.loss_notified = false;
                    NotifyReconnected
                }
                else {
                    Ignore
                }
            }
            ActiveRetriesExhausted => {
                if self.is_healthy() || self.state == Lost {
                    self.declare_lost(Lost)
                }
                else {
                    Ignore
                }
            }
            PassiveTimerFired => {
                if self.state == PassiveWaiting {
                    self.declare_lost(PassiveTimeoutCalled)
                }
                else {
                    Ignore
                }
            }
            Replaced => {
                // the loss was already reported, and the link torn down with it
                if self.loss_notified {
                    return Ignore;
                }
                let notify_reconnected = !self.is_healthy();
                // the replaced connection is retired for good
                self.state = Lost;
                self.loss_notified = true;
                self.closed = true;
                HandOver { notify_reconnected }
            }
            BackpressureTimeout => {
                if self.is_healthy() || self.state == PassiveWaiting {
                    self.declare_lost(Lost)
                }
                else {
                    Ignore
                }
            }
            GracefulClose => {
                self.state = Lost;
                self.loss_notified = true;
                self.closed = true;
                Close
            }
            NewAssociation => {
                if self.state == Lost {
                    RetryActive
                }
                else {
                    Ignore
                }
            }
            Shutdown => {
                self.state = Lost;
                self.closed = true;
                Close
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ConnectionRole::*;
    use ReconnectAction::*;
    use ReconnectEvent::*;
    use ReconnectState::*;

    const INITIATOR_LOSS: ReconnectEvent = LossDetected { role: Initiator, passive_reconnect_enabled: true };
    const ACCEPTOR_LOSS: ReconnectEvent = LossDetected { role: Acceptor, passive_reconnect_enabled: true };
    const ACCEPTOR_LOSS_NO_PASSIVE: ReconnectEvent = LossDetected { role: Acceptor, passive_reconnect_enabled: false };

    #[rstest]
    #[case::initiator_retries(vec![INITIATOR_LOSS], Init, vec![RetryActive])]
    #[case::initiator_reconnects(vec![INITIATOR_LOSS, ActiveRetrySucceeded], Reconnected, vec![RetryActive, NotifyReconnected])]
    #[case::initiator_lost(vec![INITIATOR_LOSS, ActiveRetriesExhausted], Lost, vec![RetryActive, DeclareLost])]
    #[case::initiator_lost_ignores_loss(vec![INITIATOR_LOSS, ActiveRetriesExhausted, INITIATOR_LOSS], Lost, vec![RetryActive, DeclareLost, Ignore])]
    #[case::initiator_lost_once(vec![INITIATOR_LOSS, ActiveRetriesExhausted, ActiveRetriesExhausted], Lost, vec![RetryActive, DeclareLost, Ignore])]
    #[case::initiator_second_loss(vec![INITIATOR_LOSS, ActiveRetrySucceeded, INITIATOR_LOSS, ActiveRetriesExhausted], Lost, vec![RetryActive, NotifyReconnected, RetryActive, DeclareLost])]
    #[case::new_association_on_healthy(vec![NewAssociation], Init, vec![Ignore])]
    #[case::new_association_after_loss(vec![INITIATOR_LOSS, ActiveRetriesExhausted, NewAssociation, ActiveRetrySucceeded], Reconnected, vec![RetryActive, DeclareLost, RetryActive, NotifyReconnected])]
    #[case::new_association_fails(vec![INITIATOR_LOSS, ActiveRetriesExhausted, NewAssociation, ActiveRetriesExhausted], Lost, vec![RetryActive, DeclareLost, RetryActive, Ignore])]
    #[case::acceptor_waits(vec![ACCEPTOR_LOSS], PassiveWaiting, vec![AwaitPassive])]
    #[case::acceptor_waits_once(vec![ACCEPTOR_LOSS, ACCEPTOR_LOSS], PassiveWaiting, vec![AwaitPassive, Ignore])]
    #[case::acceptor_timeout(vec![ACCEPTOR_LOSS, PassiveTimerFired], PassiveTimeoutCalled, vec![AwaitPassive, DeclareLost])]
    #[case::acceptor_timeout_once(vec![ACCEPTOR_LOSS, PassiveTimerFired, PassiveTimerFired], PassiveTimeoutCalled, vec![AwaitPassive, DeclareLost, Ignore])]
    #[case::acceptor_no_passive(vec![ACCEPTOR_LOSS_NO_PASSIVE], Lost, vec![DeclareLost])]
    #[case::acceptor_no_passive_once(vec![ACCEPTOR_LOSS_NO_PASSIVE, ACCEPTOR_LOSS_NO_PASSIVE], Lost, vec![DeclareLost, Ignore])]
    #[case::replaced_while_waiting(vec![ACCEPTOR_LOSS, Replaced], Lost, vec![AwaitPassive, HandOver { notify_reconnected: true }])]
    #[case::replaced_before_loss_detected(vec![Replaced], Lost, vec![HandOver { notify_reconnected: false }])]
    #[case::replaced_after_timeout(vec![ACCEPTOR_LOSS, PassiveTimerFired, Replaced], PassiveTimeoutCalled, vec![AwaitPassive, DeclareLost, Ignore])]
    #[case::replaced_after_lost_without_passive(vec![ACCEPTOR_LOSS_NO_PASSIVE, Replaced], Lost, vec![DeclareLost, Ignore])]
    #[case::replaced_after_backpressure(vec![BackpressureTimeout, Replaced], Lost, vec![DeclareLost, Ignore])]
    #[case::timer_after_replaced(vec![ACCEPTOR_LOSS, Replaced, PassiveTimerFired], Lost, vec![AwaitPassive, HandOver { notify_reconnected: true }, Ignore])]
    #[case::loss_after_replaced(vec![Replaced, ACCEPTOR_LOSS], Lost, vec![HandOver { notify_reconnected: false }, Ignore])]
    #[case::backpressure(vec![BackpressureTimeout], Lost, vec![DeclareLost])]
    #[case::backpressure_then_loss(vec![BackpressureTimeout, INITIATOR_LOSS], Lost, vec![DeclareLost, Ignore])]
    #[case::backpressure_while_waiting(vec![ACCEPTOR_LOSS, BackpressureTimeout, PassiveTimerFired], Lost, vec![AwaitPassive, DeclareLost, Ignore])]
    #[case::backpressure_after_lost(vec![INITIATOR_LOSS, ActiveRetriesExhausted, BackpressureTimeout], Lost, vec![RetryActive, DeclareLost, Ignore])]
    #[case::graceful(vec![GracefulClose, INITIATOR_LOSS], Lost, vec![Close, Ignore])]
    #[case::graceful_while_waiting(vec![ACCEPTOR_LOSS, GracefulClose, PassiveTimerFired], Lost, vec![AwaitPassive, Close, Ignore])]
    #[case::shutdown(vec![Shutdown, INITIATOR_LOSS, NewAssociation], Lost, vec![Close, Ignore, Ignore])]
    #[case::shutdown_during_retry(vec![INITIATOR_LOSS, Shutdown, ActiveRetriesExhausted], Lost, vec![RetryActive, Close, Ignore])]
    fn test_transitions(#[case] events: Vec<ReconnectEvent>, #[case] expected_state: ReconnectState, #[case] expected_actions: Vec<ReconnectAction>) {
        let mut machine = ReconnectMachine::default();

        let actions = events.into_iter()
            .map(|e| machine.on_event(e))
            .collect::<Vec<_>>();

        assert_eq!(actions, expected_actions);
        assert_eq!(machine.state(), expected_state);
    }

    #[test]
    fn test_lost_notified_at_most_once_per_connection_cycle() {
        let mut machine = ReconnectMachine::default();
        let mut num_lost = 0;

        for event in [INITIATOR_LOSS, ActiveRetriesExhausted, BackpressureTimeout, ActiveRetriesExhausted, INITIATOR_LOSS, NewAssociation, ActiveRetriesExhausted] {
            if machine.on_event(event) == DeclareLost {
                num_lost += 1;
            }
        }
        assert_eq!(num_lost, 1);
    }
}

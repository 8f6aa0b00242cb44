use thiserror::Error;

use crate::types::ConnectionState;

/// Inputs that drive the live channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTrigger {
    /// Application asked to connect.
    Connect,
    /// The transport reported an open connection.
    Opened,
    /// The connection closed or errored; `retry` is false once attempts are exhausted.
    Lost { retry: bool },
    /// Application asked to disconnect.
    Disconnect,
    /// Application asked for an immediate reconnect with a fresh budget.
    ManualReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply '{action}' while live channel is {state}")]
pub struct TransitionError {
    pub state: ConnectionState,
    pub action: &'static str,
}

/// Outcome of applying a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; subscribers must be told.
    Changed(ConnectionState),
    /// State is unchanged but the trigger was accepted.
    Unchanged,
    /// Trigger is a no-op in the current state.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, trigger: ChannelTrigger) -> Result<Transition, TransitionError> {
        use ConnectionState::*;

        match trigger {
            ChannelTrigger::Connect => match self.state {
                Connected | Connecting => Ok(Transition::Ignored),
                Disconnected | Reconnecting => Ok(self.set(Connecting)),
            },
            ChannelTrigger::Opened => {
                self.transition_from_any_of(&[Connecting, Reconnecting], Connected, "opened")
            }
            ChannelTrigger::Lost { retry } => {
                let next = if retry { Reconnecting } else { Disconnected };
                self.transition_from_any_of(&[Connecting, Connected, Reconnecting], next, "lost")
            }
            ChannelTrigger::Disconnect => Ok(self.set(Disconnected)),
            ChannelTrigger::ManualReconnect => match self.state {
                Connected | Connecting => Ok(Transition::Ignored),
                Disconnected | Reconnecting => Ok(self.set(Reconnecting)),
            },
        }
    }

    fn set(&mut self, next: ConnectionState) -> Transition {
        if self.state == next {
            return Transition::Unchanged;
        }
        self.state = next;
        Transition::Changed(next)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &'static str,
    ) -> Result<Transition, TransitionError> {
        if !expected.contains(&self.state) {
            return Err(TransitionError {
                state: self.state,
                action,
            });
        }
        Ok(self.set(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_connect_drop_reconnect_cycle() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        assert_eq!(
            sm.apply(ChannelTrigger::Connect),
            Ok(Transition::Changed(ConnectionState::Connecting))
        );
        assert_eq!(
            sm.apply(ChannelTrigger::Opened),
            Ok(Transition::Changed(ConnectionState::Connected))
        );
        assert_eq!(
            sm.apply(ChannelTrigger::Lost { retry: true }),
            Ok(Transition::Changed(ConnectionState::Reconnecting))
        );
        assert_eq!(
            sm.apply(ChannelTrigger::Lost { retry: true }),
            Ok(Transition::Unchanged)
        );
        assert_eq!(
            sm.apply(ChannelTrigger::Opened),
            Ok(Transition::Changed(ConnectionState::Connected))
        );
    }

    #[test]
    fn exhausted_retries_settle_into_disconnected() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(ChannelTrigger::Connect).expect("connect");
        sm.apply(ChannelTrigger::Lost { retry: true }).expect("lost");
        assert_eq!(
            sm.apply(ChannelTrigger::Lost { retry: false }),
            Ok(Transition::Changed(ConnectionState::Disconnected))
        );
    }

    #[test]
    fn connect_is_ignored_while_connected_or_connecting() {
        let mut sm = ConnectionStateMachine::default();
        sm.apply(ChannelTrigger::Connect).expect("connect");
        assert_eq!(sm.apply(ChannelTrigger::Connect), Ok(Transition::Ignored));
        sm.apply(ChannelTrigger::Opened).expect("open");
        assert_eq!(sm.apply(ChannelTrigger::Connect), Ok(Transition::Ignored));
        assert_eq!(
            sm.apply(ChannelTrigger::ManualReconnect),
            Ok(Transition::Ignored)
        );
    }

    #[test]
    fn disconnect_wins_from_any_state() {
        for setup in [
            vec![],
            vec![ChannelTrigger::Connect],
            vec![ChannelTrigger::Connect, ChannelTrigger::Opened],
            vec![ChannelTrigger::Connect, ChannelTrigger::Lost { retry: true }],
        ] {
            let mut sm = ConnectionStateMachine::default();
            for trigger in setup {
                sm.apply(trigger).expect("setup trigger");
            }
            sm.apply(ChannelTrigger::Disconnect).expect("disconnect");
            assert_eq!(sm.state(), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn manual_reconnect_resumes_from_disconnected() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(
            sm.apply(ChannelTrigger::ManualReconnect),
            Ok(Transition::Changed(ConnectionState::Reconnecting))
        );
    }

    #[test]
    fn rejects_open_or_loss_while_disconnected() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm
            .apply(ChannelTrigger::Opened)
            .expect_err("open without connect must fail");
        assert_eq!(err.state, ConnectionState::Disconnected);
        assert_eq!(err.action, "opened");
        assert!(sm.apply(ChannelTrigger::Lost { retry: true }).is_err());
    }
}

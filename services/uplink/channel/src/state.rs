//! Channel state and the transition table driven by inbound protocol events.
//!
//! [`transition`] is pure: it maps the current state and one input to the
//! next state plus the side effects the channel task has to perform. The
//! channel executes the effects in order.

use bytes::Bytes;
use std::collections::BTreeSet;
use uplink_wire::{DisconnectReason, ReturnCode};

use crate::types::{Direction, DirectionMap, TransportType};

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection
    Closed,
    /// CONNECT sent, waiting for the first sync acknowledgment
    Connecting,
    /// Session established
    Opened,
    /// Suspended by the application; reusable after resume
    Paused,
    /// Terminal
    Shutdown,
}

impl ChannelState {
    /// Whether a live connection belongs to this state
    pub fn is_connected(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Opened)
    }
}

/// Event fed to the transition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// CONNACK received
    ConnAck(ReturnCode),
    /// SYNC-RESPONSE received, payload already decrypted when it was flagged
    Response(Bytes),
    /// PINGRESP received
    PingResp,
    /// DISCONNECT received
    Disconnect(DisconnectReason),
    /// Read error, end of stream, undecodable frame or failed send
    ConnectionLost,
    /// Demultiplexer acknowledged the listed transports
    SyncAck(BTreeSet<TransportType>),
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand a payload to the demultiplexer
    Deliver(Bytes),
    /// Tell the failover manager the current server is reachable
    NotifyConnected,
    /// Send a SYNC-REQUEST covering every supported transport
    SyncAll,
    /// Send a SYNC-REQUEST for the listed transports only
    Sync(BTreeSet<TransportType>),
    /// Record the round-trip time of the outstanding ping
    RecordPong,
    /// Wipe the persisted device identity
    CleanIdentity,
    /// Close the connection gracefully without involving failover
    Close,
    /// Tear down and run the server failure path
    ServerFailed,
}

/// Result of one transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the input
    pub state: ChannelState,
    /// Effects to run, in order
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: ChannelState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    fn to(state: ChannelState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }
}

/// Compute the next state and effects for `input` in `state`
pub fn transition(state: ChannelState, input: Input) -> Transition {
    use ChannelState::*;

    // Inputs only mean something while a connection is live
    if !state.is_connected() {
        return Transition::stay(state);
    }

    match input {
        Input::ConnAck(ReturnCode::Accepted) => Transition::stay(state),
        Input::ConnAck(ReturnCode::RefuseBadCredentials) => {
            Transition::to(Closed, vec![Effect::CleanIdentity, Effect::ServerFailed])
        }
        Input::ConnAck(_) => Transition::to(Closed, vec![Effect::ServerFailed]),

        Input::Response(payload) => match state {
            Connecting => Transition::to(
                Opened,
                vec![Effect::Deliver(payload), Effect::NotifyConnected, Effect::SyncAll],
            ),
            _ => Transition::to(Opened, vec![Effect::Deliver(payload)]),
        },

        Input::PingResp => Transition::to(state, vec![Effect::RecordPong]),

        Input::Disconnect(DisconnectReason::None) => Transition::to(Closed, vec![Effect::Close]),
        Input::Disconnect(_) | Input::ConnectionLost => {
            Transition::to(Closed, vec![Effect::ServerFailed])
        }

        Input::SyncAck(types) => match state {
            Connecting => Transition::to(Opened, vec![Effect::NotifyConnected, Effect::SyncAll]),
            _ if types.len() == 1 => Transition::to(Opened, vec![Effect::Sync(types)]),
            _ => Transition::to(Opened, vec![Effect::SyncAll]),
        },
    }
}

/// Direction map for a partial sync
///
/// Requested transports keep their declared direction; every other supported
/// transport is suppressed to `Down`. Requested transports the channel does
/// not support are returned separately and left out of the map.
pub fn partial_directions<'a>(
    supported: &DirectionMap,
    requested: impl IntoIterator<Item = &'a TransportType>,
) -> (DirectionMap, Vec<TransportType>) {
    let requested: BTreeSet<TransportType> = requested.into_iter().copied().collect();

    let map = supported
        .iter()
        .map(|(typ, direction)| {
            if requested.contains(typ) {
                (*typ, *direction)
            } else {
                (*typ, Direction::Down)
            }
        })
        .collect();

    let unsupported = requested
        .into_iter()
        .filter(|typ| !supported.contains_key(typ))
        .collect();

    (map, unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Bytes {
        Bytes::from_static(b"response")
    }

    fn supported() -> DirectionMap {
        [
            (TransportType::Profile, Direction::Bidirectional),
            (TransportType::Configuration, Direction::Bidirectional),
            (TransportType::Notification, Direction::Bidirectional),
            (TransportType::Logging, Direction::Up),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_first_response_opens_once() {
        let first = transition(ChannelState::Connecting, Input::Response(payload()));
        assert_eq!(first.state, ChannelState::Opened);
        assert_eq!(
            first.effects,
            vec![
                Effect::Deliver(payload()),
                Effect::NotifyConnected,
                Effect::SyncAll
            ]
        );

        let second = transition(first.state, Input::Response(payload()));
        assert_eq!(second.state, ChannelState::Opened);
        assert_eq!(second.effects, vec![Effect::Deliver(payload())]);
    }

    #[test]
    fn test_connack_accepted_keeps_waiting() {
        let t = transition(ChannelState::Connecting, Input::ConnAck(ReturnCode::Accepted));
        assert_eq!(t, Transition::stay(ChannelState::Connecting));
    }

    #[test]
    fn test_bad_credentials_clean_before_failure() {
        let t = transition(
            ChannelState::Connecting,
            Input::ConnAck(ReturnCode::RefuseBadCredentials),
        );
        assert_eq!(t.state, ChannelState::Closed);
        assert_eq!(t.effects, vec![Effect::CleanIdentity, Effect::ServerFailed]);

        let t = transition(
            ChannelState::Connecting,
            Input::ConnAck(ReturnCode::RefuseServerUnavailable),
        );
        assert_eq!(t.effects, vec![Effect::ServerFailed]);
    }

    #[test]
    fn test_disconnect_reasons() {
        let graceful = transition(
            ChannelState::Opened,
            Input::Disconnect(DisconnectReason::None),
        );
        assert_eq!(graceful.state, ChannelState::Closed);
        assert_eq!(graceful.effects, vec![Effect::Close]);

        let failed = transition(
            ChannelState::Opened,
            Input::Disconnect(DisconnectReason::InternalError),
        );
        assert_eq!(failed.state, ChannelState::Closed);
        assert_eq!(failed.effects, vec![Effect::ServerFailed]);
    }

    #[test]
    fn test_connection_lost_is_server_failure() {
        let t = transition(ChannelState::Connecting, Input::ConnectionLost);
        assert_eq!(t.effects, vec![Effect::ServerFailed]);
    }

    #[test]
    fn test_sync_ack_before_and_after_open() {
        let one: BTreeSet<_> = [TransportType::Profile].into_iter().collect();
        let many: BTreeSet<_> = [TransportType::Profile, TransportType::Event]
            .into_iter()
            .collect();

        let t = transition(ChannelState::Connecting, Input::SyncAck(one.clone()));
        assert_eq!(t.state, ChannelState::Opened);
        assert_eq!(t.effects, vec![Effect::NotifyConnected, Effect::SyncAll]);

        let t = transition(ChannelState::Opened, Input::SyncAck(one.clone()));
        assert_eq!(t.effects, vec![Effect::Sync(one)]);

        let t = transition(ChannelState::Opened, Input::SyncAck(many));
        assert_eq!(t.effects, vec![Effect::SyncAll]);
    }

    #[test]
    fn test_inputs_ignored_without_connection() {
        for state in [
            ChannelState::Closed,
            ChannelState::Paused,
            ChannelState::Shutdown,
        ] {
            for input in [
                Input::Response(payload()),
                Input::ConnectionLost,
                Input::Disconnect(DisconnectReason::BadRequest),
                Input::SyncAck(BTreeSet::new()),
            ] {
                assert_eq!(transition(state, input), Transition::stay(state));
            }
        }
    }

    #[test]
    fn test_partial_directions_cover_every_supported_type() {
        let (map, unsupported) = partial_directions(&supported(), &[TransportType::Logging]);

        assert_eq!(map.len(), supported().len());
        assert_eq!(map[&TransportType::Logging], Direction::Up);
        for typ in [
            TransportType::Profile,
            TransportType::Configuration,
            TransportType::Notification,
        ] {
            assert_eq!(map[&typ], Direction::Down);
        }
        assert!(unsupported.is_empty());
    }

    #[test]
    fn test_partial_directions_multiple_and_unsupported() {
        let (map, unsupported) = partial_directions(
            &supported(),
            &[
                TransportType::Profile,
                TransportType::Configuration,
                TransportType::User,
            ],
        );

        assert_eq!(map[&TransportType::Profile], Direction::Bidirectional);
        assert_eq!(map[&TransportType::Configuration], Direction::Bidirectional);
        assert_eq!(map[&TransportType::Notification], Direction::Down);
        assert_eq!(map[&TransportType::Logging], Direction::Down);
        assert!(!map.contains_key(&TransportType::User));
        assert_eq!(unsupported, vec![TransportType::User]);
    }
}

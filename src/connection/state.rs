//! The four states from the state-machine table: `Disconnected` is the rest
//! state (no connection, nobody waiting); `Connecting` is the first attempt
//! owned by whichever caller raced into it; `Connected` is steady state;
//! `Reconnecting` is owned by the background loop in
//! [`super::ConnectionCore::reconnect_loop`].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

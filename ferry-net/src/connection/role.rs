use crate::listener::{ListenerConfig, ListenerRole};

/// The protocol role of a connection, without its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Listener,
    /// A link to another relay.
    Relay,
    /// An application connecting to us to open streams.
    Entry,
    /// A stream we opened to a destination on behalf of the network.
    Exit,
    /// A directory fetch or directory request.
    Dir,
    /// A controller.
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    Connecting,
    ProxyHandshaking,
    TlsHandshaking,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    AwaitingRequest,
    Resolving,
    ConnectWait,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitState {
    Resolving,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirState {
    Connecting,
    ClientSending,
    ClientReading,
    ServerCommandWait,
    ServerWriting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    NeedAuth,
    Open,
}

/// A connection's role together with its role-specific state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listeners stay in one state from creation until close.
    Listener(ListenerConfig),
    Relay(RelayState),
    Entry(EntryState),
    Exit(ExitState),
    Dir(DirState),
    Control(ControlState),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Self::Listener(_) => RoleKind::Listener,
            Self::Relay(_) => RoleKind::Relay,
            Self::Entry(_) => RoleKind::Entry,
            Self::Exit(_) => RoleKind::Exit,
            Self::Dir(_) => RoleKind::Dir,
            Self::Control(_) => RoleKind::Control,
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Self::Listener(_))
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay(_))
    }

    /// Returns `true` once the role carries application traffic.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Relay(RelayState::Open) |
                Self::Entry(EntryState::Open) |
                Self::Exit(ExitState::Open) |
                Self::Control(ControlState::Open)
        )
    }

    /// The state an outbound connection of `kind` starts in, if that role is ever dialed.
    pub fn connecting(kind: RoleKind) -> Option<Self> {
        match kind {
            RoleKind::Relay => Some(Self::Relay(RelayState::Connecting)),
            RoleKind::Exit => Some(Self::Exit(ExitState::Connecting)),
            RoleKind::Dir => Some(Self::Dir(DirState::Connecting)),
            RoleKind::Listener | RoleKind::Entry | RoleKind::Control => None,
        }
    }

    /// The state a connection moves to once its outbound connect completed. Relay links go
    /// through their handshakes first and aren't covered here.
    pub(crate) fn connected(&self) -> Option<Self> {
        match self {
            Self::Exit(ExitState::Connecting) => Some(Self::Exit(ExitState::Open)),
            Self::Dir(DirState::Connecting) => Some(Self::Dir(DirState::ClientSending)),
            _ => None,
        }
    }

    /// The state of a connection accepted on a listener of `role`.
    pub fn accepted(role: ListenerRole, tls: bool) -> Self {
        match role {
            ListenerRole::Relay if tls => Self::Relay(RelayState::TlsHandshaking),
            ListenerRole::Relay => Self::Relay(RelayState::Open),
            ListenerRole::Entry => Self::Entry(EntryState::AwaitingRequest),
            ListenerRole::Dir => Self::Dir(DirState::ServerCommandWait),
            ListenerRole::Control => Self::Control(ControlState::NeedAuth),
        }
    }
}

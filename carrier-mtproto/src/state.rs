//! Connection and login state machines.

/// Datacenter identifier.
///
/// Negative values address the media variant of `-dc`; an offset of 10 000
/// addresses the test variant.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct DcId(i32);

const TEST_OFFSET: i32 = 10_000;

impl DcId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn id(self) -> i32 {
        self.0
    }

    /// Whether this is the media variant of a datacenter.
    pub fn is_media(self) -> bool {
        self.0 < 0
    }

    /// Whether this addresses the test cluster.
    pub fn is_test(self) -> bool {
        self.0.abs() >= TEST_OFFSET
    }

    /// The main (non-media) variant of this datacenter.
    pub fn main(self) -> DcId {
        DcId(self.0.abs())
    }

    /// The media variant of this datacenter.
    pub fn media(self) -> DcId {
        DcId(-self.0.abs())
    }

    /// The raw cluster number, with the test offset stripped.
    pub fn number(self) -> i32 {
        self.0.abs() % TEST_OFFSET
    }
}

impl std::fmt::Display for DcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DC {}", self.0)
    }
}

/// Login state of the whole client, published to every auth-key session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginState {
    NotLoggedIn,
    /// Logged in; `dc` is the datacenter the authorization lives on.
    LoggedIn { dc: DcId },
    LoggedOut,
}

impl LoginState {
    /// The datacenter our authorization lives on, if logged in.
    pub fn authorized_dc(self) -> Option<DcId> {
        match self {
            LoginState::LoggedIn { dc } => Some(dc),
            LoginState::NotLoggedIn | LoginState::LoggedOut => None,
        }
    }
}

/// Lifecycle of every socket bound to one authorization key.
///
/// Transitions are monotonic within one handshake attempt; the only backward
/// edge is the explicit reset to `UnencryptedNoPermanent` when the permanent
/// key is invalidated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No permanent key; a full key exchange is needed first.
    UnencryptedNoPermanent,
    /// Media datacenter waiting for the main datacenter's permanent key.
    UnencryptedMediaWaitingMain,
    /// Permanent key present, temporary key still to be negotiated.
    Unencrypted,
    /// Temporary key present but not yet bound to the permanent key.
    EncryptedNotBound,
    /// Keys bound; connection info not yet written.
    EncryptedNotInited,
    /// Ready, but nobody is logged in yet.
    EncryptedNotAuthedNoLogin,
    /// Logged in on another datacenter; authorization import pending.
    EncryptedNotAuthed,
    /// Fully authorized and bound. Steady state.
    Encrypted,
}

/// Which outgoing queue a connection phase drains.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Unencrypted,
    Uninited,
    Main,
}

impl ConnectionState {
    pub fn is_encrypted(self) -> bool {
        !matches!(
            self,
            ConnectionState::UnencryptedNoPermanent
                | ConnectionState::UnencryptedMediaWaitingMain
                | ConnectionState::Unencrypted
        )
    }

    /// The queue the write loop drains while in this state.
    pub fn phase(self) -> Phase {
        match self {
            ConnectionState::UnencryptedNoPermanent
            | ConnectionState::UnencryptedMediaWaitingMain
            | ConnectionState::Unencrypted => Phase::Unencrypted,
            ConnectionState::EncryptedNotBound
            | ConnectionState::EncryptedNotInited
            | ConnectionState::EncryptedNotAuthed => Phase::Uninited,
            ConnectionState::EncryptedNotAuthedNoLogin | ConnectionState::Encrypted => Phase::Main,
        }
    }
}

/// Compute the state family implied by key material and login state.
///
/// This is the pure form of the transition table: any state the session
/// machine reaches must be re-derivable from these inputs, except for the
/// handshake refinements (`EncryptedNotBound`/`EncryptedNotInited`), which
/// this function skips past.
pub fn derive_state(
    has_permanent: bool,
    has_temporary: bool,
    login: LoginState,
    dc: DcId,
    is_cdn: bool,
) -> ConnectionState {
    if !has_temporary {
        return if is_cdn || has_permanent {
            ConnectionState::Unencrypted
        } else if dc.is_media() {
            ConnectionState::UnencryptedMediaWaitingMain
        } else {
            ConnectionState::UnencryptedNoPermanent
        };
    }
    if is_cdn {
        return ConnectionState::Encrypted;
    }
    match login.authorized_dc() {
        None => ConnectionState::EncryptedNotAuthedNoLogin,
        Some(authed) if authed.number() == dc.number() || dc.is_media() => {
            ConnectionState::Encrypted
        }
        Some(_) => ConnectionState::EncryptedNotAuthed,
    }
}

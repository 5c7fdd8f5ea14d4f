//! Authorization-key session: permanent key, rotating temporary key, salt.

use carrier_crypto::AuthKey;

use crate::state::{ConnectionState, DcId, LoginState, derive_state};

/// Owns the permanent and temporary authorization keys of one datacenter
/// and tracks the connection state they imply.
///
/// Mutators return the new [`ConnectionState`] when it changed so the owner
/// can publish the transition; the session itself does no fan-out.
pub struct AuthKeySession {
    dc: DcId,
    is_cdn: bool,
    permanent: Option<AuthKey>,
    temporary: Option<AuthKey>,
    server_salt: Option<i64>,
    /// Unix timestamp after which the temporary key must be rotated.
    temp_expires_at: Option<i64>,
    login: LoginState,
    state: ConnectionState,
}

impl AuthKeySession {
    pub fn new(dc: DcId, is_cdn: bool, login: LoginState) -> Self {
        let state = if is_cdn {
            ConnectionState::Unencrypted
        } else if dc.is_media() {
            ConnectionState::UnencryptedMediaWaitingMain
        } else {
            ConnectionState::UnencryptedNoPermanent
        };
        Self {
            dc,
            is_cdn,
            permanent: None,
            temporary: None,
            server_salt: None,
            temp_expires_at: None,
            login,
            state,
        }
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn is_cdn(&self) -> bool {
        self.is_cdn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn permanent_key(&self) -> Option<&AuthKey> {
        self.permanent.as_ref()
    }

    pub fn temporary_key(&self) -> Option<&AuthKey> {
        self.temporary.as_ref()
    }

    pub fn permanent_key_id(&self) -> Option<[u8; 8]> {
        self.permanent.as_ref().map(|k| k.key_id())
    }

    pub fn temporary_key_id(&self) -> Option<[u8; 8]> {
        self.temporary.as_ref().map(|k| k.key_id())
    }

    pub fn server_salt(&self) -> Option<i64> {
        self.server_salt
    }

    pub fn set_server_salt(&mut self, salt: i64) {
        if self.temporary.is_some() {
            self.server_salt = Some(salt);
        }
    }

    /// When the current temporary key expires, if one is installed.
    pub fn temp_expires_at(&self) -> Option<i64> {
        self.temp_expires_at
    }

    /// Install (or clear) the permanent key. Clearing invalidates the
    /// temporary key as well.
    #[must_use]
    pub fn set_permanent_key(&mut self, key: Option<[u8; 256]>) -> Option<ConnectionState> {
        self.permanent = key.map(AuthKey::from_bytes);
        self.set_temporary_key(None)
    }

    /// Install (or clear) the temporary key together with its server salt
    /// and expiry.
    ///
    /// A temporary key without a salt is invalid and vice versa; a
    /// temporary key requires a permanent key id unless this is a CDN node.
    #[must_use]
    pub fn set_temporary_key(
        &mut self,
        key: Option<([u8; 256], i64, i64)>,
    ) -> Option<ConnectionState> {
        let next = match key {
            None => {
                self.temporary = None;
                self.server_salt = None;
                self.temp_expires_at = None;
                derive_state(self.permanent.is_some(), false, self.login, self.dc, self.is_cdn)
            }
            Some((key, salt, expires_at)) => {
                assert!(
                    self.is_cdn || self.permanent.is_some(),
                    "temporary key requires a permanent key id"
                );
                self.temporary = Some(AuthKey::from_bytes(key));
                self.server_salt = Some(salt);
                self.temp_expires_at = Some(expires_at);
                // CDN keys skip the binding step entirely.
                if self.is_cdn {
                    ConnectionState::EncryptedNotInited
                } else {
                    ConnectionState::EncryptedNotBound
                }
            }
        };
        self.transition(next)
    }

    /// The binding handshake completed: temp key is now tied to the
    /// permanent key.
    #[must_use]
    pub fn bound(&mut self) -> Option<ConnectionState> {
        assert_eq!(self.state, ConnectionState::EncryptedNotBound);
        self.transition(ConnectionState::EncryptedNotInited)
    }

    /// Connection info was written; move to the login-dependent state.
    #[must_use]
    pub fn inited(&mut self) -> Option<ConnectionState> {
        assert_eq!(self.state, ConnectionState::EncryptedNotInited);
        let next = if self.is_cdn {
            ConnectionState::Encrypted
        } else {
            match self.login.authorized_dc() {
                None => ConnectionState::EncryptedNotAuthedNoLogin,
                Some(dc) if dc.number() == self.dc.number() || self.dc.is_media() => {
                    ConnectionState::Encrypted
                }
                Some(_) => ConnectionState::EncryptedNotAuthed,
            }
        };
        self.transition(next)
    }

    /// Authorization was imported from the home datacenter.
    #[must_use]
    pub fn authorized(&mut self) -> Option<ConnectionState> {
        assert_eq!(self.state, ConnectionState::EncryptedNotAuthed);
        self.transition(ConnectionState::Encrypted)
    }

    /// React to a login-state change.
    #[must_use]
    pub fn login_changed(&mut self, login: LoginState) -> Option<ConnectionState> {
        self.login = login;
        match self.state {
            ConnectionState::EncryptedNotAuthed | ConnectionState::EncryptedNotAuthedNoLogin => {
                let next = match login.authorized_dc() {
                    None => ConnectionState::EncryptedNotAuthedNoLogin,
                    Some(dc) if dc.number() == self.dc.number() => ConnectionState::Encrypted,
                    Some(_) => ConnectionState::EncryptedNotAuthed,
                };
                self.transition(next)
            }
            ConnectionState::Encrypted if login.authorized_dc().is_none() && !self.is_cdn => {
                // Logged out: force a fresh temp-key cycle.
                self.set_temporary_key(None)
            }
            _ => None,
        }
    }

    /// Explicit reset after the server rejected the permanent key.
    #[must_use]
    pub fn invalidate(&mut self) -> Option<ConnectionState> {
        self.set_permanent_key(None)
    }

    /// Derive the AES key/iv pair for the PFS bind payload from its message
    /// key, using the permanent key and the v1 KDF.
    pub fn pfs_kdf(&self, msg_key: &[u8; 16]) -> Option<([u8; 32], [u8; 32])> {
        self.permanent.as_ref().map(|k| carrier_crypto::old_kdf(msg_key, k))
    }

    fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if next == self.state {
            return None;
        }
        log::debug!("{}: {:?} -> {:?}", self.dc, self.state, next);
        self.state = next;
        Some(next)
    }
}

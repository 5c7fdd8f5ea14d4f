//! End-to-end checks of the auth-key session state machine.

use carrier_mtproto::state::{ConnectionState, DcId, LoginState, Phase, derive_state};
use carrier_mtproto::AuthKeySession;

fn key_bytes(seed: u8) -> [u8; 256] {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_add(seed);
    }
    data
}

#[test]
fn full_handshake_reaches_encrypted() {
    let dc = DcId::new(2);
    let mut session = AuthKeySession::new(dc, false, LoginState::LoggedIn { dc });
    assert_eq!(session.state(), ConnectionState::UnencryptedNoPermanent);
    assert_eq!(session.state().phase(), Phase::Unencrypted);

    let changed = session.set_permanent_key(Some(key_bytes(1)));
    assert_eq!(changed, Some(ConnectionState::Unencrypted));

    let changed = session.set_temporary_key(Some((key_bytes(2), 0x55, 1_700_000_000)));
    assert_eq!(changed, Some(ConnectionState::EncryptedNotBound));
    assert_eq!(session.state().phase(), Phase::Uninited);
    assert_eq!(session.server_salt(), Some(0x55));

    let changed = session.bound();
    assert_eq!(changed, Some(ConnectionState::EncryptedNotInited));

    let changed = session.inited();
    assert_eq!(changed, Some(ConnectionState::Encrypted));
    assert_eq!(session.state().phase(), Phase::Main);
}

#[test]
fn foreign_dc_waits_for_authorization_import() {
    let home = DcId::new(2);
    let dc = DcId::new(4);
    let mut session = AuthKeySession::new(dc, false, LoginState::LoggedIn { dc: home });
    let _ = session.set_permanent_key(Some(key_bytes(1)));
    let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
    let _ = session.bound();

    assert_eq!(session.inited(), Some(ConnectionState::EncryptedNotAuthed));

    let changed = session.authorized();
    assert_eq!(changed, Some(ConnectionState::Encrypted));
}

#[test]
fn media_dc_shares_the_main_dc_authorization() {
    let home = DcId::new(2);
    let dc = DcId::new(4).media();
    let mut session = AuthKeySession::new(dc, false, LoginState::LoggedIn { dc: home });
    assert_eq!(session.state(), ConnectionState::UnencryptedMediaWaitingMain);

    let _ = session.set_permanent_key(Some(key_bytes(1)));
    let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
    let _ = session.bound();
    // Media sockets never import authorization themselves.
    assert_eq!(session.inited(), Some(ConnectionState::Encrypted));
}

#[test]
fn cdn_skips_binding() {
    let mut session = AuthKeySession::new(DcId::new(203), true, LoginState::NotLoggedIn);
    assert_eq!(session.state(), ConnectionState::Unencrypted);

    let changed = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
    assert_eq!(changed, Some(ConnectionState::EncryptedNotInited));
    assert_eq!(session.inited(), Some(ConnectionState::Encrypted));
}

#[test]
fn login_after_init_promotes_the_session() {
    let dc = DcId::new(2);
    let mut session = AuthKeySession::new(dc, false, LoginState::NotLoggedIn);
    let _ = session.set_permanent_key(Some(key_bytes(1)));
    let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
    let _ = session.bound();
    assert_eq!(session.inited(), Some(ConnectionState::EncryptedNotAuthedNoLogin));

    let changed = session.login_changed(LoginState::LoggedIn { dc });
    assert_eq!(changed, Some(ConnectionState::Encrypted));
}

#[test]
fn logout_forces_a_temp_key_cycle() {
    let dc = DcId::new(2);
    let mut session = AuthKeySession::new(dc, false, LoginState::LoggedIn { dc });
    let _ = session.set_permanent_key(Some(key_bytes(1)));
    let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
    let _ = session.bound();
    let _ = session.inited();
    assert_eq!(session.state(), ConnectionState::Encrypted);

    let changed = session.login_changed(LoginState::LoggedOut);
    assert_eq!(changed, Some(ConnectionState::Unencrypted));
    assert!(session.temporary_key().is_none());
    assert!(session.server_salt().is_none());
    assert!(session.permanent_key().is_some());
}

#[test]
fn invalidate_drops_everything() {
    let dc = DcId::new(2);
    let mut session = AuthKeySession::new(dc, false, LoginState::LoggedIn { dc });
    let _ = session.set_permanent_key(Some(key_bytes(1)));
    let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));

    let changed = session.invalidate();
    assert_eq!(changed, Some(ConnectionState::UnencryptedNoPermanent));
    assert!(session.permanent_key().is_none());
    assert!(session.temporary_key().is_none());
}

#[test]
fn salt_is_dropped_without_a_temp_key() {
    let dc = DcId::new(2);
    let mut session = AuthKeySession::new(dc, false, LoginState::NotLoggedIn);
    session.set_server_salt(42);
    assert_eq!(session.server_salt(), None);
}

#[test]
fn every_steady_state_is_derivable() {
    // Any state the machine settles in must match the pure derivation from
    // its inputs, so a restored session lands where a live one did.
    let home = DcId::new(2);
    for (dc, is_cdn) in [
        (DcId::new(2), false),
        (DcId::new(4), false),
        (DcId::new(4).media(), false),
        (DcId::new(203), true),
    ] {
        for login in [
            LoginState::NotLoggedIn,
            LoginState::LoggedIn { dc: home },
            LoginState::LoggedOut,
        ] {
            let mut session = AuthKeySession::new(dc, is_cdn, login);
            assert_eq!(session.state(), derive_state(false, false, login, dc, is_cdn));

            if !is_cdn {
                let _ = session.set_permanent_key(Some(key_bytes(1)));
                assert_eq!(session.state(), derive_state(true, false, login, dc, is_cdn));
            }

            let _ = session.set_temporary_key(Some((key_bytes(2), 1, 0)));
            if !is_cdn {
                let _ = session.bound();
            }
            let _ = session.inited();
            if session.state() == carrier_mtproto::ConnectionState::EncryptedNotAuthed {
                let _ = session.authorized();
                // An imported authorization is not derivable from login
                // state alone, so skip the comparison for this leg.
                continue;
            }
            assert_eq!(
                session.state(),
                derive_state(!is_cdn, true, login, dc, is_cdn),
                "dc {dc} cdn {is_cdn} login {login:?}"
            );
        }
    }
}

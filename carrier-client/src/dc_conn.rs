//! Per-datacenter connection pools.
//!
//! A [`DataCenterConnection`] owns every socket to one datacenter plus the
//! shared [`AuthKeySession`]; it balances load across sockets by weight,
//! drives the temp-key binding handshake, and keeps sockets alive through
//! reconnects. [`ConnectionPool`] maps datacenter ids to these pools and
//! re-routes calls when the server asks for a migration.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use carrier_mtproto::envelope;
use carrier_mtproto::frame;
use carrier_mtproto::state::{ConnectionState, DcId, LoginState, Phase};
use carrier_mtproto::{ArgValue, Args, AuthKeySession, Serializer};

use crate::call;
use crate::clock::Clock;
use crate::connection::Connection;
use crate::message::OutgoingMessage;
use crate::publisher::Publisher;
use crate::session::Session;
use crate::transport::{Abridged, Wire};
use crate::{ConnectionSettings, HandshakeError, InvocationError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── Collaborator seams ───────────────────────────────────────────────────────

/// A freshly negotiated temporary key.
pub struct TempKey {
    pub key: [u8; 256],
    pub server_salt: i64,
    pub expires_at: i64,
}

/// Diffie-Hellman key negotiation, performed over the connection's
/// unencrypted queue.
pub trait KeyExchange: Send + Sync {
    fn permanent_key<'a>(
        &'a self,
        conn: &'a Connection,
        dc: DcId,
    ) -> BoxFuture<'a, Result<[u8; 256], HandshakeError>>;

    fn temporary_key<'a>(
        &'a self,
        conn: &'a Connection,
        dc: DcId,
        expires_in: i64,
    ) -> BoxFuture<'a, Result<TempKey, HandshakeError>>;
}

/// Opens wires to datacenters.
pub trait Connector: Send + Sync + 'static {
    type Wire: Wire + Send + 'static;

    fn connect(&self, dc: DcId) -> impl Future<Output = io::Result<Self::Wire>> + Send;
}

/// Plain TCP with abridged framing, from a static address table.
pub struct TcpConnector {
    addrs: HashMap<DcId, String>,
}

impl TcpConnector {
    pub fn new(addrs: HashMap<DcId, String>) -> Self {
        Self { addrs }
    }
}

impl Connector for TcpConnector {
    type Wire = Abridged<TcpStream>;

    async fn connect(&self, dc: DcId) -> io::Result<Self::Wire> {
        let addr = self
            .addrs
            .get(&dc)
            .or_else(|| self.addrs.get(&dc.main()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {dc}")))?;
        Abridged::connect(addr).await
    }
}

// ─── Pool weights ─────────────────────────────────────────────────────────────

const READ_WEIGHT: usize = 1;
const READ_WEIGHT_MEDIA: usize = 5;
const WRITE_WEIGHT: usize = 10;

/// How often media/CDN pools rebalance their weights.
const ROBIN_PERIOD_SECS: u64 = 10;

/// Temporary keys are renegotiated this long before their expiry.
const TEMP_KEY_RENEW_MARGIN_SECS: i64 = 60;

struct Slot {
    conn: Connection,
    weight: usize,
}

/// A borrowed connection; dropping it returns the weight.
pub struct Lease {
    slots: Arc<Mutex<Vec<Slot>>>,
    weight: usize,
    pub conn: Connection,
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Slots may have been removed or reordered since the lease was
        // taken; find ours by identity.
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.iter_mut().find(|s| s.conn.same_as(&self.conn)) {
            slot.weight = slot.weight.saturating_sub(self.weight);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn key_id_i64(id: [u8; 8]) -> i64 {
    i64::from_le_bytes(id)
}

// ─── DataCenterConnection ─────────────────────────────────────────────────────

pub struct DataCenterConnection<C: Connector> {
    dc: DcId,
    is_cdn: bool,
    keys: Arc<Mutex<AuthKeySession>>,
    slots: Arc<Mutex<Vec<Slot>>>,
    robin: AtomicUsize,
    connector: Arc<C>,
    exchange: Arc<dyn KeyExchange>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    settings: ConnectionSettings,
    /// Persistent: late subscribers immediately learn the current state.
    state_events: Publisher<ConnectionState>,
    unhandled: Arc<Publisher<Vec<u8>>>,
    tasks: TaskTracker,
}

impl<C: Connector> DataCenterConnection<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dc: DcId,
        is_cdn: bool,
        login: LoginState,
        connector: Arc<C>,
        exchange: Arc<dyn KeyExchange>,
        serializer: Arc<dyn Serializer>,
        clock: Arc<dyn Clock>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let keys = Arc::new(Mutex::new(AuthKeySession::new(dc, is_cdn, login)));
        let this = Arc::new(Self {
            dc,
            is_cdn,
            keys,
            slots: Arc::new(Mutex::new(Vec::new())),
            robin: AtomicUsize::new(0),
            connector,
            exchange,
            serializer,
            clock,
            settings,
            state_events: Publisher::persistent(),
            unhandled: Arc::new(Publisher::new()),
            tasks: TaskTracker::new(),
        });
        this.state_events.publish(lock(&this.keys).state());
        if dc.is_media() || is_cdn {
            this.spawn_robin();
        }
        this
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.keys).state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::mpsc::UnboundedReceiver<ConnectionState> {
        self.state_events.subscribe()
    }

    /// Payloads the transport layer does not interpret.
    pub fn subscribe_unhandled(&self) -> tokio::sync::mpsc::UnboundedReceiver<Vec<u8>> {
        self.unhandled.subscribe()
    }

    pub fn permanent_key_bytes(&self) -> Option<[u8; 256]> {
        lock(&self.keys).permanent_key().map(|k| k.to_bytes())
    }

    fn apply(&self, change: Option<ConnectionState>) {
        if let Some(state) = change {
            self.state_events.publish(state);
            for slot in lock(&self.slots).iter() {
                slot.conn.trigger();
            }
        }
    }

    // ─── Socket management ───────────────────────────────────────────────────

    /// Open the initial sockets. A no-op on an already connected pool; use
    /// [`Self::reconnect`] to cycle the sockets.
    pub fn connect(self: &Arc<Self>, count: usize) {
        if self.connection_count() > 0 {
            tracing::warn!("{}: connect called on an already connected pool", self.dc);
            return;
        }
        self.connect_more(count.max(1));
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.slots).len()
    }

    fn connect_more(self: &Arc<Self>, count: usize) {
        let mut new_conns = Vec::with_capacity(count);
        {
            let mut slots = lock(&self.slots);
            for _ in 0..count {
                if slots.len() >= self.settings.max_connections_per_dc {
                    break;
                }
                let session = Session::new(self.dc, 0);
                let conn = Connection::new(
                    session,
                    Arc::clone(&self.keys),
                    Arc::clone(&self.clock),
                    self.settings.clone(),
                    Arc::clone(&self.unhandled),
                );
                slots.push(Slot { conn: conn.clone(), weight: 0 });
                new_conns.push(conn);
            }
        }
        for conn in new_conns {
            self.spawn_runner(conn.clone());
            self.tasks.spawn(crate::ping_loop::ping_loop(conn));
        }
    }

    fn spawn_runner(self: &Arc<Self>, conn: Connection) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut backoff = 1u64;
            while !conn.cancellation().is_cancelled() {
                match this.connector.connect(this.dc).await {
                    Ok(wire) => {
                        tracing::info!("{}: connected", this.dc);
                        backoff = 1;
                        match conn.run(wire).await {
                            Ok(()) => break,
                            Err(e) => tracing::warn!("{}: connection lost: {e}", this.dc),
                        }
                    }
                    Err(e) => tracing::warn!("{}: connect failed: {e}", this.dc),
                }
                if conn.cancellation().is_cancelled() {
                    break;
                }
                this.clock.sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(30);
            }
            // A socket stopped individually (missed pong, explicit signal)
            // is replaced and its unfinished work carried over. Pool-wide
            // teardown already took the slot and the backup.
            if this.remove_slot(&conn) {
                let backup = conn.backup_session();
                this.connect_more(1);
                this.restore_into(backup);
            }
        });
    }

    /// Drop the slot owning `conn`; true if it was still registered.
    fn remove_slot(&self, conn: &Connection) -> bool {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|s| !s.conn.same_as(conn));
        slots.len() != before
    }

    /// Periodic weight rebalancing for media/CDN pools. Holds only a weak
    /// handle so a dropped pool stops its loop.
    fn spawn_robin(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let clock = Arc::clone(&self.clock);
        self.tasks.spawn(async move {
            loop {
                clock.sleep(Duration::from_secs(ROBIN_PERIOD_SECS)).await;
                let Some(dc) = this.upgrade() else { return };
                dc.even();
            }
        });
    }

    /// Pick a connection: round robin on media/CDN pools, least weight
    /// elsewhere. Returns `None` if no live socket is available; a socket
    /// whose driver was told to stop is never leased out.
    pub fn get_connection(&self, write: bool) -> Option<Lease> {
        let mut slots = lock(&self.slots);
        let live: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.conn.cancellation().is_cancelled())
            .map(|(i, _)| i)
            .collect();
        if live.is_empty() {
            return None;
        }
        let index = if self.dc.is_media() || self.is_cdn {
            live[self.robin.fetch_add(1, Ordering::Relaxed) % live.len()]
        } else {
            live.into_iter().min_by_key(|&i| slots[i].weight).unwrap_or(0)
        };
        let weight = if write {
            WRITE_WEIGHT
        } else if self.dc.is_media() {
            READ_WEIGHT_MEDIA
        } else {
            READ_WEIGHT
        };
        slots[index].weight += weight;
        Some(Lease {
            slots: Arc::clone(&self.slots),
            weight,
            conn: slots[index].conn.clone(),
        })
    }

    /// Rebalance: bump saturated pools, growing the socket count when every
    /// connection is already loaded.
    pub fn even(self: &Arc<Self>) {
        let grow = {
            let mut slots = lock(&self.slots);
            if slots.is_empty() {
                return;
            }
            let min = slots.iter().map(|s| s.weight).min().unwrap_or(0);
            if min < 50 {
                for slot in slots.iter_mut() {
                    slot.weight += 50;
                }
                false
            } else if min < 100 {
                if slots.len() + 2 <= self.settings.max_connections_per_dc {
                    true
                } else {
                    for slot in slots.iter_mut() {
                        slot.weight += 1000;
                    }
                    false
                }
            } else {
                false
            }
        };
        if grow {
            self.connect_more(2);
        }
    }

    /// Tear down every socket. In-flight messages are preserved for
    /// [`Self::restore_into`].
    pub fn disconnect(&self) -> Vec<OutgoingMessage> {
        let slots = std::mem::take(&mut *lock(&self.slots));
        let mut backup = Vec::new();
        for slot in &slots {
            slot.conn.signal_disconnect();
            backup.extend(slot.conn.backup_session());
        }
        backup
    }

    /// Hand a backup to the least-loaded live connection.
    pub fn restore_into(&self, messages: Vec<OutgoingMessage>) {
        if messages.is_empty() {
            return;
        }
        if let Some(lease) = self.get_connection(true) {
            lease.conn.restore_session(messages);
        }
    }

    /// Drop all sockets and dial fresh ones, carrying pending work over.
    pub fn reconnect(self: &Arc<Self>) {
        let backup = self.disconnect();
        self.connect_more(1);
        self.restore_into(backup);
    }

    // ─── Handshake ───────────────────────────────────────────────────────────

    /// Adopt the permanent key negotiated by the main datacenter (media
    /// variants never negotiate their own).
    pub fn adopt_permanent_key(&self, key: [u8; 256]) {
        let change = lock(&self.keys).set_permanent_key(Some(key));
        self.apply(change);
    }

    /// Clear a temporary key that is about to lapse so the state machine
    /// negotiates and binds a fresh one.
    fn rotate_expiring_temp_key(&self) {
        let change = {
            let mut keys = lock(&self.keys);
            match keys.temp_expires_at() {
                Some(expires_at)
                    if expires_at != 0
                        && expires_at - self.clock.now() <= TEMP_KEY_RENEW_MARGIN_SECS =>
                {
                    tracing::info!("{}: temporary key expiring, renegotiating", self.dc);
                    keys.set_temporary_key(None)
                }
                _ => None,
            }
        };
        self.apply(change);
    }

    /// Drive the key state machine until the connection can carry main
    /// phase traffic (or needs an authorization import).
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<(), HandshakeError> {
        loop {
            self.rotate_expiring_temp_key();
            let state = self.state();
            match state {
                ConnectionState::UnencryptedNoPermanent => {
                    let lease = self.lease_or_wait().await;
                    let key = self.exchange.permanent_key(&lease.conn, self.dc).await?;
                    let change = lock(&self.keys).set_permanent_key(Some(key));
                    self.apply(change);
                }
                ConnectionState::UnencryptedMediaWaitingMain => {
                    return Err(HandshakeError::KeyExchange(
                        "waiting for the main datacenter's permanent key".into(),
                    ));
                }
                ConnectionState::Unencrypted => {
                    let lease = self.lease_or_wait().await;
                    let temp = self
                        .exchange
                        .temporary_key(&lease.conn, self.dc, self.settings.temp_key_expires_secs)
                        .await?;
                    let change = lock(&self.keys).set_temporary_key(Some((
                        temp.key,
                        temp.server_salt,
                        temp.expires_at,
                    )));
                    self.apply(change);
                }
                ConnectionState::EncryptedNotBound => {
                    self.bind().await?;
                }
                ConnectionState::EncryptedNotInited => {
                    self.write_connection_info().await?;
                }
                ConnectionState::EncryptedNotAuthed
                | ConnectionState::EncryptedNotAuthedNoLogin
                | ConnectionState::Encrypted => return Ok(()),
            }
        }
    }

    async fn lease_or_wait(self: &Arc<Self>) -> Lease {
        loop {
            if let Some(lease) = self.get_connection(false) {
                return lease;
            }
            self.connect_more(1);
            self.clock.sleep(Duration::from_millis(50)).await;
        }
    }

    /// Bind the temporary key to the permanent one (PFS). Retried a few
    /// times; persistent failure means the permanent key is not usable.
    async fn bind(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let retries = self.settings.bind_retries;
        for attempt in 1..=retries {
            let lease = self.lease_or_wait().await;
            match self.bind_once(&lease.conn).await {
                Ok(()) => {
                    let change = lock(&self.keys).bound();
                    self.apply(change);
                    tracing::info!("{}: temporary key bound", self.dc);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("{}: binding attempt {attempt}/{retries} failed: {e}", self.dc);
                }
            }
        }
        Err(HandshakeError::SecurityError(format!(
            "binding failed {retries} times on {}; permanent key rejected",
            self.dc
        )))
    }

    async fn bind_once(&self, conn: &Connection) -> Result<(), HandshakeError> {
        let expires_at = self.clock.now() + self.settings.temp_key_expires_secs;
        let mut nonce_bytes = [0u8; 8];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        let nonce = i64::from_le_bytes(nonce_bytes);

        let (perm_id, msg_id, payload) = {
            let keys = lock(&self.keys);
            let perm = keys
                .permanent_key()
                .ok_or_else(|| HandshakeError::KeyExchange("no permanent key".into()))?;
            let temp = keys
                .temporary_key()
                .ok_or_else(|| HandshakeError::KeyExchange("no temporary key".into()))?;
            let perm_id = key_id_i64(perm.key_id());
            let temp_id = key_id_i64(temp.key_id());
            let (msg_id, session_id) =
                conn.with_session(|s| (s.next_msg_id(), s.session_id()));
            let inner = envelope::serialize_bind_auth_key_inner(
                nonce,
                temp_id,
                perm_id,
                session_id,
                expires_at as i32,
            );
            (perm_id, msg_id, frame::encrypt_bind_payload(perm, msg_id, &inner))
        };

        let mut args = Args::new();
        args.insert("perm_auth_key_id".into(), ArgValue::Int(perm_id));
        args.insert("nonce".into(), ArgValue::Int(nonce));
        args.insert("expires_at".into(), ArgValue::Int(expires_at));
        args.insert("encrypted_message".into(), ArgValue::Bytes(payload));
        let body = self
            .serializer
            .serialize_method("auth.bindTempAuthKey", &args)
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let message =
            OutgoingMessage::method("auth.bindTempAuthKey", body, tx).with_msg_id(msg_id);
        conn.enqueue(Phase::Uninited, message);

        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(InvocationError::Rpc(e))) => Err(HandshakeError::Rpc(e)),
            Ok(Err(e)) => Err(HandshakeError::KeyExchange(e.to_string())),
            Err(_) => Err(HandshakeError::KeyExchange("binding reply dropped".into())),
        }
    }

    async fn write_connection_info(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let lease = self.lease_or_wait().await;
        let mut args = Args::new();
        args.insert("api_id".into(), ArgValue::Int(i64::from(self.settings.init.api_id)));
        args.insert(
            "device_model".into(),
            ArgValue::String(self.settings.init.device_model.clone()),
        );
        args.insert(
            "system_version".into(),
            ArgValue::String(self.settings.init.system_version.clone()),
        );
        args.insert(
            "app_version".into(),
            ArgValue::String(self.settings.init.app_version.clone()),
        );
        args.insert("lang_code".into(), ArgValue::String(self.settings.init.lang_code.clone()));
        call::invoke_uninited(&lease.conn, self.serializer.as_ref(), "initConnection", &args)
            .await
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        let change = lock(&self.keys).inited();
        self.apply(change);
        Ok(())
    }

    /// An authorization was imported from the home datacenter.
    pub fn mark_authorized(&self) {
        let change = lock(&self.keys).authorized();
        self.apply(change);
    }

    pub fn login_changed(&self, login: LoginState) {
        let change = lock(&self.keys).login_changed(login);
        self.apply(change);
    }

    /// The server rejected the permanent key; start over from scratch.
    pub fn invalidate_keys(&self) {
        let change = lock(&self.keys).invalidate();
        self.apply(change);
    }

    // ─── Calls ───────────────────────────────────────────────────────────────

    pub async fn invoke(
        self: &Arc<Self>,
        method: &str,
        args: &Args,
    ) -> Result<Vec<u8>, InvocationError> {
        let lease = self.lease_or_wait().await;
        call::invoke(&lease.conn, self.serializer.as_ref(), method, args).await
    }

    /// Invoke before the session is fully authorized (pre-init queue).
    pub async fn invoke_uninited(
        self: &Arc<Self>,
        method: &str,
        args: &Args,
    ) -> Result<Vec<u8>, InvocationError> {
        let lease = self.lease_or_wait().await;
        call::invoke_uninited(&lease.conn, self.serializer.as_ref(), method, args).await
    }
}

// ─── ConnectionPool ───────────────────────────────────────────────────────────

const MAX_MIGRATIONS: usize = 5;

/// All datacenters, keyed by id, plus the login state shared between them.
pub struct ConnectionPool<C: Connector> {
    dcs: Mutex<HashMap<DcId, Arc<DataCenterConnection<C>>>>,
    connector: Arc<C>,
    exchange: Arc<dyn KeyExchange>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    settings: ConnectionSettings,
    /// Persistent: observers always see the current login state.
    login: Publisher<LoginState>,
    main_dc: Mutex<DcId>,
    cdn_dcs: Vec<DcId>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(
        main_dc: DcId,
        connector: Arc<C>,
        exchange: Arc<dyn KeyExchange>,
        serializer: Arc<dyn Serializer>,
        clock: Arc<dyn Clock>,
        settings: ConnectionSettings,
    ) -> Self {
        let login = Publisher::persistent();
        login.publish(LoginState::NotLoggedIn);
        Self {
            dcs: Mutex::new(HashMap::new()),
            connector,
            exchange,
            serializer,
            clock,
            settings,
            login,
            main_dc: Mutex::new(main_dc),
            cdn_dcs: Vec::new(),
        }
    }

    pub fn with_cdn_dcs(mut self, cdn: Vec<DcId>) -> Self {
        self.cdn_dcs = cdn;
        self
    }

    pub fn main_dc(&self) -> DcId {
        *lock(&self.main_dc)
    }

    pub fn login_state(&self) -> LoginState {
        self.login.current().unwrap_or(LoginState::NotLoggedIn)
    }

    pub fn subscribe_login(&self) -> tokio::sync::mpsc::UnboundedReceiver<LoginState> {
        self.login.subscribe()
    }

    /// Publish a login change to every datacenter.
    pub fn set_login(&self, state: LoginState) {
        self.login.publish(state);
        for dc in lock(&self.dcs).values() {
            dc.login_changed(state);
        }
    }

    pub fn get_or_create(&self, dc: DcId) -> Arc<DataCenterConnection<C>> {
        let mut dcs = lock(&self.dcs);
        if let Some(existing) = dcs.get(&dc) {
            return Arc::clone(existing);
        }
        let is_cdn = self.cdn_dcs.contains(&dc);
        let pool = DataCenterConnection::new(
            dc,
            is_cdn,
            self.login_state(),
            Arc::clone(&self.connector),
            Arc::clone(&self.exchange),
            Arc::clone(&self.serializer),
            Arc::clone(&self.clock),
            self.settings.clone(),
        );
        pool.connect(1);
        // A media variant rides on the main variant's permanent key.
        if dc.is_media() {
            if let Some(main) = dcs.get(&dc.main()) {
                if let Some(key) = main.permanent_key_bytes() {
                    pool.adopt_permanent_key(key);
                }
            }
        }
        dcs.insert(dc, Arc::clone(&pool));
        pool
    }

    /// Invoke on the current main datacenter, following migration
    /// redirects and moving the main pointer when the server says so.
    pub async fn invoke(&self, method: &str, args: &Args) -> Result<Vec<u8>, InvocationError> {
        let mut dc = self.main_dc();
        for _ in 0..MAX_MIGRATIONS {
            let pool = self.get_or_create(dc);
            pool.ensure_ready()
                .await
                .map_err(|e| InvocationError::Deserialize(e.to_string()))?;
            match pool.invoke(method, args).await {
                Err(InvocationError::Migrate(target)) => {
                    let target = DcId::new(target);
                    tracing::info!("migrating home datacenter {dc} -> {target}");
                    *lock(&self.main_dc) = target;
                    dc = target;
                }
                other => return other,
            }
        }
        Err(InvocationError::Deserialize("too many datacenter migrations".into()))
    }

    /// Invoke on a specific datacenter, importing our authorization onto
    /// it first when needed.
    pub async fn invoke_on_dc(
        &self,
        dc: DcId,
        method: &str,
        args: &Args,
    ) -> Result<Vec<u8>, InvocationError> {
        let pool = self.get_or_create(dc);
        if dc.is_media() {
            if let Some(key) = self.get_or_create(dc.main()).permanent_key_bytes() {
                pool.adopt_permanent_key(key);
            }
        }
        pool.ensure_ready()
            .await
            .map_err(|e| InvocationError::Deserialize(e.to_string()))?;
        if pool.state() == ConnectionState::EncryptedNotAuthed {
            self.import_authorization(&pool).await?;
        }
        pool.invoke(method, args).await
    }

    async fn import_authorization(
        &self,
        target: &Arc<DataCenterConnection<C>>,
    ) -> Result<(), InvocationError> {
        let home = self.get_or_create(self.main_dc());
        let mut export_args = Args::new();
        export_args.insert("dc_id".into(), ArgValue::Int(i64::from(target.dc().number())));
        let exported = home.invoke("auth.exportAuthorization", &export_args).await?;

        let mut import_args = Args::new();
        import_args.insert("authorization".into(), ArgValue::Bytes(exported));
        target.invoke_uninited("auth.importAuthorization", &import_args).await?;
        target.mark_authorized();
        Ok(())
    }
}

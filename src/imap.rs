//! IMAPS connection management and session operations
//!
//! One `ConnectionManager` owns one TLS IMAP session. All network calls are
//! TLS-only and bounded by the configured timeout; exceeding a bound surfaces
//! as `ServerTimeout` for the worker's retry wrapper. The manager also hosts
//! the fetch operations the worker issues between IDLE cycles.

use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, ResponseData};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

/// Type alias for the authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Implicit-TLS IMAP port
const IMAPS_PORT: u16 = 993;

/// Header set fetched before the whitelist gate
const HEADER_FIELDS: &str =
    "Content-Type From To Cc Bcc Date Subject Message-ID In-Reply-To References";

/// Owner of one IMAPS session
///
/// Created per mailbox; the worker is the only task that touches it. The
/// session is constructed lazily by [`open`](Self::open) and replaced
/// wholesale around each IDLE cycle (IDLE consumes the session type).
pub struct ConnectionManager {
    host: String,
    user: String,
    password: SecretString,
    op_timeout: Duration,
    session: Option<ImapSession>,
    idling: bool,
}

impl ConnectionManager {
    pub fn new(host: String, user: String, password: SecretString, op_timeout: Duration) -> Self {
        Self {
            host,
            user,
            password,
            op_timeout,
            session: None,
            idling: false,
        }
    }

    /// TCP connect, TLS handshake, and greeting read
    async fn connect(&self) -> AppResult<Client<tokio_rustls::client::TlsStream<TcpStream>>> {
        let tcp = timeout(
            self.op_timeout,
            TcpStream::connect((self.host.as_str(), IMAPS_PORT)),
        )
        .await
        .map_err(|_| AppError::ServerTimeout(format!("tcp connect to {}", self.host)))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| AppError::Internal("invalid IMAP host for TLS SNI".to_owned()))?;
        let tls_stream = timeout(self.op_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::ServerTimeout("TLS handshake".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}"))))?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(self.op_timeout, client.read_response())
            .await
            .map_err(|_| AppError::ServerTimeout("IMAP greeting".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;
        if greeting.is_none() {
            return Err(AppError::Internal(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }
        Ok(client)
    }

    /// Open a transient session to verify the credentials
    ///
    /// Logs out again on success. Returns `false` when the server rejects the
    /// LOGIN; timeouts surface as `ServerTimeout`.
    pub async fn probe(&self) -> AppResult<bool> {
        let client = self.connect().await?;
        let login = timeout(
            self.op_timeout,
            client.login(self.user.as_str(), self.password.expose_secret()),
        )
        .await
        .map_err(|_| AppError::ServerTimeout("IMAP login".to_owned()))?;
        match login {
            Ok(mut session) => {
                info!(user = %self.user, host = %self.host, "credential probe succeeded");
                let _ = timeout(self.op_timeout, session.logout()).await;
                Ok(true)
            }
            Err((e, _client)) => {
                info!(user = %self.user, host = %self.host, error = %e, "credential probe rejected");
                Ok(false)
            }
        }
    }

    /// Lazily open the persistent session: LOGIN and `SELECT INBOX`
    ///
    /// # Errors
    ///
    /// - `CredentialsInvalid` when the server rejects the LOGIN
    /// - `ServerTimeout` when any phase exceeds its bound
    pub async fn open(&mut self) -> AppResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let client = self.connect().await?;
        let login = timeout(
            self.op_timeout,
            client.login(self.user.as_str(), self.password.expose_secret()),
        )
        .await
        .map_err(|_| AppError::ServerTimeout("IMAP login".to_owned()))?;
        let mut session = match login {
            Ok(session) => session,
            Err((e, _client)) => {
                info!(user = %self.user, host = %self.host, error = %e, "login rejected");
                return Err(AppError::CredentialsInvalid);
            }
        };
        timeout(self.op_timeout, session.select("INBOX"))
            .await
            .map_err(|_| AppError::ServerTimeout("SELECT INBOX".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("SELECT INBOX failed: {e}"))))?;
        info!(user = %self.user, host = %self.host, "imap session opened");
        self.session = Some(session);
        Ok(())
    }

    /// Whether an IDLE command is currently outstanding
    pub fn is_idle_pending(&self) -> bool {
        self.idling
    }

    /// One IDLE cycle: wait for a server push or the server timeout
    ///
    /// Issues IDLE, waits up to `server_timeout` for unsolicited data, then
    /// sends DONE and waits up to `done_timeout` for the tagged completion.
    /// Returns the pushed response, or `None` when the cycle timed out
    /// quietly.
    pub async fn idle_cycle(
        &mut self,
        server_timeout: Duration,
        done_timeout: Duration,
    ) -> AppResult<Option<ResponseData>> {
        let session = self.session.take().ok_or(AppError::NotConnected)?;
        self.idling = true;
        let mut handle = session.idle();
        if let Err(e) = handle.init().await {
            self.idling = false;
            return Err(AppError::Internal(format!("IDLE init failed: {e}")));
        }
        let waited = {
            // Dropping the interrupt handle cancels the wait, so it stays
            // named until the future resolves.
            let (idle_wait, _interrupt) = handle.wait_with_timeout(server_timeout);
            idle_wait.await
        };
        let done = timeout(done_timeout, handle.done()).await;
        self.idling = false;
        let session = done
            .map_err(|_| AppError::ServerTimeout("IDLE DONE".to_owned()))?
            .map_err(|e| AppError::Internal(format!("IDLE DONE failed: {e}")))?;
        self.session = Some(session);
        match waited.map_err(|e| AppError::Internal(format!("IDLE wait failed: {e}")))? {
            IdleResponse::NewData(data) => Ok(Some(data)),
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => {
                debug!(user = %self.user, "idle cycle ended without pushes");
                Ok(None)
            }
        }
    }

    /// Resolve a sequence number from an EXISTS push to its UID
    pub async fn uid_from_sequence(&mut self, seq: u32) -> AppResult<Option<u32>> {
        let fetch = self.fetch_first(seq.to_string(), "(UID)", false).await?;
        Ok(fetch.and_then(|f| f.uid))
    }

    /// Fetch the whitelist-gate header set without marking the message seen
    pub async fn fetch_headers(&mut self, uid: u32) -> AppResult<Option<Vec<u8>>> {
        let query = format!("(UID FLAGS BODY.PEEK[HEADER.FIELDS ({HEADER_FIELDS})])");
        let fetch = self.fetch_first(uid.to_string(), &query, true).await?;
        Ok(fetch.and_then(|f| f.header().or_else(|| f.body()).map(<[u8]>::to_vec)))
    }

    /// Download the full RFC822 source without marking the message seen
    pub async fn fetch_body(&mut self, uid: u32) -> AppResult<Option<Vec<u8>>> {
        let fetch = self.fetch_first(uid.to_string(), "BODY.PEEK[]", true).await?;
        Ok(fetch.and_then(|f| f.body().map(<[u8]>::to_vec)))
    }

    /// Run a FETCH (by UID or sequence number) and keep the first result
    async fn fetch_first(
        &mut self,
        set: String,
        query: &str,
        by_uid: bool,
    ) -> AppResult<Option<Fetch>> {
        let op_timeout = self.op_timeout;
        let session = self.session.as_mut().ok_or(AppError::NotConnected)?;
        let fetches: Vec<Fetch> = if by_uid {
            let stream = timeout(op_timeout, session.uid_fetch(&set, query))
                .await
                .map_err(|_| AppError::ServerTimeout("UID FETCH".to_owned()))
                .and_then(|r| r.map_err(|e| AppError::Internal(format!("uid fetch failed: {e}"))))?;
            timeout(op_timeout, stream.try_collect())
                .await
                .map_err(|_| AppError::ServerTimeout("UID FETCH stream".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Internal(format!("uid fetch stream failed: {e}")))
                })?
        } else {
            let stream = timeout(op_timeout, session.fetch(&set, query))
                .await
                .map_err(|_| AppError::ServerTimeout("FETCH".to_owned()))
                .and_then(|r| r.map_err(|e| AppError::Internal(format!("fetch failed: {e}"))))?;
            timeout(op_timeout, stream.try_collect())
                .await
                .map_err(|_| AppError::ServerTimeout("FETCH stream".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Internal(format!("fetch stream failed: {e}")))
                })?
        };
        Ok(fetches.into_iter().next())
    }

    /// LOGOUT and drop the session
    ///
    /// # Errors
    ///
    /// - `NotConnected` when no session was ever opened
    /// - `ServerTimeout` when the server does not acknowledge LOGOUT in time
    pub async fn close(&mut self) -> AppResult<()> {
        let mut session = self.session.take().ok_or(AppError::NotConnected)?;
        timeout(self.op_timeout, session.logout())
            .await
            .map_err(|_| AppError::ServerTimeout("LOGOUT".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Internal(format!("LOGOUT failed: {e}"))))?;
        info!(user = %self.user, host = %self.host, "imap session closed");
        Ok(())
    }
}

//! End-to-end bridge scenarios
//!
//! Each test stands up the full triangle in-process: an SSH agent on a
//! Unix socket holding the user's key, a downstream sshd accepting that
//! key, and a russh client driving the bridge through the client half of
//! the in-memory pair, exactly the way the recording proxy would.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::ssh_key::certificate::{Builder as CertBuilder, CertType, Certificate};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::Auth;
use russh::{client, server, ChannelId, ChannelMsg, CryptoVec};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use sshrelay::audit::{self, AuditEvent};
use sshrelay::cluster::{AccessPoint, AuthClient, SessionRecord, SessionService};
use sshrelay::agent::LocalAgent;
use sshrelay::auth::AuthHandlers;
use sshrelay::error::{RelayError, Result};
use sshrelay::remote::connect_remote_session;
use sshrelay::{AuditLog, ForwardedAgent, Server, ServerConfig};

const TIMEOUT: Duration = Duration::from_secs(30);

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut).await.expect("test timed out")
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn ed25519() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn user_certificate(ca: &PrivateKey, subject: &PublicKey, principal: &str) -> Certificate {
    let mut builder = CertBuilder::new_with_random_nonce(
        &mut OsRng,
        subject.key_data().clone(),
        unix_now() - 60,
        unix_now() + 3600,
    )
    .unwrap();
    builder.cert_type(CertType::User).unwrap();
    builder.key_id("end-user").unwrap();
    builder.valid_principal(principal).unwrap();
    builder.sign(ca).unwrap()
}

// ---------------------------------------------------------------------
// Auth client double: static trust material plus recorded audit events.

struct TestAuthClient {
    user_cas: Vec<PublicKey>,
    host_keys: Vec<PublicKey>,
    permit_agent_forward: bool,
    events: Mutex<Vec<AuditEvent>>,
}

impl TestAuthClient {
    fn new(user_ca: &PrivateKey, host_key: Option<&PublicKey>, permit_agent_forward: bool) -> Self {
        Self {
            user_cas: vec![user_ca.public_key().clone()],
            host_keys: host_key.into_iter().cloned().collect(),
            permit_agent_forward,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events_of_kind(&self, kind: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccessPoint for TestAuthClient {
    async fn user_certificate_authorities(&self) -> Result<Vec<PublicKey>> {
        Ok(self.user_cas.clone())
    }

    async fn trusted_host_keys(&self, _hostname: &str) -> Result<Vec<PublicKey>> {
        Ok(self.host_keys.clone())
    }

    async fn permit_agent_forward(&self, _login: &str) -> Result<bool> {
        Ok(self.permit_agent_forward)
    }
}

#[async_trait]
impl AuditLog for TestAuthClient {
    async fn emit_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[async_trait]
impl SessionService for TestAuthClient {
    async fn upsert_session(&self, _record: SessionRecord) -> Result<()> {
        Ok(())
    }

    async fn remove_session(&self, _namespace: &str, _id: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-process SSH agent holding the user's key.

#[derive(Clone)]
struct KeyholderAgent {
    key: Arc<PrivateKey>,
}

#[ssh_agent_lib::async_trait]
impl ssh_agent_lib::agent::Session for KeyholderAgent {
    async fn request_identities(
        &mut self,
    ) -> std::result::Result<Vec<ssh_agent_lib::proto::Identity>, ssh_agent_lib::error::AgentError>
    {
        Ok(vec![ssh_agent_lib::proto::Identity {
            pubkey: self.key.public_key().key_data().clone(),
            comment: "end-user".to_string(),
        }])
    }

    async fn sign(
        &mut self,
        request: ssh_agent_lib::proto::SignRequest,
    ) -> std::result::Result<russh::keys::ssh_key::Signature, ssh_agent_lib::error::AgentError>
    {
        use signature::Signer;
        Ok(self.key.try_sign(&request.data).expect("agent signing"))
    }
}

impl ssh_agent_lib::agent::Agent<tokio::net::UnixListener> for KeyholderAgent {
    fn new_session(
        &mut self,
        _socket: &tokio::net::UnixStream,
    ) -> impl ssh_agent_lib::agent::Session {
        self.clone()
    }
}

/// Start an agent holding `key` on a fresh Unix socket; returns a
/// connector for it.
fn spawn_agent(key: &PrivateKey) -> ForwardedAgent {
    let path = std::env::temp_dir().join(format!(
        "sshrelay-agent-{}-{}.sock",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    let agent = KeyholderAgent {
        key: Arc::new(key.clone()),
    };
    tokio::spawn(async move {
        let _ = ssh_agent_lib::agent::bind(service_binding::Listener::Unix(listener), agent).await;
    });
    ForwardedAgent::new(Arc::new(LocalAgent::new(path)))
}

// ---------------------------------------------------------------------
// Downstream sshd double: accepts one public key, answers exec with a
// canned payload and exit status 0.

#[derive(Clone)]
struct TestSshd {
    allowed: PublicKey,
    execs: Arc<Mutex<Vec<String>>>,
}

impl server::Handler for TestSshd {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if *key == self.allowed {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: russh::Channel<server::Msg>,
        _session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.execs
            .lock()
            .push(String::from_utf8_lossy(data).to_string());
        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(b"hi\n"));
        let _ = session.exit_status_request(channel, 0);
        let _ = session.close(channel);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Start a throwaway sshd; returns its address and the exec log.
async fn spawn_sshd(host_key: PrivateKey, allowed: PublicKey) -> (String, Arc<Mutex<Vec<String>>>) {
    let execs = Arc::new(Mutex::new(Vec::new()));
    let config = Arc::new(server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler_execs = execs.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            let handler = TestSshd {
                allowed: allowed.clone(),
                execs: handler_execs.clone(),
            };
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });
    (addr, execs)
}

// ---------------------------------------------------------------------
// Upstream client double (the recording proxy's view).

struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Fixture {
    auth_client: Arc<TestAuthClient>,
    _server: Arc<Server>,
    handle: client::Handle<TrustingClient>,
}

/// Build the whole triangle and authenticate `alice` through the bridge.
async fn connect_fixture(permit_agent_forward: bool, register_host_key: bool) -> Fixture {
    let user_ca = ed25519();
    let user_key = ed25519();
    let cert = user_certificate(&user_ca, user_key.public_key(), "alice");
    let sshd_host_key = ed25519();
    let bridge_host_key = ed25519();

    let agent = spawn_agent(&user_key);
    let (sshd_addr, _execs) =
        spawn_sshd(sshd_host_key.clone(), user_key.public_key().clone()).await;

    let registered = register_host_key.then(|| sshd_host_key.public_key().clone());
    let auth_client = Arc::new(TestAuthClient::new(
        &user_ca,
        registered.as_ref(),
        permit_agent_forward,
    ));

    let server = Arc::new(
        Server::new(ServerConfig {
            auth_client: Some(AuthClient::from_single(auth_client.clone())),
            user_agent: Some(agent),
            source: "127.0.0.1:45622".to_string(),
            destination: sshd_addr,
            host_certificate: Some(bridge_host_key),
        })
        .unwrap(),
    );
    let conn = server.dial().unwrap();
    tokio::spawn(server.clone().serve());

    let mut handle = client::connect_stream(
        Arc::new(client::Config::default()),
        conn,
        TrustingClient,
    )
    .await
    .unwrap();
    let auth = handle
        .authenticate_openssh_cert("alice", Arc::new(user_key), cert)
        .await
        .unwrap();
    assert!(auth.success(), "certificate authentication should succeed");

    Fixture {
        auth_client,
        _server: server,
        handle,
    }
}

/// Drain a channel until it closes, separating stdout from exit status.
async fn collect_exec_output(
    mut channel: russh::Channel<client::Msg>,
) -> (Vec<u8>, Option<u32>) {
    let mut output = Vec::new();
    let mut status = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    (output, status)
}

#[tokio::test]
async fn exec_round_trip_delivers_output_and_exit_status() {
    let mut fixture = within(connect_fixture(true, true)).await;

    let channel = within(fixture.handle.channel_open_session()).await.unwrap();
    channel.exec(true, "echo hi").await.unwrap();
    let (output, status) = within(collect_exec_output(channel)).await;

    assert_eq!(output, b"hi\n");
    assert_eq!(status, Some(0));

    let starts = fixture.auth_client.events_of_kind(audit::SESSION_START_EVENT);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].fields[audit::EVENT_LOGIN], "alice");
}

#[tokio::test]
async fn unsupported_channel_is_rejected_and_bridge_stays_up() {
    let mut fixture = within(connect_fixture(true, true)).await;

    let rejected = within(
        fixture
            .handle
            .channel_open_direct_streamlocal("/var/run/anything.sock"),
    )
    .await;
    assert!(rejected.is_err(), "streamlocal channels are not supported");

    // The bridge keeps serving the connection afterwards.
    let channel = within(fixture.handle.channel_open_session()).await.unwrap();
    channel.exec(true, "echo hi").await.unwrap();
    let (output, status) = within(collect_exec_output(channel)).await;
    assert_eq!(output, b"hi\n");
    assert_eq!(status, Some(0));
}

#[tokio::test]
async fn direct_tcpip_echoes_bytes_and_audits_once() {
    let mut fixture = within(connect_fixture(true, true)).await;

    // Local TCP echo target.
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = echo_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    let channel = within(fixture.handle.channel_open_direct_tcpip(
        "127.0.0.1",
        echo_addr.port() as u32,
        "127.0.0.1",
        33000,
    ))
    .await
    .unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    channel.data(&payload[..]).await.unwrap();
    channel.eof().await.unwrap();

    let mut channel = channel;
    let mut echoed = Vec::new();
    within(async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => echoed.extend_from_slice(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert_eq!(echoed, payload);

    let events = fixture.auth_client.events_of_kind(audit::PORT_FORWARD_EVENT);
    assert_eq!(events.len(), 1, "exactly one port-forward event");
    let fields = &events[0].fields;
    assert_eq!(fields[audit::PORT_FORWARD_ADDR], echo_addr.to_string());
    assert_eq!(fields[audit::EVENT_LOGIN], "alice");
    assert!(fields.contains_key(audit::LOCAL_ADDR));
    assert!(fields.contains_key(audit::REMOTE_ADDR));
}

#[tokio::test]
async fn unreachable_agent_rejects_channels_after_handshake() {
    struct DeadConnector;

    #[async_trait]
    impl sshrelay::AgentConnector for DeadConnector {
        async fn connect(&self) -> Result<sshrelay::AgentStream> {
            Err(RelayError::Agent("agent went away".to_string()))
        }
    }

    let user_ca = ed25519();
    let user_key = ed25519();
    let cert = user_certificate(&user_ca, user_key.public_key(), "alice");
    let sshd_host_key = ed25519();
    let (sshd_addr, _) = spawn_sshd(sshd_host_key.clone(), user_key.public_key().clone()).await;

    let auth_client = Arc::new(TestAuthClient::new(
        &user_ca,
        Some(sshd_host_key.public_key()),
        true,
    ));
    let server = Arc::new(
        Server::new(ServerConfig {
            auth_client: Some(AuthClient::from_single(auth_client)),
            user_agent: Some(ForwardedAgent::new(Arc::new(DeadConnector))),
            source: "127.0.0.1:45622".to_string(),
            destination: sshd_addr,
            host_certificate: Some(ed25519()),
        })
        .unwrap(),
    );
    let conn = server.dial().unwrap();
    tokio::spawn(server.clone().serve());

    let mut handle =
        client::connect_stream(Arc::new(client::Config::default()), conn, TrustingClient)
            .await
            .unwrap();
    let auth = within(handle.authenticate_openssh_cert("alice", Arc::new(user_key), cert))
        .await
        .unwrap();
    assert!(auth.success(), "upstream handshake still completes");

    // The downstream dial fails, so every channel open is rejected.
    let channel = within(handle.channel_open_session()).await;
    assert!(channel.is_err(), "channel opens are rejected without an agent");
}

#[tokio::test]
async fn untrusted_host_key_tears_the_bridge_down() {
    let fixture_result = within(async {
        let user_ca = ed25519();
        let user_key = ed25519();
        let cert = user_certificate(&user_ca, user_key.public_key(), "alice");
        let sshd_host_key = ed25519();
        let agent = spawn_agent(&user_key);
        let (sshd_addr, _) =
            spawn_sshd(sshd_host_key.clone(), user_key.public_key().clone()).await;

        // The cluster never registered this host's key.
        let auth_client = Arc::new(TestAuthClient::new(&user_ca, None, true));
        let server = Arc::new(
            Server::new(ServerConfig {
                auth_client: Some(AuthClient::from_single(auth_client)),
                user_agent: Some(agent),
                source: "127.0.0.1:45622".to_string(),
                destination: sshd_addr,
                host_certificate: Some(ed25519()),
            })
            .unwrap(),
        );
        let conn = server.dial().unwrap();
        tokio::spawn(server.clone().serve());

        let mut handle =
            client::connect_stream(Arc::new(client::Config::default()), conn, TrustingClient)
                .await
                .unwrap();
        let auth = handle
            .authenticate_openssh_cert("alice", Arc::new(user_key), cert)
            .await
            .unwrap();
        assert!(auth.success());
        handle.channel_open_session().await
    })
    .await;

    assert!(
        fixture_result.is_err(),
        "host-key rejection leaves no downstream to bridge to"
    );
}

#[tokio::test]
async fn agent_forward_denial_is_silent_and_exec_still_works() {
    let mut fixture = within(connect_fixture(false, true)).await;

    let channel = within(fixture.handle.channel_open_session()).await.unwrap();
    // Policy denies this; the bridge logs and carries on (OpenSSH interop).
    channel.agent_forward(true).await.unwrap();
    channel.exec(true, "echo hi").await.unwrap();
    let (output, status) = within(collect_exec_output(channel)).await;
    assert_eq!(output, b"hi\n");
    assert_eq!(status, Some(0));
}

#[tokio::test]
async fn dialing_without_agent_is_denied_before_any_tcp() {
    let ca = ed25519();
    let auth_client = Arc::new(TestAuthClient::new(&ca, None, true));
    let handlers = Arc::new(AuthHandlers::new(auth_client));

    let err = connect_remote_session(
        &"127.0.0.1:1".parse().unwrap(),
        "alice",
        None,
        handlers,
    )
    .await
    .err()
    .expect("dial must fail without an agent");
    assert!(
        matches!(err, RelayError::AccessDenied(_)),
        "expected AccessDenied, got {err}"
    );
}

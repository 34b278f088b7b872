//! The license service daemon: accept loop, per-connection validation
//! handler, and the authorization exchange.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use uuid::Uuid;

use ovsa_core::certs::spki_fingerprint_der;
use ovsa_core::error::{OvsaError, PolicyViolation, Result};
use ovsa_core::tcb::{self, QuoteEvidence, TcbPayload};

use crate::db::LicenseDb;
use crate::proto::{
    self, authorization_binding, authorization_token, derive_token_key, WireMessage,
    PROTOCOL_VERSION,
};
use crate::tls;

pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);
pub const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

pub struct ServiceConfig {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    /// Certificate chain presented to clients; its leaf is the one pinned
    /// inside customer licenses.
    pub cert_chain_pem: String,
    pub key_pkcs8: Vec<u8>,
    /// SPKI fingerprint of the provisioned attestation-key anchor.
    pub ak_anchor_fingerprint: Option<String>,
    pub request_deadline: Duration,
}

struct ServerState {
    db: LicenseDb,
    ak_anchor: Option<String>,
    deadline: Duration,
}

pub struct LicenseServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
}

impl LicenseServer {
    pub async fn bind(config: ServiceConfig) -> Result<Self> {
        let db = LicenseDb::open(&config.db_path)?;
        let tls_config = tls::server_config(&config.cert_chain_pem, config.key_pkcs8)?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| OvsaError::Transient(format!("bind {}: {e}", config.listen)))?;
        Ok(LicenseServer {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            state: Arc::new(ServerState {
                db,
                ak_anchor: config.ak_anchor_fingerprint,
                deadline: config.request_deadline,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| OvsaError::Transient(format!("local addr: {e}")))
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "license service listening");
        loop {
            let (tcp, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| OvsaError::Transient(format!("accept: {e}")))?;
            let acceptor = self.acceptor.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(acceptor, state, tcp).await {
                    warn!(%peer, error = %err, "validation connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    tcp: TcpStream,
) -> Result<()> {
    let stream = tokio::time::timeout(TLS_HANDSHAKE_DEADLINE, acceptor.accept(tcp))
        .await
        .map_err(|_| OvsaError::Transient("TLS handshake deadline exceeded".into()))?
        .map_err(|e| OvsaError::Transient(format!("TLS handshake: {e}")))?;

    let peer_fingerprint = {
        let (_, conn) = stream.get_ref();
        let peer_certs = conn
            .peer_certificates()
            .ok_or_else(|| OvsaError::Verification("no client certificate presented".into()))?;
        spki_fingerprint_der(peer_certs[0].as_ref())?
    };
    let mut stream = stream;

    // Hello exchange carries the attestation challenge.
    let hello = proto::read_frame(&mut stream).await?;
    let WireMessage::Hello { version, .. } = hello else {
        return refuse(&mut stream, OvsaError::Verification("expected hello".into())).await;
    };
    if version != PROTOCOL_VERSION {
        return refuse(
            &mut stream,
            OvsaError::InvalidParameter(format!("unsupported protocol version {version}")),
        )
        .await;
    }
    let challenge = proto::fresh_nonce();
    proto::write_frame(
        &mut stream,
        &WireMessage::Hello {
            version: PROTOCOL_VERSION,
            nonce: Some(general_purpose::STANDARD.encode(&challenge)),
        },
    )
    .await?;

    let request = proto::read_frame(&mut stream).await?;
    let WireMessage::Validate {
        license_guid,
        bundle_hash,
        tcb_quote,
        nonce_client,
        kex_pubkey,
    } = request
    else {
        return refuse(&mut stream, OvsaError::Verification("expected validate".into())).await;
    };

    let outcome = tokio::time::timeout(
        state.deadline,
        validate(
            &state,
            &peer_fingerprint,
            &challenge,
            license_guid,
            bundle_hash,
            tcb_quote,
            nonce_client,
            kex_pubkey,
        ),
    )
    .await
    .unwrap_or_else(|_| {
        Err(OvsaError::Transient(
            "validation deadline exceeded".into(),
        ))
    });

    match outcome {
        Ok(authorize) => {
            info!(license = %license_guid, "validation authorized");
            proto::write_frame(&mut stream, &authorize).await
        }
        Err(err) => {
            warn!(license = %license_guid, tag = err.tag(), "validation refused");
            refuse(&mut stream, err).await
        }
    }
}

async fn refuse<S>(stream: &mut S, err: OvsaError) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let msg = WireMessage::Error {
        tag: err.tag().to_string(),
        message: err.to_string(),
    };
    proto::write_frame(stream, &msg).await.ok();
    Err(err)
}

#[allow(clippy::too_many_arguments)]
async fn validate(
    state: &Arc<ServerState>,
    peer_fingerprint: &str,
    challenge: &[u8],
    license_guid: Uuid,
    bundle_hash: String,
    tcb_quote: QuoteEvidence,
    nonce_client: String,
    kex_pubkey: String,
) -> Result<WireMessage> {
    // 1) Row lookup.
    let db = state.db.clone();
    let row = tokio::task::spawn_blocking(move || db.fetch(&license_guid))
        .await
        .map_err(|_| OvsaError::Transient("database task failed".into()))??
        .ok_or(OvsaError::Policy(PolicyViolation::Unknown))?;

    // 2) The mTLS client certificate must be the licensed customer.
    if peer_fingerprint != row.customer_primary_fingerprint {
        return Err(OvsaError::Verification(
            "client certificate does not match licensed customer".into(),
        ));
    }

    // 3) The presented bundle must be the licensed model build.
    if bundle_hash != row.model_hash {
        return Err(OvsaError::Verification(
            "bundle hash does not match licensed model".into(),
        ));
    }

    // 4) Attestation: quote must carry our challenge and the reference
    //    PCR digest, signed by the provisioned AK.
    let tcb_payload: TcbPayload = row.tcb_signature.payload_as()?;
    tcb::verify_quote(
        &tcb_quote,
        &tcb_payload,
        challenge,
        state.ak_anchor.as_deref(),
    )?;

    // 5) Policy gate, read-only.
    row.check_policy(Utc::now())?;

    // 6) Consume one use. This is the only state mutation and happens
    //    only after every other check has passed.
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || db.consume_usage(&license_guid))
        .await
        .map_err(|_| OvsaError::Transient("database task failed".into()))??;

    // 7) Authorization exchange.
    let client_pub = p256::PublicKey::from_sec1_bytes(&proto::decode_b64("kex key", &kex_pubkey)?)
        .map_err(|_| OvsaError::Verification("malformed client kex key".into()))?;
    let eph = p256::ecdh::EphemeralSecret::random(&mut rand::rngs::OsRng);
    let server_kex = eph.public_key().to_encoded_point(false).as_bytes().to_vec();
    let shared = eph.diffie_hellman(&client_pub);
    let token_key = derive_token_key(shared.raw_secret_bytes().as_slice());

    let nonce_server = proto::fresh_nonce();
    let nonce_client = proto::decode_b64("client nonce", &nonce_client)?;
    let binding = authorization_binding(&license_guid, &nonce_client, &nonce_server, &bundle_hash);
    let authorization = authorization_token(&token_key, &binding);

    Ok(WireMessage::Authorize {
        nonce_server: general_purpose::STANDARD.encode(nonce_server),
        kex_pubkey: general_purpose::STANDARD.encode(server_kex),
        authorization,
    })
}

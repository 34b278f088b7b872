use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ovsa_core::envelope::{read_json_capped, SignedBlob, MAX_LICENSE_FILE};
use ovsa_core::error::{OvsaError, Result};
use ovsa_core::keystore::{self, PassphraseProvider};
use ovsa_core::slots::SlotTable;

use ovsa_service::{LicenseDb, LicenseServer, ServiceConfig, DEFAULT_REQUEST_DEADLINE};

#[derive(Parser, Debug)]
#[command(author, version, about = "OVSA license service")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the validation daemon
    Serve {
        #[arg(long, default_value = "0.0.0.0:4451")]
        listen: SocketAddr,
        #[arg(long)]
        db: PathBuf,
        /// Service keystore; its primary entry is the pinned TLS identity
        #[arg(short = 'k', long)]
        keystore: PathBuf,
        /// SPKI fingerprint (hex) of the provisioned attestation key
        #[arg(long)]
        ak_anchor: Option<String>,
        #[arg(long, default_value_t = DEFAULT_REQUEST_DEADLINE.as_secs())]
        deadline_secs: u64,
    },
    /// Insert a customer license (and optionally cross-check the
    /// customer certificate) into the database
    Ingest {
        #[arg(long)]
        db: PathBuf,
        #[arg(short = 'l', long)]
        license: PathBuf,
        #[arg(short = 'c', long)]
        customer_cert: Option<PathBuf>,
    },
    /// Mark a license as revoked
    Revoke {
        #[arg(long)]
        db: PathBuf,
        #[arg(short = 'g', long)]
        license_guid: String,
    },
}

async fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Cmd::Serve {
            listen,
            db,
            keystore: store,
            ak_anchor,
            deadline_secs,
        } => {
            let provider = PassphraseProvider::from_env()?;
            let mut slots = SlotTable::new();
            let loaded = keystore::load_asymmetric_key(&mut slots, &store, &provider)?;
            let key_pkcs8 = slots
                .asymmetric(loaded.primary)?
                .keypair
                .to_pkcs8_der()?
                .to_vec();
            let server = LicenseServer::bind(ServiceConfig {
                listen,
                db_path: db,
                cert_chain_pem: loaded.primary_cert,
                key_pkcs8,
                ak_anchor_fingerprint: ak_anchor,
                request_deadline: Duration::from_secs(deadline_secs),
            })
            .await?;
            drop(slots);
            server.run().await
        }
        Cmd::Ingest {
            db,
            license,
            customer_cert,
        } => {
            let blob: SignedBlob = read_json_capped(&license, MAX_LICENSE_FILE)?;
            let cert_pem = customer_cert
                .map(|p| std::fs::read_to_string(&p).map_err(|e| OvsaError::file_io(&p, e)))
                .transpose()?;
            let db = LicenseDb::open(&db)?;
            let guid = db.ingest(&blob, cert_pem.as_deref())?;
            info!(license = %guid, "license ingested");
            println!("Ingested license {guid}");
            Ok(())
        }
        Cmd::Revoke { db, license_guid } => {
            let guid: Uuid = license_guid.parse().map_err(|_| {
                OvsaError::InvalidParameter(format!("malformed license GUID `{license_guid}`"))
            })?;
            let db = LicenseDb::open(&db)?;
            db.revoke(&guid)?;
            println!("Revoked license {guid}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    ovsa_core::security::disable_core_dumps().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}

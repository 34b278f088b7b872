use std::path::PathBuf;

use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use uuid::Uuid;

use ovsa_core::bundle::{Description, ModelName, VersionTag};
use ovsa_core::certs::TrustAnchors;
use ovsa_core::crypto::EcdsaAlgorithm;
use ovsa_core::envelope::write_json_atomic;
use ovsa_core::error::{OvsaError, Result};
use ovsa_core::keystore::{self, PassphraseProvider, StoreRole};
use ovsa_core::license::{LicenseConfig, LicensePolicy};
use ovsa_core::ocsp::OcspPolicy;
use ovsa_core::protect::{protect, ModelMetadata, ProtectRequest};
use ovsa_core::sale::{sale, SaleRequest};
use ovsa_core::slots::SlotTable;
use ovsa_core::tcb::{sign_tcb, TcbPayload};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "OVSA: protect model files into signed encrypted bundles and mint the licenses that gate them"
)]
struct Cli {
    /// Trusted CA certificate bundle (PEM). Defaults to ~/.ovsa/ca.crt.
    #[arg(long, global = true)]
    ca_cert: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a keystore (-storekey) or attach an issued certificate (-storecert)
    Keygen {
        /// Create primary and secondary keypairs with CSRs and self-signed certs
        #[arg(long)]
        storekey: bool,
        /// Replace the stored certificate with an externally signed one
        #[arg(long)]
        storecert: bool,
        /// Key algorithm: ECDSA (alias for ecdsa-p256), ecdsa-p256, ecdsa-p384
        #[arg(short = 't', long = "type", default_value = "ecdsa-p256")]
        algorithm: String,
        /// Key name, used as CN when no subject is given
        #[arg(short = 'n', long)]
        name: Option<String>,
        /// Keystore path; entries land in primary_<name> / secondary_<name>
        #[arg(short = 'k', long)]
        keystore: PathBuf,
        /// CSR base name (default: <keystore name>.csr)
        #[arg(short = 'r', long)]
        csr: Option<String>,
        /// Subject, e.g. /C=IN/CN=localhost
        #[arg(short = 'e', long)]
        subject: Option<String>,
        /// Certificate file for -storecert
        #[arg(short = 'c', long)]
        cert: Option<PathBuf>,
        /// Operate on the secondary entry instead of the primary
        #[arg(long)]
        secondary: bool,
    },
    /// Encrypt model files into a signed bundle and emit the master license
    Protect {
        /// Input model files, in order
        #[arg(short = 'i', long = "input", num_args = 1.., required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short = 'n', long)]
        name: String,
        #[arg(short = 'd', long, default_value = "")]
        description: String,
        #[arg(short = 'v', long)]
        version: String,
        #[arg(short = 'k', long)]
        keystore: PathBuf,
        /// License GUID (RFC-4122) chosen by the issuer
        #[arg(short = 'g', long)]
        license_guid: String,
        /// Protected bundle output
        #[arg(short = 'p', long)]
        protect_out: PathBuf,
        /// Master license output
        #[arg(short = 'm', long)]
        master_out: PathBuf,
    },
    /// Mint a customer license from a master license
    Sale {
        #[arg(short = 'm', long)]
        master: PathBuf,
        #[arg(short = 'k', long)]
        keystore: PathBuf,
        /// Customer license config produced by `licgen`
        #[arg(short = 'l', long)]
        license_config: PathBuf,
        /// TCB signature file produced by `gen-tcb-signature`
        #[arg(short = 't', long)]
        tcb: PathBuf,
        /// Customer primary certificate (PEM)
        #[arg(short = 'c', long)]
        customer_cert: PathBuf,
        /// Customer secondary certificate (PEM)
        #[arg(long)]
        customer_secondary_cert: Option<PathBuf>,
        #[arg(short = 'o', long)]
        out: PathBuf,
    },
    /// Write a customer license config (policy + pinned license server)
    Licgen {
        /// Policy: time-limit, usage-count or unlimited
        #[arg(long = "type")]
        policy: String,
        /// Days for time-limit
        #[arg(long)]
        days: Option<u32>,
        /// Count for usage-count
        #[arg(long)]
        count: Option<u32>,
        /// License server endpoint, host:port
        #[arg(long)]
        server_url: String,
        /// License server certificate to pin (PEM file)
        #[arg(long)]
        server_cert: PathBuf,
        #[arg(short = 'o', long)]
        out: PathBuf,
    },
    /// Sign a TCB reference measurement
    GenTcbSignature {
        #[arg(long)]
        name: String,
        #[arg(long = "tcb-version")]
        version: String,
        #[arg(long, default_value = "sha256")]
        pcr_bank: String,
        /// Comma-separated PCR indices, e.g. 0,1,2,3,7
        #[arg(long)]
        pcr_selection: String,
        /// Expected digest over the selected PCR values (hex)
        #[arg(long)]
        pcr_digest: String,
        #[arg(short = 'k', long)]
        keystore: PathBuf,
        #[arg(short = 'o', long)]
        out: PathBuf,
    },
}

fn parse_algorithm(value: &str) -> Result<EcdsaAlgorithm> {
    match value {
        "ECDSA" | "ecdsa" | "ecdsa-p256" => Ok(EcdsaAlgorithm::P256),
        "ecdsa-p384" => Ok(EcdsaAlgorithm::P384),
        other => Err(OvsaError::InvalidParameter(format!(
            "unknown key type `{other}`"
        ))),
    }
}

fn load_anchors(ca_cert: &Option<PathBuf>) -> Result<TrustAnchors> {
    let path = match ca_cert {
        Some(p) => p.clone(),
        None => {
            let home = dirs::home_dir().ok_or_else(|| {
                OvsaError::InvalidParameter("cannot locate home directory for ~/.ovsa".into())
            })?;
            home.join(".ovsa").join("ca.crt")
        }
    };
    if path.exists() {
        TrustAnchors::from_pem_file(&path)
    } else {
        Ok(TrustAnchors::empty())
    }
}

async fn run(cli: Cli) -> Result<()> {
    let anchors = load_anchors(&cli.ca_cert)?;
    match cli.cmd {
        Cmd::Keygen {
            storekey,
            storecert,
            algorithm,
            name,
            keystore: store,
            csr,
            subject,
            cert,
            secondary,
        } => {
            if storekey == storecert {
                return Err(OvsaError::InvalidParameter(
                    "exactly one of --storekey / --storecert required".into(),
                ));
            }
            let provider = PassphraseProvider::from_env()?;
            if storekey {
                let subject = match (subject, name) {
                    (Some(s), _) => s,
                    (None, Some(n)) => format!("/CN={n}"),
                    (None, None) => {
                        return Err(OvsaError::InvalidParameter(
                            "--subject or --name required for --storekey".into(),
                        ))
                    }
                };
                let alg = parse_algorithm(&algorithm)?;
                keystore::create_store(&store, alg, &subject, csr.as_deref(), &provider)?;
                println!("Created keystore entries for {}", store.display());
                for role in ["primary", "secondary"] {
                    println!(
                        "  {}_{}  (+ .csr, .csr.crt)",
                        role,
                        store.file_name().and_then(|n| n.to_str()).unwrap_or("ks")
                    );
                }
            } else {
                let cert_path = cert.ok_or_else(|| {
                    OvsaError::InvalidParameter("--cert required for --storecert".into())
                })?;
                let pem = std::fs::read_to_string(&cert_path)
                    .map_err(|e| OvsaError::file_io(&cert_path, e))?;
                let role = if secondary {
                    StoreRole::Secondary
                } else {
                    StoreRole::Primary
                };
                keystore::attach_certificate(&store, role, &pem, &provider)?;
                println!("Attached certificate to {}", store.display());
            }
        }
        Cmd::Protect {
            inputs,
            name,
            description,
            version,
            keystore: store,
            license_guid,
            protect_out,
            master_out,
        } => {
            let provider = PassphraseProvider::from_env()?;
            let license_guid: Uuid = license_guid.parse().map_err(|_| {
                OvsaError::InvalidParameter(format!("malformed license GUID `{license_guid}`"))
            })?;
            let description = if description.is_empty() {
                "-".to_string()
            } else {
                description
            };
            let outcome = protect(
                ProtectRequest {
                    model_files: inputs,
                    metadata: ModelMetadata {
                        name: ModelName::new(name)?,
                        description: Description::new(description)?,
                        version: VersionTag::new(version)?,
                    },
                    license_guid,
                    keystore: &store,
                    protect_out: &protect_out,
                    master_out: &master_out,
                },
                &provider,
                &anchors,
            )
            .await?;
            println!(
                "Protected {} file(s), {} of model data",
                outcome.files,
                format_size(outcome.plaintext_bytes, BINARY)
            );
            println!("  model_guid: {}", outcome.model_guid);
            println!("  bundle:     {}", protect_out.display());
            println!("  master:     {}", master_out.display());
        }
        Cmd::Sale {
            master,
            keystore: store,
            license_config,
            tcb,
            customer_cert,
            customer_secondary_cert,
            out,
        } => {
            let provider = PassphraseProvider::from_env()?;
            let ocsp = OcspPolicy::required()?;
            let outcome = sale(
                SaleRequest {
                    master: &master,
                    keystore: &store,
                    license_config: &license_config,
                    tcb: &tcb,
                    customer_cert: &customer_cert,
                    customer_secondary_cert: customer_secondary_cert.as_deref(),
                    out: &out,
                },
                &provider,
                &anchors,
                &ocsp,
            )
            .await?;
            println!("Issued customer license {}", outcome.license_guid);
            println!("  customer: {}", outcome.customer_fingerprint);
            println!("  output:   {}", out.display());
        }
        Cmd::Licgen {
            policy,
            days,
            count,
            server_url,
            server_cert,
            out,
        } => {
            let license_policy = match policy.as_str() {
                "time-limit" => LicensePolicy::TimeLimit {
                    days: days.ok_or_else(|| {
                        OvsaError::InvalidParameter("--days required for time-limit".into())
                    })?,
                },
                "usage-count" => LicensePolicy::UsageCount {
                    n: count.ok_or_else(|| {
                        OvsaError::InvalidParameter("--count required for usage-count".into())
                    })?,
                },
                "unlimited" => LicensePolicy::Unlimited,
                other => {
                    return Err(OvsaError::InvalidParameter(format!(
                        "unknown policy type `{other}`"
                    )))
                }
            };
            let cert_pem = std::fs::read_to_string(&server_cert)
                .map_err(|e| OvsaError::file_io(&server_cert, e))?;
            let config = LicenseConfig {
                license_policy,
                license_server_url: server_url,
                license_server_cert: cert_pem,
            };
            config.validate()?;
            write_json_atomic(&out, &config, false)?;
            println!("Wrote license config {}", out.display());
        }
        Cmd::GenTcbSignature {
            name,
            version,
            pcr_bank,
            pcr_selection,
            pcr_digest,
            keystore: store,
            out,
        } => {
            let provider = PassphraseProvider::from_env()?;
            let pcr_selection = pcr_selection
                .split(',')
                .map(|s| {
                    s.trim().parse::<u32>().map_err(|_| {
                        OvsaError::InvalidParameter(format!("bad PCR index `{s}`"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mut slots = SlotTable::new();
            let loaded = keystore::load_asymmetric_key(&mut slots, &store, &provider)?;
            let blob = sign_tcb(
                &slots,
                loaded.primary,
                &TcbPayload {
                    tcb_name: name,
                    tcb_version: version,
                    pcr_bank_algorithm: pcr_bank,
                    pcr_selection,
                    pcr_digest,
                },
            )?;
            write_json_atomic(&out, &blob, false)?;
            println!("Wrote TCB signature {}", out.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    ovsa_core::security::disable_core_dumps().ok();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}

//! CA Manager - interactive console
//!
//! Opens the certificate authorities listed in the configuration and offers a menu to
//! create, unlock and operate them.
//!
//! ```bash
//! # Uses ./config.toml unless a path is given
//! ca-manager /etc/ca-manager/config.toml
//! RUST_LOG=debug ca-manager
//! ```

use anyhow::{anyhow, Context, Result};
use ca_manager::certificate_factory::{generate_self_signed_certificate, IssuedCertificate};
use ca_manager::configs::AppConfig;
use ca_manager::crl::RevocationReason;
use ca_manager::key_pair_factory::generate_key_pair;
use ca_manager::manager::{CertificateAuthorityManager, SharedAuthority};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const DEFAULT_CRL_VALIDITY_DAYS: i64 = 7;

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&config_path).exists() {
        AppConfig::from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level in configuration")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("=== CA Manager ===\n");
    let manager = CertificateAuthorityManager::new();
    let mut current: Option<SharedAuthority> = None;
    for dir in &config.manager.ca_directories {
        match manager.open(dir) {
            Ok(ca) => {
                println!("✓ Opened {}", ca.lock().display_name());
                current = Some(ca);
            }
            Err(e) => warn!(path = %dir.display(), error = %e, "failed to open configured CA"),
        }
    }

    // Main menu loop
    loop {
        println!("\n=== CA Manager Menu ===");
        match current.as_ref() {
            Some(ca) => {
                let ca = ca.lock();
                let state = if ca.is_locked() { "locked" } else { "unlocked" };
                println!("Current CA: {} ({state})", ca.display_name());
            }
            None => println!("Current CA: none"),
        }
        println!("1. Create CA");
        println!("2. Open CA");
        println!("3. Unlock");
        println!("4. Lock");
        println!("5. Import certificate request");
        println!("6. Sign pending request");
        println!("7. Revoke certificate");
        println!("8. Create CRL");
        println!("9. Status");
        println!("10. Exit");

        let choice = prompt("\nSelect an option")?;
        let result = match choice.as_str() {
            "1" => create_ca(&manager, &config).map(|ca| current = Some(ca)),
            "2" => open_ca(&manager).map(|ca| current = Some(ca)),
            "3" => selected(&current).and_then(unlock),
            "4" => selected(&current).and_then(|ca| {
                ca.lock().lock()?;
                println!("✓ CA locked");
                Ok(())
            }),
            "5" => selected(&current).and_then(import_request),
            "6" => selected(&current).and_then(sign_pending),
            "7" => selected(&current).and_then(revoke),
            "8" => selected(&current).and_then(create_crl),
            "9" => selected(&current).and_then(status),
            "10" => {
                println!("\nExiting CA Manager...");
                break;
            }
            _ => {
                println!("Invalid option. Please select 1-10.");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("✗ {e:#}");
        }
    }

    for (id, _) in manager.list() {
        manager.remove(id)?;
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn selected(current: &Option<SharedAuthority>) -> Result<&SharedAuthority> {
    current
        .as_ref()
        .ok_or_else(|| anyhow!("No CA selected, create or open one first"))
}

fn create_ca(manager: &CertificateAuthorityManager, config: &AppConfig) -> Result<SharedAuthority> {
    println!("\n=== Create CA ===");
    let dir = PathBuf::from(prompt("Directory (must exist)")?);
    let subject = prompt("Subject (e.g. CN=Home Root CA,O=Home)")?;
    let description = prompt("Description")?;
    let passphrase = prompt("Keystore passphrase")?;

    let defaults = &config.defaults;
    let key = generate_key_pair(defaults.key_type).context("Failed to generate CA key pair")?;
    let now = OffsetDateTime::now_utc();
    let certificate = generate_self_signed_certificate(
        &subject,
        now,
        now + Duration::days(defaults.ca_validity_days),
        &key,
        defaults.signature_algorithm,
        true,
        None,
    )
    .context("Failed to generate CA certificate")?;
    println!("✓ {} root certificate generated", defaults.key_type);

    let bundle = IssuedCertificate::new(certificate.clone(), Some(key), vec![certificate]);
    let shared = manager
        .create(&dir, bundle, &passphrase, &description)
        .context("Failed to create CA")?;
    {
        let mut ca = shared.lock();
        ca.set_expiry_days(defaults.expiry_days)?;
        ca.set_incremental_serial(defaults.incremental_serial)?;
        if let Some(algorithm) = defaults.signature_algorithm {
            ca.set_signature_algorithm(algorithm)?;
        }
        println!("✓ CA {} created in {}", ca.id(), ca.base_path().display());
    }
    Ok(shared)
}

fn open_ca(manager: &CertificateAuthorityManager) -> Result<SharedAuthority> {
    let dir = PathBuf::from(prompt("CA directory")?);
    let shared = manager.open(&dir).context("Failed to open CA")?;
    println!("✓ Opened {}", shared.lock().display_name());
    Ok(shared)
}

fn unlock(shared: &SharedAuthority) -> Result<()> {
    let passphrase = prompt("Keystore passphrase")?;
    shared.lock().unlock(&passphrase)?;
    println!("✓ CA unlocked");
    Ok(())
}

fn import_request(shared: &SharedAuthority) -> Result<()> {
    let path = PathBuf::from(prompt("Request file (PEM or DER)")?);
    let props = shared.lock().add_certificate_signing_request(&path)?;
    println!(
        "✓ Request {} imported for {}",
        props.id,
        props.subject.as_deref().unwrap_or("<no subject>")
    );
    Ok(())
}

fn sign_pending(shared: &SharedAuthority) -> Result<()> {
    let mut ca = shared.lock();
    if ca.requests().is_empty() {
        println!("No pending requests.");
        return Ok(());
    }
    for (i, request) in ca.requests().iter().enumerate() {
        println!(
            "{}. {} {}",
            i + 1,
            request.id,
            request.subject.as_deref().unwrap_or("<no subject>")
        );
    }
    let index: usize = prompt("Request number")?.parse().context("Not a number")?;
    let id = ca
        .requests()
        .get(index.wrapping_sub(1))
        .map(|r| r.id.clone())
        .ok_or_else(|| anyhow!("No request number {index}"))?;
    let passphrase = prompt("Passphrase for the issued bundle")?;

    let now = OffsetDateTime::now_utc();
    let not_after = now + Duration::days(ca.expiry_days());
    let issued = ca.sign_pending_request(&id, Some(now), Some(not_after), &passphrase)?;
    println!(
        "✓ Issued serial {}",
        ca_manager::certificate_factory::certificate_serial(&issued.certificate)?
    );
    Ok(())
}

fn revoke(shared: &SharedAuthority) -> Result<()> {
    let mut ca = shared.lock();
    for entry in ca.issued() {
        println!(
            "{} {}",
            entry.id,
            entry.subject.as_deref().unwrap_or("<no subject>")
        );
    }
    let id = prompt("Serial to revoke")?;
    let reason = prompt("Reason (empty for unspecified)")?;
    let reason = if reason.is_empty() {
        None
    } else {
        Some(reason.parse::<RevocationReason>()?)
    };
    ca.revoke_certificate(&id, None, reason)?;
    println!("✓ Certificate {id} revoked");
    Ok(())
}

fn create_crl(shared: &SharedAuthority) -> Result<()> {
    let days = prompt(&format!("Days until next update [{DEFAULT_CRL_VALIDITY_DAYS}]"))?;
    let days: i64 = if days.is_empty() {
        DEFAULT_CRL_VALIDITY_DAYS
    } else {
        days.parse().context("Not a number")?
    };
    let mut ca = shared.lock();
    let crl = ca.create_crl(Some(OffsetDateTime::now_utc() + Duration::days(days)))?;
    println!(
        "✓ CRL {} created with {} entries",
        crl.number()?.unwrap_or_default(),
        crl.revoked()?.len()
    );
    Ok(())
}

fn status(shared: &SharedAuthority) -> Result<()> {
    let ca = shared.lock();
    println!("\n=== CA Status ===");
    println!("Id:                  {}", ca.id());
    println!("Description:         {}", ca.description());
    println!("Directory:           {}", ca.base_path().display());
    println!("Locked:              {}", ca.is_locked());
    println!("Signature algorithm: {}", ca.signature_algorithm());
    println!("Expiry days:         {}", ca.expiry_days());
    println!("Incremental serials: {}", ca.incremental_serial());
    println!("Activity log:        {}", ca.enable_log());
    println!("Next serial:         {:x}", ca.next_serial_number());
    println!("Next CRL number:     {:x}", ca.next_crl_serial_number());
    println!("Pending requests:    {}", ca.requests().len());
    println!("Issued:              {}", ca.issued().len());
    println!("Revoked:             {}", ca.revoked().len());
    println!("CRLs:                {}", ca.crls().len());
    println!("Templates:           {}", ca.templates().len());
    Ok(())
}

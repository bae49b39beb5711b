//! Certificate manager
//!
//! One self-signed authority per `CaRole` lives in the vault together with
//! the metadata and certificate of every leaf it issued. Private keys of
//! leaves are handed to the caller and never stored.

use crate::error::ControllerError;
use crate::storage::{CaBundle, Storage, VaultEntry};
use chrono::{DateTime, Utc};
use cluster_model::{CaRole, CertificateMetadata};
use kv_client::LeaderKey;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What to put in a leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// `<node address>/<certificate name>`
    pub target: String,
    /// Subject CN
    pub common_name: String,
    /// Subject O
    pub organization: Option<String>,
    /// DNS names and IP addresses
    pub alt_names: Vec<String>,
    /// Lifetime
    pub validity: Duration,
}

/// A freshly issued leaf
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Vault bookkeeping
    pub metadata: CertificateMetadata,
    /// PEM certificate
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
}

/// Issues, renews, revokes and collects certificates
#[derive(Debug)]
pub struct CertificateManager {
    storage: Arc<Storage>,
}

fn offset(t: DateTime<Utc>) -> Result<time::OffsetDateTime, ControllerError> {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| ControllerError::Certificate(format!("timestamp {t}: {e}")))
}

fn add(t: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>, ControllerError> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .ok_or_else(|| ControllerError::Certificate(format!("validity {d:?} out of range")))
}

fn new_serial() -> u64 {
    // Positive and non-zero so that DER encoding never needs a padding byte.
    let (hi, _) = uuid::Uuid::new_v4().as_u64_pair();
    (hi >> 1).max(1)
}

fn san(name: &str) -> SanType {
    match name.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(name.to_string()),
    }
}

/// Create a self-signed authority
pub fn generate_ca(role: CaRole, validity: Duration, now: DateTime<Utc>) -> Result<CaBundle, ControllerError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("cke {} CA", role.as_str()));
    dn.push(DnType::OrganizationName, "cke");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(new_serial());
    params.not_before = offset(now)?;
    params.not_after = offset(add(now, validity)?)?;

    let cert = Certificate::from_params(params)?;
    Ok(CaBundle {
        role,
        certificate: cert.serialize_pem()?,
        private_key: cert.serialize_private_key_pem(),
    })
}

/// Sign a leaf with `ca`
fn sign(
    ca: &CaBundle,
    request: &IssueRequest,
    now: DateTime<Utc>,
) -> Result<IssuedCertificate, ControllerError> {
    let key_pair = KeyPair::from_pem(&ca.private_key)?;
    let issuer = Certificate::from_params(CertificateParams::from_ca_cert_pem(&ca.certificate, key_pair)?)?;

    let not_after = add(now, request.validity)?;
    let serial = new_serial();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, request.common_name.clone());
    if let Some(org) = &request.organization {
        dn.push(DnType::OrganizationName, org.clone());
    }
    params.distinguished_name = dn;
    params.subject_alt_names = request.alt_names.iter().map(|n| san(n)).collect();
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    params.serial_number = Some(serial);
    params.not_before = offset(now)?;
    params.not_after = offset(not_after)?;

    let cert = Certificate::from_params(params)?;
    Ok(IssuedCertificate {
        metadata: CertificateMetadata {
            role: ca.role,
            serial: format!("{serial:016x}"),
            target: request.target.clone(),
            common_name: request.common_name.clone(),
            alt_names: request.alt_names.clone(),
            organization: request.organization.clone(),
            not_before: now,
            not_after,
            revoked: false,
        },
        certificate: cert.serialize_pem_with_signer(&issuer)?,
        private_key: cert.serialize_private_key_pem(),
    })
}

impl CertificateManager {
    /// Create a manager over the vault in `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    async fn authority(&self, role: CaRole) -> Result<CaBundle, ControllerError> {
        self.storage
            .get_ca(role)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("{role} CA")))
    }

    /// Create the authority for `role` unless it exists; returns whether it was created
    pub async fn ensure_ca(
        &self,
        role: CaRole,
        validity: Duration,
        now: DateTime<Utc>,
        guard: &LeaderKey,
    ) -> Result<bool, ControllerError> {
        if self.storage.get_ca(role).await?.is_some() {
            return Ok(false);
        }
        let bundle = generate_ca(role, validity, now)?;
        let created = self.storage.put_ca(&bundle, guard).await?;
        if created {
            info!("Created {} CA", role);
        }
        Ok(created)
    }

    /// PEM certificate of an authority
    pub async fn ca_certificate(&self, role: CaRole) -> Result<Option<String>, ControllerError> {
        Ok(self.storage.get_ca(role).await?.map(|ca| ca.certificate))
    }

    /// Issue a leaf and record it; live certificates of the same target are revoked
    pub async fn issue(
        &self,
        role: CaRole,
        request: &IssueRequest,
        now: DateTime<Utc>,
        guard: &LeaderKey,
    ) -> Result<IssuedCertificate, ControllerError> {
        let ca = self.authority(role).await?;
        let issued = sign(&ca, request, now)?;

        for mut previous in self.storage.list_certificates(role).await? {
            if previous.metadata.target == request.target && !previous.metadata.revoked {
                previous.metadata.revoked = true;
                self.storage.put_certificate(&previous, guard).await?;
                debug!("Revoked superseded certificate {} for {}", previous.metadata.serial, request.target);
            }
        }

        self.storage
            .put_certificate(
                &VaultEntry {
                    metadata: issued.metadata.clone(),
                    certificate: issued.certificate.clone(),
                },
                guard,
            )
            .await?;
        info!(
            "Issued {} certificate {} for {} (expires {})",
            role, issued.metadata.serial, request.target, issued.metadata.not_after
        );
        Ok(issued)
    }

    /// Issue a leaf without recording it (short-lived client credentials)
    pub async fn issue_ephemeral(
        &self,
        role: CaRole,
        request: &IssueRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate, ControllerError> {
        let ca = self.authority(role).await?;
        sign(&ca, request, now)
    }

    /// Re-issue the certificate `serial` with the same subject and lifetime
    pub async fn renew(
        &self,
        role: CaRole,
        serial: &str,
        now: DateTime<Utc>,
        guard: &LeaderKey,
    ) -> Result<IssuedCertificate, ControllerError> {
        let entry = self
            .storage
            .list_certificates(role)
            .await?
            .into_iter()
            .find(|e| e.metadata.serial == serial)
            .ok_or_else(|| ControllerError::NotFound(format!("{role} certificate {serial}")))?;
        let m = entry.metadata;
        let validity = (m.not_after - m.not_before)
            .to_std()
            .map_err(|e| ControllerError::Certificate(format!("certificate {serial}: {e}")))?;
        let request = IssueRequest {
            target: m.target,
            common_name: m.common_name,
            organization: m.organization,
            alt_names: m.alt_names,
            validity,
        };
        self.issue(role, &request, now, guard).await
    }

    /// Mark a certificate revoked; returns `false` if it was unknown or already revoked
    pub async fn revoke(&self, role: CaRole, serial: &str, guard: &LeaderKey) -> Result<bool, ControllerError> {
        let Some(mut entry) = self
            .storage
            .list_certificates(role)
            .await?
            .into_iter()
            .find(|e| e.metadata.serial == serial)
        else {
            return Ok(false);
        };
        if entry.metadata.revoked {
            return Ok(false);
        }
        entry.metadata.revoked = true;
        self.storage.put_certificate(&entry, guard).await?;
        info!("Revoked {} certificate {} ({})", role, serial, entry.metadata.target);
        Ok(true)
    }

    /// Revoke every live certificate whose target starts with `prefix`, across all roles
    pub async fn revoke_targets(&self, prefix: &str, guard: &LeaderKey) -> Result<usize, ControllerError> {
        let mut count = 0;
        for role in CaRole::ALL {
            for entry in self.storage.list_certificates(role).await? {
                if entry.metadata.target.starts_with(prefix) && !entry.metadata.revoked {
                    self.revoke(role, &entry.metadata.serial, guard).await?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Issued certificates of a role
    pub async fn list(&self, role: CaRole) -> Result<Vec<CertificateMetadata>, ControllerError> {
        Ok(self
            .storage
            .list_certificates(role)
            .await?
            .into_iter()
            .map(|e| e.metadata)
            .collect())
    }

    /// Newest live certificate for a target
    pub async fn latest(&self, role: CaRole, target: &str) -> Result<Option<VaultEntry>, ControllerError> {
        Ok(self
            .storage
            .list_certificates(role)
            .await?
            .into_iter()
            .filter(|e| e.metadata.target == target && !e.metadata.revoked)
            .max_by_key(|e| e.metadata.not_after))
    }

    /// Delete revoked and expired entries; returns how many were deleted
    pub async fn gc(&self, now: DateTime<Utc>, guard: &LeaderKey) -> Result<usize, ControllerError> {
        let mut total = 0;
        for role in CaRole::ALL {
            let doomed: Vec<String> = self
                .storage
                .list_certificates(role)
                .await?
                .into_iter()
                .filter(|e| e.metadata.revoked || e.metadata.is_expired(now))
                .map(|e| e.metadata.serial)
                .collect();
            total += self.storage.delete_certificates(role, &doomed, guard).await?;
        }
        if total > 0 {
            info!("Collected {} revoked or expired certificates", total);
        }
        Ok(total)
    }
}

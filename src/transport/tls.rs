//! Purpose: Build the TLS client configuration used for encrypted connections.
//! Exports: `client_config`, `build_root_store`, `BUNDLED_ANCHORS`.
//! Role: Trust store = three bundled anchors plus the platform's trusted roots.
//! Invariants: Assembled at most once per process; concurrent callers wait for the first.
//! Invariants: A missing platform bundle is not fatal; the bundled anchors always load.
use crate::core::error::{ClientResult, Error, ErrorKind};
use rustls::{ClientConfig, RootCertStore};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Anchors shipped with the client for deployments whose chains predate
/// the platform store.
pub const BUNDLED_ANCHORS: [(&str, &str); 3] = [
    (
        "addtrust_external_root",
        include_str!("../../certs/addtrust_external_root.pem"),
    ),
    (
        "usertrust_rsa_ca",
        include_str!("../../certs/usertrust_rsa_ca.pem"),
    ),
    (
        "dst_root_ca_x3",
        include_str!("../../certs/dst_root_ca_x3.pem"),
    ),
];

const PLATFORM_BUNDLES: [&str; 5] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

static CLIENT_CONFIG: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();

pub fn client_config() -> ClientResult<Arc<ClientConfig>> {
    CLIENT_CONFIG
        .get_or_init(|| {
            let platform = read_platform_bundle();
            let (roots, added) =
                build_root_store(platform.as_deref()).map_err(|err| err.to_string())?;
            debug!(anchors = added, "assembled TLS trust store");
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Arc::new(config))
        })
        .clone()
        .map_err(|message| {
            Error::new(ErrorKind::Configuration)
                .with_message(format!("could not set up TLS trust store: {message}"))
        })
}

/// Returns the store and how many anchors it holds.
pub fn build_root_store(platform_pem: Option<&[u8]>) -> ClientResult<(RootCertStore, usize)> {
    let mut roots = RootCertStore::empty();

    if let Some(pem) = platform_pem {
        let certs = parse_pem(pem);
        let (added, ignored) = roots.add_parsable_certificates(certs);
        debug!(added, ignored, "loaded platform roots");
    }

    for (name, pem) in BUNDLED_ANCHORS {
        let certs = parse_pem(pem.as_bytes());
        let (added, _) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("bundled anchor {name} did not parse")));
        }
    }

    let total = roots.len();
    Ok((roots, total))
}

fn parse_pem(pem: &[u8]) -> Vec<rustls::pki_types::CertificateDer<'static>> {
    let mut reader = Cursor::new(pem);
    rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect()
}

fn read_platform_bundle() -> Option<Vec<u8>> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = std::env::var_os("SSL_CERT_FILE") {
        candidates.push(PathBuf::from(path));
    }
    candidates.extend(PLATFORM_BUNDLES.iter().map(PathBuf::from));

    for path in &candidates {
        if let Some(bytes) = read_if_present(path) {
            return Some(bytes);
        }
    }
    warn!("no platform certificate bundle found; using bundled anchors only");
    None
}

fn read_if_present(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            debug!(path = %path.display(), "reading platform certificate bundle");
            Some(bytes)
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{BUNDLED_ANCHORS, build_root_store, client_config};
    use std::sync::Arc;

    #[test]
    fn bundled_anchors_always_load() {
        let (roots, total) = build_root_store(None).expect("trust store");
        assert_eq!(total, BUNDLED_ANCHORS.len());
        assert_eq!(roots.len(), 3);
    }

    #[test]
    fn unparsable_platform_bundle_is_ignored() {
        let (_, total) = build_root_store(Some(b"not a pem bundle")).expect("trust store");
        assert_eq!(total, 3);
    }

    #[test]
    fn platform_bundle_adds_to_bundled_anchors() {
        let platform = BUNDLED_ANCHORS[0].1.as_bytes();
        let (_, total) = build_root_store(Some(platform)).expect("trust store");
        assert!(total >= 3);
    }

    #[test]
    fn concurrent_first_use_shares_one_config() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| client_config().expect("tls config")))
            .collect();
        let configs: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect();
        let first = &configs[0];
        assert!(configs.iter().all(|config| Arc::ptr_eq(first, config)));
        assert!(Arc::ptr_eq(first, &client_config().expect("tls config")));
    }
}

//! TLS listener support with certificate hot reload
//!
//! Certificates are loaded once at startup; a background task re-stats the
//! files on a configurable cadence and swaps in a fresh acceptor when either
//! modification time changes. Existing connections keep their negotiated
//! session and are never interrupted.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Certificate loader with mtime-based reloading
pub struct CertificateLoader {
    cert_path: PathBuf,
    key_path: PathBuf,
    check_interval: Duration,
    acceptor: RwLock<TlsAcceptor>,
    mod_times: Mutex<(SystemTime, SystemTime)>,
}

fn mod_time(path: &Path) -> Result<SystemTime> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.modified()?)
}

fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_path.display())))?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid certificate/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

impl CertificateLoader {
    /// Load the pair for the first time
    pub fn new(cert_path: PathBuf, key_path: PathBuf, check_seconds: u64) -> Result<Arc<Self>> {
        let acceptor = load_acceptor(&cert_path, &key_path)?;
        let mod_times = (mod_time(&cert_path)?, mod_time(&key_path)?);

        Ok(Arc::new(Self {
            cert_path,
            key_path,
            check_interval: Duration::from_secs(check_seconds.max(1)),
            acceptor: RwLock::new(acceptor),
            mod_times: Mutex::new(mod_times),
        }))
    }

    /// The current acceptor (cheap: clones an Arc)
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().unwrap().clone()
    }

    /// Check the files once and swap the acceptor when they changed
    pub fn check_reload(&self) {
        let current = match (mod_time(&self.cert_path), mod_time(&self.key_path)) {
            (Ok(cert), Ok(key)) => (cert, key),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "could not stat TLS certificate files");
                return;
            }
        };

        {
            let last = self.mod_times.lock().unwrap();
            if *last == current {
                return;
            }
        }

        match load_acceptor(&self.cert_path, &self.key_path) {
            Ok(acceptor) => {
                *self.acceptor.write().unwrap() = acceptor;
                *self.mod_times.lock().unwrap() = current;
                tracing::info!("reloaded TLS certificates");
            }
            Err(e) => {
                tracing::error!(error = %e, "could not reload TLS certificates");
            }
        }
    }

    /// Background task polling for certificate changes
    pub fn spawn_reload_task(self: &Arc<Self>) {
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(loader.check_interval).await;
                loader.check_reload();
            }
        });
    }
}

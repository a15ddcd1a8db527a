//! On-disk certificate pairs: `<dir>/<hostname>.crt` and `<dir>/<hostname>.key`.

use alloc::sync::Arc;
use core::fmt;
use std::{
    io,
    path::{Path, PathBuf},
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::{fs, io::AsyncWriteExt as _};
use tracing::debug;

use super::CertError;

/// Parsed certificate chain and key, ready to build a TLS server config.
pub struct TlsCredential {
    hostname: String,
    cert_pem: Vec<u8>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl fmt::Debug for TlsCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredential")
            .field("hostname", &self.hostname)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TlsCredential {
    /// Parses PEM material.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Parse`] if there is no certificate or no private key.
    pub fn from_pem(hostname: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        let chain = rustls_pemfile::certs(&mut &*cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Parse(format!("certificate: {e}")))?;
        if chain.is_empty() {
            return Err(CertError::Parse("no certificate in PEM".to_owned()));
        }
        let key = rustls_pemfile::private_key(&mut &*key_pem)
            .map_err(|e| CertError::Parse(format!("private key: {e}")))?
            .ok_or_else(|| CertError::Parse("no private key in PEM".to_owned()))?;

        Ok(Self {
            hostname: hostname.to_owned(),
            cert_pem: cert_pem.to_vec(),
            chain,
            key,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// rustls server config offering h2 and http/1.1.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Parse`] if rustls rejects the key or chain.
    pub fn server_config(&self) -> Result<rustls::ServerConfig, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CertError::Parse(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| CertError::Parse(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn paths(&self, hostname: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{hostname}.crt")),
            self.dir.join(format!("{hostname}.key")),
        )
    }

    /// Loads the pair for a fully qualified hostname.
    ///
    /// # Errors
    ///
    /// [`CertError::NotFound`] if either file is absent, [`CertError::Load`] otherwise.
    pub async fn load(&self, hostname: &str) -> Result<TlsCredential, CertError> {
        let (cert_path, key_path) = self.paths(hostname);
        if !cert_path.exists() || !key_path.exists() {
            return Err(CertError::NotFound(hostname.to_owned()));
        }

        let load_err = |reason: String| CertError::Load {
            hostname: hostname.to_owned(),
            reason,
        };
        let (cert_pem, key_pem) = tokio::try_join!(fs::read(&cert_path), fs::read(&key_path))
            .map_err(|e| load_err(e.to_string()))?;
        let credential = TlsCredential::from_pem(hostname, &cert_pem, &key_pem)
            .map_err(|e| load_err(e.to_string()))?;
        debug!(path = %cert_path.display(), "Loaded stored certificate");
        Ok(credential)
    }

    /// Writes the pair with owner-only permissions, each file via a rename so a reader
    /// never sees a half-written file.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Persist`] if the directory or a file cannot be written.
    pub async fn save(
        &self,
        hostname: &str,
        cert_pem: &[u8],
        key_pem: &SecretString,
    ) -> Result<(), CertError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(CertError::Persist)?;
        #[cfg(unix)]
        restrict(&self.dir, 0o700).await.map_err(CertError::Persist)?;

        let (cert_path, key_path) = self.paths(hostname);
        write_private(&key_path, key_pem.expose_secret().as_bytes())
            .await
            .map_err(CertError::Persist)?;
        write_private(&cert_path, cert_pem)
            .await
            .map_err(CertError::Persist)?;
        debug!(dir = %self.dir.display(), hostname, "Stored certificate");
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> io::Result<()> {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt as _};
    fs::set_permissions(path, Permissions::from_mode(mode)).await
}

/// The temporary file is created owner-only, so the key is never readable by others,
/// not even between create and rename.
async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // a leftover from an interrupted save would keep its old mode
    if let Err(e) = fs::remove_file(&tmp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        return Err(e);
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

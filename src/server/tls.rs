//! TLS server configuration from PEM certificate and key files.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{self, Certificate, PrivateKey, RootCertStore};

use super::{ServerError, TlsSettings};

/// Resolves a configured path against the current working directory when it
/// is not absolute.
fn resolve(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn read_certs(path: &Path) -> Result<Vec<Certificate>, ServerError> {
    let file = File::open(path).map_err(|source| ServerError::TlsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|source| {
        ServerError::TlsFile {
            path: path.to_path_buf(),
            source,
        }
    })?;
    if certs.is_empty() {
        return Err(ServerError::TlsMaterial {
            path: path.to_path_buf(),
            detail: "no certificates found",
        });
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey, ServerError> {
    let file = File::open(path).map_err(|source| ServerError::TlsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file)).map_err(|source| {
            ServerError::TlsFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
    if keys.is_empty() {
        return Err(ServerError::TlsMaterial {
            path: path.to_path_buf(),
            detail: "no usable PKCS#8 keys",
        });
    }
    if keys.len() != 1 {
        return Err(ServerError::TlsMaterial {
            path: path.to_path_buf(),
            detail: "multiple keys",
        });
    }
    Ok(PrivateKey(keys.pop().expect("checked length")))
}

/// Builds the shared rustls server config for the secure listener.
///
/// With `verify_peer` set, clients must present a certificate chaining to
/// the configured certificate.
pub(crate) fn server_config(settings: &TlsSettings) -> Result<rustls::ServerConfig, ServerError> {
    let certs = read_certs(&resolve(&settings.cert_file))?;
    let key = read_key(&resolve(&settings.key_file))?;

    let builder = rustls::ServerConfig::builder().with_safe_defaults();
    let config = if settings.verify_peer {
        let mut roots = RootCertStore::empty();
        for cert in &certs {
            roots.add(cert)?;
        }
        builder
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
            .with_single_cert(certs, key)?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_reported() {
        let settings = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = server_config(&settings).unwrap_err();
        assert!(matches!(err, ServerError::TlsFile { .. }));
    }

    #[test]
    fn empty_cert_file_reported() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();
        let settings = TlsSettings::new(cert.path(), key.path());
        let err = server_config(&settings).unwrap_err();
        assert!(matches!(
            err,
            ServerError::TlsMaterial {
                detail: "no certificates found",
                ..
            }
        ));
    }

    #[test]
    fn relative_paths_resolved_against_cwd() {
        let resolved = resolve(Path::new("certs/server.pem"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("certs/server.pem"));
    }
}

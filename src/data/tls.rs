//! CA certificate validation for the network backend
//!
//! The certificate is handed to sqlx by path; this module only makes sure
//! the file is usable so that a bad path fails at startup with a precise
//! message instead of as an opaque handshake error later.

use std::path::Path;

use rustls_pemfile::certs;
use x509_parser::prelude::*;

use crate::error::DbError;

/// Read and validate a PEM CA certificate, returning its DER bytes.
///
/// Only the first certificate in the file is checked.
pub fn load_ca_certificate(path: &Path) -> Result<Vec<u8>, DbError> {
    let bytes = std::fs::read(path).map_err(|e| {
        DbError::Config(format!(
            "error opening CA certificate at {}: {}",
            path.display(),
            e
        ))
    })?;

    if bytes.is_empty() {
        return Err(DbError::Config(format!(
            "ca cert at {} was empty",
            path.display()
        )));
    }

    let der = match certs(&mut bytes.as_slice()).next() {
        Some(Ok(der)) => der,
        Some(Err(e)) => {
            return Err(DbError::Config(format!(
                "could not parse cert at {} into PEM: {}",
                path.display(),
                e
            )));
        }
        None => {
            return Err(DbError::Config(format!(
                "could not parse cert at {} into PEM",
                path.display()
            )));
        }
    };

    let (_, parsed) = X509Certificate::from_der(der.as_ref()).map_err(|e| {
        DbError::Config(format!(
            "could not parse cert at {} into x509 certificate: {}",
            path.display(),
            e
        ))
    })?;
    tracing::debug!(
        path = %path.display(),
        subject = %parsed.subject(),
        "loaded CA certificate"
    );

    Ok(der.as_ref().to_vec())
}

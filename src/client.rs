//! Per-task HTTP client construction (§4.9/§5/§6).
//!
//! Every task gets its own `reqwest::Client`, sized to its `LoadProfile` and
//! mounting its own TLS client identity — nothing here is shared across
//! tasks or held globally, unlike the teacher's single process-wide client.

use std::fs;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use crate::connection_pool::PoolConfig;
use crate::descriptor::{TaskDescriptor, TlsClientIdentity};

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid header name '{name}': {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: reqwest::header::InvalidHeaderName,
    },
    #[error("invalid header value for '{name}': {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    #[error("failed to read TLS identity file '{path}': {source}")]
    TlsIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no PEM certificate found in '{0}'")]
    NoCertificate(String),
    #[error("no PKCS#8 private key found in '{0}'")]
    NoPrivateKey(String),
    #[error("failed to build reqwest identity from PEM material: {0}")]
    InvalidIdentity(reqwest::Error),
    #[error("failed to build HTTP client: {0}")]
    BuildFailed(reqwest::Error),
}

/// Builds the shared `reqwest::Client` a `TaskRuntime` hands to every
/// `VirtualUser` of one task. Pool sized to the profile's max user count.
pub fn build_task_client(
    descriptor: &TaskDescriptor,
    connect_timeout: Duration,
) -> Result<reqwest::Client, ClientBuildError> {
    let max_users = descriptor.load_profile.max_users().min(5000) as usize;
    let pool_config = PoolConfig::new().with_max_idle_per_host(max_users.max(1));

    let mut builder = pool_config.apply_to_builder(reqwest::Client::builder());
    builder = builder.connect_timeout(connect_timeout);

    let headers = build_default_headers(descriptor)?;
    builder = builder.default_headers(headers);

    if let Some(identity) = &descriptor.tls_client_identity {
        let identity = load_identity(identity)?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(ClientBuildError::BuildFailed)
}

fn build_default_headers(descriptor: &TaskDescriptor) -> Result<HeaderMap, ClientBuildError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &descriptor.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
            ClientBuildError::InvalidHeaderName {
                name: name.clone(),
                source,
            }
        })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|source| ClientBuildError::InvalidHeaderValue {
                name: name.clone(),
                source,
            })?;
        headers.insert(header_name, header_value);
    }

    // Every request template in this engine is a JSON body (§3 FieldMap).
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    if !descriptor.cookies.is_empty() {
        let cookie_value = descriptor
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        let header_value = HeaderValue::from_str(&cookie_value).map_err(|source| {
            ClientBuildError::InvalidHeaderValue {
                name: "Cookie".to_string(),
                source,
            }
        })?;
        headers.insert(reqwest::header::COOKIE, header_value);
    }

    Ok(headers)
}

/// Loads a TLS client identity (§6): either a combined cert+key PEM (same
/// path given for both) or separate cert/key files.
fn load_identity(identity: &TlsClientIdentity) -> Result<reqwest::Identity, ClientBuildError> {
    let cert_pem = read_file(&identity.cert_path)?;
    let key_pem = if identity.key_path == identity.cert_path {
        cert_pem.clone()
    } else {
        read_file(&identity.key_path)?
    };

    let mut cert_cursor = std::io::Cursor::new(cert_pem.as_slice());
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_cursor).collect();
    if certs.is_empty() || certs.iter().any(|c| c.is_err()) {
        return Err(ClientBuildError::NoCertificate(identity.cert_path.clone()));
    }

    let mut key_cursor = std::io::Cursor::new(key_pem.as_slice());
    let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_cursor).collect();
    if keys.is_empty() || keys.iter().any(|k| k.is_err()) {
        return Err(ClientBuildError::NoPrivateKey(identity.key_path.clone()));
    }

    let mut combined = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
    combined.extend_from_slice(&cert_pem);
    if !cert_pem.ends_with(b"\n") {
        combined.push(b'\n');
    }
    combined.extend_from_slice(&key_pem);

    reqwest::Identity::from_pem(&combined).map_err(ClientBuildError::InvalidIdentity)
}

fn read_file(path: &str) -> Result<Vec<u8>, ClientBuildError> {
    fs::read(path).map_err(|source| ClientBuildError::TlsIo {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ApiKind, Dataset, LoadProfile, Timeouts};
    use std::collections::BTreeMap;

    fn base_descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_id: "t-1".to_string(),
            name: "smoke".to_string(),
            api_kind: ApiKind::OpenAiChat,
            target_base_url: "https://example.com".to_string(),
            api_path: "/v1/chat/completions".to_string(),
            http_method: "POST".to_string(),
            request_template: TaskDescriptor::default_request_template(ApiKind::OpenAiChat)
                .unwrap(),
            headers: vec![("Authorization".to_string(), "Bearer x".to_string())],
            cookies: BTreeMap::new(),
            tls_client_identity: None,
            stream_mode: true,
            field_map: TaskDescriptor::default_field_map(ApiKind::OpenAiChat).unwrap(),
            dataset: Dataset::DefaultText,
            load_profile: LoadProfile::Fixed {
                users: 2,
                duration_s: 5,
                spawn_per_s: 2,
            },
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn builds_client_without_tls_identity() {
        let descriptor = base_descriptor();
        let client = build_task_client(&descriptor, Duration::from_secs(10));
        assert!(client.is_ok());
    }

    #[test]
    fn default_headers_include_fixed_content_type_and_custom_header() {
        let descriptor = base_descriptor();
        let headers = build_default_headers(&descriptor).unwrap();
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer x");
    }

    #[test]
    fn cookies_are_joined_into_a_single_header() {
        let mut descriptor = base_descriptor();
        descriptor
            .cookies
            .insert("session".to_string(), "abc".to_string());
        descriptor.cookies.insert("a".to_string(), "b".to_string());
        let headers = build_default_headers(&descriptor).unwrap();
        let cookie = headers.get("cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("session=abc"));
        assert!(cookie.contains("a=b"));
    }

    #[test]
    fn missing_tls_file_is_reported() {
        let mut descriptor = base_descriptor();
        descriptor.tls_client_identity = Some(TlsClientIdentity {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/cert.pem".to_string(),
        });
        let result = build_task_client(&descriptor, Duration::from_secs(10));
        assert!(matches!(result, Err(ClientBuildError::TlsIo { .. })));
    }
}

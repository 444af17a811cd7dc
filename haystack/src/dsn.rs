//! Ingestion credential (DSN) parsing.
//!
//! A DSN looks like `https://<public_key>@<host>[:port][/prefix]/<project_id>`
//! and carries everything the transport needs: where to POST envelopes and
//! which public key to authenticate with.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::Error;

/// A parsed ingestion credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
}

impl Dsn {
    /// The public key embedded in the credential, propagated in outbound
    /// baggage and in the transport auth header.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The project id the credential points at.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The envelope ingestion endpoint, `<base>/api/<project-id>/envelope/`.
    pub fn envelope_uri(&self) -> String {
        let mut uri = format!("{}://{}", self.scheme, self.host);
        if let Some(port) = self.port {
            uri.push_str(&format!(":{port}"));
        }
        uri.push_str(&self.path);
        uri.push_str(&format!("/api/{}/envelope/", self.project_id));
        uri
    }

    /// The `X-Haystack-Auth` header value for requests to the ingestion
    /// endpoint.
    pub fn auth_header(&self) -> String {
        format!(
            "Haystack haystack_version=7, haystack_client={}/{}, haystack_key={}",
            crate::SDK_NAME,
            env!("CARGO_PKG_VERSION"),
            self.public_key
        )
    }
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url =
            Url::parse(s).map_err(|e| Error::Configuration(format!("invalid DSN {s:?}: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Configuration(format!(
                    "invalid DSN {s:?}: unsupported scheme {other:?}"
                )))
            }
        }

        let public_key = url.username();
        if public_key.is_empty() {
            return Err(Error::Configuration(format!(
                "invalid DSN {s:?}: missing public key"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::Configuration(format!("invalid DSN {s:?}: missing host")))?
            .to_owned();

        // The last path segment is the project id; anything before it is an
        // installation prefix.
        let path = url.path().trim_end_matches('/');
        let (prefix, project_id) = match path.rfind('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => ("", path),
        };
        if project_id.is_empty() || !project_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Configuration(format!(
                "invalid DSN {s:?}: missing project id"
            )));
        }

        Ok(Dsn {
            scheme: url.scheme().to_owned(),
            public_key: public_key.to_owned(),
            host,
            port: url.port(),
            path: prefix.to_owned(),
            project_id: project_id.to_owned(),
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.scheme, self.public_key, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}/{}", self.path, self.project_id)
    }
}

use reqwest::Url;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Where the hosted service lives and the API credential used to reach it.
///
/// Built once at startup and handed to [`ClientHandle::connect`]; the handle
/// keeps its own validated copy, so the config is never mutated afterwards.
///
/// [`ClientHandle::connect`]: crate::ClientHandle::connect
#[derive(Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub credential: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credential: credential.into(),
        }
    }

    /// Parses the endpoint and checks the credential.
    ///
    /// The returned URL always ends with `/` so that relative paths join
    /// below it instead of replacing its last segment.
    pub(crate) fn validate(&self) -> Result<(Url, String)> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Configuration("endpoint is missing".to_string()));
        }
        let credential = self.credential.trim();
        if credential.is_empty() {
            return Err(Error::Configuration("credential is missing".to_string()));
        }

        let mut url = Url::parse(endpoint)
            .map_err(|err| Error::Configuration(format!("invalid endpoint {endpoint:?}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "endpoint must be http or https, got {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::Configuration("endpoint has no host".to_string()));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);

        Ok((url, credential.to_string()))
    }
}

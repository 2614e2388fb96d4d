//! Process-wide handle to the hosted service.

use std::sync::{Arc, PoisonError, RwLock};

use api_types::{Collection, Record, auth::Session, category::Category, expense::Expense};
use reqwest::{Client, Method, RequestBuilder, Response, Url, header};
use serde::Deserialize;

use crate::{
    config::ConnectionConfig,
    error::{Error, Result},
    realtime::{Subscriptions, WebSocketFeed},
    repository::Repository,
};

/// Shared connection state: validated endpoint, credential, HTTP client and
/// the current auth session.
///
/// Construct it once with [`ClientHandle::connect`] and clone it into every
/// repository and subscription manager; clones share the same session.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Url,
    credential: String,
    http: Client,
    session: RwLock<Option<Session>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("signed_in", &self.session().is_some())
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.message
            .or(self.error_description)
            .or(self.msg)
            .or(self.error)
    }
}

/// Same as [`ClientHandle::connect`].
pub fn connect(config: &ConnectionConfig) -> Result<ClientHandle> {
    ClientHandle::connect(config)
}

impl ClientHandle {
    /// Validates `config` and builds the handle. No I/O happens here.
    pub fn connect(config: &ConnectionConfig) -> Result<Self> {
        let (endpoint, credential) = config.validate()?;

        let mut apikey = header::HeaderValue::try_from(credential.as_str()).map_err(|err| {
            Error::Configuration(format!("credential is not a valid header value: {err}"))
        })?;
        apikey.set_sensitive(true);

        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", apikey);

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| Error::Configuration(format!("failed to build http client: {err}")))?;

        tracing::info!(endpoint = %endpoint, "data-access client ready");

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                credential,
                http,
                session: RwLock::new(None),
            }),
        })
    }

    /// Builds a new handle for the same endpoint with another credential.
    ///
    /// This is the only supported way to change the credential: the old
    /// handle and its session are left untouched, the new one starts
    /// signed out.
    pub fn rotate_credential(&self, credential: &str) -> Result<Self> {
        tracing::info!("rotating data-access credential");
        Self::connect(&ConnectionConfig::new(
            self.inner.endpoint.as_str(),
            credential,
        ))
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Current auth session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Token sent as `Authorization: Bearer`: the session access token when
    /// signed in, the API credential otherwise.
    pub(crate) fn bearer_token(&self) -> String {
        self.session()
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.inner.credential.clone())
    }

    pub fn repository<T: Record>(&self) -> Repository<T> {
        Repository::new(self.clone())
    }

    pub fn expenses(&self) -> Repository<Expense> {
        self.repository()
    }

    pub fn categories(&self) -> Repository<Category> {
        self.repository()
    }

    /// Subscription manager backed by the realtime websocket.
    pub fn subscriptions(&self) -> Subscriptions<WebSocketFeed> {
        Subscriptions::new(WebSocketFeed::new(self.clone()))
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.request_as(method, url, &self.bearer_token())
    }

    pub(crate) fn request_as(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        self.inner.http.request(method, url).bearer_auth(token)
    }

    pub(crate) fn rest_url(&self, collection: Collection) -> Result<Url> {
        self.join(&format!("rest/v1/{collection}"))
    }

    pub(crate) fn auth_url(&self, path: &str) -> Result<Url> {
        self.join(&format!("auth/v1/{}", path.trim_start_matches('/')))
    }

    /// Websocket URL of the realtime service (`ws`/`wss` matching the
    /// endpoint scheme).
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.join("realtime/v1/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::Configuration(format!("cannot use {scheme} for {url}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.inner.credential)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.inner
            .endpoint
            .join(path)
            .map_err(|err| Error::Configuration(format!("invalid path {path}: {err}")))
    }
}

/// Passes 2xx responses through and turns everything else into
/// [`Error::Remote`].
pub(crate) async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    tracing::debug!(%status, %message, "remote call failed");
    Err(Error::Remote { status, message })
}

pub(crate) async fn error_message(response: Response) -> String {
    response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or_else(|| "server error".to_string())
}

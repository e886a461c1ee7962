use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use bytes::Bytes;
use replica_core::{
    ApiError, ChangeEvent, ErrorCategory, Resource, ResourceList, SyncFailure, error_label,
};
use reqwest::{
    Method,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    credentials::CredentialSource,
    transport::{HttpRequest, HttpResponse, Transport, TransportError},
    watch::{WatchChannel, WatchEnd, WatchError},
};

/// Server-side bound for list requests, in seconds.
pub const DEFAULT_LIST_TIMEOUT_SECONDS: u32 = 10;

/// Client-side slack on top of `timeoutSeconds` before a list is abandoned.
const LIST_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

const APPLICATION_JSON: &str = "application/json";

/// Errors returned by [`ResourceClient`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{method} {url}: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{url}: invalid response body: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("bearer token is not a valid header value")]
    InvalidCredential,
    #[error("object has no metadata.name")]
    MissingName,
    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl From<&ClientError> for SyncFailure {
    fn from(err: &ClientError) -> Self {
        let (category, code) = match err {
            ClientError::Api(api) => return SyncFailure::from(api),
            ClientError::Watch(watch) => return SyncFailure::from(watch),
            ClientError::Transport { .. } => (ErrorCategory::Transport, "transport_error"),
            ClientError::Decode { .. } => (ErrorCategory::Protocol, "response_decode_error"),
            ClientError::Encode(_) => (ErrorCategory::Config, "request_encode_error"),
            ClientError::InvalidUrl { .. } => (ErrorCategory::Config, "invalid_url"),
            ClientError::InvalidCredential => (ErrorCategory::Auth, "invalid_credential"),
            ClientError::MissingName => (ErrorCategory::Config, "missing_name"),
        };
        SyncFailure::new(category, code, err.to_string())
    }
}

/// Location of one resource collection, e.g. `/apis/apps.example.com/v1` + `apps`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef {
    pub api_path: String,
    pub resource: String,
}

impl CollectionRef {
    pub fn new(api_path: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            api_path: api_path.into(),
            resource: resource.into(),
        }
    }

    /// Collection path, namespace-scoped when `namespace` is given.
    pub fn path(&self, namespace: Option<&str>) -> String {
        let api_path = self.api_path.trim_end_matches('/');
        let resource = self.resource.trim_matches('/');
        match namespace {
            Some(namespace) => format!("{api_path}/namespaces/{namespace}/{resource}"),
            None => format!("{api_path}/{resource}"),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path(None))
    }
}

/// Typed client for one collection.
pub struct ResourceClient<T> {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    server: Url,
    collection: CollectionRef,
    namespace: Option<String>,
    list_timeout_seconds: u32,
    _resource: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            credentials: Arc::clone(&self.credentials),
            server: self.server.clone(),
            collection: self.collection.clone(),
            namespace: self.namespace.clone(),
            list_timeout_seconds: self.list_timeout_seconds,
            _resource: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ResourceClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClient")
            .field("server", &self.server.as_str())
            .field("collection", &self.collection)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<T> ResourceClient<T>
where
    T: Resource + Serialize + DeserializeOwned,
{
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        server: Url,
        collection: CollectionRef,
    ) -> Self {
        Self {
            transport,
            credentials,
            server,
            collection,
            namespace: None,
            list_timeout_seconds: DEFAULT_LIST_TIMEOUT_SECONDS,
            _resource: PhantomData,
        }
    }

    /// Scope list, watch, get and delete to one namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_list_timeout_seconds(mut self, seconds: u32) -> Self {
        self.list_timeout_seconds = seconds.max(1);
        self
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// List the collection.
    ///
    /// The server is asked to answer within `timeoutSeconds`; a server that
    /// never answers is cut off a few seconds later with a timeout.
    pub async fn list(&self) -> Result<ResourceList<T>, ClientError> {
        let mut url = self.collection_url(self.namespace.as_deref())?;
        url.query_pairs_mut()
            .append_pair("allowWatchBookmarks", "1")
            .append_pair("timeoutSeconds", &self.list_timeout_seconds.to_string());

        let deadline = self.list_deadline();
        let target = url.to_string();
        match tokio::time::timeout(deadline, self.execute(Method::GET, url, None)).await {
            Ok(listed) => listed,
            Err(_) => Err(ClientError::Transport {
                method: Method::GET,
                url: target,
                source: TransportError::Timeout(format!(
                    "no response within {}s",
                    deadline.as_secs()
                )),
            }),
        }
    }

    /// How long a list may take before it is abandoned client-side.
    pub fn list_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.list_timeout_seconds)) + LIST_DEADLINE_MARGIN
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<T, ClientError> {
        let url = self.object_url(namespace.or(self.namespace.as_deref()), name)?;
        self.execute(Method::GET, url, None).await
    }

    pub async fn create(&self, object: &T) -> Result<T, ClientError> {
        let namespace = object
            .metadata()
            .namespace
            .as_deref()
            .or(self.namespace.as_deref());
        let url = self.collection_url(namespace)?;
        let body = encode(object)?;
        self.execute(Method::POST, url, Some(body)).await
    }

    pub async fn update(&self, object: &T) -> Result<T, ClientError> {
        let meta = object.metadata();
        let name = meta
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(ClientError::MissingName)?;
        let namespace = meta.namespace.as_deref().or(self.namespace.as_deref());

        let mut url = self.object_url(namespace, name)?;
        url.query_pairs_mut()
            .append_pair("timeoutSeconds", &self.list_timeout_seconds.to_string());
        let body = encode(object)?;
        self.execute(Method::PUT, url, Some(body)).await
    }

    pub async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        let url = self.object_url(namespace.or(self.namespace.as_deref()), name)?;
        self.execute::<Value>(Method::DELETE, url, None).await?;
        Ok(())
    }

    /// Build the streaming request for a watch starting at `resource_version`.
    ///
    /// Without a cursor the server watches from "now".
    pub fn watch_request(
        &self,
        resource_version: Option<&str>,
    ) -> Result<HttpRequest, ClientError> {
        let mut url = self.collection_url(self.namespace.as_deref())?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("watch", "1");
            if let Some(resource_version) = resource_version {
                query.append_pair("resourceVersion", resource_version);
            }
        }
        self.request(Method::GET, url, None)
    }

    /// Open a watch channel without consuming it.
    pub async fn open_watch(
        &self,
        resource_version: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<WatchChannel<T>, ClientError> {
        let request = self.watch_request(resource_version)?;
        Ok(WatchChannel::open(self.transport.as_ref(), request, cancel).await?)
    }

    /// Watch the collection, handing each event to `handler` until the stream
    /// ends, fails, or `cancel` fires.
    pub async fn watch<F>(
        &self,
        handler: F,
        resource_version: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<WatchEnd, ClientError>
    where
        F: FnMut(ChangeEvent<T>),
    {
        let request = self.watch_request(resource_version)?;
        Ok(WatchChannel::watch(self.transport.as_ref(), request, cancel, handler).await?)
    }

    /// Server URL plus the collection path, every segment percent-encoded.
    fn collection_url(&self, namespace: Option<&str>) -> Result<Url, ClientError> {
        let mut url = self.server.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut segments = url.path_segments_mut().map_err(|()| self.invalid_base())?;
            segments.pop_if_empty();
            segments.extend(
                self.collection
                    .api_path
                    .split('/')
                    .filter(|segment| !segment.is_empty()),
            );
            if let Some(namespace) = namespace {
                segments.push("namespaces").push(namespace);
            }
            segments.push(self.collection.resource.trim_matches('/'));
        }
        Ok(url)
    }

    fn object_url(&self, namespace: Option<&str>, name: &str) -> Result<Url, ClientError> {
        if name.is_empty() {
            return Err(ClientError::MissingName);
        }
        let mut url = self.collection_url(namespace)?;
        url.path_segments_mut()
            .map_err(|()| self.invalid_base())?
            .push(name);
        Ok(url)
    }

    fn invalid_base(&self) -> ClientError {
        ClientError::InvalidUrl {
            url: self.server.to_string(),
            reason: "base url cannot carry a path".to_owned(),
        }
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
    ) -> Result<HttpRequest, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        }
        if let Some(token) = self.credentials.bearer_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidCredential)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }

    async fn execute<R: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
    ) -> Result<R, ClientError> {
        let request = self.request(method.clone(), url, body)?;
        let url = request.url.to_string();
        debug!(%method, %url, "sending request");

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| ClientError::Transport {
                method: method.clone(),
                url: url.clone(),
                source,
            })?;

        let error_body = match error_label(response.status) {
            Some(_) => response_body(&response),
            None => Value::Null,
        };
        ApiError::check(
            method.as_str(),
            url.as_str(),
            response.status,
            response.status_text.as_str(),
            error_body,
        )?;

        let payload: &[u8] = if response.status == 204 || response.body.is_empty() {
            b"null"
        } else {
            &response.body
        };
        serde_json::from_slice(payload).map_err(|source| ClientError::Decode { url, source })
    }
}

fn encode<T: Serialize>(object: &T) -> Result<Bytes, ClientError> {
    serde_json::to_vec(object)
        .map(Bytes::from)
        .map_err(ClientError::Encode)
}

/// Best-effort body of an error response: JSON when declared, else text.
fn response_body(response: &HttpResponse) -> Value {
    if response.status == 204 || response.body.is_empty() {
        return Value::Null;
    }
    let is_json = response
        .content_type
        .as_deref()
        .is_some_and(|content_type| {
            content_type
                .to_ascii_lowercase()
                .starts_with(APPLICATION_JSON)
        });
    if is_json {
        if let Ok(value) = serde_json::from_slice(&response.body) {
            return value;
        }
        debug!("error response declared JSON but did not parse");
    }
    Value::String(String::from_utf8_lossy(&response.body).into_owned())
}

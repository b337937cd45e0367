use std::sync::Arc;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::commands::DeviceType;
use crate::config::Endpoint;
use crate::error::{Error, Result};

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Devices of one type, keyed by label, in the order the platform listed them.
pub type DeviceTypeCache = IndexMap<String, DeviceRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub state: Option<String>,
}

impl DeviceRecord {
    /// Any non-empty state counts as an alert.
    pub fn is_alerting(&self) -> bool {
        self.state.as_deref().is_some_and(|s| !s.is_empty())
    }
}

type Inner = hyper_util::client::legacy::Client<HttpsConnector, Empty<Bytes>>;

/// Plain GET-only HTTP(S) client shared by every platform call.
///
/// The TLS connector, and with it the native root store, is built on the
/// first request, so runs that never touch the network never load it.
#[derive(Clone, Default)]
pub struct HttpClient {
    inner: Arc<OnceCell<Inner>>,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn inner(&self) -> Result<&Inner> {
        self.inner
            .get_or_try_init(|| async {
                let connector = hyper_rustls::HttpsConnectorBuilder::new()
                    .with_native_roots()?
                    .https_or_http()
                    .enable_http1()
                    .build();

                Ok::<_, Error>(
                    hyper_util::client::legacy::Client::builder(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .build(connector),
                )
            })
            .await
    }

    /// GET `url`, optionally with a bearer token, and collect the whole body.
    pub async fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse> {
        debug!("GET {url}");
        let mut request = Request::get(url);
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request
            .body(Empty::new())
            .map_err(|e| Error::remote(url, None, e.to_string()))?;

        let response = self
            .inner()
            .await?
            .request(request)
            .await
            .map_err(|e| Error::remote(url, None, e.to_string()))?;
        let status = response.status().as_u16();
        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            debug!("Response content-type: {content_type:?}");
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::remote(url, Some(status), e.to_string()))?
            .to_bytes();
        debug!("Response ({status}): {}", String::from_utf8_lossy(&body));

        Ok(HttpResponse { status, body })
    }
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail with [`Error::Remote`] unless the status is 2xx.
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let snippet: String = String::from_utf8_lossy(&self.body).chars().take(200).collect();
            Err(Error::remote(url, Some(self.status), snippet))
        }
    }

    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::parse(url, e.to_string()))
    }
}

/// Status and command calls against the installed SmartApp.
pub trait DeviceApi {
    async fn get_status(&self, device_type: DeviceType) -> Result<DeviceTypeCache>;

    /// Returns the HTTP status of the command call.
    async fn send_command(
        &self,
        device_type: DeviceType,
        device_id: &str,
        command: &str,
    ) -> Result<u16>;
}

pub struct SmartAppClient {
    http: HttpClient,
    access_token: String,
    endpoint: Endpoint,
}

impl SmartAppClient {
    pub fn new(http: HttpClient, access_token: String, endpoint: Endpoint) -> Self {
        Self {
            http,
            access_token,
            endpoint,
        }
    }

    fn type_url(&self, device_type: DeviceType) -> String {
        format!("{}/{}", self.endpoint.url(), device_type)
    }
}

impl DeviceApi for SmartAppClient {
    async fn get_status(&self, device_type: DeviceType) -> Result<DeviceTypeCache> {
        let url = self.type_url(device_type);
        debug!("Requesting status from: {url}");
        let response = self
            .http
            .get(&url, Some(&self.access_token))
            .await?
            .error_for_status(&url)?;
        parse_status(&url, &response.json(&url)?)
    }

    async fn send_command(
        &self,
        device_type: DeviceType,
        device_id: &str,
        command: &str,
    ) -> Result<u16> {
        let url = format!("{}/{}/{}", self.type_url(device_type), device_id, command);
        let response = self.http.get(&url, Some(&self.access_token)).await?;
        if response.is_success() {
            info!("Command response: {}", response.status);
        } else {
            warn!("Command to {url} returned {}", response.status);
        }
        Ok(response.status)
    }
}

#[derive(Deserialize)]
struct DeviceStatus {
    label: String,
    id: Value,
    #[serde(default)]
    value: Option<Value>,
}

/// Build the cache from a status listing: `[{label, id, value: {state?}}]`.
pub fn parse_status(url: &str, body: &Value) -> Result<DeviceTypeCache> {
    let devices: Vec<DeviceStatus> = serde_json::from_value(body.clone())
        .map_err(|e| Error::parse(url, format!("device list: {e}")))?;

    let mut cache = DeviceTypeCache::with_capacity(devices.len());
    for device in devices {
        let device_id = scalar_text(&device.id)
            .ok_or_else(|| Error::parse(url, format!("device \"{}\" has no usable id", device.label)))?;
        let state = device
            .value
            .as_ref()
            .and_then(|v| v.get("state"))
            .and_then(scalar_text);
        cache.insert(device.label, DeviceRecord { device_id, state });
    }
    Ok(cache)
}

/// Strings pass through; numbers and booleans are rendered; anything else is absent.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const URL: &str = "https://host/api/smartapps/installations/1/switch";

    #[test]
    fn status_listing_keeps_platform_order() {
        let body = json!([
            {"label": "Porch", "id": "p-1", "value": {"state": "on"}},
            {"label": "Kitchen", "id": "k-1", "value": {"state": ""}},
            {"label": "Attic", "id": "a-1", "value": {}},
        ]);
        let cache = parse_status(URL, &body).unwrap();
        let labels: Vec<_> = cache.keys().map(String::as_str).collect();
        assert_eq!(labels, ["Porch", "Kitchen", "Attic"]);
        assert_eq!(cache["Porch"].device_id, "p-1");
        assert_eq!(cache["Porch"].state.as_deref(), Some("on"));
        assert_eq!(cache["Attic"].state, None);
    }

    #[test]
    fn numeric_ids_and_states_are_rendered() {
        let body = json!([{"label": "Hall", "id": 7, "value": {"state": 21.5}}]);
        let cache = parse_status(URL, &body).unwrap();
        assert_eq!(cache["Hall"].device_id, "7");
        assert_eq!(cache["Hall"].state.as_deref(), Some("21.5"));
    }

    #[test]
    fn missing_value_object_means_no_state() {
        let body = json!([{"label": "Hall", "id": "h"}]);
        let cache = parse_status(URL, &body).unwrap();
        assert_eq!(cache["Hall"].state, None);
    }

    #[test]
    fn wrong_shape_is_a_parse_error() {
        let err = parse_status(URL, &json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));

        let err = parse_status(URL, &json!([{"label": "Hall", "id": null}])).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn only_non_empty_state_alerts() {
        let record = |state: Option<&str>| DeviceRecord {
            device_id: "x".into(),
            state: state.map(str::to_string),
        };
        assert!(!record(None).is_alerting());
        assert!(!record(Some("")).is_alerting());
        assert!(record(Some("on")).is_alerting());
        assert!(record(Some("active")).is_alerting());
        assert!(record(Some("off")).is_alerting());
    }

    #[test]
    fn non_success_status_is_remote_error() {
        let response = HttpResponse {
            status: 401,
            body: Bytes::from_static(b"unauthorized"),
        };
        let err = response.error_for_status(URL).unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(401), .. }));
    }

    #[tokio::test]
    async fn set_hits_the_device_command_path_with_bearer() {
        use crate::commands::{parse, Dispatcher};
        use crate::testing::FakePlatform;

        let install = "/api/smartapps/installations/1";
        let status_path = format!("{install}/switch");
        let command_path = format!("{install}/switch/k1/on");
        let platform = FakePlatform::start(&[
            (
                status_path.as_str(),
                r#"[{"label": "Kitchen", "id": "k1", "value": {"state": ""}}]"#,
            ),
            (command_path.as_str(), "{}"),
        ])
        .await;
        let api = SmartAppClient::new(
            HttpClient::new(),
            "tok".into(),
            Endpoint {
                base_url: platform.base.clone(),
                path: install.into(),
            },
        );

        let tokens: Vec<String> = ["set", "switch", "Kitchen", "on"].map(String::from).to_vec();
        let outcome = Dispatcher::new(&api).run(parse(&tokens)).await.unwrap();
        assert_eq!(outcome.exit_code(), 0);

        let seen: Vec<_> = platform
            .seen()
            .into_iter()
            .map(|r| (r.method, r.path, r.authorization))
            .collect();
        let bearer = Some("Bearer tok".to_string());
        assert_eq!(
            seen,
            vec![
                ("GET".to_string(), status_path.clone(), bearer.clone()),
                ("GET".to_string(), command_path.clone(), bearer),
            ]
        );
    }

    #[tokio::test]
    async fn command_status_is_reported_even_when_not_success() {
        use crate::testing::FakePlatform;

        let platform = FakePlatform::start(&[]).await;
        let api = SmartAppClient::new(
            HttpClient::new(),
            "tok".into(),
            Endpoint {
                base_url: platform.base.clone(),
                path: "/api/x".into(),
            },
        );
        let status = api
            .send_command(DeviceType::Switch, "k1", "off")
            .await
            .unwrap();
        assert_eq!(status, 404);
        assert_eq!(platform.seen()[0].path, "/api/x/switch/k1/off");
    }
}

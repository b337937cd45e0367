use std::net::IpAddr;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::callback::CallbackListener;
use crate::client::HttpClient;
use crate::config::{Credentials, Endpoint, Session};
use crate::error::{Error, Result};

pub const API_BASE: &str = "https://graph.api.smartthings.com";
const AUTHORIZE_PATH: &str = "/oauth/authorize";
const TOKEN_PATH: &str = "/oauth/token";
const ENDPOINTS_PATH: &str = "/api/smartapps/endpoints";
const SCOPE: &str = "app";

/// Used only to learn which local interface faces the internet; nothing is sent.
const ROUTE_LOOKUP_ADDR: &str = "8.8.8.8:80";

fn provider_url(api_base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
    let base = format!("{api_base}{path}");
    Url::parse_with_params(&base, params).map_err(|e| Error::parse(&base, format!("bad URL: {e}")))
}

/// Browser-facing URL where the operator grants access.
pub fn authorization_url(api_base: &str, redirect_url: &str, client_id: &str) -> Result<Url> {
    provider_url(
        api_base,
        AUTHORIZE_PATH,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("scope", SCOPE),
            ("redirect_uri", redirect_url),
        ],
    )
}

/// Print the authorization URL and wait for the platform's redirect.
pub async fn acquire_authorization_code(
    api_base: &str,
    redirect_url: &str,
    bind_port: u16,
    client_id: &str,
    timeout: Option<Duration>,
) -> Result<String> {
    let url = authorization_url(api_base, redirect_url, client_id)?;
    // Bind before asking the operator to act, so a busy port fails fast
    let listener = CallbackListener::start(bind_port).await?;

    info!("Please go to the following URL in your browser");
    info!("{url}");
    debug!("Waiting for redirect on port {}", listener.port());

    let code = listener.wait_for_code(timeout).await?;
    debug!("Received auth code: {code}");
    Ok(code)
}

/// Trade the authorization code for an access token.
///
/// The platform expects a GET with query parameters here, not a form POST.
pub async fn exchange_code_for_token(
    http: &HttpClient,
    api_base: &str,
    redirect_url: &str,
    credentials: &Credentials,
    auth_code: &str,
) -> Result<String> {
    let url = provider_url(
        api_base,
        TOKEN_PATH,
        &[
            ("grant_type", "authorization_code"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("redirect_uri", redirect_url),
            ("scope", SCOPE),
            ("code", auth_code),
        ],
    )?;
    // The query carries the client secret; log and report the bare path
    let shown = format!("{api_base}{TOKEN_PATH}");
    debug!("Requesting access token from: {shown}");
    let response = http.get(url.as_str(), None).await?.error_for_status(&shown)?;
    let access_token = parse_token_response(&shown, &response.json(&shown)?)?;
    info!("Received access token");
    Ok(access_token)
}

pub fn parse_token_response(url: &str, body: &Value) -> Result<String> {
    if let Some(token) = body.get("access_token").and_then(Value::as_str) {
        return Ok(token.to_string());
    }
    let reason = body
        .get("error_description")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("no access_token in response");
    Err(Error::parse(url, reason))
}

/// Resolve the installation-specific SmartApp endpoint.
pub async fn discover_endpoint(
    http: &HttpClient,
    api_base: &str,
    access_token: &str,
) -> Result<Endpoint> {
    let url = format!("{api_base}{ENDPOINTS_PATH}");
    debug!("Requesting endpoints from: {url}");
    let response = http
        .get(&url, Some(access_token))
        .await?
        .error_for_status(&url)?;
    let endpoint = parse_endpoints(&url, &response.json(&url)?)?;
    info!("Received endpoint URL: {}", endpoint.url());
    Ok(endpoint)
}

pub fn parse_endpoints(url: &str, body: &Value) -> Result<Endpoint> {
    let first = body
        .as_array()
        .and_then(|list| list.first())
        .ok_or_else(|| Error::parse(url, "expected a non-empty endpoint list"))?;
    let field = |name: &str| {
        first
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::parse(url, format!("endpoint has no {name}")))
    };
    Ok(Endpoint {
        base_url: field("base_url")?,
        path: field("url")?,
    })
}

/// Where the platform should send the operator's browser back to.
#[derive(Debug, Clone)]
pub struct RedirectTarget {
    pub public_ip: Option<String>,
    pub port: u16,
}

impl RedirectTarget {
    pub async fn url(&self) -> Result<String> {
        let host = match &self.public_ip {
            Some(ip) => ip.clone(),
            None => {
                let ip = detect_host_ip().await?;
                debug!("IP of this computer is: {ip}");
                ip.to_string()
            }
        };
        Ok(format!("http://{host}:{}/", self.port))
    }
}

/// First non-loopback IPv4 address of this host's name, else the address of
/// the interface that routes to the internet.
pub async fn detect_host_ip() -> Result<IpAddr> {
    if let Some(ip) = hostname_ip().await {
        return Ok(ip);
    }
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(ROUTE_LOOKUP_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(unix)]
async fn hostname_ip() -> Option<IpAddr> {
    let host = nix::unistd::gethostname().ok()?.into_string().ok()?;
    let addrs = tokio::net::lookup_host((host.as_str(), 0)).await.ok()?;
    first_routable(addrs.map(|addr| addr.ip()))
}

#[cfg(not(unix))]
async fn hostname_ip() -> Option<IpAddr> {
    None
}

fn first_routable(mut ips: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    ips.find(|ip| ip.is_ipv4() && !ip.is_loopback())
}

/// The OAuth2 provider as seen by [`ensure_authorized`].
pub trait Provider {
    async fn redirect_url(&self) -> Result<String>;

    async fn authorization_code(&self, redirect_url: &str, client_id: &str) -> Result<String>;

    async fn access_token(
        &self,
        redirect_url: &str,
        credentials: &Credentials,
        auth_code: &str,
    ) -> Result<String>;

    async fn endpoint(&self, access_token: &str) -> Result<Endpoint>;
}

pub struct SmartThings {
    http: HttpClient,
    api_base: String,
    redirect: RedirectTarget,
    auth_timeout: Option<Duration>,
}

impl SmartThings {
    pub fn new(
        http: HttpClient,
        api_base: impl Into<String>,
        redirect: RedirectTarget,
        auth_timeout: Option<Duration>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            redirect,
            auth_timeout,
        }
    }
}

impl Provider for SmartThings {
    async fn redirect_url(&self) -> Result<String> {
        self.redirect.url().await
    }

    async fn authorization_code(&self, redirect_url: &str, client_id: &str) -> Result<String> {
        acquire_authorization_code(
            &self.api_base,
            redirect_url,
            self.redirect.port,
            client_id,
            self.auth_timeout,
        )
        .await
    }

    async fn access_token(
        &self,
        redirect_url: &str,
        credentials: &Credentials,
        auth_code: &str,
    ) -> Result<String> {
        exchange_code_for_token(&self.http, &self.api_base, redirect_url, credentials, auth_code)
            .await
    }

    async fn endpoint(&self, access_token: &str) -> Result<Endpoint> {
        discover_endpoint(&self.http, &self.api_base, access_token).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authorized {
    pub access_token: String,
    pub endpoint: Endpoint,
}

/// Make sure the session holds a token and a matching endpoint.
///
/// Runs the browser flow only when no token is stored, and discovery only when
/// the endpoint is missing or the token is new. The session is updated only
/// after every step succeeded.
pub async fn ensure_authorized<P: Provider>(
    session: &mut Session,
    credentials: &Credentials,
    provider: &P,
) -> Result<Authorized> {
    let (access_token, fresh) = match session.access_token() {
        Some(token) => (token.to_string(), false),
        None => {
            let redirect_url = provider.redirect_url().await?;
            let code = provider
                .authorization_code(&redirect_url, &credentials.client_id)
                .await?;
            let token = provider
                .access_token(&redirect_url, credentials, &code)
                .await?;
            (token, true)
        }
    };

    let endpoint = match session.endpoint().filter(|_| !fresh) {
        Some(endpoint) => endpoint,
        None => provider.endpoint(&access_token).await?,
    };

    if fresh {
        session.set_authorization(credentials, access_token.clone());
    }
    session.set_endpoint(endpoint.clone());

    Ok(Authorized {
        access_token,
        endpoint,
    })
}

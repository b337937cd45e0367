use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = ".smartthings_cli.json";

/// Durable state carried between runs.
///
/// Loaded once at start, mutated in place as credentials, tokens and the
/// SmartApp endpoint are discovered, and written back once at the end.
/// Keys this tool does not know about are kept so a save never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_base_url: Option<String>,
    #[serde(
        default,
        rename = "endpoint_url",
        skip_serializing_if = "Option::is_none"
    )]
    pub endpoint_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resolved OAuth client credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Installation-specific SmartApp endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub base_url: String,
    pub path: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

impl Session {
    /// Command-line values win over stored ones. Empty strings count as unset.
    pub fn credentials(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<Credentials> {
        let client_id = pick(client_id, self.client_id.as_deref()).ok_or_else(|| {
            Error::Config(
                "Client ID must be specified on the command line or config file!".into(),
            )
        })?;
        let client_secret = pick(client_secret, self.client_secret.as_deref()).ok_or_else(|| {
            Error::Config(
                "Client secret must be specified on the command line or config file!".into(),
            )
        })?;
        Ok(Credentials {
            client_id,
            client_secret,
        })
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        match (
            self.endpoint_base_url.as_deref(),
            self.endpoint_path.as_deref(),
        ) {
            (Some(base), Some(path)) if !base.is_empty() && !path.is_empty() => Some(Endpoint {
                base_url: base.to_string(),
                path: path.to_string(),
            }),
            _ => None,
        }
    }

    /// Record a freshly acquired token together with the credentials that
    /// obtained it. Any stored endpoint belonged to the old token and is cleared.
    pub fn set_authorization(&mut self, credentials: &Credentials, access_token: String) {
        self.client_id = Some(credentials.client_id.clone());
        self.client_secret = Some(credentials.client_secret.clone());
        self.access_token = Some(access_token);
        self.endpoint_base_url = None;
        self.endpoint_path = None;
    }

    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint_base_url = Some(endpoint.base_url);
        self.endpoint_path = Some(endpoint.path);
    }
}

fn pick(overridden: Option<&str>, stored: Option<&str>) -> Option<String> {
    overridden
        .filter(|v| !v.is_empty())
        .or(stored.filter(|v| !v.is_empty()))
        .map(str::to_string)
}

/// Default session file: `~/.smartthings_cli.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine home directory".into()))?;
    Ok(home.join(CONFIG_FILE_NAME))
}

/// Load the session. A missing file is an empty session.
pub fn load(path: &Path) -> Result<Session> {
    if !path.exists() {
        debug!("No config at {}, starting fresh", path.display());
        return Ok(Session::default());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Session::default());
    }
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("Invalid config file {}: {e}", path.display())))
}

/// Overwrite the session file, indented by four spaces.
pub fn save(path: &Path, session: &Session) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    session
        .serialize(&mut ser)
        .map_err(|e| Error::Config(format!("Could not serialize config: {e}")))?;
    buf.push(b'\n');
    std::fs::write(path, buf)?;
    debug!("Saved config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_loads_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(session, Session::default());
    }

    #[test]
    fn untouched_session_saves_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let original = json!({
            "client_id": "abc",
            "client_secret": "shh",
            "access_token": "tok",
            "endpoint_base_url": "https://graph.api.smartthings.com",
            "endpoint_url": "/api/smartapps/installations/42",
            "note": {"kept": true}
        });
        std::fs::write(&path, serde_json::to_string(&original).unwrap()).unwrap();

        let session = load(&path).unwrap();
        assert_eq!(session.endpoint_path.as_deref(), Some("/api/smartapps/installations/42"));
        save(&path, &session).unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, original);
        assert_eq!(load(&path).unwrap(), session);
    }

    #[test]
    fn save_uses_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let session = Session {
            client_id: Some("abc".into()),
            ..Session::default()
        };
        save(&path, &session).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"client_id\": \"abc\"\n}\n");
    }

    #[test]
    fn command_line_credentials_override_stored_ones() {
        let session = Session {
            client_id: Some("stored-id".into()),
            client_secret: Some("stored-secret".into()),
            ..Session::default()
        };
        let creds = session.credentials(Some("cli-id"), None).unwrap();
        assert_eq!(creds.client_id, "cli-id");
        assert_eq!(creds.client_secret, "stored-secret");
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let session = Session::default();
        let err = session.credentials(None, Some("secret")).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.starts_with("Client ID")));

        let err = session.credentials(Some("id"), Some("")).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.starts_with("Client secret")));
    }

    #[test]
    fn endpoint_requires_both_fields() {
        let mut session = Session {
            endpoint_base_url: Some("https://host".into()),
            ..Session::default()
        };
        assert_eq!(session.endpoint(), None);

        session.set_endpoint(Endpoint {
            base_url: "https://host".into(),
            path: "/api/x".into(),
        });
        assert_eq!(session.endpoint().unwrap().url(), "https://host/api/x");
    }

    #[test]
    fn new_token_clears_stale_endpoint() {
        let mut session = Session {
            access_token: Some("old".into()),
            endpoint_base_url: Some("https://host".into()),
            endpoint_path: Some("/api/x".into()),
            ..Session::default()
        };
        let creds = Credentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        };
        session.set_authorization(&creds, "new".into());
        assert_eq!(session.access_token(), Some("new"));
        assert_eq!(session.client_id.as_deref(), Some("id"));
        assert_eq!(session.endpoint(), None);
    }
}

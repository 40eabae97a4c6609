use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, Response, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::auth::{Credentials, TokenStore};
use crate::error::GatewayError;
use crate::model::{id_string, EntityKind};
use crate::store::ImageBinding;

/// Internal marker for pre-authentication calls. Stripped before sending.
pub const SKIP_AUTH_HEADER: &str = "x-skip-auth";

const MAX_LOG_BODY_CHARS: usize = 512;

/// Bulk fetch result for one kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub entities: Vec<Value>,
    #[serde(default)]
    pub setup_lookups: Value,
}

/// Server acknowledgement of a create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub server_id: String,
    /// Remaining fields echoed by the server.
    pub fields: Map<String, Value>,
}

/// Attachment file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub local_ref: String,
    pub path: PathBuf,
    pub file_name: String,
}

/// Attachment listed by the server for download.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAttachment {
    #[serde(alias = "id")]
    pub image_id: String,
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Request functions against the backend, one family per entity kind.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn fetch_all(&self, kind: EntityKind) -> Result<AppData, GatewayError>;

    async fn create(&self, kind: EntityKind, body: &Value) -> Result<Created, GatewayError>;

    /// Returns the fields of the updated entity (empty if the server sent none).
    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        body: &Value,
    ) -> Result<Map<String, Value>, GatewayError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError>;

    async fn add_images(
        &self,
        kind: EntityKind,
        id: &str,
        images: &[ImageUpload],
    ) -> Result<Vec<ImageBinding>, GatewayError>;

    async fn download_attachments(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Vec<RemoteAttachment>, GatewayError>;

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, GatewayError>;

    /// Pre-authentication call; never carries a bearer token.
    async fn login(&self, username: &str, password: &str) -> Result<Credentials, GatewayError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenStore>,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout_secs: u64, tokens: Arc<TokenStore>) -> Result<Self, GatewayError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| GatewayError::decode(format!("invalid base url {base}: {e}")))?;
        let http = Client::builder()
            .user_agent(concat!("fieldops-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path)
            .map_err(|e| GatewayError::decode(format!("invalid endpoint {path}: {e}")))
    }

    fn kind_endpoint(&self, kind: EntityKind, action: &str) -> Result<Url, GatewayError> {
        self.endpoint(&format!("{}/{}", kind.api_path(), action))
    }

    /// `{kind}/{action}/{id}` with the id as one escaped path segment.
    fn entity_endpoint(
        &self,
        kind: EntityKind,
        action: &str,
        id: &str,
    ) -> Result<Url, GatewayError> {
        if id.is_empty() || id == "." || id == ".." {
            return Err(GatewayError::decode(format!("invalid entity id {id:?}")));
        }
        let mut url = self.kind_endpoint(kind, action)?;
        let url_text = url.to_string();
        url.path_segments_mut()
            .map_err(|()| GatewayError::decode(format!("base url cannot take a path: {url_text}")))?
            .push(id);
        Ok(url)
    }

    /// Inject the bearer token, or strip the skip-auth marker for pre-auth calls.
    pub async fn authorize(&self, mut request: Request) -> Result<Request, GatewayError> {
        if request.headers_mut().remove(SKIP_AUTH_HEADER).is_some() {
            return Ok(request);
        }
        let token = self
            .tokens
            .bearer()
            .await
            .ok_or_else(|| GatewayError::auth("session expired; please sign in again"))?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GatewayError::auth("stored token is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }

    async fn execute(&self, request: Request) -> Result<Response, GatewayError> {
        let request = self.authorize(request).await?;
        debug!(method=%request.method(), url=%request.url(), "sending request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
            debug!(%status, body=%preview, "request rejected");
            return Err(GatewayError::rejected(status.as_u16(), body));
        }
        Ok(res)
    }

    async fn execute_json(&self, request: Request) -> Result<Value, GatewayError> {
        let res = self.execute(request).await?;
        let text = res.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_all(&self, kind: EntityKind) -> Result<AppData, GatewayError> {
        let request = self
            .http
            .get(self.kind_endpoint(kind, "appData")?)
            .build()?;
        let body = self.execute_json(request).await?;
        parse_app_data(body)
    }

    async fn create(&self, kind: EntityKind, body: &Value) -> Result<Created, GatewayError> {
        let request = self
            .http
            .post(self.kind_endpoint(kind, "create")?)
            .json(body)
            .build()?;
        parse_created(self.execute_json(request).await?)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        body: &Value,
    ) -> Result<Map<String, Value>, GatewayError> {
        let request = self
            .http
            .put(self.entity_endpoint(kind, "update", id)?)
            .json(body)
            .build()?;
        Ok(entity_fields(self.execute_json(request).await?))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError> {
        let request = self
            .http
            .delete(self.entity_endpoint(kind, "delete", id)?)
            .build()?;
        self.execute(request).await?;
        Ok(())
    }

    async fn add_images(
        &self,
        kind: EntityKind,
        id: &str,
        images: &[ImageUpload],
    ) -> Result<Vec<ImageBinding>, GatewayError> {
        let mut form = reqwest::multipart::Form::new();
        for image in images {
            let bytes = fs::read(&image.path).await?;
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(image.file_name.clone())
                .mime_str(content_type(&image.path))?;
            form = form.part(image.local_ref.clone(), part);
        }
        let request = self
            .http
            .post(self.entity_endpoint(kind, "addImages", id)?)
            .multipart(form)
            .build()?;
        let body = self.execute_json(request).await?;
        serde_json::from_value(body).map_err(|e| GatewayError::decode(e.to_string()))
    }

    async fn download_attachments(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Vec<RemoteAttachment>, GatewayError> {
        let request = self
            .http
            .get(self.entity_endpoint(kind, "downloadAttachments", id)?)
            .build()?;
        let body = self.execute_json(request).await?;
        if body.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(body).map_err(|e| GatewayError::decode(e.to_string()))
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let target = match Url::parse(url) {
            Ok(abs) => abs,
            Err(_) => self.endpoint(url.trim_start_matches('/'))?,
        };
        let request = self.http.get(target).build()?;
        let res = self.execute(request).await?;
        Ok(res.bytes().await?.to_vec())
    }

    async fn login(&self, username: &str, password: &str) -> Result<Credentials, GatewayError> {
        let request = self
            .http
            .request(Method::POST, self.endpoint("auth/login")?)
            .header(SKIP_AUTH_HEADER, "1")
            .json(&json!({ "username": username, "password": password }))
            .build()?;
        let body = self.execute_json(request).await?;
        let resp: LoginResponse =
            serde_json::from_value(body).map_err(|e| GatewayError::decode(e.to_string()))?;
        resp.into_credentials(Utc::now())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(alias = "accessToken")]
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry, used when no absolute time is given.
    #[serde(default)]
    expires_in: Option<i64>,
}

impl LoginResponse {
    fn into_credentials(self, now: DateTime<Utc>) -> Result<Credentials, GatewayError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Some(at),
            (None, Some(secs)) => Some(
                Duration::try_seconds(secs)
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| GatewayError::decode(format!("expiresIn out of range: {secs}")))?,
            ),
            (None, None) => None,
        };
        Ok(Credentials {
            token: self.token,
            expires_at,
        })
    }
}

fn parse_app_data(body: Value) -> Result<AppData, GatewayError> {
    match body {
        // Some endpoints return the bare list.
        Value::Array(entities) => Ok(AppData {
            entities,
            setup_lookups: Value::Null,
        }),
        Value::Null => Ok(AppData::default()),
        other => serde_json::from_value(other).map_err(|e| GatewayError::decode(e.to_string())),
    }
}

fn parse_created(body: Value) -> Result<Created, GatewayError> {
    let Value::Object(mut obj) = body else {
        return Err(GatewayError::decode("create response is not an object"));
    };
    let server_id = obj
        .remove("serverId")
        .and_then(|v| id_string(&v))
        .or_else(|| obj.get("id").and_then(id_string))
        .ok_or_else(|| GatewayError::decode("create response has no serverId"))?;
    obj.remove("id");
    obj.remove("localId");
    Ok(Created {
        server_id,
        fields: obj,
    })
}

fn entity_fields(body: Value) -> Map<String, Value> {
    match body {
        Value::Object(mut obj) => {
            obj.remove("id");
            obj.remove("serverId");
            obj.remove("localId");
            obj
        }
        _ => Map::new(),
    }
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "heic" => "image/heic",
        Some(ext) if ext == "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{run_migrations, SqliteStore};

    async fn gateway() -> (HttpGateway, Arc<TokenStore>) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let tokens = Arc::new(TokenStore::new(Arc::new(SqliteStore::new(pool))));
        let gw = HttpGateway::new("https://api.example.com/v2", 5, tokens.clone()).unwrap();
        (gw, tokens)
    }

    #[tokio::test]
    async fn endpoints_are_relative_to_base() {
        let (gw, _) = gateway().await;
        let url = gw
            .entity_endpoint(EntityKind::TrafficCountWorkOrder, "update", "7")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/traffic-count-work-orders/update/7"
        );
    }

    #[tokio::test]
    async fn entity_ids_stay_in_one_segment() {
        let (gw, _) = gateway().await;
        let url = gw
            .entity_endpoint(EntityKind::Sign, "delete", "a/b?c#d")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v2/signs/delete/a%2Fb%3Fc%23d"
        );
        assert!(gw.entity_endpoint(EntityKind::Sign, "delete", "..").is_err());
    }

    #[tokio::test]
    async fn authorize_injects_bearer() {
        let (gw, tokens) = gateway().await;
        tokens
            .set(Credentials {
                token: "tok".into(),
                expires_at: None,
            })
            .await
            .unwrap();
        let req = gw.http.get(gw.endpoint("signs/appData").unwrap()).build().unwrap();
        let req = gw.authorize(req).await.unwrap();
        assert_eq!(
            req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok()),
            Some("Bearer tok")
        );
    }

    #[tokio::test]
    async fn authorize_strips_skip_auth_marker() {
        let (gw, tokens) = gateway().await;
        tokens
            .set(Credentials {
                token: "tok".into(),
                expires_at: None,
            })
            .await
            .unwrap();
        let req = gw
            .http
            .post(gw.endpoint("auth/login").unwrap())
            .header(SKIP_AUTH_HEADER, "1")
            .build()
            .unwrap();
        let req = gw.authorize(req).await.unwrap();
        assert!(req.headers().get(SKIP_AUTH_HEADER).is_none());
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn authorize_without_token_fails() {
        let (gw, _) = gateway().await;
        let req = gw.http.get(gw.endpoint("signs/appData").unwrap()).build().unwrap();
        let err = gw.authorize(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn parse_created_accepts_server_id_or_id() {
        let c = parse_created(json!({"serverId": "srv-42", "legend": "STOP"})).unwrap();
        assert_eq!(c.server_id, "srv-42");
        assert_eq!(c.fields.get("legend"), Some(&json!("STOP")));

        let c = parse_created(json!({"id": 17, "localId": "local_sign_1_a"})).unwrap();
        assert_eq!(c.server_id, "17");
        assert!(c.fields.is_empty());

        assert!(parse_created(json!({"ok": true})).is_err());
    }

    #[test]
    fn app_data_accepts_bare_list() {
        let d = parse_app_data(json!([{"id": "a"}])).unwrap();
        assert_eq!(d.entities.len(), 1);
        let d = parse_app_data(json!({"entities": [], "setupLookups": {"conditions": ["good"]}}))
            .unwrap();
        assert_eq!(d.setup_lookups["conditions"][0], "good");
    }

    #[test]
    fn login_expiry_from_relative_seconds() {
        let now = Utc::now();
        let resp = LoginResponse {
            token: "t".into(),
            expires_at: None,
            expires_in: Some(3600),
        };
        let creds = resp.into_credentials(now).unwrap();
        assert_eq!(creds.expires_at, Some(now + Duration::seconds(3600)));
    }

    #[test]
    fn login_expiry_out_of_range_is_a_decode_error() {
        let resp: LoginResponse =
            serde_json::from_value(json!({"token": "t", "expiresIn": i64::MAX})).unwrap();
        let err = resp.into_credentials(Utc::now()).unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}

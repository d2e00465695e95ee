//! GeoNetwork REST client.
//!
//! GeoNetwork protects write routes with an XSRF token handed out as a cookie. [`login`]
//! performs the handshake: a first `GET {api}/me` yields the `XSRF-TOKEN` cookie, then an
//! authenticated `GET {api}/me` echoes it back in the `X-XSRF-TOKEN` header. The session
//! cookie lives in the client's cookie store; the token is cached and sent with every later
//! request along with HTTP basic credentials.
//!
//! [`login`]: GeoNetworkClient::login

use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Catalog, CatalogError};
use crate::{config::CatalogSettings, resolver::EditDirective};

const XSRF_COOKIE: &str = "XSRF-TOKEN";
const XSRF_HEADER: &str = "X-XSRF-TOKEN";
const JSON: &str = "application/json";

#[derive(Debug, Serialize)]
struct BatchEdit<'a> {
    xpath: &'a str,
    value: String,
}

#[derive(Debug)]
pub struct GeoNetworkClient {
    client: Client,
    settings: CatalogSettings,
    token: Mutex<Option<String>>,
}

impl GeoNetworkClient {
    pub fn new(settings: CatalogSettings) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;
        Ok(GeoNetworkClient {
            client,
            settings,
            token: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    /// Run the XSRF handshake and cache the token.
    pub async fn login(&self) -> Result<String, CatalogError> {
        let response = self
            .client
            .get(self.settings.me().clone())
            .header(ACCEPT, JSON)
            .send()
            .await?;
        let status = response.status();
        let token = response
            .cookies()
            .find(|cookie| cookie.name() == XSRF_COOKIE)
            .map(|cookie| cookie.value().to_string());
        let token = match token {
            Some(token) => token,
            None if !status.is_success() => return Err(error_for_status(response, status).await),
            None => return Err(CatalogError::AuthFailed("No XSRF-TOKEN returned".to_string())),
        };

        let response = self
            .client
            .get(self.settings.me().clone())
            .header(ACCEPT, JSON)
            .header(XSRF_HEADER, &token)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(response, status).await);
        }
        tracing::info!(
            "Logged in to {} as '{}'",
            self.settings.api,
            self.settings.username
        );
        *self.token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> Result<String, CatalogError> {
        if let Some(token) = self.token.lock().await.as_ref() {
            return Ok(token.clone());
        }
        self.login().await
    }

    /// Attach credentials and the XSRF header to a request.
    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, CatalogError> {
        let token = self.token().await?;
        Ok(request
            .header(ACCEPT, JSON)
            .header(XSRF_HEADER, token)
            .basic_auth(&self.settings.username, Some(&self.settings.password)))
    }

    async fn handle_response(&self, response: Response) -> Result<Value, CatalogError> {
        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::FORBIDDEN {
                // The token may have expired with the session.
                *self.token.lock().await = None;
            }
            return Err(error_for_status(response, status).await);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| CatalogError::InvalidResponse(format!("Failed to parse response: {e}")))
    }
}

async fn error_for_status(response: Response, status: StatusCode) -> CatalogError {
    let message = response
        .text()
        .await
        .ok()
        .and_then(|body| {
            serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|json| json["message"].as_str().map(str::to_string))
                .or(Some(body))
        })
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| "Unknown error".to_string());
    match status {
        StatusCode::UNAUTHORIZED => CatalogError::AuthFailed("Invalid credentials".to_string()),
        StatusCode::FORBIDDEN => CatalogError::AuthFailed(format!("Permission denied: {message}")),
        StatusCode::NOT_FOUND => CatalogError::NotFound(message),
        _ => CatalogError::ApiError {
            status: status.as_u16(),
            message,
        },
    }
}

/// Pull the assigned UUID out of a record import report.
///
/// The report maps internal ids to the imported records:
/// `{"metadataInfos": {"<id>": [{"uuid": "..."}]}, "errors": [...]}`.
pub fn extract_uuid(report: &Value) -> Result<String, CatalogError> {
    if let Some(error) = first_error(report) {
        return Err(CatalogError::Rejected(error));
    }
    report["metadataInfos"]
        .as_object()
        .and_then(|infos| infos.values().next())
        .and_then(|records| records.get(0))
        .and_then(|record| record["uuid"].as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CatalogError::InvalidResponse(format!("no uuid in import report: {report}"))
        })
}

fn first_error(report: &Value) -> Option<String> {
    let error = report["errors"].as_array()?.first()?;
    Some(
        error["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

#[async_trait]
impl Catalog for GeoNetworkClient {
    fn name(&self) -> &'static str {
        "geonetwork"
    }

    async fn register(&self, local_id: &str, xml: &str) -> Result<String, CatalogError> {
        let request = self
            .client
            .put(self.settings.records().clone())
            .query(&[("metadataType", "METADATA"), ("uuidProcessing", "NOTHING")])
            .header(CONTENT_TYPE, "application/xml")
            .body(xml.to_string());
        let response = self.authorized(request).await?.send().await?;
        let report = self.handle_response(response).await?;
        let uuid = extract_uuid(&report)?;
        tracing::info!("Registered '{}' as {}", local_id, uuid);
        Ok(uuid)
    }

    async fn patch(
        &self,
        owner_final: &str,
        locator: &str,
        payload: &str,
        directive: EditDirective,
    ) -> Result<(), CatalogError> {
        // GeoNetwork evaluates the xpath against the record root, leading dot included.
        let edits = [BatchEdit {
            xpath: locator,
            value: directive.wrap(payload),
        }];
        let request = self
            .client
            .put(self.settings.batch_editing().clone())
            .query(&[("uuids", owner_final), ("updateDateStamp", "true")])
            .header(CONTENT_TYPE, JSON)
            .json(&edits);
        let response = self.authorized(request).await?.send().await?;
        let report = self.handle_response(response).await?;
        if let Some(error) = first_error(&report) {
            return Err(CatalogError::Rejected(error));
        }
        if report["numberOfRecordsNotFound"].as_u64().unwrap_or(0) > 0 {
            return Err(CatalogError::NotFound(format!("record {owner_final}")));
        }
        tracing::info!("Patched {} ({} at '{}')", owner_final, directive, locator);
        Ok(())
    }

    async fn delete(&self, final_ids: &[String]) -> Result<(), CatalogError> {
        if final_ids.is_empty() {
            return Ok(());
        }
        let mut query: Vec<(&str, &str)> = final_ids.iter().map(|id| ("uuids", id.as_str())).collect();
        query.push(("withBackup", "true"));
        let request = self
            .client
            .delete(self.settings.records().clone())
            .query(&query);
        let response = self.authorized(request).await?.send().await?;
        self.handle_response(response).await?;
        tracing::info!("Deleted {} record(s)", final_ids.len());
        Ok(())
    }
}

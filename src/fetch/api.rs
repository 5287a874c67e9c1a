//! Structured requests against vendor JSON endpoints.
//!
//! Parameters (all optional) from `strategyParams`:
//!
//! | key        | meaning                                                    |
//! |------------|------------------------------------------------------------|
//! | `method`   | `GET` (default) or `POST`                                  |
//! | `endpoint` | URL template; `{url}` is the target, `{id}` its `id` query |
//! | `body`     | JSON object sent as the request body                       |
//! | `form`     | object of strings sent `application/x-www-form-urlencoded` |
//! | `headers`  | extra request headers                                      |
//!
//! Vendors that publish a listing page of product detail links and a
//! per-product file API are handled in two phases: when the request needs
//! `{id}` and the target has no `id` query parameter, the target itself is
//! fetched with GET and its markup is returned for traversal. Detail links
//! carrying `?id=` then hit the endpoint.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use url::Url;

use super::{FetchError, FetchStrategy, RawContent, is_json_content_type, parse_headers};
use crate::config::FetchStrategyKind;

const ID_PLACEHOLDER: &str = "{id}";
const URL_PLACEHOLDER: &str = "{url}";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

#[derive(Debug, Clone)]
enum RequestBody {
    None,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Fetches structured listings from a vendor API.
#[derive(Debug, Clone)]
pub struct ApiStrategy {
    client: Client,
    method: Method,
    endpoint: Option<String>,
    body: RequestBody,
    headers: HeaderMap,
    needs_id: bool,
}

impl ApiStrategy {
    /// Builds the strategy from `strategyParams`.
    ///
    /// # Errors
    ///
    /// Returns a reason string when `method` is not GET/POST, `endpoint` is
    /// not a string, `body` is not an object, or `form` holds non-scalar values.
    pub fn from_params(client: Client, params: &Map<String, Value>) -> Result<Self, String> {
        let method = match params.get("method").and_then(Value::as_str) {
            None => Method::GET,
            Some(m) if m.eq_ignore_ascii_case("get") => Method::GET,
            Some(m) if m.eq_ignore_ascii_case("post") => Method::POST,
            Some(other) => return Err(format!("unsupported API method {other:?}")),
        };

        let endpoint = match params.get("endpoint") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(_) => return Err("`endpoint` must be a string".to_string()),
        };

        let body = match (params.get("body"), params.get("form")) {
            (Some(_), Some(_)) => return Err("set either `body` or `form`, not both".to_string()),
            (Some(Value::Object(map)), None) => RequestBody::Json(Value::Object(map.clone())),
            (Some(_), None) => return Err("`body` must be a JSON object".to_string()),
            (None, Some(Value::Object(map))) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return Err(format!("form field {key:?} must be a scalar")),
                    };
                    fields.push((key.clone(), value));
                }
                RequestBody::Form(fields)
            }
            (None, Some(_)) => return Err("`form` must be an object".to_string()),
            (None, None) => RequestBody::None,
        };

        let needs_id = endpoint.as_deref().is_some_and(|e| e.contains(ID_PLACEHOLDER))
            || match &body {
                RequestBody::None => false,
                RequestBody::Json(v) => v.to_string().contains(ID_PLACEHOLDER),
                RequestBody::Form(fields) => fields.iter().any(|(_, v)| v.contains(ID_PLACEHOLDER)),
            };

        Ok(Self {
            client,
            method,
            endpoint,
            body,
            headers: parse_headers(params),
            needs_id,
        })
    }

    fn request_url(&self, target: &Url, id: &str) -> Result<Url, FetchError> {
        let Some(template) = &self.endpoint else {
            return Ok(target.clone());
        };
        let filled = template
            .replace(ID_PLACEHOLDER, &urlencoding::encode(id))
            .replace(URL_PLACEHOLDER, &urlencoding::encode(target.as_str()));
        target
            .join(&filled)
            .map_err(|e| FetchError::network(target.as_str(), format!("bad endpoint {filled:?}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: &RequestBody,
        referer: &Url,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.request(method, url.clone());

        if url != *referer {
            if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
                request = request.header(REFERER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&referer.origin().ascii_serialization()) {
                request = request.header(ORIGIN, value);
            }
        }

        request = match body {
            RequestBody::None => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::Form(fields) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields.iter())
                    .finish();
                request
                    .header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
                    .body(encoded)
            }
        };

        request
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))
    }
}

#[async_trait]
impl FetchStrategy for ApiStrategy {
    fn kind(&self) -> FetchStrategyKind {
        FetchStrategyKind::Api
    }

    #[instrument(level = "debug", skip(self), fields(url = %target, method = %self.method))]
    async fn fetch(&self, target: &Url) -> Result<RawContent, FetchError> {
        let id = target
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty());

        let (method, url, body) = match (&id, self.needs_id) {
            (None, true) => {
                debug!("target carries no id, fetching it as a listing page");
                (Method::GET, target.clone(), RequestBody::None)
            }
            _ => {
                let id = id.as_deref().unwrap_or_default();
                let url = self.request_url(target, id)?;
                (self.method.clone(), url, fill_body(&self.body, id, target))
            }
        };

        let response = self.send(method, url.clone(), &body, target).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(url.as_str(), status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))?;

        debug!(
            endpoint = %url,
            status = status.as_u16(),
            bytes = text.len(),
            "API response received"
        );

        if is_json_content_type(content_type.as_deref()) {
            let payload = serde_json::from_str(&text).map_err(|e| {
                FetchError::network(url.as_str(), format!("invalid JSON body: {e}"))
            })?;
            return Ok(RawContent::Structured {
                url: target.clone(),
                payload,
            });
        }

        // Some vendors serve JSON as text/html.
        let trimmed = text.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(payload) = serde_json::from_str::<Value>(trimmed)
        {
            return Ok(RawContent::Structured {
                url: target.clone(),
                payload,
            });
        }

        Ok(RawContent::Markup {
            url: target.clone(),
            html: text,
        })
    }
}

fn fill_body(body: &RequestBody, id: &str, target: &Url) -> RequestBody {
    let fill = |s: &str| {
        s.replace(ID_PLACEHOLDER, id)
            .replace(URL_PLACEHOLDER, target.as_str())
    };
    match body {
        RequestBody::None => RequestBody::None,
        RequestBody::Json(value) => RequestBody::Json(fill_value(value, &fill)),
        RequestBody::Form(fields) => {
            RequestBody::Form(fields.iter().map(|(k, v)| (k.clone(), fill(v))).collect())
        }
    }
}

fn fill_value(value: &Value, fill: &impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(fill(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| fill_value(v, fill)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_value(v, fill)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::http_client::build_http_client;

    fn strategy(params: Value) -> ApiStrategy {
        ApiStrategy::from_params(
            build_http_client(Duration::from_secs(5)).unwrap(),
            params.as_object().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_params_rejects_invalid_shapes() {
        let client = build_http_client(Duration::from_secs(5)).unwrap();
        for params in [
            json!({"method": "PUT"}),
            json!({"endpoint": 5}),
            json!({"body": "x"}),
            json!({"form": {"a": {"nested": true}}}),
            json!({"body": {}, "form": {}}),
        ] {
            assert!(
                ApiStrategy::from_params(client.clone(), params.as_object().unwrap()).is_err(),
                "{params}"
            );
        }
    }

    #[tokio::test]
    async fn test_get_target_returns_structured_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/manuals"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"fileList": []}})),
            )
            .mount(&server)
            .await;

        let target = Url::parse(&format!("{}/api/manuals", server.uri())).unwrap();
        let content = strategy(json!({})).fetch(&target).await.unwrap();
        let RawContent::Structured { payload, url } = content else {
            panic!("expected structured content");
        };
        assert_eq!(url, target);
        assert!(payload["data"]["fileList"].is_array());
    }

    #[tokio::test]
    async fn test_post_form_with_id_from_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/detail"))
            .and(header("content-type", FORM_CONTENT_TYPE))
            .and(body_string("id=42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"fileList": [{"fileUrl": "/f/a.pdf"}]})),
            )
            .mount(&server)
            .await;

        let s = strategy(json!({
            "method": "POST",
            "endpoint": "/api/detail",
            "form": {"id": "{id}"}
        }));
        let target = Url::parse(&format!("{}/resource-center-detail/?id=42", server.uri())).unwrap();
        let content = s.fetch(&target).await.unwrap();
        assert!(matches!(content, RawContent::Structured { .. }));
    }

    #[tokio::test]
    async fn test_listing_without_id_is_fetched_as_markup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resource-center"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<a href=\"/resource-center-detail/?id=7\">Panel</a>", "text/html"),
            )
            .mount(&server)
            .await;

        let s = strategy(json!({
            "method": "POST",
            "endpoint": "/api/detail",
            "form": {"id": "{id}"}
        }));
        let target = Url::parse(&format!("{}/resource-center", server.uri())).unwrap();
        let content = s.fetch(&target).await.unwrap();
        let RawContent::Markup { html, .. } = content else {
            panic!("expected markup");
        };
        assert!(html.contains("?id=7"));
    }

    #[tokio::test]
    async fn test_post_json_body_substitutes_placeholders() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/search"))
            .and(body_json(json!({"productId": "9", "page": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let s = strategy(json!({
            "method": "POST",
            "endpoint": "/api/search",
            "body": {"productId": "{id}", "page": 1}
        }));
        let target = Url::parse(&format!("{}/p?id=9", server.uri())).unwrap();
        assert!(s.fetch(&target).await.is_ok());
    }

    #[tokio::test]
    async fn test_json_served_as_html_is_sniffed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/legacy"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"list": []}"#, "text/html"),
            )
            .mount(&server)
            .await;

        let target = Url::parse(&format!("{}/legacy", server.uri())).unwrap();
        let content = strategy(json!({})).fetch(&target).await.unwrap();
        assert!(matches!(content, RawContent::Structured { .. }));
    }

    #[tokio::test]
    async fn test_malformed_json_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("{not json", "application/json"),
            )
            .mount(&server)
            .await;

        let target = Url::parse(&format!("{}/bad", server.uri())).unwrap();
        assert!(matches!(
            strategy(json!({})).fetch(&target).await,
            Err(FetchError::Network { .. })
        ));
    }
}

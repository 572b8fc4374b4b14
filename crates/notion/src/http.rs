use async_trait::async_trait;
use notesync_config::NotionConfig;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use crate::api::{BlockPage, NotionApi};
use crate::block::{Block, is_archived, rich_text};
use crate::error::{NotionError, Result};

/// [`NotionApi`] over the public REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpNotionApi {
    client: reqwest::Client,
    base_url: String,
    version: String,
    token: String,
}

impl HttpNotionApi {
    pub fn new(config: &NotionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            version: config.api_version.clone(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.version)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }

        Err(error_from_response(status, &body))
    }
}

fn error_from_response(status: StatusCode, body: &str) -> NotionError {
    let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let code = parsed
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = parsed
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    if status == StatusCode::TOO_MANY_REQUESTS || code == "rate_limited" {
        return NotionError::rate_limited(message);
    }

    NotionError::Api {
        status: status.as_u16(),
        code,
        message,
    }
}

/// Deleting a block that is already gone must not fail the caller.
fn is_already_deleted(err: &NotionError) -> bool {
    match err {
        NotionError::Api { status: 404, .. } => true,
        NotionError::Api {
            status: 400,
            message,
            ..
        } => message.contains("archived"),
        _ => false,
    }
}

fn results(body: &Value, object: &str) -> Result<Vec<Value>> {
    body.get("results")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| NotionError::missing_field(object, "results"))
}

fn block_payloads(children: &[Block]) -> Vec<Value> {
    children.iter().map(Block::to_json).collect()
}

#[async_trait]
impl NotionApi for HttpNotionApi {
    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<BlockPage> {
        let mut request = self
            .request(Method::GET, &format!("blocks/{block_id}/children"))
            .query(&[("page_size", page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("start_cursor", cursor)]);
        }

        let body = self.send(request).await?;
        let blocks = results(&body, "block list")?
            .iter()
            .filter(|raw| !is_archived(raw))
            .filter_map(Block::from_json)
            .collect();
        let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        let next_cursor = if has_more {
            body.get("next_cursor")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        } else {
            None
        };

        Ok(BlockPage {
            blocks,
            next_cursor,
        })
    }

    async fn create_page(
        &self,
        parent_id: &str,
        title: &str,
        children: &[Block],
    ) -> Result<String> {
        let payload = json!({
            "parent": { "page_id": parent_id },
            "properties": {
                "title": { "title": rich_text(title) }
            },
            "children": block_payloads(children),
        });

        let body = self
            .send(self.request(Method::POST, "pages").json(&payload))
            .await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| NotionError::missing_field("page", "id"))
    }

    async fn append_children(
        &self,
        block_id: &str,
        children: &[Block],
        after: Option<&str>,
    ) -> Result<Vec<Block>> {
        let mut payload = json!({ "children": block_payloads(children) });
        if let Some(after) = after {
            payload["after"] = json!(after);
        }

        let body = self
            .send(
                self.request(Method::PATCH, &format!("blocks/{block_id}/children"))
                    .json(&payload),
            )
            .await?;
        Ok(results(&body, "append response")?
            .iter()
            .filter_map(Block::from_json)
            .collect())
    }

    async fn delete_block(&self, block_id: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &format!("blocks/{block_id}"));
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_deleted(&err) => {
                debug!(block_id, "block already deleted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn update_block(&self, block_id: &str, block: &Block) -> Result<()> {
        let mut payload = serde_json::Map::new();
        payload.insert(block.kind.clone(), block.payload.clone());

        self.send(
            self.request(Method::PATCH, &format!("blocks/{block_id}"))
                .json(&Value::Object(payload)),
        )
        .await?;
        Ok(())
    }

    async fn set_page_archived(&self, page_id: &str, archived: bool) -> Result<()> {
        self.send(
            self.request(Method::PATCH, &format!("pages/{page_id}"))
                .json(&json!({ "archived": archived })),
        )
        .await?;
        Ok(())
    }

    async fn retrieve_page(&self, page_id: &str) -> Result<Value> {
        self.send(self.request(Method::GET, &format!("pages/{page_id}")))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        let err = error_from_response(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_rate_limited());
    }

    #[test]
    fn rate_limited_code_is_recognized_on_any_status() {
        let body = r#"{"object":"error","status":503,"code":"rate_limited","message":"busy"}"#;
        let err = error_from_response(StatusCode::SERVICE_UNAVAILABLE, body);
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "rate limited by remote service: busy");
    }

    #[test]
    fn api_errors_keep_status_and_code() {
        let body = r#"{"object":"error","status":400,"code":"validation_error","message":"bad"}"#;
        match error_from_response(StatusCode::BAD_REQUEST, body) {
            NotionError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(code, "validation_error");
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_json_error_body_becomes_message() {
        let err = error_from_response(StatusCode::BAD_GATEWAY, "upstream down\n");
        assert_eq!(
            err.to_string(),
            "remote API error (502, unknown): upstream down"
        );
    }

    #[test]
    fn repeated_delete_is_tolerated() {
        let gone = NotionError::Api {
            status: 400,
            code: "validation_error".to_string(),
            message: "Can't edit block that is archived.".to_string(),
        };
        assert!(is_already_deleted(&gone));
        assert!(!is_already_deleted(&NotionError::rate_limited("x")));
    }

    #[test]
    fn client_builds_from_config() {
        let mut config = NotionConfig::default();
        config.api_base_url = "http://localhost:9999/v1/".to_string();
        let api = HttpNotionApi::new(&config).unwrap();
        assert_eq!(api.base_url, "http://localhost:9999/v1");
        assert_eq!(api.version, "2022-06-28");
    }
}

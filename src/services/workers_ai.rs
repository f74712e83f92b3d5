use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::vision::{ModelError, VisionModel, PROMPT};

const LLAVA_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";

/// Client for the Cloudflare Workers AI LLaVA model.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Serialize)]
struct LlavaRequest<'a> {
    image: &'a [u8],
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: Option<LlavaResult>,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClient {
    pub fn new(account_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, LLAVA_MODEL
        )
    }
}

#[async_trait]
impl VisionModel for WorkersAiClient {
    async fn infer(&self, image: &[u8], _mime_type: &str) -> Result<String, ModelError> {
        // LLaVA sniffs the format itself; the image goes over as a byte array.
        let request_body = LlavaRequest {
            image,
            prompt: PROMPT,
            max_tokens: 512,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, &body));
        }

        let llava_resp: LlavaResponse = response.json().await?;
        llava_resp
            .result
            .map(|r| r.description)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ModelError::Transient("LLaVA returned no description".to_string()))
    }
}

use reqwest::{Client, Response};
use shared::{
    domain::{ConditionId, ControlAction, PartId},
    protocol::{CounterEvaluation, CounterIncrement},
};
use tracing::{debug, warn};

use crate::error::ClientError;

/// Request/response control calls. One HTTP request per invocation, no
/// retries and no de-duplication; serialising double clicks is up to the
/// caller.
#[derive(Clone)]
pub struct ActionGateway {
    http: Client,
    server_url: String,
}

impl ActionGateway {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into();
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn control_auto_transition(&self, action: ControlAction) -> Result<(), ClientError> {
        debug!(action = %action, "gateway: auto-transition request");
        let res = self
            .http
            .post(format!("{}/api/auto-transition", self.server_url))
            .query(&[("action", action.as_str())])
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    pub async fn increment_counter(
        &self,
        condition_id: ConditionId,
        part_id: PartId,
        amount: i64,
    ) -> Result<CounterEvaluation, ClientError> {
        debug!(
            condition_id = condition_id.0,
            part_id = part_id.0,
            amount,
            "gateway: counter increment request"
        );
        let res = self
            .http
            .post(format!(
                "{}/api/condition/{}/part/{}/evaluate",
                self.server_url, condition_id.0, part_id.0
            ))
            .json(&CounterIncrement { increment: amount })
            .send()
            .await?;
        let evaluation: CounterEvaluation = check_status(res).await?.json().await?;
        Ok(evaluation)
    }

    /// Raw snapshot body; parsed by the controller through the same path as
    /// socket frames.
    pub async fn fetch_initial_state(&self) -> Result<String, ClientError> {
        let res = self
            .http
            .get(format!("{}/api/initial-state", self.server_url))
            .send()
            .await?;
        Ok(check_status(res).await?.text().await?)
    }
}

async fn check_status(res: Response) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let message = res.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %message.trim(), "gateway: request rejected");
    Err(ClientError::Request {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;

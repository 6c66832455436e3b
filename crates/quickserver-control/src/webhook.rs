//! JSON-over-HTTP collaborators: a provisioning backend and an owner notification relay.
//!
//! Provisioner contract:
//! - `POST {base}/deploy` with a [`DeployRequest`] body answers a [`DeployedInstance`].
//!   `503` or `429` means no capacity; the response text is shown to the requester.
//! - `POST {base}/destroy` with `{instance_id, region}`. `404` counts as already destroyed.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quickserver_types::{DeployedInstance, InstanceId, OwnerId};
use reqwest::StatusCode;
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::ports::{DeployRequest, Notifier, Provisioner};

const USER_AGENT: &str = "quickserver-control";

fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Serialize)]
struct DestroyRequest<'a> {
    instance_id: InstanceId,
    region: &'a str,
}

#[derive(Clone)]
pub struct WebhookProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl WebhookProvisioner {
    /// `deploy_timeout` bounds every call, including deploys that wait for the instance to
    /// come up. Keep it below the pending reaper's age limit.
    pub fn new(base_url: &str, deploy_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: client(deploy_timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl Provisioner for WebhookProvisioner {
    async fn deploy(&self, request: DeployRequest) -> Result<DeployedInstance> {
        let instance_id = request.instance_id;
        let region = request.region.clone();
        let resp = self
            .client
            .post(format!("{}/deploy", self.base_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("deploy {instance_id}"))?;

        let status = resp.status();
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            let body = resp.text().await.unwrap_or_default();
            let message = match body.trim() {
                "" => format!(
                    "There is no capacity left in {region} right now. Please try another region or try again later."
                ),
                text => text.to_string(),
            };
            return Err(FleetError::InsufficientCapacity(message));
        }

        let deployed = resp
            .error_for_status()
            .with_context(|| format!("deploy {instance_id}"))?
            .json::<DeployedInstance>()
            .await
            .with_context(|| format!("parse deploy response for {instance_id}"))?;
        tracing::info!(instance_id = %instance_id, %region, "provisioner deployed instance");
        Ok(deployed)
    }

    async fn destroy(&self, id: InstanceId, region: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/destroy", self.base_url))
            .json(&DestroyRequest {
                instance_id: id,
                region,
            })
            .send()
            .await
            .with_context(|| format!("destroy {id}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(instance_id = %id, "provisioner had nothing to destroy");
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("destroy {id}"))?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct NotifyRequest<'a> {
    owner_id: &'a OwnerId,
    message: &'a str,
}

/// Relays direct messages to a chat bridge.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: client(Duration::from_secs(10))?,
            url: url.trim().to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, owner: &OwnerId, message: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&NotifyRequest {
                owner_id: owner,
                message,
            })
            .send()
            .await
            .context("send owner notification")?
            .error_for_status()
            .context("send owner notification")?;
        Ok(())
    }
}

/// Used when no relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner: &OwnerId, message: &str) -> Result<()> {
        tracing::info!(owner_id = %owner, message, "owner notification");
        Ok(())
    }
}

//! RPC Network State
//!
//! Read-only `NetworkState` over CometBFT RPC and the Cosmos SDK REST API.
//! It never submits transactions. Response parsing is kept in plain functions
//! so it can be tested against recorded JSON.

use crate::config::NetworkConfig;
use crate::error::{Result, UpgradeError};
use crate::network::{GovParams, NetworkState, Proposal, ProposalStatus, ProposalVote, UpgradePlan};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, Instrument, Span};

/// Poll interval for `wait_for_block`
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RpcNetworkState {
    client: reqwest::Client,
    rpc_url: String,
    rest_url: String,
    span: Span,
}

impl RpcNetworkState {
    pub fn new(config: &NetworkConfig, span: Span) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpgradeError::Network(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            rpc_url: config.rpc_url.trim_end_matches('/').to_string(),
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            span,
        })
    }

    async fn get_json(&self, url: String) -> Result<Value> {
        async {
            debug!(%url, "GET");
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| UpgradeError::Network(format!("{}: {}", url, e)))?
                .error_for_status()
                .map_err(|e| UpgradeError::Network(format!("{}: {}", url, e)))?;
            response
                .json::<Value>()
                .await
                .map_err(|e| UpgradeError::Network(format!("{}: invalid JSON: {}", url, e)))
        }
        .instrument(self.span.clone())
        .await
    }

    async fn status(&self) -> Result<(i64, DateTime<Utc>)> {
        let body = self.get_json(format!("{}/status", self.rpc_url)).await?;
        parse_status(&body)
    }
}

#[async_trait]
impl NetworkState for RpcNetworkState {
    async fn get_block_height(&self) -> Result<i64> {
        Ok(self.status().await?.0)
    }

    async fn get_block_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.status().await?.1)
    }

    async fn is_chain_running(&self) -> bool {
        self.status().await.is_ok()
    }

    async fn wait_for_block(&self, height: i64) -> Result<()> {
        loop {
            let current = self.get_block_height().await?;
            if current >= height {
                return Ok(());
            }
            debug!(current, target = height, "waiting for block");
            tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
        }
    }

    async fn get_proposal(&self, id: u64) -> Result<Proposal> {
        let body = self
            .get_json(format!("{}/cosmos/gov/v1/proposals/{}", self.rest_url, id))
            .await?;
        parse_proposal(&body)
    }

    async fn get_proposal_votes(&self, id: u64) -> Result<Vec<ProposalVote>> {
        let body = self
            .get_json(format!(
                "{}/cosmos/gov/v1/proposals/{}/votes?pagination.limit=1000",
                self.rest_url, id
            ))
            .await?;
        parse_votes(&body)
    }

    async fn get_upgrade_plan(&self) -> Result<Option<UpgradePlan>> {
        let body = self
            .get_json(format!("{}/cosmos/upgrade/v1beta1/current_plan", self.rest_url))
            .await?;
        parse_plan(&body)
    }

    async fn get_app_version(&self) -> Result<String> {
        let body = self
            .get_json(format!(
                "{}/cosmos/base/tendermint/v1beta1/node_info",
                self.rest_url
            ))
            .await?;
        body.pointer("/application_version/version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed("node_info", "application_version.version"))
    }

    async fn get_gov_params(&self) -> Result<GovParams> {
        let body = self
            .get_json(format!("{}/cosmos/gov/v1/params/voting", self.rest_url))
            .await?;
        parse_gov_params(&body)
    }
}

// ============================================================================
// Response parsing
// ============================================================================

fn malformed(what: &str, field: &str) -> UpgradeError {
    UpgradeError::Network(format!("malformed {} response: missing {}", what, field))
}

/// Numbers arrive as strings in both APIs
fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

pub fn parse_status(body: &Value) -> Result<(i64, DateTime<Utc>)> {
    let result = body.get("result").unwrap_or(body);
    let height = as_i64(result.pointer("/sync_info/latest_block_height"))
        .ok_or_else(|| malformed("status", "sync_info.latest_block_height"))?;
    let time = result
        .pointer("/sync_info/latest_block_time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| malformed("status", "sync_info.latest_block_time"))?;
    Ok((height, time))
}

pub fn parse_proposal_status(raw: &str) -> ProposalStatus {
    match raw {
        "PROPOSAL_STATUS_DEPOSIT_PERIOD" => ProposalStatus::Pending,
        "PROPOSAL_STATUS_VOTING_PERIOD" => ProposalStatus::Voting,
        "PROPOSAL_STATUS_PASSED" => ProposalStatus::Passed,
        "PROPOSAL_STATUS_REJECTED" => ProposalStatus::Rejected,
        "PROPOSAL_STATUS_FAILED" => ProposalStatus::Failed,
        _ => ProposalStatus::Unknown,
    }
}

pub fn parse_proposal(body: &Value) -> Result<Proposal> {
    let proposal = body
        .get("proposal")
        .ok_or_else(|| malformed("proposal", "proposal"))?;
    let id = as_i64(proposal.get("id")).ok_or_else(|| malformed("proposal", "proposal.id"))?;
    let status = proposal
        .get("status")
        .and_then(Value::as_str)
        .map(parse_proposal_status)
        .ok_or_else(|| malformed("proposal", "proposal.status"))?;
    let title = proposal
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let voting_end_time = proposal
        .get("voting_end_time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    Ok(Proposal {
        id: id as u64,
        status,
        title,
        voting_end_time,
    })
}

pub fn parse_votes(body: &Value) -> Result<Vec<ProposalVote>> {
    let votes = body
        .get("votes")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("votes", "votes"))?;

    Ok(votes
        .iter()
        .filter_map(|vote| {
            let voter = vote.get("voter")?.as_str()?.to_string();
            let option = vote
                .pointer("/options/0/option")
                .and_then(Value::as_str)
                .unwrap_or("VOTE_OPTION_UNSPECIFIED");
            Some(ProposalVote {
                voter,
                option: option
                    .trim_start_matches("VOTE_OPTION_")
                    .to_lowercase(),
            })
        })
        .collect())
}

pub fn parse_plan(body: &Value) -> Result<Option<UpgradePlan>> {
    let plan = match body.get("plan") {
        None | Some(Value::Null) => return Ok(None),
        Some(plan) => plan,
    };
    let name = plan
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("current_plan", "plan.name"))?;
    let height = as_i64(plan.get("height")).ok_or_else(|| malformed("current_plan", "plan.height"))?;
    Ok(Some(UpgradePlan {
        name: name.to_string(),
        height,
        info: plan
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }))
}

pub fn parse_gov_params(body: &Value) -> Result<GovParams> {
    let params = body
        .get("params")
        .filter(|p| !p.is_null())
        .or_else(|| body.get("voting_params"))
        .ok_or_else(|| malformed("gov params", "params"))?;
    let period = params
        .get("voting_period")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("gov params", "voting_period"))?;
    let voting_period_secs = parse_duration_secs(period)
        .ok_or_else(|| malformed("gov params", "voting_period"))?;

    let text = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Ok(GovParams {
        voting_period_secs,
        quorum: text("quorum"),
        threshold: text("threshold"),
    })
}

/// Protobuf JSON durations look like "172800s" or "30.5s"
fn parse_duration_secs(raw: &str) -> Option<u64> {
    let secs: f64 = raw.strip_suffix('s')?.parse().ok()?;
    if secs < 0.0 {
        return None;
    }
    Some(secs.floor() as u64)
}

//! Daily campaign spend from the Facebook Marketing API.
//!
//! Insights are listed for the reporting window at campaign level, one row per
//! campaign per day. Each campaign's delivery status and schedule come from one
//! extra lookup per distinct campaign.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as Days, FixedOffset, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::mapping::scalar_text;
use super::{get_json, http_client, progress_bar, Checkpoint, FailureLog, Pacer};
use crate::config::FacebookConfig;
use crate::error::FetchError;
use crate::run::{RunReport, RunTracker};
use crate::schema::RAW_SPEND_FACEBOOK;
use crate::tabular::{row_key, Row, TableAppender};

const USER_AGENT: &str = concat!("research-etl/", env!("CARGO_PKG_VERSION"));

const INSIGHT_FIELDS: &str =
    "campaign_name,outbound_clicks,spend,campaign_id,reach,actions,frequency,impressions";
const CAMPAIGN_FIELDS: &str = "id,name,effective_status,status,start_time,stop_time";

pub const SPEND_KEY: &[&str] = RAW_SPEND_FACEBOOK.primary_key;

/// Inclusive reporting window `[today - days_back, today - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

pub fn report_window(today: NaiveDate, days_back: u32) -> ReportWindow {
    ReportWindow {
        since: today - Days::days(i64::from(days_back)),
        until: today - Days::days(1),
    }
}

/// Calendar date right now at a fixed UTC offset.
pub fn today_at_offset(offset_hours: i32) -> Result<NaiveDate> {
    let offset = offset_hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| anyhow!("UTC offset out of range: {} hours", offset_hours))?;
    Ok(Utc::now().with_timezone(&offset).date_naive())
}

pub struct FacebookClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl FacebookClient {
    pub fn new(base_url: &str, access_token: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout, USER_AGENT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// All daily campaign insights in the window, following `paging.next`.
    pub async fn insights(
        &self,
        ad_account_id: &str,
        window: ReportWindow,
    ) -> Result<Vec<Value>, FetchError> {
        let time_range = json!({
            "since": window.since.format("%Y-%m-%d").to_string(),
            "until": window.until.format("%Y-%m-%d").to_string(),
        });
        let first = self
            .client
            .get(format!("{}/act_{}/insights", self.base_url, ad_account_id))
            .query(&[
                ("access_token", self.access_token.clone()),
                ("time_range", time_range.to_string()),
                ("level", "campaign".to_string()),
                ("fields", INSIGHT_FIELDS.to_string()),
                ("time_increment", "1".to_string()),
            ]);

        let mut all = Vec::new();
        let mut request = Some(first);
        while let Some(req) = request.take() {
            let page = get_json(req)
                .await?
                .ok_or_else(|| FetchError::Payload("insights endpoint not found".to_string()))?;

            match page.get("data") {
                Some(Value::Array(items)) => all.extend(items.iter().cloned()),
                _ => {
                    debug!("Insights page without data");
                    break;
                }
            }

            // The next link already carries every query parameter.
            if let Some(next) = page.pointer("/paging/next").and_then(Value::as_str) {
                request = Some(self.client.get(next));
            }
        }

        Ok(all)
    }

    pub async fn campaign(&self, campaign_id: &str) -> Result<Option<Value>, FetchError> {
        let request = self
            .client
            .get(format!(
                "{}/{}",
                self.base_url,
                urlencoding::encode(campaign_id)
            ))
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("fields", CAMPAIGN_FIELDS),
            ]);
        get_json(request).await
    }
}

fn text_at(value: &Value, key: &str) -> String {
    value.get(key).map(scalar_text).unwrap_or_default()
}

/// Value of the `link_click` entry in an insight's `actions` list, 0 when absent.
pub fn link_clicks(insight: &Value) -> i64 {
    insight
        .get("actions")
        .and_then(Value::as_array)
        .and_then(|actions| {
            actions.iter().find(|a| {
                a.get("action_type").and_then(Value::as_str) == Some("link_click")
            })
        })
        .and_then(|a| a.get("value"))
        .map(|v| match v {
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0) as i64,
            other => other.as_f64().unwrap_or(0.0) as i64,
        })
        .unwrap_or(0)
}

/// One output row from an insight and, when known, its campaign record.
pub fn spend_row(insight: &Value, campaign: Option<&Value>, updated_at: &str) -> Row {
    let clicks = link_clicks(insight);
    let results = clicks;
    let spend = text_at(insight, "spend");
    let cost_per_result = if results == 0 {
        0.0
    } else {
        spend.trim().parse::<f64>().unwrap_or(0.0) / results as f64
    };
    let date = text_at(insight, "date_start");
    let date_stop = text_at(insight, "date_stop");

    let mut row = Row::new();
    row.insert("date".into(), date.clone());
    row.insert("campaign_id".into(), text_at(insight, "campaign_id"));
    row.insert("campaign_name".into(), text_at(insight, "campaign_name"));
    row.insert("spend".into(), spend);
    row.insert("reach".into(), text_at(insight, "reach"));
    row.insert("link_click".into(), clicks.to_string());
    row.insert("frequency".into(), text_at(insight, "frequency"));
    row.insert("impressions".into(), text_at(insight, "impressions"));
    row.insert("results".into(), results.to_string());
    row.insert("result_type".into(), "link_click".into());
    row.insert("cost_per_result".into(), cost_per_result.to_string());
    row.insert("delivery_level".into(), "campaign".into());
    row.insert("date_start".into(), date.clone());
    row.insert("date_stop".into(), date_stop.clone());
    row.insert("report_start_date".into(), date);
    row.insert("report_end_date".into(), date_stop);
    row.insert("updated_at".into(), updated_at.to_string());

    let (status, start, stop) = match campaign {
        Some(c) => (
            text_at(c, "status"),
            text_at(c, "start_time"),
            text_at(c, "stop_time"),
        ),
        None => Default::default(),
    };
    row.insert("delivery_status".into(), status);
    row.insert("ad_start_time".into(), start);
    row.insert("ad_stop_time".into(), stop);
    row
}

pub fn run(config: FacebookConfig) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config))
}

pub async fn run_async(config: FacebookConfig) -> Result<RunReport> {
    let today = today_at_offset(config.utc_offset_hours)?;
    let window = report_window(today, config.days_back);
    harvest(&config, window).await
}

/// Lists insights for `window`, resolves campaigns, and appends new rows.
pub async fn harvest(config: &FacebookConfig, window: ReportWindow) -> Result<RunReport> {
    let mut tracker = RunTracker::new("facebook");
    let client = FacebookClient::new(
        &config.base_url,
        &config.access_token,
        config.pacing.request_timeout,
    )?;
    let mut checkpoint = Checkpoint::load(&config.output, SPEND_KEY)?;
    tracker.start();

    info!(since = %window.since, until = %window.until, "Listing campaign insights");
    let insights = client
        .insights(&config.ad_account_id, window)
        .await
        .context("Failed to list campaign insights")?;
    info!("{} insight rows in window", insights.len());

    // Pending insights grouped by campaign, in first-seen order.
    let mut by_campaign: Vec<(String, Vec<&Value>)> = Vec::new();
    let mut campaign_slot: HashMap<String, usize> = HashMap::new();
    let mut pending = HashSet::new();
    for insight in &insights {
        tracker.processed(1);
        let key = [
            text_at(insight, "date_start"),
            text_at(insight, "campaign_id"),
        ];
        if key.iter().any(String::is_empty) {
            warn!("Insight without date or campaign id ignored");
            tracker.skipped(1);
            continue;
        }
        let joined = key.join("|");
        if checkpoint.is_processed(&joined) {
            tracker.already_done(1);
            continue;
        }
        if !pending.insert(joined) {
            debug!(date = %key[0], campaign_id = %key[1], "Duplicate insight ignored");
            continue;
        }
        let slot = *campaign_slot.entry(key[1].clone()).or_insert_with(|| {
            by_campaign.push((key[1].clone(), Vec::new()));
            by_campaign.len() - 1
        });
        by_campaign[slot].1.push(insight);
    }

    if by_campaign.is_empty() {
        return Ok(tracker.finish());
    }

    let headers: Vec<String> = RAW_SPEND_FACEBOOK
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let mut output = TableAppender::open(&config.output, &headers)?;
    let mut failures = FailureLog::open(&config.output, "facebook")?;
    let mut pacer = Pacer::new(config.pacing.clone());
    let updated_at = Utc::now().to_rfc3339();
    let pb = progress_bar(by_campaign.len() as u64);
    let total = by_campaign.len();

    for (idx, (campaign_id, rows)) in by_campaign.into_iter().enumerate() {
        let campaign = match client.campaign(&campaign_id).await {
            Ok(found) => {
                if found.is_none() {
                    debug!(campaign_id = %campaign_id, "Campaign not found");
                }
                found
            }
            Err(e) => {
                warn!(campaign_id = %campaign_id, "Campaign lookup failed: {}", e);
                failures.record(&campaign_id, &e.to_string())?;
                tracker.skipped(rows.len());
                pb.inc(1);
                pacer.after_request(idx + 1 < total).await;
                continue;
            }
        };

        for insight in rows {
            let row = spend_row(insight, campaign.as_ref(), &updated_at);
            if let Some(key) = row_key(&row, SPEND_KEY) {
                output.append(&row)?;
                checkpoint.mark_processed(&key);
                tracker.written(1);
            }
        }

        pb.inc(1);
        pacer.after_request(idx + 1 < total).await;
    }

    pb.finish_and_clear();
    Ok(tracker.finish())
}

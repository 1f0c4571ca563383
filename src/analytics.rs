//! Columnar analytics sink: one row per evicted window bucket, written by
//! the integrator's live-rate fiber (§4.3, §6 Analytics row).
//!
//! Grounded on the reference implementation's `conf.go` `ClickhouseConf`
//! and its per-eviction insert path in `integrate.go`; the teacher repo
//! carries no analytics-store dependency, so the `clickhouse` crate is
//! adopted directly per DESIGN.md's dependency ledger.

use std::collections::HashMap;

use clickhouse::{Client, Row};
use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::errors::RecordStoreError;
use crate::model::Aggregate;

/// The exact column set named in §6: map columns carry the small
/// per-push histograms, `latency_map` carries the percentile->ms table
/// computed at eviction time.
#[derive(Debug, Clone, Serialize, Row)]
pub struct AnalyticsRow {
    pub plan_id: i64,
    pub task_id: i64,
    pub url: String,
    pub timestamp: u64,
    pub total_num: u64,
    pub total_response_content_length: u64,
    pub duration_map: HashMap<u64, u64>,
    pub status_map: HashMap<u16, u64>,
    pub error_map: HashMap<String, u64>,
    pub body_check_result_map: HashMap<String, u64>,
    pub latency_map: HashMap<String, f64>,
}

pub struct AnalyticsStore {
    client: Client,
    table_name: String,
}

impl AnalyticsStore {
    pub fn connect(config: &AnalyticsConfig) -> Self {
        let mut client = Client::default().with_url(
            config
                .addrs
                .first()
                .cloned()
                .unwrap_or_else(|| "http://127.0.0.1:8123".to_string()),
        );
        client = client.with_database(&config.database);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            client = client.with_user(user).with_password(pass);
        }
        Self {
            client,
            table_name: config.table_name.clone(),
        }
    }

    /// Writes one analytics row for an evicted window bucket, combining the
    /// drained `Aggregate` with its derived latency percentiles.
    pub async fn write_row(
        &self,
        aggregate: &Aggregate,
        url: &str,
        latency_map: HashMap<String, f64>,
    ) -> Result<(), RecordStoreError> {
        let row = AnalyticsRow {
            plan_id: aggregate.plan_id,
            task_id: aggregate.task_id,
            url: url.to_string(),
            timestamp: aggregate.timestamp,
            total_num: aggregate.total_num,
            total_response_content_length: aggregate.total_response_content_length,
            duration_map: aggregate.duration_map.clone(),
            status_map: aggregate.status_map.clone(),
            error_map: aggregate.error_map.clone(),
            body_check_result_map: aggregate.body_check_result_map.clone(),
            latency_map,
        };

        let mut insert = self
            .client
            .insert(&self.table_name)
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        insert
            .write(&row)
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))?;
        insert
            .end()
            .await
            .map_err(|e| RecordStoreError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LiveResult;

    #[test]
    fn analytics_row_carries_every_spec_column() {
        let mut aggregate = Aggregate::new(1, 2, 0, 1_700_000_000);
        aggregate.record(&LiveResult {
            timestamp: 1_700_000_000,
            duration_ms: 42,
            status_code: Some(200),
            response_length: 128,
            err_string: None,
            body_check_result: Some("ok".to_string()),
            stop: false,
        });

        let mut latency_map = HashMap::new();
        latency_map.insert("p50".to_string(), 42.0);

        let row = AnalyticsRow {
            plan_id: aggregate.plan_id,
            task_id: aggregate.task_id,
            url: "http://example.com".to_string(),
            timestamp: aggregate.timestamp,
            total_num: aggregate.total_num,
            total_response_content_length: aggregate.total_response_content_length,
            duration_map: aggregate.duration_map.clone(),
            status_map: aggregate.status_map.clone(),
            error_map: aggregate.error_map.clone(),
            body_check_result_map: aggregate.body_check_result_map.clone(),
            latency_map,
        };

        assert_eq!(row.total_num, 1);
        assert_eq!(row.status_map.get(&200), Some(&1));
        assert_eq!(row.latency_map.get("p50"), Some(&42.0));
    }
}

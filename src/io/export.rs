use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::TransactionEngine;
use crate::domain::{ServiceRequest, TransactionRecord, UserBalance};

/// Database snapshot for a full export
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub balances: Vec<UserBalance>,
    pub requests: Vec<ServiceRequest>,
    pub transactions: Vec<TransactionRecord>,
}

/// Exporter for converting exchange data to CSV or JSON
pub struct Exporter<'a> {
    engine: &'a TransactionEngine,
}

impl<'a> Exporter<'a> {
    pub fn new(engine: &'a TransactionEngine) -> Self {
        Self { engine }
    }

    /// Export transaction records to CSV, in sequence order
    pub async fn export_transactions_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let records = self.engine.list_transactions(None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "sequence",
            "recorded_at",
            "kind",
            "request_id",
            "from_user",
            "to_user",
            "amount",
            "operation_key",
        ])?;

        for record in &records {
            csv_writer.write_record([
                record.id.to_string(),
                record.sequence.to_string(),
                record.recorded_at.to_rfc3339(),
                record.kind.to_string(),
                record.request_id.map(|id| id.to_string()).unwrap_or_default(),
                record.from_user.map(|id| id.to_string()).unwrap_or_default(),
                record.to_user.to_string(),
                record.amount.to_string(),
                record.operation_key.clone(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(records.len())
    }

    /// Export stored balances to CSV
    pub async fn export_balances_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let balances = self.engine.list_balances().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["user_id", "available", "reserved", "version"])?;

        for balance in &balances {
            csv_writer.write_record([
                balance.user_id.to_string(),
                balance.available.to_string(),
                balance.reserved.to_string(),
                balance.version.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(balances.len())
    }

    /// Export requests (without history) to CSV
    pub async fn export_requests_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let requests = self.engine.list_requests(None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "requester_id",
            "provider_id",
            "service_type",
            "amount",
            "state",
            "created_at",
            "updated_at",
        ])?;

        for request in &requests {
            csv_writer.write_record([
                request.id.to_string(),
                request.requester_id.to_string(),
                request.provider_id.map(|id| id.to_string()).unwrap_or_default(),
                request.service_type.clone(),
                request.amount.to_string(),
                request.state.to_string(),
                request.created_at.to_rfc3339(),
                request.updated_at.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(requests.len())
    }

    /// Export everything as a JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<DatabaseSnapshot> {
        let snapshot = DatabaseSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            balances: self.engine.list_balances().await?,
            requests: self.engine.list_requests(None).await?,
            transactions: self.engine.list_transactions(None).await?,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}

//! Audit export of invoice events.
//!
//! Every format carries every field of [`InvoiceEvent`].

use std::fmt;
use std::str::FromStr;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use taxbridge_documents::InvoiceEvent;

use super::store::EventLogError;

/// CSV column headers, one per event field.
pub const CSV_HEADERS: [&str; 12] = [
    "id",
    "tenant_id",
    "document_id",
    "stream_version",
    "event_type",
    "previous_state",
    "new_state",
    "payload",
    "actor",
    "actor_type",
    "correlation_id",
    "occurred_at",
];

/// Export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    /// A single JSON array.
    #[default]
    Json,
    /// One JSON object per line.
    JsonLines,
    Csv,
}

impl AuditFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditFormat::Json => "json",
            AuditFormat::JsonLines => "jsonl",
            AuditFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AuditFormat::Json => "application/json",
            AuditFormat::JsonLines => "application/x-ndjson",
            AuditFormat::Csv => "text/csv",
        }
    }
}

impl fmt::Display for AuditFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditFormat {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(AuditFormat::Json),
            "jsonl" | "ndjson" | "json_lines" => Ok(AuditFormat::JsonLines),
            "csv" => Ok(AuditFormat::Csv),
            other => Err(EventLogError::Export(format!("unknown audit format: {other}"))),
        }
    }
}

/// Serialize `events` in the given format.
pub fn render(events: &[InvoiceEvent], format: AuditFormat) -> Result<String, EventLogError> {
    match format {
        AuditFormat::Json => serde_json::to_string_pretty(events).map_err(export_error),
        AuditFormat::JsonLines => {
            let mut out = String::new();
            for event in events {
                out.push_str(&serde_json::to_string(event).map_err(export_error)?);
                out.push('\n');
            }
            Ok(out)
        }
        AuditFormat::Csv => render_csv(events),
    }
}

fn render_csv(events: &[InvoiceEvent]) -> Result<String, EventLogError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADERS).map_err(export_error)?;

    for event in events {
        let id = event.id.to_string();
        let tenant_id = event.tenant_id.to_string();
        let document_id = event.document_id.to_string();
        let stream_version = event.stream_version.to_string();
        let payload = serde_json::to_string(&event.payload).map_err(export_error)?;
        let occurred_at = event.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        wtr.write_record([
            id.as_str(),
            tenant_id.as_str(),
            document_id.as_str(),
            stream_version.as_str(),
            event.event_type.as_str(),
            event.previous_state.map(|s| s.as_str()).unwrap_or(""),
            event.new_state.as_str(),
            payload.as_str(),
            event.actor.as_str(),
            event.actor_type.as_str(),
            event.correlation_id.as_deref().unwrap_or(""),
            occurred_at.as_str(),
        ])
        .map_err(export_error)?;
    }

    let bytes = wtr.into_inner().map_err(export_error)?;
    String::from_utf8(bytes).map_err(export_error)
}

fn export_error(err: impl fmt::Display) -> EventLogError {
    EventLogError::Export(err.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use taxbridge_core::{DocumentId, EventId, TenantId};
    use taxbridge_documents::{ActorType, DocumentState, InvoiceEventType};

    use super::*;

    fn events() -> Vec<InvoiceEvent> {
        let tenant_id = TenantId::new();
        let document_id = DocumentId::new();
        vec![
            InvoiceEvent {
                id: EventId::new(),
                tenant_id,
                document_id,
                stream_version: 1,
                event_type: InvoiceEventType::DocumentCreated,
                previous_state: None,
                new_state: DocumentState::Draft,
                payload: json!({"number": "INV-1, rev \"a\""}),
                actor: "alice".to_string(),
                actor_type: ActorType::User,
                correlation_id: None,
                occurred_at: Utc::now(),
            },
            InvoiceEvent {
                id: EventId::new(),
                tenant_id,
                document_id,
                stream_version: 2,
                event_type: InvoiceEventType::DocumentValidated,
                previous_state: Some(DocumentState::Draft),
                new_state: DocumentState::Validated,
                payload: json!({}),
                actor: "validator".to_string(),
                actor_type: ActorType::System,
                correlation_id: Some("req-9".to_string()),
                occurred_at: Utc::now(),
            },
        ]
    }

    #[test]
    fn csv_has_a_column_per_field_and_quotes_payload() {
        let events = events();
        let out = render(&events, AuditFormat::Csv).unwrap();

        let mut rdr = csv::Reader::from_reader(out.as_bytes());
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers.len(), CSV_HEADERS.len());

        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], events[0].id.to_string());
        assert_eq!(&rows[0][5], "");
        assert_eq!(&rows[1][5], "DRAFT");
        assert_eq!(&rows[1][10], "req-9");

        let payload: serde_json::Value = serde_json::from_str(&rows[0][7]).unwrap();
        assert_eq!(payload, events[0].payload);
    }

    #[test]
    fn json_lines_round_trip_every_field() {
        let events = events();
        let out = render(&events, AuditFormat::JsonLines).unwrap();
        let parsed: Vec<InvoiceEvent> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, events);
    }

    #[test]
    fn json_is_an_array() {
        let out = render(&events(), AuditFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(render(&[], AuditFormat::Json).unwrap(), "[]");
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("CSV".parse::<AuditFormat>().unwrap(), AuditFormat::Csv);
        assert_eq!("ndjson".parse::<AuditFormat>().unwrap(), AuditFormat::JsonLines);
        assert!("xml".parse::<AuditFormat>().is_err());
    }
}

// Reversal statements
//
// Each captured record maps to exactly one structured command that undoes
// it. Drivers consume the commands; only the replay script turns them
// into text.

use std::fmt::Write as _;

use serde_json::Value;

use crate::changelog::{LogRecord, Row, RowOp};
use crate::config::catalog::SequenceState;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum InverseCommand {
    /// Undo an INSERT.
    DeleteRow { key: String },
    /// Undo a DELETE by putting the before-image back.
    InsertRow { key: String, row: Row },
    /// Undo an UPDATE by overwriting with the before-image.
    RestoreRow { key: String, row: Row },
}

impl InverseCommand {
    pub fn for_record(record: &LogRecord) -> EngineResult<Self> {
        let before = || {
            record.before.clone().ok_or_else(|| {
                EngineError::Internal(format!(
                    "log record {} of '{}' has no before-image",
                    record.seq, record.relation
                ))
            })
        };
        Ok(match record.op {
            RowOp::Insert => InverseCommand::DeleteRow {
                key: record.key.clone(),
            },
            RowOp::Delete => InverseCommand::InsertRow {
                key: record.key.clone(),
                row: before()?,
            },
            RowOp::Update => InverseCommand::RestoreRow {
                key: record.key.clone(),
                row: before()?,
            },
        })
    }

    pub fn key(&self) -> &str {
        match self {
            InverseCommand::DeleteRow { key }
            | InverseCommand::InsertRow { key, .. }
            | InverseCommand::RestoreRow { key, .. } => key,
        }
    }

    /// Commands undoing `records`, newest record first.
    pub fn unwind(records: &[LogRecord]) -> EngineResult<Vec<Self>> {
        let mut ordered: Vec<&LogRecord> = records.iter().collect();
        ordered.sort_by(|a, b| b.seq.cmp(&a.seq));
        ordered.into_iter().map(Self::for_record).collect()
    }

    /// SQL text of the command, for replay scripts.
    pub fn to_sql(&self, relation: &str, key_column: &str) -> String {
        match self {
            InverseCommand::DeleteRow { key } => format!(
                "DELETE FROM {} WHERE {} = {};",
                relation,
                key_column,
                quote(key)
            ),
            InverseCommand::InsertRow { row, .. } => {
                let columns: Vec<&str> = row.keys().map(String::as_str).collect();
                let values: Vec<String> = row.values().map(literal).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({});",
                    relation,
                    columns.join(", "),
                    values.join(", ")
                )
            }
            InverseCommand::RestoreRow { key, row } => {
                let mut assignments = String::new();
                for (i, (column, value)) in row.iter().enumerate() {
                    if i > 0 {
                        assignments.push_str(", ");
                    }
                    let _ = write!(assignments, "{} = {}", column, literal(value));
                }
                format!(
                    "UPDATE {} SET {} WHERE {} = {};",
                    relation,
                    assignments,
                    key_column,
                    quote(key)
                )
            }
        }
    }
}

pub fn sequence_reset_sql(sequence: &str, state: &SequenceState) -> String {
    format!(
        "SELECT setval({}, {}, {});",
        quote(sequence),
        state.last_value,
        state.is_called
    )
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn record(seq: u64, op: RowOp, before: Option<Row>, after: Option<Row>) -> LogRecord {
        LogRecord {
            seq,
            relation: "public.orders".into(),
            op,
            key: "7".into(),
            before,
            after,
            at: Local::now(),
        }
    }

    #[test]
    fn unwind_is_newest_first() {
        let records = vec![
            record(3, RowOp::Insert, None, Some(row(json!({"id": 7, "qty": 1})))),
            record(
                5,
                RowOp::Update,
                Some(row(json!({"id": 7, "qty": 1}))),
                Some(row(json!({"id": 7, "qty": 2}))),
            ),
            record(
                9,
                RowOp::Update,
                Some(row(json!({"id": 7, "qty": 2}))),
                Some(row(json!({"id": 7, "qty": 3}))),
            ),
        ];

        let commands = InverseCommand::unwind(&records).unwrap();

        assert_eq!(
            commands,
            vec![
                InverseCommand::RestoreRow {
                    key: "7".into(),
                    row: row(json!({"id": 7, "qty": 2}))
                },
                InverseCommand::RestoreRow {
                    key: "7".into(),
                    row: row(json!({"id": 7, "qty": 1}))
                },
                InverseCommand::DeleteRow { key: "7".into() },
            ]
        );
    }

    #[test]
    fn delete_without_before_image_is_internal() {
        let err = InverseCommand::for_record(&record(1, RowOp::Delete, None, None)).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn sql_rendering_quotes_text() {
        let cmd = InverseCommand::InsertRow {
            key: "7".into(),
            row: row(json!({"id": 7, "label": "o'brien", "gift": false, "note": null})),
        };
        assert_eq!(
            cmd.to_sql("public.orders", "id"),
            "INSERT INTO public.orders (gift, id, label, note) VALUES (FALSE, 7, 'o''brien', NULL);"
        );
        assert_eq!(
            InverseCommand::DeleteRow { key: "7".into() }.to_sql("public.orders", "id"),
            "DELETE FROM public.orders WHERE id = '7';"
        );
        assert_eq!(
            sequence_reset_sql(
                "public.orders_id_seq",
                &SequenceState {
                    last_value: 41,
                    is_called: true
                }
            ),
            "SELECT setval('public.orders_id_seq', 41, true);"
        );
    }
}

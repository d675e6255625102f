//! Derived events published after enrichment

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind tag carried by every derived event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivedEventKind {
    MetricComputed,
}

/// Emitted once per successful enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedEvent {
    pub note_id: String,
    pub derived_metric: i64,
    pub kind: DerivedEventKind,
}

impl DerivedEvent {
    pub fn metric_computed(note_id: impl Into<String>, derived_metric: i64) -> Self {
        Self {
            note_id: note_id.into(),
            derived_metric,
            kind: DerivedEventKind::MetricComputed,
        }
    }

    /// Field map the routing predicates are evaluated against
    pub fn fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_use_wire_names() {
        let event = DerivedEvent::metric_computed("n1", 3);
        let fields = event.fields();
        assert_eq!(fields["noteId"], "n1");
        assert_eq!(fields["derivedMetric"], 3);
        assert_eq!(fields["kind"], "metricComputed");
    }
}

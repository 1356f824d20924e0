use serde::Deserialize;

/// Body of `POST /api/runs/{id}/stream`.
///
/// Every field is optional: a fresh run needs `query`, a resumed one may
/// send nothing or extra `data`/`options` to merge in.
#[derive(Debug, Default, Deserialize)]
pub struct StreamRunBody {
    #[serde(default)]
    pub query: Option<String>,
    /// Workflow to build for a fresh run; ignored when the run exists.
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    /// Caller's id for the item this execution renders into.
    #[serde(default)]
    pub thread_item_id: Option<String>,
}

impl StreamRunBody {
    /// The engine payload: `query`, `data` and `options`, when present.
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        if let Some(query) = &self.query {
            payload.insert("query".into(), serde_json::Value::String(query.clone()));
        }
        if let Some(data) = &self.data {
            payload.insert("data".into(), data.clone());
        }
        if let Some(options) = &self.options {
            payload.insert("options".into(), options.clone());
        }
        serde_json::Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_keeps_present_fields() {
        let body: StreamRunBody = serde_json::from_value(json!({
            "query": "what is a lane?",
            "options": {"max_loop_iterations": 2},
            "thread_item_id": "item-7"
        }))
        .unwrap();

        assert_eq!(
            body.payload(),
            json!({"query": "what is a lane?", "options": {"max_loop_iterations": 2}})
        );
        assert_eq!(body.thread_item_id.as_deref(), Some("item-7"));
    }

    #[test]
    fn test_empty_body() {
        let body: StreamRunBody = serde_json::from_value(json!({})).unwrap();
        assert_eq!(body.payload(), json!({}));
        assert!(body.workflow.is_none());
    }
}

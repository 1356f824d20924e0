use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::host::{RunStream, StreamItem};

/// Render one stream item as a named SSE frame.
///
/// The frame name is the event kind; the data is the event payload with the
/// correlation fields `run_id`, `thread_item_id`, `seq` and `node_id` merged
/// on top. A frame that cannot be rendered degrades to a minimal `error`
/// frame so the consumer still learns the run ended badly.
pub fn render_frame(item: &StreamItem) -> SseEvent {
    match render(item) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(run_id = %item.run_id, kind = %item.event.kind, error = %e, "Failed to render event");
            let data = json!({
                "run_id": item.run_id,
                "thread_item_id": item.thread_item_id,
                "seq": item.event.seq,
                "error": "event could not be rendered",
            });
            SseEvent::default().event("error").data(data.to_string())
        }
    }
}

fn render(item: &StreamItem) -> Result<SseEvent, axum::Error> {
    let mut data = match &item.event.payload {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    };
    data.insert("run_id".into(), json!(item.run_id));
    data.insert("thread_item_id".into(), json!(item.thread_item_id));
    data.insert("seq".into(), json!(item.event.seq));
    data.insert("node_id".into(), json!(item.event.node_id));
    data.insert("timestamp".into(), json!(item.event.timestamp));

    SseEvent::default()
        .event(item.event.kind.as_str())
        .id(item.event.seq.to_string())
        .json_data(serde_json::Value::Object(data))
}

/// Turn a run stream into an SSE response with a keep-alive comment frame
/// every `heartbeat_secs`.
pub fn sse_response(
    stream: RunStream,
    heartbeat_secs: u64,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let frames = ReceiverStream::new(stream).map(|item| Ok(render_frame(&item)));
    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat_secs.max(1)))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use chrono::Utc;
    use delve_core::types::{Event, EventKind, RunId};

    fn item(kind: EventKind, node_id: Option<&str>, payload: serde_json::Value) -> StreamItem {
        StreamItem {
            run_id: RunId::from_string("run-1"),
            thread_item_id: "item-1".into(),
            event: Event {
                kind,
                seq: 4,
                node_id: node_id.map(str::to_string),
                payload,
                timestamp: Utc::now(),
            },
        }
    }

    async fn body_of(items: Vec<StreamItem>) -> String {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        for i in items {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        let response = sse_response(rx, 15).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_frame_is_named_and_correlated() {
        let body = body_of(vec![item(
            EventKind::NodeUpdated,
            Some("searcher"),
            json!({"output": "found it", "iteration": 1}),
        )])
        .await;

        assert!(body.contains("event: node_updated\n"));
        let data_line = body
            .lines()
            .find(|l| l.starts_with("data: "))
            .unwrap()
            .trim_start_matches("data: ");
        let data: serde_json::Value = serde_json::from_str(data_line).unwrap();
        assert_eq!(data["output"], "found it");
        assert_eq!(data["run_id"], "run-1");
        assert_eq!(data["thread_item_id"], "item-1");
        assert_eq!(data["seq"], 4);
        assert_eq!(data["node_id"], "searcher");
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let body = body_of(vec![
            item(EventKind::RunStarted, None, json!({})),
            item(EventKind::Completed, None, json!({"status": "completed"})),
        ])
        .await;
        let started = body.find("event: run_started").unwrap();
        let completed = body.find("event: completed").unwrap();
        assert!(started < completed);
    }

    #[tokio::test]
    async fn test_scalar_payload_is_wrapped() {
        let body = body_of(vec![item(EventKind::Error, None, json!("boom"))]).await;
        assert!(body.contains("event: error\n"));
        assert!(body.contains("\"value\":\"boom\""));
        assert!(body.contains("\"node_id\":null"));
    }
}

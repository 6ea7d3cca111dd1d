//! Publish boundary: `POST /push/all` and `POST /push/room`.
//!
//! Both take a form-encoded body whose `items` field is a JSON array of
//! message fragments. Items are handed to the merge layer one by one and the
//! request returns immediately; delivery is asynchronous and best-effort.
//! A saturated merge queue drops the item but still answers `200 OK`.

use axum::Form;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::merge::MergeLayer;
use crate::server::ServiceState;

/// Form body of `POST /push/all`.
#[derive(Debug, Default, Deserialize)]
pub struct PushAllForm {
    /// JSON array of fragments.
    #[serde(default)]
    pub items: Option<String>,
}

/// Form body of `POST /push/room`.
#[derive(Debug, Default, Deserialize)]
pub struct PushRoomForm {
    /// Target room.
    #[serde(default)]
    pub room: Option<String>,
    /// JSON array of fragments.
    #[serde(default)]
    pub items: Option<String>,
}

fn parse_items(items: Option<&str>) -> Option<Vec<Box<RawValue>>> {
    serde_json::from_str(items?).ok()
}

/// POST /push/all
pub async fn push_all(State(state): State<ServiceState>, Form(form): Form<PushAllForm>) -> StatusCode {
    let Some(items) = parse_items(form.items.as_deref()) else {
        debug!("push/all rejected: items is not a JSON array");
        return StatusCode::BAD_REQUEST;
    };
    forward(&state.merge, None, items);
    StatusCode::OK
}

/// POST /push/room
pub async fn push_room(State(state): State<ServiceState>, Form(form): Form<PushRoomForm>) -> StatusCode {
    let Some(room) = form.room.filter(|r| !r.is_empty()) else {
        debug!("push/room rejected: missing room");
        return StatusCode::BAD_REQUEST;
    };
    let Some(items) = parse_items(form.items.as_deref()) else {
        debug!(room, "push/room rejected: items is not a JSON array");
        return StatusCode::BAD_REQUEST;
    };
    forward(&state.merge, Some(&room), items);
    StatusCode::OK
}

fn forward(merge: &MergeLayer, room: Option<&str>, items: Vec<Box<RawValue>>) {
    let total = items.len();
    let mut dropped = 0usize;
    for item in items {
        let result = match room {
            Some(room) => merge.push_room(room, item),
            None => merge.push_all(item),
        };
        if result.is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(room, total, dropped, "merge queue saturated, dropped publish items");
    } else {
        debug!(room, total, "publish accepted");
    }
}

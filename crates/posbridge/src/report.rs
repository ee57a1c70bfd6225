// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Position report decoding and rewriting.
//!
//! Reports are JSON objects from several tag vendors. Coordinates may sit in
//! one of five places; everything else in the object is carried through to
//! the outbound report untouched.

use crate::transform::TransformedPoint;
use serde_json::{Map, Value};
use std::time::SystemTime;
use thiserror::Error;

/// Report decoding errors. All of them count as malformed input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Report is not a JSON object")]
    NotAnObject,

    #[error("No coordinate fields found")]
    MissingCoordinates,

    #[error("Coordinate {0} is missing or not a number")]
    BadCoordinate(&'static str),
}

/// Where in the report the coordinates were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateLocation {
    /// `data.coordinates.{x,y,z}`
    DataCoordinates,
    /// `coordinates.{x,y,z}`
    Coordinates,
    /// `{x,y,z}` at the top level
    Flat,
    /// `posX`/`posY`/`posZ` at the top level
    PosFields,
    /// `position.{x,y,z}`
    Position,
}

impl CoordinateLocation {
    fn keys(self) -> [&'static str; 3] {
        match self {
            Self::PosFields => ["posX", "posY", "posZ"],
            _ => ["x", "y", "z"],
        }
    }

    fn container<'a>(self, body: &'a Map<String, Value>) -> Option<&'a Map<String, Value>> {
        match self {
            Self::DataCoordinates => body
                .get("data")
                .and_then(Value::as_object)
                .and_then(|data| data.get("coordinates"))
                .and_then(Value::as_object),
            Self::Coordinates => body.get("coordinates").and_then(Value::as_object),
            Self::Position => body.get("position").and_then(Value::as_object),
            Self::Flat | Self::PosFields => Some(body),
        }
    }

    fn container_mut<'a>(self, body: &'a mut Map<String, Value>) -> Option<&'a mut Map<String, Value>> {
        match self {
            Self::DataCoordinates => body
                .get_mut("data")
                .and_then(Value::as_object_mut)
                .and_then(|data| data.get_mut("coordinates"))
                .and_then(Value::as_object_mut),
            Self::Coordinates => body.get_mut("coordinates").and_then(Value::as_object_mut),
            Self::Position => body.get_mut("position").and_then(Value::as_object_mut),
            Self::Flat | Self::PosFields => Some(body),
        }
    }

    /// Does this location claim the report?
    fn matches(self, body: &Map<String, Value>) -> bool {
        match self {
            Self::Flat => body.contains_key("x") && body.contains_key("y"),
            Self::PosFields => body.contains_key("posX") && body.contains_key("posY"),
            _ => self.container(body).is_some(),
        }
    }
}

const SEARCH_ORDER: [CoordinateLocation; 5] = [
    CoordinateLocation::DataCoordinates,
    CoordinateLocation::Coordinates,
    CoordinateLocation::Flat,
    CoordinateLocation::PosFields,
    CoordinateLocation::Position,
];

/// Decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Value),
    Batch(Vec<Value>),
}

/// Decode a payload as one report or an array of reports.
///
/// Elements are not inspected here; each is decoded on its own later.
pub fn parse_payload(payload: &[u8]) -> Result<Payload, ReportError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ReportError::InvalidJson(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(Payload::Batch(items)),
        Value::Object(_) => Ok(Payload::Single(value)),
        _ => Err(ReportError::NotAnObject),
    }
}

/// Locate the coordinates of a report, first match wins.
pub fn locate_coordinates(
    body: &Map<String, Value>,
) -> Result<(CoordinateLocation, f64, f64, Option<f64>), ReportError> {
    let location = SEARCH_ORDER
        .into_iter()
        .find(|loc| loc.matches(body))
        .ok_or(ReportError::MissingCoordinates)?;
    let container = location
        .container(body)
        .ok_or(ReportError::MissingCoordinates)?;
    let [kx, ky, kz] = location.keys();

    let x = container
        .get(kx)
        .and_then(Value::as_f64)
        .ok_or(ReportError::BadCoordinate("x"))?;
    let y = container
        .get(ky)
        .and_then(Value::as_f64)
        .ok_or(ReportError::BadCoordinate("y"))?;
    let z = match container.get(kz) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_f64().ok_or(ReportError::BadCoordinate("z"))?),
    };

    Ok((location, x, y, z))
}

/// Resolve the tag identifier of a report.
///
/// Falls back to the last non-empty topic segment, then to `unknown`.
pub fn resolve_tag_id(body: &Map<String, Value>, topic: &str) -> String {
    let nested = body.get("tagData").and_then(|tag| tag.get("tagId"));
    let candidates = [body.get("tagId"), body.get("tag_id"), nested, body.get("id")];

    for candidate in candidates.into_iter().flatten() {
        match candidate {
            Value::String(s) if !s.is_empty() => return s.clone(),
            Value::Number(n) => return n.to_string(),
            _ => {}
        }
    }

    match topic.rsplit('/').next() {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => "unknown".to_string(),
    }
}

/// A decoded inbound report.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub tag_id: String,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub location: CoordinateLocation,
    pub body: Map<String, Value>,
    pub received_at: SystemTime,
}

impl PositionReport {
    /// Decode one report object.
    pub fn from_value(value: Value, topic: &str) -> Result<Self, ReportError> {
        let Value::Object(body) = value else {
            return Err(ReportError::NotAnObject);
        };
        let (location, x, y, z) = locate_coordinates(&body)?;
        let tag_id = resolve_tag_id(&body, topic);
        Ok(Self {
            tag_id,
            x,
            y,
            z,
            location,
            body,
            received_at: SystemTime::now(),
        })
    }

    /// Produce the outbound object.
    ///
    /// Coordinates are rewritten where they were found, the frame metadata
    /// is injected, and `strip` keys are removed at the top level and inside
    /// `data`.
    pub fn into_transformed(
        self,
        point: &TransformedPoint,
        strip: &[String],
        processed_at_ms: u64,
    ) -> Value {
        let mut body = self.body;
        let [kx, ky, kz] = self.location.keys();

        if let Some(container) = self.location.container_mut(&mut body) {
            container.insert(kx.to_string(), number(point.x));
            container.insert(ky.to_string(), number(point.y));
            if let Some(z) = point.z {
                container.insert(kz.to_string(), number(z));
            }
        }

        for key in strip {
            body.remove(key);
            if let Some(data) = body.get_mut("data").and_then(Value::as_object_mut) {
                data.remove(key);
            }
        }

        body.insert("frame_id".into(), Value::String(point.frame_id.clone()));
        body.insert(
            "output_unit".into(),
            Value::String(point.output_unit.as_str().to_string()),
        );
        body.insert("processed_at_ms".into(), Value::from(processed_at_ms));

        Value::Object(body)
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

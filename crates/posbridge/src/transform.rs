// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Floorplan coordinate transform.
//!
//! Positions arrive in the positioning system's frame (millimetres) and are
//! projected onto a floorplan with one homogeneous 3x3 matrix:
//!
//! ```text
//! M = S(scale, flips) * R(-rotation) * T(-origin)
//! ```
//!
//! `M` maps into "scaled space" (floorplan pixels); the configured
//! [`OutputUnit`] decides how that is reported. The matrix and its inverse are
//! derived once per parameter set and swapped together, so readers on the
//! message path never see a matrix from one parameter set paired with the
//! inverse or unit of another.

use nalgebra::{Matrix3, Vector3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transform errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("Invalid scale {0}: must be finite and non-zero")]
    InvalidScale(f64),

    #[error("Invalid transform parameter: {0}")]
    InvalidParameter(String),

    #[error("Transform matrix is not invertible")]
    NonInvertible,

    #[error("Transform produced a non-finite coordinate")]
    NonFinite,
}

/// Unit of the coordinates written to outbound reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputUnit {
    #[default]
    #[serde(alias = "metres", alias = "m")]
    Meters,
    #[serde(alias = "mm")]
    Millimeters,
    #[serde(alias = "px")]
    Pixels,
}

impl OutputUnit {
    /// Canonical name, as written into outbound reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Meters => "meters",
            Self::Millimeters => "millimeters",
            Self::Pixels => "pixels",
        }
    }

    fn from_scaled(self, value: f64, scale: f64) -> f64 {
        match self {
            Self::Meters => value / scale / 1000.0,
            Self::Millimeters => value / scale,
            Self::Pixels => value,
        }
    }

    fn to_scaled(self, value: f64, scale: f64) -> f64 {
        match self {
            Self::Meters => value * 1000.0 * scale,
            Self::Millimeters => value * scale,
            Self::Pixels => value,
        }
    }

    /// Heights are not part of the planar transform; only the unit changes.
    fn convert_height(self, z: f64, scale: f64) -> f64 {
        match self {
            Self::Meters => z / 1000.0,
            Self::Millimeters => z,
            Self::Pixels => z * scale,
        }
    }
}

impl fmt::Display for OutputUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputUnit {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "meters" | "metres" | "m" => Ok(Self::Meters),
            "millimeters" | "mm" => Ok(Self::Millimeters),
            "pixels" | "px" => Ok(Self::Pixels),
            other => Err(TransformError::InvalidParameter(format!(
                "unknown output unit '{}'",
                other
            ))),
        }
    }
}

fn default_frame_id() -> String {
    "floorplan_pixel_frame".to_string()
}

/// Transform parameters. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TransformDocument")]
pub struct TransformParameters {
    /// X of the floorplan origin in the source frame (mm).
    pub origin_x: f64,

    /// Y of the floorplan origin in the source frame (mm).
    pub origin_y: f64,

    /// Floorplan units per source unit (px/mm).
    pub scale: f64,

    /// Rotation of the source frame (radians, counter-clockwise).
    pub rotation: f64,

    /// Source X axis opposes floorplan X axis.
    pub x_flipped: bool,

    /// Source Y axis opposes floorplan Y axis.
    pub y_flipped: bool,

    /// Frame identifier written into outbound reports.
    pub frame_id: String,

    /// Unit of outbound coordinates.
    pub output_unit: OutputUnit,
}

impl Default for TransformParameters {
    fn default() -> Self {
        Self {
            origin_x: 0.0,
            origin_y: 0.0,
            scale: 1.0,
            rotation: 0.0,
            x_flipped: false,
            y_flipped: false,
            frame_id: default_frame_id(),
            output_unit: OutputUnit::Meters,
        }
    }
}

impl TransformParameters {
    /// Create parameters with no axis flips and metre output.
    pub fn new(origin_x: f64, origin_y: f64, scale: f64, rotation: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            scale,
            rotation,
            ..Default::default()
        }
    }

    /// Set axis flips.
    pub fn flipped(mut self, x_flipped: bool, y_flipped: bool) -> Self {
        self.x_flipped = x_flipped;
        self.y_flipped = y_flipped;
        self
    }

    /// Set the output unit.
    pub fn with_output_unit(mut self, unit: OutputUnit) -> Self {
        self.output_unit = unit;
        self
    }

    /// Set the frame identifier.
    pub fn with_frame_id(mut self, frame_id: impl Into<String>) -> Self {
        self.frame_id = frame_id.into();
        self
    }

    /// Parse a full replacement document (JSON object).
    pub fn from_document(doc: &serde_json::Value) -> Result<Self, TransformError> {
        TransformParameters::deserialize(doc)
            .map_err(|e| TransformError::InvalidParameter(e.to_string()))
    }

    /// Check the parameters describe an invertible transform.
    pub fn validate(&self) -> Result<(), TransformError> {
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(TransformError::InvalidScale(self.scale));
        }
        for (name, value) in [
            ("origin_x", self.origin_x),
            ("origin_y", self.origin_y),
            ("rotation", self.rotation),
        ] {
            if !value.is_finite() {
                return Err(TransformError::InvalidParameter(format!(
                    "{} must be finite (got {})",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Forward matrix: scale/flip * rotate(-rotation) * translate(-origin).
    pub fn matrix(&self) -> Matrix3<f64> {
        let translate = Matrix3::new(
            1.0, 0.0, -self.origin_x, //
            0.0, 1.0, -self.origin_y, //
            0.0, 0.0, 1.0,
        );

        let (s, c) = (-self.rotation).sin_cos();
        let rotate = Matrix3::new(
            c, -s, 0.0, //
            s, c, 0.0, //
            0.0, 0.0, 1.0,
        );

        let sx = if self.x_flipped { -self.scale } else { self.scale };
        let sy = if self.y_flipped { -self.scale } else { self.scale };
        let scale = Matrix3::new(
            sx, 0.0, 0.0, //
            0.0, sy, 0.0, //
            0.0, 0.0, 1.0,
        );

        scale * rotate * translate
    }
}

/// Wire form of [`TransformParameters`], accepting the legacy field spellings.
#[derive(Debug, Default, Deserialize)]
struct TransformDocument {
    origin_x: Option<f64>,
    origin_y: Option<f64>,
    scale: Option<f64>,
    rotation: Option<f64>,
    rotation_rad: Option<f64>,
    rotation_deg: Option<f64>,
    x_flipped: Option<bool>,
    y_flipped: Option<bool>,
    x_flip: Option<i64>,
    y_flip: Option<i64>,
    frame_id: Option<String>,
    output_unit: Option<OutputUnit>,
    output_units: Option<OutputUnit>,
}

impl TryFrom<TransformDocument> for TransformParameters {
    type Error = TransformError;

    fn try_from(doc: TransformDocument) -> Result<Self, Self::Error> {
        let required = |value: Option<f64>, name: &str| {
            value.ok_or_else(|| TransformError::InvalidParameter(format!("missing {}", name)))
        };

        let rotation = match (doc.rotation, doc.rotation_rad, doc.rotation_deg) {
            (None, None, None) => 0.0,
            (Some(rad), None, None) | (None, Some(rad), None) => rad,
            (None, None, Some(deg)) => deg.to_radians(),
            _ => {
                return Err(TransformError::InvalidParameter(
                    "rotation given more than once (rotation/rotation_rad/rotation_deg)".into(),
                ))
            }
        };

        let flip = |flag: Option<bool>, legacy: Option<i64>, name: &str| match (flag, legacy) {
            (Some(_), Some(_)) => Err(TransformError::InvalidParameter(format!(
                "{0}_flipped and {0}_flip both given",
                name
            ))),
            (Some(flag), None) => Ok(flag),
            (None, Some(sign)) => Ok(sign < 0),
            (None, None) => Ok(false),
        };

        let output_unit = match (doc.output_unit, doc.output_units) {
            (Some(_), Some(_)) => {
                return Err(TransformError::InvalidParameter(
                    "output_unit and output_units both given".into(),
                ))
            }
            (Some(unit), None) | (None, Some(unit)) => unit,
            (None, None) => OutputUnit::Meters,
        };

        Ok(Self {
            origin_x: required(doc.origin_x, "origin_x")?,
            origin_y: required(doc.origin_y, "origin_y")?,
            scale: required(doc.scale, "scale")?,
            rotation,
            x_flipped: flip(doc.x_flipped, doc.x_flip, "x")?,
            y_flipped: flip(doc.y_flipped, doc.y_flip, "y")?,
            frame_id: doc.frame_id.unwrap_or_else(default_frame_id),
            output_unit,
        })
    }
}

/// A transformed position, with the frame it was transformed into.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedPoint {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub frame_id: String,
    pub output_unit: OutputUnit,
}

#[derive(Debug, Clone)]
struct TransformState {
    params: TransformParameters,
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
    generation: u64,
}

impl TransformState {
    fn derive(params: TransformParameters, generation: u64) -> Result<Self, TransformError> {
        params.validate()?;
        let matrix = params.matrix();
        let inverse = matrix.try_inverse().ok_or(TransformError::NonInvertible)?;
        Ok(Self {
            params,
            matrix,
            inverse,
            generation,
        })
    }

    fn forward(&self, x: f64, y: f64) -> Result<(f64, f64), TransformError> {
        let scaled = self.matrix * Vector3::new(x, y, 1.0);
        let unit = self.params.output_unit;
        finite_pair(
            unit.from_scaled(scaled.x, self.params.scale),
            unit.from_scaled(scaled.y, self.params.scale),
        )
    }

    fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), TransformError> {
        let unit = self.params.output_unit;
        let scaled = Vector3::new(
            unit.to_scaled(x, self.params.scale),
            unit.to_scaled(y, self.params.scale),
            1.0,
        );
        let source = self.inverse * scaled;
        finite_pair(source.x, source.y)
    }
}

fn finite_pair(x: f64, y: f64) -> Result<(f64, f64), TransformError> {
    if x.is_finite() && y.is_finite() {
        Ok((x, y))
    } else {
        Err(TransformError::NonFinite)
    }
}

/// Shared transform engine.
///
/// Many delivery contexts call [`forward`](Self::forward) concurrently; a
/// configuration listener occasionally calls [`replace`](Self::replace). The
/// replacement state is derived before the write lock is taken, so the
/// exclusive section is a single move.
#[derive(Debug)]
pub struct TransformEngine {
    state: RwLock<TransformState>,
}

impl TransformEngine {
    /// Create an engine, validating the initial parameters.
    pub fn new(params: TransformParameters) -> Result<Self, TransformError> {
        Ok(Self {
            state: RwLock::new(TransformState::derive(params, 0)?),
        })
    }

    /// Source frame (mm) to output frame.
    pub fn forward(&self, x: f64, y: f64) -> Result<(f64, f64), TransformError> {
        self.state.read().forward(x, y)
    }

    /// Output frame back to source frame (mm).
    pub fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64), TransformError> {
        self.state.read().inverse(x, y)
    }

    /// Transform a full position under a single parameter set.
    pub fn forward_point(
        &self,
        x: f64,
        y: f64,
        z: Option<f64>,
    ) -> Result<TransformedPoint, TransformError> {
        let state = self.state.read();
        let (x, y) = state.forward(x, y)?;
        let unit = state.params.output_unit;
        let z = match z {
            Some(z) => {
                let z = unit.convert_height(z, state.params.scale);
                if !z.is_finite() {
                    return Err(TransformError::NonFinite);
                }
                Some(z)
            }
            None => None,
        };
        Ok(TransformedPoint {
            x,
            y,
            z,
            frame_id: state.params.frame_id.clone(),
            output_unit: unit,
        })
    }

    /// Atomically replace the parameters.
    ///
    /// Invalid parameters are rejected and the current ones stay in force.
    /// Returns the new generation number.
    pub fn replace(&self, params: TransformParameters) -> Result<u64, TransformError> {
        let mut next = TransformState::derive(params, 0)?;
        let mut state = self.state.write();
        next.generation = state.generation + 1;
        *state = next;
        Ok(state.generation)
    }

    /// Current parameters.
    pub fn parameters(&self) -> TransformParameters {
        self.state.read().params.clone()
    }

    /// Current forward matrix.
    pub fn matrix(&self) -> Matrix3<f64> {
        self.state.read().matrix
    }

    /// Current cached inverse matrix.
    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        self.state.read().inverse
    }

    /// Number of successful replacements since construction.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }
}

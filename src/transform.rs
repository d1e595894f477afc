//! Rigid transformations between stack, slice and template space.

use std::fmt;
use std::path::Path;

use nalgebra::{Matrix4, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ReconstructionError, Result};

/// Six-parameter rigid pose: translation in millimetres and Euler rotation in
/// degrees, applied as `R_z * R_y * R_x` followed by the translation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub translation: [f32; 3],
    pub rotation: [f32; 3],
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        translation: [0.0; 3],
        rotation: [0.0; 3],
    };

    pub fn new(translation: [f32; 3], rotation: [f32; 3]) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_params(params: [f32; 6]) -> Self {
        Self::new(
            [params[0], params[1], params[2]],
            [params[3], params[4], params[5]],
        )
    }

    pub fn params(&self) -> [f32; 6] {
        let [tx, ty, tz] = self.translation;
        let [rx, ry, rz] = self.rotation;
        [tx, ty, tz, rx, ry, rz]
    }

    pub fn is_identity(&self) -> bool {
        self.params().iter().all(|p| *p == 0.0)
    }

    fn rotation(&self) -> Rotation3<f32> {
        let [rx, ry, rz] = self.rotation;
        Rotation3::from_euler_angles(rx.to_radians(), ry.to_radians(), rz.to_radians())
    }

    pub fn matrix(&self) -> Matrix4<f32> {
        let mut m = self.rotation().to_homogeneous();
        let [tx, ty, tz] = self.translation;
        m[(0, 3)] = tx;
        m[(1, 3)] = ty;
        m[(2, 3)] = tz;
        m
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation().inverse();
        let translation = -(rotation * Vector3::from(self.translation));
        let (rx, ry, rz) = rotation.euler_angles();
        Self::new(
            [translation.x, translation.y, translation.z],
            [rx.to_degrees(), ry.to_degrees(), rz.to_degrees()],
        )
    }

    /// Rigid part of a homogeneous matrix.
    pub fn from_matrix(m: &Matrix4<f32>) -> Self {
        let rotation = Rotation3::from_matrix(&m.fixed_view::<3, 3>(0, 0).into_owned());
        let (rx, ry, rz) = rotation.euler_angles();
        Self::new(
            [m[(0, 3)], m[(1, 3)], m[(2, 3)]],
            [rx.to_degrees(), ry.to_degrees(), rz.to_degrees()],
        )
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Self) -> Self {
        Self::from_matrix(&(next.matrix() * self.matrix()))
    }

    pub fn apply(&self, point: [f32; 3]) -> [f32; 3] {
        let p = self.rotation() * Vector3::from(point) + Vector3::from(self.translation);
        [p.x, p.y, p.z]
    }

    /// Reads the plain-text `.dof` form: six whitespace separated numbers
    /// `tx ty tz rx ry rz`. Lines starting with `#` are ignored.
    pub fn read_dof(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        text.parse()
    }

    pub fn write_dof(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), format!("{self}\n"))?;
        Ok(())
    }
}

impl fmt::Display for RigidTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.params();
        write!(
            f,
            "{} {} {} {} {} {}",
            p[0], p[1], p[2], p[3], p[4], p[5]
        )
    }
}

impl std::str::FromStr for RigidTransform {
    type Err = ReconstructionError;

    fn from_str(s: &str) -> Result<Self> {
        let values: Vec<f32> = s
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(str::split_whitespace)
            .map(|token| {
                token
                    .parse::<f32>()
                    .map_err(|_| ReconstructionError::invalid(format!("bad dof value `{token}`")))
            })
            .collect::<Result<_>>()?;
        let params: [f32; 6] = values.try_into().map_err(|v: Vec<f32>| {
            ReconstructionError::invalid(format!("dof needs 6 values, found {}", v.len()))
        })?;
        Ok(Self::from_params(params))
    }
}

/// How a stack's initial pose was supplied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StackTransform {
    /// Explicit identity marker; the first such stack is the template.
    Identity,
    /// A pose mapping template space into stack space.
    Loaded(RigidTransform),
}

impl StackTransform {
    pub fn is_identity_marker(&self) -> bool {
        matches!(self, StackTransform::Identity)
    }

    /// Pose mapping stack world coordinates into template world coordinates.
    pub fn stack_to_template(&self) -> RigidTransform {
        match self {
            StackTransform::Identity => RigidTransform::IDENTITY,
            StackTransform::Loaded(t) => t.inverse(),
        }
    }
}

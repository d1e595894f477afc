//! Per-iteration decisions of the outer loop.
//!
//! Everything here is a pure function of the iteration index and the
//! immutable [`ScheduleParams`], recomputed at the top of every outer
//! iteration.

use std::fmt;

use crate::anneal::{Smoothing, SmoothingAnnealer};

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleParams {
    pub iterations: usize,
    pub levels: usize,
    pub delta: f32,
    pub lambda: f32,
    pub last_lambda: f32,
    pub rec_iterations_first: usize,
    pub rec_iterations_last: usize,
    /// Acquisition packages per stack; empty when none were declared.
    pub packages: Vec<usize>,
    /// A reference volume seeds the reconstruction, so iteration 0 can
    /// already register against it.
    pub reference_volume: bool,
}

impl ScheduleParams {
    pub fn annealer(&self) -> SmoothingAnnealer {
        SmoothingAnnealer {
            iterations: self.iterations,
            levels: self.levels,
            delta: self.delta,
            lambda: self.lambda,
            last_lambda: self.last_lambda,
        }
    }

    pub fn is_last(&self, iteration: usize) -> bool {
        iteration + 1 == self.iterations
    }

    pub fn smoothing(&self, iteration: usize) -> Smoothing {
        self.annealer().at(iteration)
    }

    pub fn inner_iterations(&self, iteration: usize) -> usize {
        if self.is_last(iteration) {
            self.rec_iterations_last
        } else {
            self.rec_iterations_first
        }
    }

    /// Faster, coarser reconstruction for every pass but the last.
    pub fn speedup(&self, iteration: usize) -> bool {
        !self.is_last(iteration)
    }

    /// Last iteration that may still use package registration.
    pub fn package_cutoff(&self) -> usize {
        self.iterations * (self.levels - 1) / self.levels
    }

    pub fn registration(&self, iteration: usize) -> RegistrationStep {
        let progress = Progress {
            iteration,
            packages: !self.packages.is_empty(),
            in_package_window: iteration <= self.package_cutoff() && !self.is_last(iteration),
            reference_volume: self.reference_volume,
        };
        RULES
            .iter()
            .find(|rule| (rule.applies)(&progress))
            .map_or(RegistrationStep::SliceToVolume, |rule| (rule.step)(&progress))
    }
}

/// How packages are subdivided before package-to-volume registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackageSplit {
    /// Split every package into its odd and even planes.
    pub odd_even: bool,
    /// Number of times the resulting groups are halved.
    pub halvings: usize,
}

impl PackageSplit {
    pub const WHOLE: Self = Self {
        odd_even: false,
        halvings: 0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationStep {
    Skip,
    SliceToVolume,
    Packages(PackageSplit),
    /// Package registration followed by slice-to-volume refinement.
    PackagesThenSlices(PackageSplit),
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStep::Skip => write!(f, "skip"),
            RegistrationStep::SliceToVolume => write!(f, "slice-to-volume"),
            RegistrationStep::Packages(split) => write!(f, "packages {split:?}"),
            RegistrationStep::PackagesThenSlices(split) => {
                write!(f, "packages {split:?} then slice-to-volume")
            }
        }
    }
}

struct Progress {
    iteration: usize,
    packages: bool,
    in_package_window: bool,
    reference_volume: bool,
}

impl Progress {
    fn packaged(&self) -> bool {
        self.packages && self.in_package_window
    }
}

struct Rule {
    applies: fn(&Progress) -> bool,
    step: fn(&Progress) -> RegistrationStep,
}

/// Evaluated top to bottom; the first match wins, otherwise slice-to-volume.
const RULES: &[Rule] = &[
    Rule {
        applies: |p| p.iteration == 0 && !p.reference_volume,
        step: |_| RegistrationStep::Skip,
    },
    Rule {
        applies: |p| p.packaged() && p.iteration == 1,
        step: |_| RegistrationStep::Packages(PackageSplit::WHOLE),
    },
    Rule {
        applies: |p| p.packaged() && p.iteration == 2,
        step: |_| {
            RegistrationStep::Packages(PackageSplit {
                odd_even: true,
                halvings: 0,
            })
        },
    },
    Rule {
        applies: |p| p.packaged() && p.iteration == 3,
        step: |_| {
            RegistrationStep::Packages(PackageSplit {
                odd_even: true,
                halvings: 1,
            })
        },
    },
    Rule {
        applies: |p| p.packaged() && p.iteration >= 4,
        step: |p| {
            RegistrationStep::PackagesThenSlices(PackageSplit {
                odd_even: true,
                halvings: p.iteration - 2,
            })
        },
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn params(iterations: usize, levels: usize, packages: Vec<usize>) -> ScheduleParams {
        ScheduleParams {
            iterations,
            levels,
            delta: 150.0,
            lambda: 0.02,
            last_lambda: 0.01,
            rec_iterations_first: 4,
            rec_iterations_last: 13,
            packages,
            reference_volume: false,
        }
    }

    #[test]
    fn nine_iterations_three_levels_with_packages() {
        let p = params(9, 3, vec![2, 2, 2]);
        assert_eq!(p.package_cutoff(), 6);
        let steps: Vec<_> = (0..9).map(|i| p.registration(i)).collect();
        assert_eq!(steps[0], RegistrationStep::Skip);
        assert_eq!(steps[1], RegistrationStep::Packages(PackageSplit::WHOLE));
        assert_eq!(
            steps[2],
            RegistrationStep::Packages(PackageSplit { odd_even: true, halvings: 0 })
        );
        assert_eq!(
            steps[3],
            RegistrationStep::Packages(PackageSplit { odd_even: true, halvings: 1 })
        );
        for i in 4..=6 {
            assert_eq!(
                steps[i],
                RegistrationStep::PackagesThenSlices(PackageSplit {
                    odd_even: true,
                    halvings: i - 2
                })
            );
        }
        assert_eq!(steps[7], RegistrationStep::SliceToVolume);
        assert_eq!(steps[8], RegistrationStep::SliceToVolume);
    }

    #[test]
    fn without_packages_every_later_iteration_is_slice_to_volume() {
        let p = params(4, 3, vec![]);
        assert_eq!(p.registration(0), RegistrationStep::Skip);
        assert!((1..4).all(|i| p.registration(i) == RegistrationStep::SliceToVolume));
    }

    #[test]
    fn reference_volume_registers_on_first_iteration() {
        let mut p = params(4, 3, vec![3]);
        p.reference_volume = true;
        assert_eq!(p.registration(0), RegistrationStep::SliceToVolume);
    }

    #[test]
    fn last_iteration_never_uses_packages() {
        let p = params(2, 1, vec![2]);
        // Cutoff is 0 with a single level, so iteration 1 is outside the window.
        assert_eq!(p.registration(1), RegistrationStep::SliceToVolume);
        let q = params(3, 3, vec![2]);
        // Cutoff 2, but iteration 2 is the last one.
        assert_eq!(q.registration(2), RegistrationStep::SliceToVolume);
    }

    #[test]
    fn inner_iterations_and_speedup() {
        let p = params(4, 3, vec![]);
        assert_eq!(
            (0..4).map(|i| p.inner_iterations(i)).collect::<Vec<_>>(),
            vec![4, 4, 4, 13]
        );
        assert!(p.speedup(2) && !p.speedup(3));
    }
}

//! Smoothing schedule across outer iterations.

/// Edge threshold and smoothing weight in force for one outer iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Smoothing {
    pub delta: f32,
    pub lambda: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothingAnnealer {
    pub iterations: usize,
    pub levels: usize,
    pub delta: f32,
    pub lambda: f32,
    pub last_lambda: f32,
}

impl SmoothingAnnealer {
    /// Outer iteration at which level `k` becomes active.
    pub fn landing(&self, k: usize) -> usize {
        self.iterations * (self.levels - k - 1) / self.levels
    }

    /// Parameters for iteration `i`.
    ///
    /// The last iteration always uses `(delta, last_lambda)`. Otherwise the
    /// most recent level to have landed at or before `i` wins; when several
    /// levels land on the same iteration the highest `k` is applied last and
    /// wins. Levels land at descending iterations as `k` grows, so the weight
    /// only ever decreases.
    pub fn at(&self, i: usize) -> Smoothing {
        if i + 1 == self.iterations {
            return Smoothing {
                delta: self.delta,
                lambda: self.last_lambda,
            };
        }
        let mut in_force: Option<(usize, f32)> = None;
        let mut lambda = self.lambda;
        for k in 0..self.levels {
            let landing = self.landing(k);
            if landing <= i && in_force.is_none_or(|(at, _)| landing >= at) {
                in_force = Some((landing, lambda));
            }
            lambda *= 2.0;
        }
        Smoothing {
            delta: self.delta,
            lambda: in_force.map_or(self.lambda, |(_, l)| l),
        }
    }
}

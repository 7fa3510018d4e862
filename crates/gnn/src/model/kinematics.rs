//! Host-side pairwise relativistic kinematics.
//!
//! All pair features are computed in plain f32 before anything touches a
//! tensor: they are fixed input preprocessing, not part of the
//! differentiable graph. Conventions: collider coordinates (pt, eta, phi,
//! mass), azimuthal differences wrapped to [-pi, pi], every logarithm
//! argument clamped to [`LOG_EPS`].

use std::f32::consts::PI;

/// Clamp floor for logarithm arguments and denominators.
pub const LOG_EPS: f32 = 1e-10;
/// Fill value for masked pair-grid entries.
pub const MASK_SENTINEL: f32 = -1e6;
/// Pseudorapidity clamp for pairs collinear with the beam axis.
pub const ETA_SENTINEL: f32 = 20.0;
/// Number of features per object pair.
pub const N_PAIR_FEATURES: usize = 7;

/// A collider 4-momentum in (pt, eta, phi, mass) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FourMomentum {
    pub pt: f32,
    pub eta: f32,
    pub phi: f32,
    pub mass: f32,
}

impl FourMomentum {
    pub fn new(pt: f32, eta: f32, phi: f32, mass: f32) -> Self {
        Self { pt, eta, phi, mass }
    }

    /// Build from a `[pt, eta, phi, mass]` feature row.
    pub fn from_slice(row: &[f32]) -> Self {
        Self::new(row[0], row[1], row[2], row[3])
    }

    pub fn px(&self) -> f32 {
        self.pt * self.phi.cos()
    }

    pub fn py(&self) -> f32 {
        self.pt * self.phi.sin()
    }

    pub fn pz(&self) -> f32 {
        self.pt * self.eta.sinh()
    }

    pub fn energy(&self) -> f32 {
        let p2 = self.pt * self.pt + self.pz() * self.pz();
        (self.mass * self.mass + p2).sqrt()
    }

    /// Padding slots carry an all-zero 4-momentum.
    pub fn is_padding(&self) -> bool {
        self.pt == 0.0 && self.eta == 0.0 && self.phi == 0.0 && self.mass == 0.0
    }
}

/// Wrap an azimuthal difference into [-pi, pi].
pub fn wrap_delta_phi(dphi: f32) -> f32 {
    let mut d = dphi;
    while d > PI {
        d -= 2.0 * PI;
    }
    while d < -PI {
        d += 2.0 * PI;
    }
    d
}

/// Pseudorapidity of a summed momentum, clamped to [`ETA_SENTINEL`].
///
/// Computed as 0.5 * ln((|p| + pz) / (|p| - pz)) with both log arguments
/// floored at [`LOG_EPS`], so a pair exactly along the beam axis lands on
/// the sentinel instead of infinity.
fn combined_eta(px: f32, py: f32, pz: f32) -> f32 {
    let p = (px * px + py * py + pz * pz).sqrt();
    let eta = 0.5 * ((p + pz).max(LOG_EPS) / (p - pz).max(LOG_EPS)).ln();
    eta.clamp(-ETA_SENTINEL, ETA_SENTINEL)
}

/// The seven pair features plus the combined 4-momentum of two objects.
///
/// Features, in order: ln dR, ln kT, ln z, ln m^2, ln pT(pair), combined
/// eta, combined phi. The invariant mass squared is floored at zero before
/// the log clamp so numerical noise below the mass shell cannot produce
/// NaN.
pub fn pair_features(a: &FourMomentum, b: &FourMomentum) -> ([f32; N_PAIR_FEATURES], FourMomentum) {
    let deta = a.eta - b.eta;
    let dphi = wrap_delta_phi(a.phi - b.phi);
    let delta = (deta * deta + dphi * dphi).sqrt();
    let ln_delta = delta.max(LOG_EPS).ln();

    let min_pt = a.pt.min(b.pt);
    let ln_kt = (min_pt * delta).max(LOG_EPS).ln();
    let ln_z = (min_pt / (a.pt + b.pt).max(LOG_EPS)).max(LOG_EPS).ln();

    let px = a.px() + b.px();
    let py = a.py() + b.py();
    let pz = a.pz() + b.pz();
    let energy = a.energy() + b.energy();

    let m2 = (energy * energy - px * px - py * py - pz * pz).max(0.0);
    let ln_m2 = m2.max(LOG_EPS).ln();

    let pt = (px * px + py * py).sqrt();
    let ln_pt = pt.max(LOG_EPS).ln();

    let eta = combined_eta(px, py, pz);
    let phi = py.atan2(px);

    let features = [ln_delta, ln_kt, ln_z, ln_m2, ln_pt, eta, phi];
    (features, FourMomentum::new(pt, eta, phi, m2.sqrt()))
}

/// A dense `rows x cols` grid of pair features with a validity mask.
///
/// Entries where either endpoint is a padding slot have all features set to
/// [`MASK_SENTINEL`], a zero combined momentum, and `mask == false`.
#[derive(Debug, Clone)]
pub struct PairGrid {
    pub features: Vec<f32>,
    pub momenta: Vec<FourMomentum>,
    pub mask: Vec<bool>,
    pub rows: usize,
    pub cols: usize,
}

impl PairGrid {
    fn masked(rows: usize, cols: usize) -> Self {
        Self {
            features: vec![MASK_SENTINEL; rows * cols * N_PAIR_FEATURES],
            momenta: vec![FourMomentum::default(); rows * cols],
            mask: vec![false; rows * cols],
            rows,
            cols,
        }
    }

    fn set(&mut self, i: usize, j: usize, features: [f32; N_PAIR_FEATURES], p4: FourMomentum) {
        let cell = i * self.cols + j;
        let start = cell * N_PAIR_FEATURES;
        self.features[start..start + N_PAIR_FEATURES].copy_from_slice(&features);
        self.momenta[cell] = p4;
        self.mask[cell] = true;
    }

    /// The feature vector of cell `(i, j)`.
    pub fn feature_row(&self, i: usize, j: usize) -> &[f32] {
        let start = (i * self.cols + j) * N_PAIR_FEATURES;
        &self.features[start..start + N_PAIR_FEATURES]
    }

    pub fn is_real(&self, i: usize, j: usize) -> bool {
        self.mask[i * self.cols + j]
    }
}

/// Full ordered n x n pair grid of one collection, diagonal included.
pub fn self_interaction(objects: &[FourMomentum]) -> PairGrid {
    let n = objects.len();
    let mut grid = PairGrid::masked(n, n);
    for (i, a) in objects.iter().enumerate() {
        if a.is_padding() {
            continue;
        }
        for (j, b) in objects.iter().enumerate() {
            if b.is_padding() {
                continue;
            }
            let (features, p4) = pair_features(a, b);
            grid.set(i, j, features, p4);
        }
    }
    grid
}

/// Full rectangular pair grid between two collections.
pub fn pairwise_interaction(a: &[FourMomentum], b: &[FourMomentum]) -> PairGrid {
    let mut grid = PairGrid::masked(a.len(), b.len());
    for (i, pa) in a.iter().enumerate() {
        if pa.is_padding() {
            continue;
        }
        for (j, pb) in b.iter().enumerate() {
            if pb.is_padding() {
                continue;
            }
            let (features, p4) = pair_features(pa, pb);
            grid.set(i, j, features, p4);
        }
    }
    grid
}

/// Flat list of pairs with a validity mask, fixed length per capacity.
#[derive(Debug, Clone)]
pub struct PairList {
    pub features: Vec<f32>,
    pub momenta: Vec<FourMomentum>,
    pub mask: Vec<bool>,
    pub len: usize,
}

impl PairList {
    pub fn feature_row(&self, k: usize) -> &[f32] {
        &self.features[k * N_PAIR_FEATURES..(k + 1) * N_PAIR_FEATURES]
    }
}

/// Strict upper triangle (i < j) of a square pair grid, row-major order.
/// Length is fixed at n * (n - 1) / 2 regardless of how many entries are
/// real, so downstream tensor shapes never depend on event content.
pub fn upper_triangle(grid: &PairGrid) -> PairList {
    assert_eq!(grid.rows, grid.cols, "upper_triangle needs a square grid");
    let n = grid.rows;
    let len = n * (n - 1) / 2;
    let mut list = PairList {
        features: Vec::with_capacity(len * N_PAIR_FEATURES),
        momenta: Vec::with_capacity(len),
        mask: Vec::with_capacity(len),
        len,
    };
    for i in 0..n {
        for j in (i + 1)..n {
            list.features.extend_from_slice(grid.feature_row(i, j));
            list.momenta.push(grid.momenta[i * n + j]);
            list.mask.push(grid.mask[i * n + j]);
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn massless(pt: f32, eta: f32, phi: f32) -> FourMomentum {
        FourMomentum::new(pt, eta, phi, 0.0)
    }

    #[test]
    fn test_back_to_back_massless_pair_mass() {
        // Equal-pT massless objects at opposite phi: invariant mass 2*pT.
        let pt = 50.0;
        let a = massless(pt, 0.0, 0.0);
        let b = massless(pt, 0.0, PI);
        let (features, pair) = pair_features(&a, &b);

        let expected_m2 = 4.0 * pt * pt;
        assert!((features[3] - expected_m2.ln()).abs() < 1e-3);
        assert!((pair.mass - 2.0 * pt).abs() < 1e-2);
    }

    #[test]
    fn test_mass_squared_never_negative() {
        // Nearly collinear massless pair: m^2 sits at the numerical edge.
        let a = massless(100.0, 1.0, 0.5);
        let b = massless(100.0, 1.0 + 1e-6, 0.5);
        let (features, pair) = pair_features(&a, &b);
        assert!(features[3].is_finite());
        assert!(pair.mass >= 0.0);
    }

    #[test]
    fn test_identical_objects_hit_clamp() {
        let a = massless(30.0, 0.7, -1.2);
        let (features, _) = pair_features(&a, &a);
        // dR = 0 clamps to LOG_EPS.
        assert!((features[0] - LOG_EPS.ln()).abs() < 1e-3);
        assert!((features[1] - LOG_EPS.ln()).abs() < 1e-3);
    }

    #[test]
    fn test_delta_phi_wraps() {
        let a = massless(40.0, 0.0, 3.0);
        let b = massless(40.0, 0.0, -3.0);
        let dphi = wrap_delta_phi(a.phi - b.phi);
        assert!(dphi.abs() <= PI);
        assert!((dphi.abs() - (2.0 * PI - 6.0)).abs() < 1e-5);

        assert_eq!(wrap_delta_phi(0.0), 0.0);
        assert!((wrap_delta_phi(2.0 * PI) - 0.0).abs() < 1e-5);
    }

    #[test]
    fn test_combined_eta_sentinel() {
        // Opposite-phi equal-pT objects at extreme eta: transverse momenta
        // cancel exactly, the sum points along the beam, eta clamps.
        let a = FourMomentum::new(1.0, 20.0, 0.0, 0.0);
        let b = FourMomentum::new(1.0, 20.0, PI, 0.0);
        let (features, _) = pair_features(&a, &b);
        assert!((features[5] - ETA_SENTINEL).abs() < 1e-5);

        let (features_neg, _) = pair_features(
            &FourMomentum::new(1.0, -20.0, 0.0, 0.0),
            &FourMomentum::new(1.0, -20.0, PI, 0.0),
        );
        assert!((features_neg[5] + ETA_SENTINEL).abs() < 1e-5);
    }

    #[test]
    fn test_self_interaction_masks_padding() {
        let objects = vec![
            massless(60.0, 0.1, 0.2),
            massless(40.0, -0.5, 1.0),
            FourMomentum::default(),
        ];
        let grid = self_interaction(&objects);
        assert_eq!(grid.rows, 3);
        assert!(grid.is_real(0, 1));
        assert!(grid.is_real(0, 0)); // diagonal included
        assert!(!grid.is_real(0, 2));
        assert!(!grid.is_real(2, 1));
        assert_eq!(grid.feature_row(2, 0), &[MASK_SENTINEL; N_PAIR_FEATURES]);
        assert!(grid.momenta[2].is_padding());
    }

    #[test]
    fn test_pairwise_interaction_shapes() {
        let jets = vec![massless(60.0, 0.1, 0.2), FourMomentum::default()];
        let leptons = vec![
            massless(30.0, -0.3, 2.0),
            massless(25.0, 0.8, -2.5),
            FourMomentum::default(),
        ];
        let grid = pairwise_interaction(&jets, &leptons);
        assert_eq!((grid.rows, grid.cols), (2, 3));
        assert!(grid.is_real(0, 0));
        assert!(grid.is_real(0, 1));
        assert!(!grid.is_real(0, 2));
        assert!(!grid.is_real(1, 0));
    }

    #[test]
    fn test_upper_triangle_strict() {
        let objects = vec![
            massless(60.0, 0.1, 0.2),
            massless(40.0, -0.5, 1.0),
            massless(20.0, 1.5, -0.7),
            FourMomentum::default(),
        ];
        let grid = self_interaction(&objects);
        let ut = upper_triangle(&grid);
        assert_eq!(ut.len, 6); // 4 * 3 / 2
        // Order: (0,1) (0,2) (0,3) (1,2) (1,3) (2,3).
        assert_eq!(ut.feature_row(0), grid.feature_row(0, 1));
        assert_eq!(ut.feature_row(3), grid.feature_row(1, 2));
        assert_eq!(ut.mask, vec![true, true, false, true, false, false]);
    }

    #[test]
    fn test_pair_features_symmetric_in_mass() {
        let a = FourMomentum::new(70.0, 0.4, 0.1, 5.0);
        let b = FourMomentum::new(35.0, -1.1, 2.2, 0.105);
        let (fab, pab) = pair_features(&a, &b);
        let (fba, pba) = pair_features(&b, &a);
        // ln m^2, ln pT, eta are order-independent.
        assert!((fab[3] - fba[3]).abs() < 1e-4);
        assert!((fab[4] - fba[4]).abs() < 1e-4);
        assert!((fab[5] - fba[5]).abs() < 1e-4);
        assert!((pab.mass - pba.mass).abs() < 1e-3);
    }
}

//! Subband planner (§4.4): parses a transform template, produces per-level
//! lifting grids, subbands (with their local/global grids and low/high
//! tags), and precomputed CDF 5/3 basis norms.

use crate::error::{Idx2Error, Idx2Result};
use crate::grid::{Grid, V3};

pub const MAX_NORM_LEVELS: usize = 16;

/// Precomputed scaling/wavelet L2 basis norms, one entry per decomposition
/// level, following the recurrence in `Wavelet.h`'s `GetCdf53NormsFast`:
/// `Num1' = Num1*4 - 1`, `Num2' = Num2*4 - 33`, starting from `Num1 = 3`,
/// `Num2 = 23`, with `Scaling[i] = sqrt(Num1_i / 2^(i+1))` and
/// `Wavelet[i] = sqrt(Num2_i / 2^(i+5))`.
#[derive(Debug, Clone)]
pub struct Cdf53Norms {
    pub scaling: [f64; MAX_NORM_LEVELS],
    pub wavelet: [f64; MAX_NORM_LEVELS],
}

impl Cdf53Norms {
    pub fn compute() -> Self {
        let mut scaling = [0.0f64; MAX_NORM_LEVELS];
        let mut wavelet = [0.0f64; MAX_NORM_LEVELS];
        let mut num1 = 3.0f64;
        let mut num2 = 23.0f64;
        for i in 0..MAX_NORM_LEVELS {
            scaling[i] = (num1 / (1u64 << (i + 1)) as f64).sqrt();
            num1 = num1 * 4.0 - 1.0;
            wavelet[i] = (num2 / (1u64 << (i + 5)) as f64).sqrt();
            num2 = num2 * 4.0 - 33.0;
        }
        Self { scaling, wavelet }
    }
}

/// One level's worth of a decomposed volume: the all-scaling (low-pass)
/// quadrant plus `2^d - 1` high-pass quadrants.
#[derive(Debug, Clone)]
pub struct Subband {
    pub local_grid: Grid,
    pub global_grid: Grid,
    pub level3: V3,
    /// Low(0)/High(1) tag per axis for this subband.
    pub low_high3: V3,
    pub norm: f64,
}

impl Subband {
    /// Subband 0 is the all-scaling quadrant, recursively transformed at
    /// the next level.
    pub fn is_lowpass(&self) -> bool {
        self.low_high3 == V3::ZEROS
    }
}

/// One step of the transform template: lift along `axis` at template
/// position `step_index`, ending a level when `level_boundary` is true.
#[derive(Debug, Clone, Copy)]
pub struct TransformStep {
    pub axis: u8,
    pub level_boundary: bool,
}

/// Parsed transform template, e.g. `":210210:210:210"`.
///
/// Read right-to-left per §4.4: the rightmost level is level 1 (finest).
/// Each digit selects an axis (`0`,`1`,`2`); `:` marks a level boundary.
#[derive(Debug, Clone)]
pub struct TransformTemplate {
    pub steps: Vec<TransformStep>,
    pub num_levels: usize,
    raw: String,
}

impl TransformTemplate {
    pub fn parse(template: &str) -> Idx2Result<Self> {
        if template.len() > 32 {
            return Err(Idx2Error::SyntaxError {
                what: "transform template".into(),
                detail: format!("template length {} exceeds 32", template.len()),
            });
        }
        let chars: Vec<char> = template.chars().collect();
        let mut steps = Vec::new();
        let mut num_levels = 0usize;
        // Read right to left.
        for (i, &c) in chars.iter().enumerate().rev() {
            match c {
                ':' => {
                    num_levels += 1;
                    if let Some(last) = steps.last_mut() {
                        let _: &mut TransformStep = last;
                    }
                    if i != chars.len() - 1 && !steps.is_empty() {
                        steps.last_mut().unwrap().level_boundary = true;
                    } else if i == chars.len() - 1 {
                        // Trailing boundary marker with nothing after it; a
                        // level boundary still closes whatever came before,
                        // handled by the next iteration's push.
                    }
                }
                '0' | '1' | '2' => {
                    let axis = c as u8 - b'0';
                    if axis as usize >= 3 {
                        return Err(Idx2Error::DimensionsTooMany(axis as usize + 1));
                    }
                    steps.push(TransformStep { axis, level_boundary: false });
                }
                '|' => {
                    // Reserved v2 prefix-section marker (§9 open question):
                    // static non-multiresolution dimensions. Treat as
                    // reserved; nothing before it in the template
                    // contributes additional transform steps.
                    break;
                }
                other => {
                    return Err(Idx2Error::SyntaxError {
                        what: "transform template".into(),
                        detail: format!("unexpected character '{other}'"),
                    });
                }
            }
        }
        if !steps.is_empty() {
            steps.last_mut().unwrap().level_boundary = true;
        }
        if num_levels == 0 {
            num_levels = 1;
        }
        Ok(Self { steps, num_levels, raw: template.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Steps belonging to level `level` (1-indexed from the finest level),
    /// in application order (left to right within the level).
    pub fn steps_for_level(&self, level: usize) -> Vec<TransformStep> {
        let mut out = Vec::new();
        let mut cur_level = 1usize;
        let mut run = Vec::new();
        for step in &self.steps {
            run.push(*step);
            if step.level_boundary {
                if cur_level == level {
                    out = run.clone();
                }
                run.clear();
                cur_level += 1;
            }
        }
        out
    }
}

/// Build the lifting grids for one level's transform, one per axis-pass in
/// the level's template run, with `(From, Dims, Spacing)` consistent with
/// repeated halving of `dims`.
pub fn compute_transform_grids(dims: V3, template: &TransformTemplate, level: usize) -> Vec<Grid> {
    let mut grids = Vec::new();
    let mut cur = Grid::new(V3::ZEROS, dims, V3::ONES);
    for step in template.steps_for_level(level) {
        grids.push(cur);
        let axis = step.axis as usize;
        let d = cur.dims.get(axis);
        let mut next = cur;
        next.dims.set(axis, (d + 1) / 2);
        next.spacing.set(axis, cur.spacing.get(axis) * 2);
        cur = next;
    }
    grids
}

/// Produce the `2^k - 1` high-pass subbands plus the low-pass subband for
/// one level's run of `k` axis-passes, given the dims/spacing the level
/// starts from.
pub fn build_level_subbands(
    dims: V3,
    spacing: V3,
    template: &TransformTemplate,
    level: usize,
    norms: &Cdf53Norms,
) -> Vec<Subband> {
    let steps = template.steps_for_level(level);
    let k = steps.len();
    if k == 0 {
        return vec![Subband {
            local_grid: Grid::new(V3::ZEROS, dims, spacing),
            global_grid: Grid::new(V3::ZEROS, dims, spacing),
            level3: V3::ZEROS,
            low_high3: V3::ZEROS,
            norm: 1.0,
        }];
    }

    let mut subbands = Vec::with_capacity(1 << k);
    for mask in 0..(1u32 << k) {
        let mut local_dims = dims;
        let mut local_spacing = spacing;
        let mut local_from = V3::ZEROS;
        let mut low_high3 = V3::ZEROS;
        let mut level3 = V3::ZEROS;
        let mut norm = 1.0f64;

        for (bit, step) in steps.iter().enumerate() {
            let axis = step.axis as usize;
            let is_high = (mask >> bit) & 1 == 1;
            let d = local_dims.get(axis);
            let s = local_spacing.get(axis);
            let (even, odd) = (
                (d + 1) / 2,
                d / 2,
            );
            if is_high {
                local_from.set(axis, local_from.get(axis) + s);
                local_dims.set(axis, odd);
                low_high3.set(axis, 1);
                let lvl = level3.get(axis) + 1;
                level3.set(axis, lvl);
                norm *= norms.wavelet[lvl.max(1) as usize - 1];
            } else {
                local_dims.set(axis, even);
                let lvl = level3.get(axis);
                norm *= norms.scaling[lvl.max(0) as usize];
            }
            local_spacing.set(axis, s * 2);
        }

        subbands.push(Subband {
            local_grid: Grid::new(local_from, local_dims, local_spacing),
            global_grid: Grid::new(local_from, local_dims, local_spacing),
            level3,
            low_high3,
            norm,
        });
    }

    // Subband 0 is the all-scaling quadrant (mask == 0).
    subbands.swap(0, 0);
    subbands
}

/// Dimensions of the low-pass subband (subband 0) `level`'s transform
/// produces from a brick of `brick_dims` — i.e. the dims the next coarser
/// level's brick buffer needs.
pub fn lowpass_dims(brick_dims: V3, template: &TransformTemplate, level: usize, norms: &Cdf53Norms) -> V3 {
    build_level_subbands(brick_dims, V3::ONES, template, level, norms)[0].local_grid.dims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_round_trip() {
        for t in [":210210:210:210", ":0:1:2", "012", ":210"] {
            let parsed = TransformTemplate::parse(t).unwrap();
            assert_eq!(parsed.as_str(), t);
        }
    }

    #[test]
    fn template_rejects_bad_axis() {
        assert!(TransformTemplate::parse(":310").is_err());
    }

    #[test]
    fn template_too_long_rejected() {
        let t = "0".repeat(33);
        assert!(TransformTemplate::parse(&t).is_err());
    }

    #[test]
    fn level_subbands_conserve_samples() {
        let template = TransformTemplate::parse(":210").unwrap();
        let norms = Cdf53Norms::compute();
        let dims = V3::new(8, 8, 8);
        let subbands = build_level_subbands(dims, V3::ONES, &template, 1, &norms);
        let total: i64 = subbands.iter().map(|s| s.local_grid.num_samples()).sum();
        assert_eq!(total, dims.product());
    }

    #[test]
    fn lowpass_dims_matches_subband_zero() {
        let template = TransformTemplate::parse(":210").unwrap();
        let norms = Cdf53Norms::compute();
        let dims = lowpass_dims(V3::new(8, 8, 8), &template, 1, &norms);
        assert_eq!(dims, V3::new(4, 4, 4));
    }

    #[test]
    fn subband_zero_is_lowpass() {
        let template = TransformTemplate::parse(":210").unwrap();
        let norms = Cdf53Norms::compute();
        let subbands = build_level_subbands(V3::new(8, 8, 8), V3::ONES, &template, 1, &norms);
        assert!(subbands[0].is_lowpass());
    }
}

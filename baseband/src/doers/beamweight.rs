//! Beam-Weight Kernel
//!
//! Zero-forcing weights for one (frame, subcarrier group) task. Per
//! subcarrier: assemble the channel matrix from the per-UE CSI planes, form
//! the UE-side Gram matrix, invert it, and emit the uplink receive weights
//! plus their conjugate transpose as the downlink precoder.

use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;
use tracing::trace;

use crate::buffer::BasebandBuffer;
use crate::config::PhyConfig;
use crate::stats::{elapsed_ns, Stats};
use common::{DoerType, EventData, EventType, TaskTag};

use super::Doer;

/// In-place Gauss-Jordan inversion with partial pivoting. `m` is destroyed;
/// `out` receives the inverse. A singular input is not detected: the zero
/// pivot yields non-finite values that propagate into downstream tensors.
pub(crate) fn invert(m: &mut [Complex32], out: &mut [Complex32], n: usize) {
    debug_assert_eq!(m.len(), n * n);
    debug_assert_eq!(out.len(), n * n);

    out.fill(Complex32::new(0.0, 0.0));
    for i in 0..n {
        out[i * n + i] = Complex32::new(1.0, 0.0);
    }

    for col in 0..n {
        // Largest remaining pivot in this column
        let mut pivot_row = col;
        let mut pivot_norm = m[col * n + col].norm_sqr();
        for row in col + 1..n {
            let norm = m[row * n + col].norm_sqr();
            if norm > pivot_norm {
                pivot_row = row;
                pivot_norm = norm;
            }
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap(col * n + k, pivot_row * n + k);
                out.swap(col * n + k, pivot_row * n + k);
            }
        }

        let pivot = m[col * n + col];
        for k in 0..n {
            m[col * n + k] /= pivot;
            out[col * n + k] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row * n + col];
            if factor == Complex32::new(0.0, 0.0) {
                continue;
            }
            for k in 0..n {
                let mc = m[col * n + k];
                let oc = out[col * n + k];
                m[row * n + k] -= factor * mc;
                out[row * n + k] -= factor * oc;
            }
        }
    }
}

/// The zero-forcing beam-weight doer. One instance per worker thread.
pub struct DoBeamWeights {
    tid: usize,
    cfg: Arc<PhyConfig>,
    buffer: Arc<BasebandBuffer>,
    stats: Arc<Stats>,
    /// Channel matrix scratch, ant x ue column-gathered as ue rows
    chan: Vec<Complex32>,
    /// UE-side Gram matrix scratch
    gram: Vec<Complex32>,
    /// Gram inverse scratch
    gram_inv: Vec<Complex32>,
}

impl DoBeamWeights {
    pub fn new(tid: usize, cfg: Arc<PhyConfig>, buffer: Arc<BasebandBuffer>, stats: Arc<Stats>) -> Self {
        let chan = vec![Complex32::new(0.0, 0.0); cfg.ue_num * cfg.bs_ant_num];
        let gram = vec![Complex32::new(0.0, 0.0); cfg.ue_num * cfg.ue_num];
        let gram_inv = gram.clone();
        Self { tid, cfg, buffer, stats, chan, gram, gram_inv }
    }
}

impl Doer for DoBeamWeights {
    fn event_type(&self) -> EventType {
        EventType::BeamWeights
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let base_sc = tag.index as usize;
        let slot = self.buffer.slot(frame_id);

        trace!(tid = self.tid, frame_id, base_sc, "beam weight task");

        let ant = self.cfg.bs_ant_num;
        let ue = self.cfg.ue_num;
        let max_sc = self.cfg.beam_block_size.min(self.cfg.ofdm_data_num - base_sc);

        let mut gram_ns = 0u64;
        let mut solve_ns = 0u64;

        for cur_sc in base_sc..base_sc + max_sc {
            let t0 = Instant::now();
            // chan row u = UE u's channel across antennas at this subcarrier
            for u in 0..ue {
                // SAFETY: CSI planes are read-only once beam weights are
                // scheduled.
                let csi = unsafe { self.buffer.csi(slot, u) };
                self.chan[u * ant..(u + 1) * ant]
                    .copy_from_slice(&csi[cur_sc * ant..(cur_sc + 1) * ant]);
            }
            // gram[i][j] = sum_a conj(chan[i][a]) * chan[j][a]
            for i in 0..ue {
                for j in 0..ue {
                    let mut acc = Complex32::new(0.0, 0.0);
                    for a in 0..ant {
                        acc += self.chan[i * ant + a].conj() * self.chan[j * ant + a];
                    }
                    self.gram[i * ue + j] = acc;
                }
            }
            gram_ns += elapsed_ns(t0);

            let t1 = Instant::now();
            invert(&mut self.gram, &mut self.gram_inv, ue);

            // SAFETY: this task is the sole writer of its subcarrier group's
            // beam matrices.
            let ul = unsafe { self.buffer.ul_beam_mut(slot, cur_sc) };
            let dl = unsafe { self.buffer.dl_beam_mut(slot, cur_sc) };
            for u in 0..ue {
                for a in 0..ant {
                    // W = (G^H G)^-1 G^H, row u applied to the antenna vector
                    let mut acc = Complex32::new(0.0, 0.0);
                    for k in 0..ue {
                        acc += self.gram_inv[u * ue + k] * self.chan[k * ant + a].conj();
                    }
                    ul[u * ant + a] = acc;
                    // Downlink precoder is the conjugate transpose
                    dl[a * ue + u] = acc.conj();
                }
            }
            solve_ns += elapsed_ns(t1);
        }

        self.stats
            .duration_stat(DoerType::BeamWeights, self.tid)
            .record([elapsed_ns(start), gram_ns, solve_ns]);
        EventData::new(EventType::BeamWeights, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameSchedule;

    fn small_config() -> PhyConfig {
        PhyConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_data_num: 64,
            pilot_spacing: 8,
            frame_schedule: "PPU".to_string(),
            window_depth: 4,
            demul_block_size: 64,
            beam_block_size: 16,
            num_workers: 4,
            ..PhyConfig::default()
        }
    }

    struct Fixture {
        cfg: Arc<PhyConfig>,
        buffer: Arc<BasebandBuffer>,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg = Arc::new(small_config());
            cfg.validate().unwrap();
            let schedule: FrameSchedule = cfg.schedule().unwrap();
            let buffer = Arc::new(BasebandBuffer::new(&cfg, &schedule).unwrap());
            Self { cfg, buffer }
        }

        fn doer(&self) -> DoBeamWeights {
            DoBeamWeights::new(0, self.cfg.clone(), self.buffer.clone(), Arc::new(Stats::new(1)))
        }

        /// Channel of UE `u` at (sc, ant)
        fn set_csi(&self, u: usize, sc: usize, a: usize, v: Complex32) {
            let ant = self.cfg.bs_ant_num;
            let csi = unsafe { self.buffer.csi_mut(0, u) };
            csi[sc * ant + a] = v;
        }
    }

    fn assert_close(a: Complex32, b: Complex32, tol: f32) {
        assert!((a - b).norm() < tol, "{a} vs {b}");
    }

    #[test]
    fn test_invert_known_matrix() {
        // [[1, i], [0, 2]] has inverse [[1, -i/2], [0, 1/2]]
        let mut m = vec![
            Complex32::new(1.0, 0.0),
            Complex32::new(0.0, 1.0),
            Complex32::new(0.0, 0.0),
            Complex32::new(2.0, 0.0),
        ];
        let mut out = vec![Complex32::new(0.0, 0.0); 4];
        invert(&mut m, &mut out, 2);
        assert_close(out[0], Complex32::new(1.0, 0.0), 1e-6);
        assert_close(out[1], Complex32::new(0.0, -0.5), 1e-6);
        assert_close(out[2], Complex32::new(0.0, 0.0), 1e-6);
        assert_close(out[3], Complex32::new(0.5, 0.0), 1e-6);
    }

    #[test]
    fn test_invert_requires_pivoting() {
        // Zero in the leading position forces a row swap
        let mut m = vec![
            Complex32::new(0.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(0.0, 0.0),
        ];
        let mut out = vec![Complex32::new(0.0, 0.0); 4];
        invert(&mut m, &mut out, 2);
        // The inverse of the swap is the swap
        assert_close(out[0], Complex32::new(0.0, 0.0), 1e-6);
        assert_close(out[1], Complex32::new(1.0, 0.0), 1e-6);
        assert_close(out[2], Complex32::new(1.0, 0.0), 1e-6);
        assert_close(out[3], Complex32::new(0.0, 0.0), 1e-6);
    }

    #[test]
    fn test_zero_forcing_inverts_the_channel() {
        let fx = Fixture::new();
        let ant = fx.cfg.bs_ant_num;
        let ue = fx.cfg.ue_num;

        // A full-rank channel on every subcarrier
        for sc in 0..fx.cfg.ofdm_data_num {
            for u in 0..ue {
                for a in 0..ant {
                    let v = Complex32::new(
                        1.0 + (u * ant + a) as f32 * 0.2,
                        (sc % 7) as f32 * 0.1 - u as f32,
                    );
                    fx.set_csi(u, sc, a, v);
                }
            }
        }

        let mut doer = fx.doer();
        for base in (0..fx.cfg.ofdm_data_num).step_by(fx.cfg.beam_block_size) {
            let comp = doer.launch(TaskTag::frame_symbol_index(0, 0, base as u16));
            assert_eq!(comp.event_type, EventType::BeamWeights);
        }

        // W * G = identity on the UE side, for every subcarrier
        for sc in 0..fx.cfg.ofdm_data_num {
            let w = unsafe { fx.buffer.ul_beam(0, sc) };
            let csi0 = unsafe { fx.buffer.csi(0, 0) };
            let csi1 = unsafe { fx.buffer.csi(0, 1) };
            for i in 0..ue {
                for j in 0..ue {
                    let g = if j == 0 { csi0 } else { csi1 };
                    let mut acc = Complex32::new(0.0, 0.0);
                    for a in 0..ant {
                        acc += w[i * ant + a] * g[sc * ant + a];
                    }
                    let expect =
                        if i == j { Complex32::new(1.0, 0.0) } else { Complex32::new(0.0, 0.0) };
                    assert!((acc - expect).norm() < 1e-3, "sc {sc} ({i},{j}): {acc}");
                }
            }
        }
    }

    #[test]
    fn test_downlink_is_conjugate_transpose() {
        let fx = Fixture::new();
        let ant = fx.cfg.bs_ant_num;
        let ue = fx.cfg.ue_num;
        for u in 0..ue {
            for a in 0..ant {
                fx.set_csi(u, 3, a, Complex32::new(a as f32 + 1.0, u as f32 - 0.5));
            }
        }
        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(0, 0, 0));

        let ul = unsafe { fx.buffer.ul_beam(0, 3) };
        let dl = unsafe { fx.buffer.dl_beam(0, 3) };
        for u in 0..ue {
            for a in 0..ant {
                assert_eq!(dl[a * ue + u], ul[u * ant + a].conj());
            }
        }
    }

    #[test]
    fn test_degenerate_channel_propagates_non_finite() {
        let fx = Fixture::new();
        let ant = fx.cfg.bs_ant_num;
        // Two UEs with identical channels: the Gram matrix is singular
        for u in 0..fx.cfg.ue_num {
            for a in 0..ant {
                fx.set_csi(u, 0, a, Complex32::new(1.0, 1.0));
            }
        }
        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(0, 0, 0));

        let w = unsafe { fx.buffer.ul_beam(0, 0) };
        assert!(w.iter().any(|v| !v.re.is_finite() || !v.im.is_finite()));
    }
}

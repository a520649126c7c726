//! Baseband Unit Main Application
//!
//! Assembles the engine (buffer store, queue fabric, dispatcher, worker
//! pool, recorder) and drives it with a deterministic synthetic radio
//! front-end: staged receive samples in, transmit packets out.

mod config;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use num_complex::Complex32;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use baseband::buffer::BasebandBuffer;
use baseband::config::{FrameSchedule, PhyConfig};
use baseband::dispatcher::FrameDispatcher;
use baseband::fabric::EventFabric;
use baseband::recorder::{RecorderThread, SampleChunk, WriteSink};
use baseband::stats::Stats;
use baseband::worker::WorkerPool;
use baseband::PhyError;
use common::{FrameId, SymbolType};

use config::BbuConfig;

/// Massive-MIMO baseband unit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the number of frames to run
    #[arg(long)]
    num_frames: Option<u32>,
}

/// End-of-run totals.
#[derive(Debug)]
struct EngineReport {
    frames_completed: u64,
    tx_packets: u64,
    recorder_dropped: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => BbuConfig::from_yaml_file(path)?,
        None => BbuConfig::default(),
    };
    if let Some(num_frames) = args.num_frames {
        cfg.driver.num_frames = num_frames;
    }

    let level = args.log_level.unwrap_or_else(|| cfg.log.level.clone());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting baseband unit");
    info!(
        antennas = cfg.phy.bs_ant_num,
        ues = cfg.phy.ue_num,
        subcarriers = cfg.phy.ofdm_data_num,
        schedule = %cfg.phy.frame_schedule,
        window = cfg.phy.window_depth,
        workers = cfg.phy.num_workers,
        "engine configuration"
    );

    let report = run_engine(&cfg)?;

    info!(
        frames = report.frames_completed,
        tx_packets = report.tx_packets,
        recorder_dropped = report.recorder_dropped,
        "baseband unit finished"
    );
    Ok(())
}

/// Bring the engine up, push `driver.num_frames` synthetic frames through
/// it, drain it, and tear it down.
fn run_engine(cfg: &BbuConfig) -> Result<EngineReport> {
    let phy = Arc::new(cfg.phy.clone());
    phy.validate()?;
    let schedule = phy.schedule()?;

    let buffer = Arc::new(BasebandBuffer::new(&phy, &schedule)?);
    let fabric = Arc::new(EventFabric::new(
        phy.num_shards,
        phy.queue_capacity,
        phy.comp_queue_capacity,
        phy.tx_queue_capacity,
    ));
    let stats = Arc::new(Stats::new(phy.num_workers));
    let mut dispatcher = FrameDispatcher::new(phy.clone(), schedule.clone(), fabric.clone());
    let pool =
        WorkerPool::spawn(phy.clone(), schedule.clone(), buffer.clone(), fabric.clone(), stats.clone());

    let mut recorder = if phy.recorder.enabled {
        let file = std::fs::File::create(&phy.recorder.path).map_err(|e| {
            PhyError::InitializationFailed(format!(
                "cannot create recorder output {}: {e}",
                phy.recorder.path
            ))
        })?;
        let mut recorder = RecorderThread::new(phy.recorder.clone());
        recorder.start(WriteSink::new(std::io::BufWriter::new(file)));
        info!(path = %phy.recorder.path, "sample recording enabled");
        Some(recorder)
    } else {
        None
    };

    let mut tx_packets = 0u64;
    let deadline = Duration::from_millis(cfg.driver.frame_deadline_ms);

    for frame_id in 0..cfg.driver.num_frames {
        // Admission control: a frame may not enter while its buffer slot's
        // previous occupant is still in flight.
        let wait_start = Instant::now();
        while !dispatcher.can_accept(frame_id) {
            dispatcher.poll()?;
            tx_packets += drain_tx(&fabric);
            if wait_start.elapsed() > deadline {
                anyhow::bail!("pipeline stalled waiting for frame {frame_id}'s slot");
            }
            std::hint::spin_loop();
        }

        stage_frame(&phy, &schedule, &buffer, frame_id);

        for symbol_id in 0..schedule.num_symbols() as u8 {
            if schedule.symbol_type(symbol_id) == SymbolType::Downlink {
                continue;
            }
            if let Some(recorder) = &recorder {
                forward_to_recorder(recorder, &buffer, frame_id, symbol_id, phy.bs_ant_num);
            }
            dispatcher.on_packet_rx(frame_id, symbol_id)?;
            dispatcher.poll()?;
            tx_packets += drain_tx(&fabric);
        }
    }

    // Drain the in-flight tail
    let drain_start = Instant::now();
    while !dispatcher.is_idle() {
        dispatcher.poll()?;
        tx_packets += drain_tx(&fabric);
        if drain_start.elapsed() > deadline {
            anyhow::bail!("pipeline stalled during drain");
        }
        std::hint::spin_loop();
    }
    tx_packets += drain_tx(&fabric);

    pool.shutdown();
    let recorder_dropped = match recorder.as_mut() {
        Some(recorder) => {
            recorder.stop();
            recorder.dropped()
        }
        None => 0,
    };

    stats.print_summary();
    let dropped = fabric.total_dropped();
    if dropped > 0 {
        warn!(dropped, "compute tasks were dropped under queue pressure");
    }

    Ok(EngineReport { frames_completed: dispatcher.frames_completed(), tx_packets, recorder_dropped })
}

/// Pull finished transmit packets off the dedicated queue; a real front-end
/// would hand them to the radio here.
fn drain_tx(fabric: &EventFabric) -> u64 {
    let mut count = 0;
    while fabric.try_dequeue_tx().is_some() {
        count += 1;
    }
    count
}

/// Deterministic unit-modulus receive sample.
fn synth_sample(frame_id: FrameId, symbol_id: u8, ant: usize, i: usize) -> Complex32 {
    let phase = frame_id as f32 * 0.37
        + symbol_id as f32 * 1.3
        + ant as f32 * 0.11
        + i as f32 * 0.013;
    Complex32::from_polar(1.0, phase)
}

/// Stage one frame's inputs: time-domain receive planes for pilot and
/// uplink symbols, modulated UE data for downlink symbols.
fn stage_frame(
    phy: &PhyConfig,
    schedule: &FrameSchedule,
    buffer: &BasebandBuffer,
    frame_id: FrameId,
) {
    use std::f32::consts::FRAC_1_SQRT_2;

    let slot = buffer.slot(frame_id);
    for symbol_id in 0..schedule.num_symbols() as u8 {
        match schedule.symbol_type(symbol_id) {
            SymbolType::Pilot | SymbolType::Uplink => {
                for ant in 0..phy.bs_ant_num {
                    // SAFETY: the slot was admitted as free, so no stage
                    // holds any of this frame's tensors yet.
                    let plane = unsafe { buffer.time_rx_mut(slot, symbol_id, ant) };
                    for (i, sample) in plane.iter_mut().enumerate() {
                        *sample = synth_sample(frame_id, symbol_id, ant, i);
                    }
                }
            }
            SymbolType::Downlink => {
                let Some(dl_idx) = schedule.dl_symbol_idx(symbol_id) else {
                    continue;
                };
                // SAFETY: as above.
                let plane = unsafe { buffer.dl_mod_mut(slot, dl_idx) };
                for (i, sym) in plane.iter_mut().enumerate() {
                    // Unit-power QPSK from a deterministic bit pattern
                    let bits = frame_id as usize + i;
                    let re = if bits % 2 == 0 { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
                    let im = if (bits / 2) % 2 == 0 { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
                    *sym = Complex32::new(re, im);
                }
            }
        }
    }
}

/// Copy one received symbol's planes to the recorder. Lossy by design:
/// dropped chunks are counted by the recorder itself.
fn forward_to_recorder(
    recorder: &RecorderThread,
    buffer: &BasebandBuffer,
    frame_id: FrameId,
    symbol_id: u8,
    num_ants: usize,
) {
    let slot = buffer.slot(frame_id);
    for ant in 0..num_ants {
        // SAFETY: the driver staged this plane and no FFT task for it has
        // been issued yet.
        let samples: Arc<[Complex32]> =
            unsafe { buffer.time_rx(slot, symbol_id, ant) }.to_vec().into();
        recorder.dispatch(SampleChunk { frame_id, symbol_id, ant_id: ant as u16, samples });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smoke_config() -> BbuConfig {
        let mut cfg = BbuConfig::default();
        cfg.phy = PhyConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_data_num: 64,
            pilot_spacing: 8,
            frame_schedule: "PPUUD".to_string(),
            window_depth: 4,
            demul_block_size: 32,
            beam_block_size: 16,
            num_workers: 6,
            ..PhyConfig::default()
        };
        cfg.driver.num_frames = 8;
        cfg
    }

    #[test]
    fn test_engine_end_to_end() {
        let cfg = smoke_config();
        let report = run_engine(&cfg).unwrap();

        assert_eq!(report.frames_completed, 8);
        // One transmit packet per (frame, downlink symbol, antenna)
        assert_eq!(report.tx_packets, 8 * 1 * 4);
    }

    #[test]
    fn test_engine_with_recorder() {
        let mut cfg = smoke_config();
        cfg.driver.num_frames = 4;
        cfg.phy.recorder.enabled = true;
        cfg.phy.recorder.capacity = 1024;
        let path = std::env::temp_dir().join("bbu_recorder_smoke.bin");
        cfg.phy.recorder.path = path.to_string_lossy().into_owned();

        let report = run_engine(&cfg).unwrap();
        assert_eq!(report.frames_completed, 4);
        assert_eq!(report.recorder_dropped, 0);

        // 4 frames x 4 received symbols x 4 antennas, 11-byte header plus
        // 64 samples each
        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.len(), 4 * 4 * 4 * (11 + 64 * 8));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_engine_rejects_unwritable_recorder_path() {
        let mut cfg = smoke_config();
        cfg.phy.recorder.enabled = true;
        cfg.phy.recorder.path = std::env::temp_dir()
            .join("no_such_dir")
            .join("recorder.bin")
            .to_string_lossy()
            .into_owned();

        let err = run_engine(&cfg).unwrap_err();
        assert!(err.to_string().contains("Initialization failed"), "{err}");
    }
}

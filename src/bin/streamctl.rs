use std::env;
use std::error::Error;
use std::process;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use dasp_signal::Signal;

use isostream_kit::cycle_timer::{TICKS_PER_SECOND, ticks_to_cycles, wrap_ticks};
use isostream_kit::{
    BusClock, PortList, ProcessorHandle, SimulatedTransport, StreamError, StreamProcessor,
    StreamProcessorManager, StreamSnapshot, StreamingConfig, init_tracing,
};

const RATE: u32 = 48_000;
const CHANNELS: usize = 2;
const PACKET_FRAMES: usize = 8;
// Eight seconds of bus time.
const PACKETS: u32 = 48_000;
const REPORT_EVERY: u32 = 12_000;
const TONE_HZ: f64 = 1_000.0;
// Device crystal runs slightly fast relative to the bus.
const DEVICE_DRIFT_PPM: f64 = 40.0;

enum Report {
    Progress {
        packet: u32,
        receive: StreamSnapshot,
        transmit: StreamSnapshot,
    },
    Done {
        peak: f32,
    },
}

type StreamPair = (StreamProcessorManager, ProcessorHandle, ProcessorHandle);

fn build(config: &StreamingConfig, clock: &BusClock) -> Result<StreamPair, StreamError> {
    let mut spm = StreamProcessorManager::with_geometry(Arc::new(config.geometry()));
    let rx = spm.register(config.apply(
        StreamProcessor::receive(
            0,
            RATE,
            Box::new(SimulatedTransport::new(clock.clone(), 0)),
            Box::new(PortList::numbered("capture_", CHANNELS)),
        ),
        None,
    ));
    let tx = spm.register(config.apply(
        StreamProcessor::transmit(
            1,
            RATE,
            Box::new(SimulatedTransport::new(clock.clone(), 1)),
            Box::new(PortList::numbered("playback_", CHANNELS)),
        ),
        None,
    ));
    spm.init_all()?;
    spm.prepare_all()?;
    spm.reset_all()?;
    spm.set_sync_source(tx, Some(rx))?;
    Ok((spm, rx, tx))
}

fn simulate(
    spm: &StreamProcessorManager,
    clock: &BusClock,
    rx: ProcessorHandle,
    tx: ProcessorHandle,
    reports: &Sender<Report>,
) -> Result<(), StreamError> {
    let receive = spm.get(rx)?;
    let transmit = spm.get(tx)?;
    let period = receive.period_size() as usize;
    let device_tpf = TICKS_PER_SECOND as f64 / f64::from(RATE) * (1.0 - DEVICE_DRIFT_PPM * 1e-6);

    let mut tone = dasp_signal::rate(f64::from(RATE)).const_hz(TONE_HZ).sine();
    let mut app_period = vec![0.0f32; period * CHANNELS];
    let mut packet = vec![0.0f32; PACKET_FRAMES * CHANNELS];
    let mut elapsed = clock.now_ticks() as f64;
    let mut peak = 0.0f32;

    for n in 1..=PACKETS {
        elapsed += PACKET_FRAMES as f64 * device_tpf;
        let now = wrap_ticks(elapsed.round() as u64);
        clock.set_ticks(now);

        while transmit.buffer().space_frames() >= period {
            for frame in app_period.chunks_exact_mut(CHANNELS) {
                frame.fill((tone.next() * 0.5) as f32);
            }
            transmit.port_write(&app_period, None)?;
        }

        if transmit.is_deadline_reached(ticks_to_cycles(now)) {
            transmit.transport_get(&mut packet, now)?;
            receive.transport_put(&packet, now)?;
        }

        while receive.buffer().frame_count() >= period {
            receive.port_read(&mut app_period)?;
            peak = app_period.iter().fold(peak, |acc, s| acc.max(s.abs()));
        }

        if n % REPORT_EVERY == 0 {
            let report = Report::Progress {
                packet: n,
                receive: spm.dump(rx)?,
                transmit: spm.dump(tx)?,
            };
            if reports.send(report).is_err() {
                return Ok(());
            }
        }
    }
    let _ = reports.send(Report::Done { peak });
    Ok(())
}

fn run_status(config: &StreamingConfig) -> Result<(), Box<dyn Error>> {
    let clock = BusClock::manual(0);
    let (spm, rx, tx) = build(config, &clock)?;
    let start = clock.now_cycles() + 16;
    for handle in spm.handles() {
        let processor = spm.get(handle)?;
        processor.set_running(true);
        processor.prepare_for_enable(start);
    }
    spm.enable_all(start);

    let (report_tx, report_rx) = unbounded();
    thread::scope(|scope| -> Result<(), Box<dyn Error>> {
        let (spm, clock) = (&spm, &clock);
        let worker = scope.spawn(move || simulate(spm, clock, rx, tx, &report_tx));
        for report in report_rx.iter() {
            match report {
                Report::Progress {
                    packet,
                    receive,
                    transmit,
                } => {
                    println!("--- after {packet} packets ---");
                    print!("{receive}");
                    print!("{transmit}");
                }
                Report::Done { peak } => {
                    println!("Loopback peak level : {peak:.3}");
                    break;
                }
            }
        }
        match worker.join() {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err("transport thread panicked".into()),
        }
    })?;

    for handle in spm.handles() {
        spm.get(handle)?.prepare_for_disable();
    }
    spm.disable_all();
    let drift = (spm.tracked_frame_rate(tx)? / f64::from(RATE) - 1.0) * 1e6;
    println!("Recovered drift     : {drift:.1} ppm");
    for handle in spm.handles() {
        println!("Xruns {handle}         : {}", spm.get(handle)?.xruns());
    }
    Ok(())
}

fn main() {
    init_tracing();
    let mut config_path = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => {}
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(path),
                None => {
                    eprintln!("streamctl: --config needs a path");
                    process::exit(1);
                }
            },
            "--help" | "-h" => {
                println!("Usage: streamctl [--status] [--config FILE]");
                println!();
                println!("Runs a receive/transmit pair over a simulated bus and prints state.");
                return;
            }
            other => {
                eprintln!("streamctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    let config = match config_path {
        Some(path) => match StreamingConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("streamctl: {err}");
                process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };

    if let Err(err) = run_status(&config) {
        eprintln!("streamctl: {err}");
        process::exit(1);
    }
}

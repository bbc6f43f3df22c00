use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use mx_pulser::hal::RelayStatus;
use mx_pulser::{load_config, CallbackLoop, ManualClock, PulseCount, SoftBench};

const CONFIG: &str = r#"
[callback]
enabled = true
interval_ms = 100
tick_ms = 10

[[pulsers]]
type = "doutput"
name = "shutter"
output = "do0"
pulse_width = 0.1
pulse_period = 0.5
num_pulses = 3

[[pulsers]]
type = "relay"
name = "valve"
relay = "rly0"
pulse_width = 0.2
pulse_period = 0.4
num_pulses = 1

[[pulsers]]
type = "sis3820"
name = "lne"
crate_number = 1
base_address = 0x38000000
address_mode = "a32"
pulse_period = 0.001
num_pulses = 500
"#;

fn load() -> mx_pulser::AppConfig {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    load_config(Some(file.path())).unwrap()
}

#[test]
fn every_pulser_type_runs_from_config() {
    let config = load();
    let clock = ManualClock::new();
    let callbacks = CallbackLoop::new(Arc::new(clock.clone()));
    let (sender, receiver) = unbounded();
    let mut bench = SoftBench::build(&config, Arc::new(clock.clone()), Some(sender)).unwrap();
    bench.registry.open_all(Some(&callbacks)).unwrap();

    for name in ["shutter", "valve", "lne"] {
        bench.registry.by_name_mut(name).unwrap().start().unwrap();
    }
    let relay = bench.relays["rly0"].clone();
    assert_eq!(relay.current_status(), RelayStatus::Closed);

    for _ in 0..150 {
        clock.advance(Duration::from_millis(10));
        callbacks.poll(&mut bench.registry).unwrap();
    }

    for name in ["shutter", "valve", "lne"] {
        let pulser = bench.registry.by_name_mut(name).unwrap();
        assert!(!pulser.is_busy().unwrap(), "'{name}' still busy");
    }
    assert_eq!(relay.current_status(), RelayStatus::Open);

    let waveform = bench.output_waveform("do0").unwrap();
    let highs = waveform.iter().filter(|&&(_, level)| level == 1.0).count();
    assert_eq!(highs, 3);

    // 3 pulses on the shutter, 1 on the valve, two edges each
    let events: Vec<_> = receiver.try_iter().collect();
    assert_eq!(events.iter().filter(|e| e.pulser == "shutter").count(), 6);
    assert_eq!(events.iter().filter(|e| e.pulser == "valve").count(), 2);
}

#[test]
fn sis_pulser_programs_prescaler_from_config() {
    let config = load();
    let clock = ManualClock::new();
    let mut bench = SoftBench::build(&config, Arc::new(clock.clone()), None).unwrap();
    bench.registry.open_all(None).unwrap();

    // SIS3820 LNE prescaler register, 1 ms at 10 MHz
    assert_eq!(bench.vme.register(1, 0x3800_0018), Some(9999));

    let lne = bench.registry.by_name_mut("lne").unwrap();
    lne.set_num_pulses(PulseCount::Forever).unwrap();
    lne.start().unwrap();
    clock.advance(Duration::from_secs(60));
    assert!(lne.is_busy().unwrap());
    lne.stop().unwrap();
    assert!(!lne.is_busy().unwrap());
}

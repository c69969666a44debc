use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::Parser;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_storage::{ReadStorage, Storage};
use fabrik_selftest::orchestrator::TICK_PERIOD_MS;
use fabrik_selftest::{Bridge, Selftest, SelftestRecord, TestMask, TestResult};
use fabrik_sim::harness::Harness;
use fabrik_sim::simulator::Machine;
use fabrik_store::Store;

/// Runs the selftest wizard against the simulated machine.
#[derive(Parser)]
struct Args {
    /// Sub-tests to run (fans, loadcell, xaxis, yaxis, zaxis, axes,
    /// heaters, fsensor, dock). Empty means everything.
    tests: Vec<String>,

    /// Back the config store with this file, so verdicts survive
    /// between invocations.
    #[arg(long)]
    flash: Option<PathBuf>,
}

const FLASH_SIZE: usize = 512;

/// Optionally file-backed flash for the config store.
struct FileFlash {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
}

impl FileFlash {
    fn open(path: Option<PathBuf>) -> anyhow::Result<FileFlash> {
        let mut bytes = match &path {
            Some(p) if p.exists() => fs::read(p)?,
            _ => Vec::new(),
        };
        bytes.resize(FLASH_SIZE, 0);
        Ok(FileFlash { path, bytes })
    }
}

impl ReadStorage for FileFlash {
    type Error = std::io::Error;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        bytes.copy_from_slice(&self.bytes[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl Storage for FileFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(path) = &self.path {
            fs::write(path, &self.bytes)?;
        }
        Ok(())
    }
}

fn parse_mask(tests: &[String]) -> anyhow::Result<TestMask> {
    if tests.is_empty() {
        return Ok(TestMask::ALL);
    }
    let mut mask = TestMask::NONE;
    for name in tests {
        mask = mask.or(match name.as_str() {
            "fans" => TestMask::FANS,
            "loadcell" => TestMask::LOADCELL,
            "xaxis" => TestMask::XAXIS,
            "yaxis" => TestMask::YAXIS,
            "zaxis" => TestMask::ZAXIS,
            "axes" => TestMask::AXES,
            "heaters" => TestMask::HEATERS,
            "fsensor" => TestMask::FSENSOR,
            "dock" => TestMask::DOCK,
            "all" => TestMask::ALL,
            other => bail!("unknown test {other:?}"),
        });
    }
    Ok(mask)
}

fn verdict(result: TestResult) -> &'static str {
    match result {
        TestResult::Unknown => "unknown",
        TestResult::Passed => "passed",
        TestResult::Failed => "FAILED",
        TestResult::Skipped => "skipped",
    }
}

fn print_record(record: &SelftestRecord) {
    let rows = [
        ("fans", record.fans),
        ("loadcell", record.loadcell),
        ("x-axis", record.xaxis),
        ("y-axis", record.yaxis),
        ("z-axis", record.zaxis),
        ("nozzle", record.nozzle),
        ("bed", record.bed),
        ("fsensor", record.fsensor),
        ("dock", record.dock),
    ];
    for (name, result) in rows {
        println!("{name:10} {}", verdict(result));
    }
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();
    let mask = parse_mask(&args.tests)?;

    let flash = FileFlash::open(args.flash)?;
    let mut store = Store::load(flash, 0).map_err(|e| anyhow!("{e}"))?;
    let mut machine = Machine::new();
    let mut harness = Harness::new();
    let bridge: Bridge<NoopRawMutex> = Bridge::new();
    let cfg = fabrik_sim::machine_config();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(mask);
    let mut ticks = 0u64;
    while selftest.is_in_progress() {
        machine.advance(TICK_PERIOD_MS);
        harness.react(&mut machine, &bridge);
        let mut periph = machine.peripherals(&mut store);
        selftest.tick(&mut periph, &bridge);
        ticks += 1;
        if ticks > 1_000_000 {
            bail!("simulation did not settle");
        }
    }

    println!(
        "selftest {} after {} simulated seconds",
        if selftest.is_aborted() { "aborted" } else { "finished" },
        ticks * TICK_PERIOD_MS as u64 / 1000,
    );
    if let Some(fault) = selftest.fatal_fault() {
        println!("fatal fault: {fault:?}");
    }
    print_record(&store.data().selftest);

    if selftest.is_aborted() {
        bail!("selftest did not complete");
    }
    Ok(())
}

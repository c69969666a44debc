#![no_std]
#![no_main]

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Ticker};
use esp32c3_hal::adc::{AdcConfig, Attenuation, ADC, ADC1};
use esp32c3_hal::clock::{ClockControl, Clocks};
use esp32c3_hal::ledc::channel::{self, ChannelIFace as _};
use esp32c3_hal::ledc::timer::{self, TimerIFace as _};
use esp32c3_hal::ledc::{LSGlobalClkSource, LowSpeed, LEDC};
use esp32c3_hal::timer::TimerGroup;
use esp32c3_hal::{embassy, peripherals::Peripherals, prelude::*, IO};
use esp_backtrace as _;
use esp_println::println;
use esp_storage::FlashStorage;

use fabrik_selftest::hal::{AxisId, HeaterId};
use fabrik_selftest::parts::axis::AxisConfig;
use fabrik_selftest::parts::dock::DockConfig;
use fabrik_selftest::parts::fan::FanConfig;
use fabrik_selftest::parts::fsensor::FsensorConfig;
use fabrik_selftest::parts::heater::HeaterConfig;
use fabrik_selftest::parts::loadcell::LoadcellConfig;
use fabrik_selftest::{Bridge, Selftest, SelftestConfig, TestMask};
use fabrik_store::Store;

mod board;

use board::{
    Board, BoardFans, BoardFsensor, BoardLoadcell, BoardMotion, BoardThermal, Buttons, Stepper,
};

macro_rules! singleton {
    ($val:expr, $T:ty) => {{
        static STATIC_CELL: ::static_cell::StaticCell<$T> = ::static_cell::StaticCell::new();
        STATIC_CELL.init($val)
    }};
}

static BRIDGE: Bridge<CriticalSectionRawMutex> = Bridge::new();

const FLASH_ADDR: u32 = 0x110000;

// The jig carries only the toolhead: no X/Y gantry, no bed, no dock.
const BOOT_MASK: TestMask = TestMask::FANS
    .or(TestMask::LOADCELL)
    .or(TestMask::FSENSOR);

fn selftest_config() -> SelftestConfig {
    SelftestConfig {
        fans: FanConfig {
            name: "fans",
            rpm_min_print: 3000,
            rpm_max_print: 6000,
            rpm_min_heatbreak: 6000,
            rpm_max_heatbreak: 9500,
            spinup_ms: 3000,
            spindown_ms: 3000,
        },
        loadcell: LoadcellConfig {
            name: "loadcell",
            cool_temp_c: 50.0,
            countdown_sec: 5,
            countdown_load_error_g: 500,
            tap_min_g: 50,
            tap_max_g: 500,
            tap_timeout_ms: 30_000,
            z_extra_pos_mm: 40.0,
            z_feedrate_mm_s: 10.0,
        },
        xaxis: AxisConfig {
            name: "x-axis",
            axis: AxisId::X,
            length_mm: 182.0,
            length_min_mm: 178.0,
            length_max_mm: 188.0,
            fr_table_mm_s: &[50.0, 90.0],
            end_gap_mm: 5.0,
            park: false,
            park_pos_mm: 0.0,
        },
        yaxis: AxisConfig {
            name: "y-axis",
            axis: AxisId::Y,
            length_mm: 185.0,
            length_min_mm: 179.0,
            length_max_mm: 190.0,
            fr_table_mm_s: &[50.0, 90.0],
            end_gap_mm: 5.0,
            park: true,
            park_pos_mm: 92.0,
        },
        zaxis: AxisConfig {
            name: "z-axis",
            axis: AxisId::Z,
            length_mm: 120.0,
            length_min_mm: 115.0,
            length_max_mm: 126.0,
            fr_table_mm_s: &[12.0],
            end_gap_mm: 4.0,
            park: false,
            park_pos_mm: 0.0,
        },
        nozzle: HeaterConfig {
            name: "nozzle",
            heater: HeaterId::Nozzle,
            start_temp_c: 40.0,
            target_temp_c: 200.0,
            heat_time_ms: 42_000,
            heat_min_temp_c: 130.0,
            heat_max_temp_c: 230.0,
        },
        bed: HeaterConfig {
            name: "bed",
            heater: HeaterId::Bed,
            start_temp_c: 45.0,
            target_temp_c: 60.0,
            heat_time_ms: 60_000,
            heat_min_temp_c: 50.0,
            heat_max_temp_c: 70.0,
        },
        fsensor: FsensorConfig { name: "fsensor" },
        dock: DockConfig {
            name: "dock",
            num_cycles: 3,
            tolerance_mm: 1.0,
            fatal_distance_mm: 5.0,
        },
        bed_preheat_c: 35.0,
    }
}

/// Prints every screen change and feeds button presses back as the
/// response to whatever screen is current.
#[embassy_executor::task]
async fn ui_task(mut buttons: Buttons) {
    let mut ticker = Ticker::every(Duration::from_millis(20));
    let mut phase = None;
    loop {
        if let Some(data) = BRIDGE.take_notification() {
            println!("selftest: {:?} {:?}", data.phase, data.data);
            phase = Some(data.phase);
        }
        if let (Some(phase), Some(response)) = (phase, buttons.poll()) {
            BRIDGE.respond(phase, response);
        }
        ticker.next().await;
    }
}

#[main]
async fn main(spawner: Spawner) {
    let peripherals = Peripherals::take();
    let system = peripherals.SYSTEM.split();
    let clocks = singleton!(ClockControl::max(system.clock_control).freeze(), Clocks<'_>);
    embassy::init(clocks, TimerGroup::new(peripherals.TIMG0, clocks).timer0);

    let io = IO::new(peripherals.GPIO, peripherals.IO_MUX);

    let analog = peripherals.APB_SARADC.split();
    let mut adc_config = AdcConfig::new();
    let nozzle_sense =
        adc_config.enable_pin(io.pins.gpio0.into_analog(), Attenuation::Attenuation11dB);
    let adc = ADC::<ADC1>::adc(analog.adc1, adc_config).unwrap();
    let thermal = BoardThermal::new(adc, nozzle_sense, io.pins.gpio1.into_push_pull_output());

    let motion = BoardMotion::new(Stepper::new(
        io.pins.gpio2.into_push_pull_output(),
        io.pins.gpio3.into_push_pull_output(),
        io.pins.gpio4.into_push_pull_output(),
        io.pins.gpio5.into_pull_up_input(),
        400.0,
    ));

    let ledc = singleton!(LEDC::new(peripherals.LEDC, clocks), LEDC<'static>);
    ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);
    let fan_timer = singleton!(
        ledc.get_timer::<LowSpeed>(timer::Number::Timer0),
        esp32c3_hal::ledc::timer::Timer<LowSpeed>
    );
    fan_timer
        .configure(timer::config::Config {
            duty: timer::config::Duty::Duty8Bit,
            clock_source: timer::LSClockSource::APBClk,
            frequency: 25u32.kHz(),
        })
        .unwrap();
    let mut print_fan = ledc.get_channel::<LowSpeed, _>(
        channel::Number::Channel0,
        io.pins.gpio6.into_push_pull_output().degrade(),
    );
    print_fan
        .configure(channel::config::Config {
            timer: fan_timer,
            duty_pct: 0,
            pin_config: channel::config::PinConfig::PushPull,
        })
        .unwrap();
    let mut heatbreak_fan = ledc.get_channel::<LowSpeed, _>(
        channel::Number::Channel1,
        io.pins.gpio7.into_push_pull_output().degrade(),
    );
    heatbreak_fan
        .configure(channel::config::Config {
            timer: fan_timer,
            duty_pct: 0,
            pin_config: channel::config::PinConfig::PushPull,
        })
        .unwrap();
    let fans = BoardFans::new(
        [print_fan, heatbreak_fan],
        [
            io.pins.gpio8.into_pull_up_input().degrade(),
            io.pins.gpio10.into_pull_up_input().degrade(),
        ],
    );

    let loadcell = BoardLoadcell::new(
        io.pins.gpio18.into_pull_up_input(),
        io.pins.gpio19.into_push_pull_output(),
        420.0,
    );
    let fsensor = BoardFsensor::new(io.pins.gpio20.into_pull_up_input());

    let mut board = Board::new(motion, thermal, fans, loadcell, fsensor);

    spawner.must_spawn(ui_task(Buttons::new(
        io.pins.gpio9.into_pull_up_input(),
        io.pins.gpio21.into_pull_up_input(),
    )));

    let mut store = match Store::load(FlashStorage::new(), FLASH_ADDR) {
        Ok(store) => store,
        Err(e) => {
            println!("config store unusable: {}", e);
            loop {
                embassy_time::Timer::after(Duration::from_secs(1)).await;
            }
        }
    };

    let cfg = selftest_config();
    let mut selftest = Selftest::new(&cfg);
    if fabrik_selftest::hal::Config::run_wizard(&store) {
        println!("first boot, running the selftest wizard");
        selftest.start(BOOT_MASK);
    }

    let mut ticker = Ticker::every(Duration::from_millis(1));
    loop {
        board.service();
        let mut periph = board.peripherals(&mut store);
        selftest.tick(&mut periph, &BRIDGE);
        ticker.next().await;
    }
}

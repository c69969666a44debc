//! Host-side simulator for the selftest engine: a small machine model,
//! a scripted operator, and the tuning profile they are matched to.

pub mod harness;
pub mod simulator;

use fabrik_selftest::hal::{AxisId, HeaterId};
use fabrik_selftest::parts::axis::AxisConfig;
use fabrik_selftest::parts::dock::DockConfig;
use fabrik_selftest::parts::fan::FanConfig;
use fabrik_selftest::parts::fsensor::FsensorConfig;
use fabrik_selftest::parts::heater::HeaterConfig;
use fabrik_selftest::parts::loadcell::LoadcellConfig;
use fabrik_selftest::SelftestConfig;

/// Tuning matched to [`simulator::Machine`]: the axis bands bracket its
/// true travel, the heater bands its first-order thermals.
pub fn machine_config() -> SelftestConfig {
    SelftestConfig {
        fans: FanConfig {
            name: "fans",
            rpm_min_print: 2500,
            rpm_max_print: 3500,
            rpm_min_heatbreak: 2500,
            rpm_max_heatbreak: 3500,
            spinup_ms: 1000,
            spindown_ms: 1000,
        },
        loadcell: LoadcellConfig {
            name: "loadcell",
            cool_temp_c: 50.0,
            countdown_sec: 2,
            countdown_load_error_g: 500,
            tap_min_g: 50,
            tap_max_g: 500,
            tap_timeout_ms: 5000,
            z_extra_pos_mm: 40.0,
            z_feedrate_mm_s: 10.0,
        },
        xaxis: AxisConfig {
            name: "x-axis",
            axis: AxisId::X,
            length_mm: 180.0,
            length_min_mm: 175.0,
            length_max_mm: 186.0,
            fr_table_mm_s: &[40.0, 80.0],
            end_gap_mm: 5.0,
            park: false,
            park_pos_mm: 0.0,
        },
        yaxis: AxisConfig {
            name: "y-axis",
            axis: AxisId::Y,
            length_mm: 180.0,
            length_min_mm: 175.0,
            length_max_mm: 186.0,
            fr_table_mm_s: &[40.0, 80.0],
            end_gap_mm: 5.0,
            park: true,
            park_pos_mm: 90.0,
        },
        zaxis: AxisConfig {
            name: "z-axis",
            axis: AxisId::Z,
            length_mm: 185.0,
            length_min_mm: 180.0,
            length_max_mm: 192.0,
            fr_table_mm_s: &[20.0],
            end_gap_mm: 5.0,
            park: false,
            park_pos_mm: 0.0,
        },
        nozzle: HeaterConfig {
            name: "nozzle",
            heater: HeaterId::Nozzle,
            start_temp_c: 40.0,
            target_temp_c: 200.0,
            heat_time_ms: 10_000,
            heat_min_temp_c: 150.0,
            heat_max_temp_c: 230.0,
        },
        bed: HeaterConfig {
            name: "bed",
            heater: HeaterId::Bed,
            start_temp_c: 45.0,
            target_temp_c: 60.0,
            heat_time_ms: 10_000,
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

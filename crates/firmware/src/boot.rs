//! Board bring-up for the flash bench (NUCLEO-H743ZI)
//!
//! Initialization order:
//!   1. Clocks (`build_embassy_config`), Embassy time driver
//!   2. Independent watchdog
//!   3. Flash SPI at the safe programming clock, chip select high
//!   4. microSD over SPI at the init clock, then the data clock
//!   5. Console UART, worker and console tasks
//!
//! The pin map below is the wiring the bench was built with. Change it to
//! match your board before flashing.
//!
//! | Signal      | MCU pin | Peripheral        |
//! |-------------|---------|-------------------|
//! | Flash SCK   | PA5     | SPI1              |
//! | Flash MOSI  | PB5     | SPI1              |
//! | Flash MISO  | PA6     | SPI1              |
//! | Flash CS    | PD14    | GPIO, active low  |
//! | SD SCK      | PB10    | SPI2              |
//! | SD MOSI     | PC1     | SPI2              |
//! | SD MISO     | PC2     | SPI2              |
//! | SD CS       | PB12    | GPIO, active low  |
//! | Console TX  | PD8     | USART3 (ST-LINK)  |
//! | Console RX  | PD9     | USART3 (ST-LINK)  |

use flashbench::config::SAFE_PROG_HZ;

/// Ordered bring-up steps, printed at boot.
pub const BOOT_SEQUENCE_STEPS: &[&str] = &[
    "1. RCC: PLL1 400 MHz sysclk, 100 MHz APB for SPI1/SPI2",
    "2. IWDG: armed, fed by the main task",
    "3. SPI1: flash bus at the safe programming clock",
    "4. SPI2: microSD at 400 kHz for init, then 12 MHz",
    "5. USART3: console at 115200 baud",
    "6. Embassy executor: spawn worker and console tasks",
];

/// Watchdog timeout.
///
/// The longest blocking step is a sector erase on a slow part (4 s for the
/// SST26 family), so the timeout leaves room for that plus a log flush.
pub const WATCHDOG_TIMEOUT_MS: u32 = 8_000;

/// How often the main task feeds the watchdog.
pub const WATCHDOG_FEED_MS: u64 = 1_000;

/// Flash SPI clock at boot.
pub const FLASH_BOOT_HZ: u32 = SAFE_PROG_HZ;

/// SD card clock during card initialization.
pub const SD_INIT_HZ: u32 = 400_000;

/// SD card clock once the card is up.
pub const SD_DATA_HZ: u32 = 12_000_000;

/// Console baud rate.
pub const CONSOLE_BAUD: u32 = 115_200;

/// Watchdog timeout in microseconds, as the IWDG driver takes it.
pub const fn init_watchdog_config() -> u32 {
    WATCHDOG_TIMEOUT_MS.saturating_mul(1_000)
}

/// Embassy configuration for the bench.
///
/// SPI1 and SPI2 are fed from PLL1_Q at 200 MHz, so the prescalers reach
/// 50 MHz at /4 and the benchmark's 12/24/36 MHz requests round down to the
/// nearest power-of-two divider.
#[cfg(feature = "hardware")]
pub fn build_embassy_config() -> embassy_stm32::Config {
    use embassy_stm32::rcc::*;

    let mut config = embassy_stm32::Config::default();

    // ── Oscillators ─────────────────────────────────────────────────────────
    config.rcc.hsi = Some(HSIPrescaler::DIV1);
    config.rcc.csi = true;

    // ── PLL1: system clock + SPI kernel clock ───────────────────────────────
    // HSI (64 MHz) / prediv(4) = 16 MHz → × mul(50) = 800 MHz VCO
    // PLL1_P = VCO / divp(2) = 400 MHz  → system clock
    // PLL1_Q = VCO / divq(4) = 200 MHz  → SPI1/2/3 kernel clock (SPI123SEL)
    config.rcc.pll1 = Some(Pll {
        source: PllSource::HSI,
        prediv: PllPreDiv::DIV4,
        mul: PllMul::MUL50,
        divp: Some(PllDiv::DIV2),
        divq: Some(PllDiv::DIV4),
        divr: None,
    });

    // ── System clock + bus prescalers ────────────────────────────────────────
    config.rcc.sys = Sysclk::PLL1_P; // 400 MHz
    config.rcc.ahb_pre = AHBPrescaler::DIV2; // 200 MHz
    config.rcc.apb1_pre = APBPrescaler::DIV2; // 100 MHz
    config.rcc.apb2_pre = APBPrescaler::DIV2; // 100 MHz
    config.rcc.apb3_pre = APBPrescaler::DIV2; // 100 MHz
    config.rcc.apb4_pre = APBPrescaler::DIV2; // 100 MHz
    config.rcc.voltage_scale = VoltageScale::Scale1;

    config
}

/// SPI configuration for a given SCK frequency (mode 0, MSB first).
#[cfg(feature = "hardware")]
pub fn spi_config(hz: u32) -> embassy_stm32::spi::Config {
    use embassy_stm32::spi;
    use platform::{BitOrder, SpiConfig, SpiMode};

    let wanted = SpiConfig::nor_flash(hz);
    let mut config = spi::Config::default();
    config.frequency = embassy_stm32::time::Hertz(wanted.frequency);
    config.mode = match wanted.mode {
        SpiMode::Mode0 => spi::MODE_0,
        SpiMode::Mode1 => spi::MODE_1,
        SpiMode::Mode2 => spi::MODE_2,
        SpiMode::Mode3 => spi::MODE_3,
    };
    config.bit_order = match wanted.bit_order {
        BitOrder::MsbFirst => spi::BitOrder::MsbFirst,
        BitOrder::LsbFirst => spi::BitOrder::LsbFirst,
    };
    config
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_outlasts_a_slow_sector_erase() {
        assert!(WATCHDOG_TIMEOUT_MS > 4_000);
        assert!(u64::from(WATCHDOG_TIMEOUT_MS) > WATCHDOG_FEED_MS * 4);
        assert_eq!(init_watchdog_config(), 8_000_000);
    }

    #[test]
    fn sd_init_clock_is_in_range() {
        // SD identification mode runs at 100-400 kHz
        assert!((100_000..=400_000).contains(&SD_INIT_HZ));
        assert!(SD_DATA_HZ <= 25_000_000);
    }

    #[test]
    fn boot_steps_are_ordered() {
        for (i, step) in BOOT_SEQUENCE_STEPS.iter().enumerate() {
            assert!(step.starts_with(&format!("{}.", i + 1)));
        }
    }
}

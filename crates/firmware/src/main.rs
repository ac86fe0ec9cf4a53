//! Flash bench firmware - main entry point
//!
//! Hardware-only entry point for STM32H743ZI.

#![no_std]
#![no_main]

use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32::gpio::{AnyPin, Level, Output, Pin, Speed};
use embassy_stm32::dma::NoDma;
use embassy_stm32::peripherals::{DMA1_CH0, DMA1_CH1, DMA1_CH2, DMA1_CH3, IWDG1, SPI1, SPI2, USART3};
use embassy_stm32::spi::Spi;
use embassy_stm32::usart::{self, Uart, UartRx, UartTx};
use embassy_stm32::{bind_interrupts, wdg::IndependentWatchdog};
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::SdCard;
use flashbench::{TransferBuffers, Workbench};
use platform::storage_sdcard::{FixedTime, SdCardStorage};
use platform::{Removable, TextSink};
use spi_nor::SpiNor;
use static_cell::StaticCell;

use firmware::boot;
use firmware::clocked::ClockedSpi;
use firmware::console::parse_key;
use firmware::worker::{self, COMMANDS, STATUS};

// Panic handler
use panic_probe as _;

bind_interrupts!(struct Irqs {
    USART3 => usart::InterruptHandler<USART3>;
});

type FlashBus = Spi<'static, SPI1, DMA1_CH0, DMA1_CH1>;
type FlashSpi = ClockedSpi<FlashBus, Output<'static, AnyPin>, Delay>;
type CardSpi = ExclusiveDevice<Spi<'static, SPI2, NoDma, NoDma>, Output<'static, AnyPin>, Delay>;
type CardStorage = Removable<SdCardStorage<SdCard<CardSpi, Delay>, FixedTime>>;
type Bench = Workbench<'static, FlashSpi, Delay, CardStorage>;

static BUFFERS: StaticCell<TransferBuffers> = StaticCell::new();

/// Console output on the ST-LINK virtual COM port.
///
/// Blocking writes keep [`TextSink`] synchronous; at 115200 baud a full
/// summary block takes well under the watchdog period.
struct UartSink {
    tx: UartTx<'static, USART3, DMA1_CH2>,
}

impl TextSink for UartSink {
    fn write_text(&mut self, text: &str) {
        if self.tx.blocking_write(text.as_bytes()).is_err() {
            defmt::warn!("console write failed");
        }
    }
}

fn reclock_flash(bus: &mut FlashBus, hz: u32) {
    if bus.set_config(&boot::spi_config(hz)).is_err() {
        defmt::warn!("flash SPI rejected {=u32} Hz", hz);
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    defmt::info!("{=str} {=str}", platform::config::banner(), platform::config::APP_VERSION);
    for step in boot::BOOT_SEQUENCE_STEPS {
        defmt::info!("boot: {=str}", step);
    }

    let p = embassy_stm32::init(boot::build_embassy_config());

    let mut watchdog = IndependentWatchdog::new(p.IWDG1, boot::init_watchdog_config());
    watchdog.unleash(); // cannot be stopped after this point
    defmt::info!("IWDG armed: timeout={=u32}ms", boot::WATCHDOG_TIMEOUT_MS);

    // Flash bus: SPI1 with DMA, chip select released before the first transfer.
    let flash_bus = Spi::new(
        p.SPI1,
        p.PA5, // SCK
        p.PB5, // MOSI
        p.PA6, // MISO
        p.DMA1_CH0,
        p.DMA1_CH1,
        boot::spi_config(boot::FLASH_BOOT_HZ),
    );
    let flash_cs = Output::new(p.PD14.degrade(), Level::High, Speed::VeryHigh);
    let Ok(flash_dev) = ExclusiveDevice::new(flash_bus, flash_cs, Delay) else {
        defmt::error!("flash CS pin init failed");
        halt(watchdog).await
    };
    let flash = ClockedSpi::new(flash_dev, reclock_flash, boot::FLASH_BOOT_HZ);
    let nor = SpiNor::new(flash, Delay);

    // microSD: SPI2, blocking, 400 kHz until the card answers.
    let card_bus = Spi::new(
        p.SPI2,
        p.PB10, // SCK
        p.PC1,  // MOSI
        p.PC2,  // MISO
        NoDma,
        NoDma,
        boot::spi_config(boot::SD_INIT_HZ),
    );
    let card_cs = Output::new(p.PB12.degrade(), Level::High, Speed::VeryHigh);
    let storage = match ExclusiveDevice::new(card_bus, card_cs, Delay) {
        Ok(dev) => mount_card(SdCard::new(dev, Delay)),
        Err(_) => Removable::empty(),
    };

    // Console: USART3 on the ST-LINK VCP.
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = boot::CONSOLE_BAUD;
    let Ok(uart) = Uart::new(p.USART3, p.PD9, p.PD8, Irqs, p.DMA1_CH2, p.DMA1_CH3, uart_config)
    else {
        defmt::error!("console UART init failed");
        halt(watchdog).await
    };
    let (tx, rx) = uart.split();

    let buffers = BUFFERS.init(TransferBuffers::new());
    let bench = Workbench::new(nor, storage, &STATUS, buffers);

    if spawner.spawn(flash_worker(bench, UartSink { tx })).is_err() {
        defmt::error!("flash worker spawn failed");
    }
    if spawner.spawn(console_task(rx)).is_err() {
        defmt::error!("console task spawn failed");
    }

    // The worker owns the chip; this task only keeps the watchdog fed.
    loop {
        watchdog.pet();
        Timer::after(Duration::from_millis(boot::WATCHDOG_FEED_MS)).await;
    }
}

fn mount_card(card: SdCard<CardSpi, Delay>) -> CardStorage {
    match card.num_bytes() {
        Ok(bytes) => defmt::info!("microSD: {=u64} bytes", bytes),
        Err(_) => {
            defmt::warn!("microSD not detected; results will not be saved");
            return Removable::empty();
        }
    }
    card.spi(|dev| {
        if dev.bus_mut().set_config(&boot::spi_config(boot::SD_DATA_HZ)).is_err() {
            defmt::warn!("microSD stays at init clock");
        }
    });
    match SdCardStorage::mount(card, FixedTime) {
        Ok(storage) => Removable::mounted(storage),
        Err(e) => {
            defmt::warn!("microSD mount failed: {}", defmt::Display2Format(&e));
            Removable::empty()
        }
    }
}

async fn halt(mut watchdog: IndependentWatchdog<'static, IWDG1>) -> ! {
    loop {
        watchdog.pet();
        Timer::after(Duration::from_millis(boot::WATCHDOG_FEED_MS)).await;
    }
}

#[embassy_executor::task]
async fn flash_worker(mut bench: Bench, mut console: UartSink) {
    worker::serve(&mut bench, COMMANDS.receiver(), &STATUS, &mut console).await;
    defmt::info!("menu closed; worker idle until reset");
}

#[embassy_executor::task]
async fn console_task(mut rx: UartRx<'static, USART3, DMA1_CH3>) {
    let mut byte = [0u8; 1];
    loop {
        if rx.read(&mut byte).await.is_err() {
            defmt::warn!("console read error");
            continue;
        }
        let [key] = byte;
        if let Some(command) = parse_key(key) {
            worker::try_send_command(&COMMANDS, command);
        }
    }
}

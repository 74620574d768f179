#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

use defmt_rtt as _; // global logger
use panic_probe as _;
use rtic::app;
use rtic_monotonics::stm32::prelude::*;

use rtos_hal_core::time::{DelayHandle, DelayScheduler, MonotonicClock};
use rtos_hal_core::ClockConfig;

use nvic::rtic_level;
use timer::Tim3;

mod nvic;
mod timer;

stm32_tim2_monotonic!(Mono, 1_000_000);

/// Pending delays the scheduler can hold at once
const MAX_DELAYS: usize = 4;

/// RTIC priority of the TIM3 hardware task
const TIM3_TASK_PRIORITY: u8 = 3;

const CLOCK_CONFIG: ClockConfig = ClockConfig {
    // APB1 at 42 MHz with a prescaler != 1: timers run at twice that
    timer_clock_hz: 84_000_000,
    tick_hz: 500_000,
    counter_bits: 16,
    irq_priority: rtic_level(TIM3_TASK_PRIORITY),
};

static CLOCK: MonotonicClock<Tim3> = MonotonicClock::new(Tim3, CLOCK_CONFIG);
static SCHEDULER: DelayScheduler<'static, Tim3, MAX_DELAYS> = DelayScheduler::new(&CLOCK);

static SAMPLE_DELAY: DelayHandle = DelayHandle::new();
static LOG_DELAY: DelayHandle = DelayHandle::new();

#[app(device = embassy_stm32, peripherals = true, dispatchers = [USART1, USART2, USART6])]
mod app {
    use super::*;
    use core::fmt::Write as _;
    use defmt::{info, warn};
    use embassy_stm32::gpio::{Level, Output, Speed};
    use embassy_stm32::mode::Async;
    use embassy_stm32::peripherals;
    use embassy_stm32::rcc::{Hse, HseMode};
    use embassy_stm32::spi::{self, Spi};
    use embassy_stm32::time::Hertz;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::mutex::Mutex;
    use embedded_io_async::SeekFrom;
    use rtos_hal_core::sdc::Sdc;
    use rtos_hal_core::{SdcConfig, SdcError};
    use static_cell::StaticCell;

    use nvic::Nvic;

    type SpiPeripheral = embassy_stm32::Peri<'static, peripherals::SPI2>;
    type PinPB13 = embassy_stm32::Peri<'static, peripherals::PB13>;
    type PinPB15 = embassy_stm32::Peri<'static, peripherals::PB15>;
    type PinPB14 = embassy_stm32::Peri<'static, peripherals::PB14>;
    type PinPB12 = embassy_stm32::Peri<'static, peripherals::PB12>;
    type DmaTx = embassy_stm32::Peri<'static, peripherals::DMA1_CH4>;
    type DmaRx = embassy_stm32::Peri<'static, peripherals::DMA1_CH3>;
    type SdSpiBus = Mutex<CriticalSectionRawMutex, Spi<'static, Async>>;

    /// microSD breakout on SPI2 (morpho header; PA5 drives LD2)
    struct SdPeripherals {
        spi: SpiPeripheral,
        sck: PinPB13,
        mosi: PinPB15,
        miso: PinPB14,
        cs: PinPB12,
        dma_tx: DmaTx,
        dma_rx: DmaRx,
    }

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        led: Output<'static>,
    }

    #[init]
    fn init(_cx: init::Context) -> (Shared, Local) {
        info!("HAL demo starting...");

        // NUCLEO-F401RE: 8 MHz HSE from the ST-LINK MCO
        let mut config = embassy_stm32::Config::default();
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        // HSE (8 MHz) / PREDIV(4) = 2 MHz (PLL input)
        // 2 MHz * MUL(168) = 336 MHz (VCO)
        // VCO / DIVP(4) = 84 MHz (SYSCLK)
        // VCO / DIVQ(7) = 48 MHz (USB)
        config.rcc.pll_src = embassy_stm32::rcc::PllSource::HSE;
        config.rcc.pll = Some(embassy_stm32::rcc::Pll {
            prediv: embassy_stm32::rcc::PllPreDiv::DIV4,
            mul: embassy_stm32::rcc::PllMul::MUL168,
            divp: Some(embassy_stm32::rcc::PllPDiv::DIV4),
            divq: Some(embassy_stm32::rcc::PllQDiv::DIV7),
            divr: None,
        });
        config.rcc.sys = embassy_stm32::rcc::Sysclk::PLL1_P;
        config.rcc.ahb_pre = embassy_stm32::rcc::AHBPrescaler::DIV1; // 84 MHz
        config.rcc.apb1_pre = embassy_stm32::rcc::APBPrescaler::DIV2; // 42 MHz
        config.rcc.apb2_pre = embassy_stm32::rcc::APBPrescaler::DIV1; // 84 MHz

        let p = embassy_stm32::init(config);
        info!("PLL configured: SYSCLK=84MHz");

        Mono::start(84_000_000);
        info!("TIM2 monotonic timer initialized at 1 MHz");

        CLOCK.init(&Nvic);

        let led = Output::new(p.PA5, Level::Low, Speed::Low);

        let sd_periph = SdPeripherals {
            spi: p.SPI2,
            sck: p.PB13,
            mosi: p.PB15,
            miso: p.PB14,
            cs: p.PB12,
            dma_tx: p.DMA1_CH4,
            dma_rx: p.DMA1_CH3,
        };

        heartbeat::spawn().ok();
        scheduler_task::spawn().ok();
        sampler::spawn().ok();
        sd_logger::spawn(sd_periph).ok();

        (Shared {}, Local { led })
    }

    /// Counter wrap and compare match of the core clock
    #[task(binds = TIM3, priority = 3)]
    fn tim3(_cx: tim3::Context) {
        CLOCK.on_overflow();
        SCHEDULER.on_compare();
    }

    /// Heartbeat task
    #[task(priority = 1, local = [led])]
    async fn heartbeat(cx: heartbeat::Context) {
        info!("Heartbeat task started");
        loop {
            cx.local.led.set_high();
            Mono::delay(100.millis()).await;
            cx.local.led.set_low();
            Mono::delay(4900.millis()).await;
        }
    }

    /// Owns the compare channel of TIM3
    #[task(priority = 2)]
    async fn scheduler_task(_cx: scheduler_task::Context) -> ! {
        info!("Delay scheduler started");
        SCHEDULER.run().await
    }

    /// Checks delay accuracy against the clock it is built on
    #[task(priority = 1)]
    async fn sampler(_cx: sampler::Context) -> ! {
        loop {
            let start = CLOCK.now();
            if let Err(e) = SCHEDULER.delay_us(&SAMPLE_DELAY, 250_000).await {
                warn!("Sample delay failed: {}", e);
            }
            let elapsed = CLOCK.ticks_to_us(CLOCK.elapsed_since(start));
            info!("250 ms delay took {} us (epoch {})", elapsed, CLOCK.epoch());
        }
    }

    /// Appends an uptime line to LOG.TXT every ten seconds
    ///
    /// LOG.TXT must exist with clusters allocated to it; files do not grow.
    #[task(priority = 1)]
    async fn sd_logger(_cx: sd_logger::Context, periph: SdPeripherals) -> ! {
        info!("SD logger started");

        // Identification must run at 400 kHz or less
        let mut spi_config = spi::Config::default();
        spi_config.frequency = Hertz(400_000);

        let spi = Spi::new(
            periph.spi,
            periph.sck,
            periph.mosi,
            periph.miso,
            periph.dma_tx,
            periph.dma_rx,
            spi_config,
        );
        let cs = Output::new(periph.cs, Level::High, Speed::VeryHigh);

        static SPI_BUS: StaticCell<SdSpiBus> = StaticCell::new();
        let bus = SPI_BUS.init(Mutex::new(spi));
        let sdc = Sdc::new(bus, cs, SdcConfig::default());

        if let Err(e) = log_uptime(&sdc).await {
            warn!("SD logging stopped: {}", e);
        }
        loop {
            Mono::delay(60.secs()).await;
        }
    }

    async fn log_uptime(
        sdc: &Sdc<'static, CriticalSectionRawMutex, Spi<'static, Async>, Output<'static>>,
    ) -> Result<(), SdcError> {
        let version = sdc.init().await?;
        info!("SD card ready: {}", version);

        let mut log = sdc.open_stream("LOG.TXT").await?;
        log.seek(SeekFrom::End(0)).await?;
        info!("LOG.TXT: {} of {} bytes used", log.len(), log.capacity());

        loop {
            if SCHEDULER.delay_ms(&LOG_DELAY, 10_000).await.is_err() {
                warn!("Log delay rejected, retrying");
                continue;
            }

            let mut line: heapless::String<32> = heapless::String::new();
            let uptime_ms = CLOCK.ticks_to_ms(CLOCK.now());
            // 32 bytes fit any u64
            let _ = write!(line, "uptime_ms={}", uptime_ms);

            match log.write_line(line.as_bytes()).await {
                Ok(()) => log.save().await?,
                Err(SdcError::EndOfFile) => {
                    info!("LOG.TXT is full");
                    log.save().await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// RTIC idle task - WFI sleep mode when no tasks active
    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        info!("Idle task started - entering WFI loop");
        loop {
            cortex_m::asm::wfi();
        }
    }
}

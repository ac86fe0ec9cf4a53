//! Property tests for NOR semantics through the full driver stack.
//!
//! Runs the transport + wait + timed layers against `SimFlash`, so every
//! byte goes through the same SPI command framing as on hardware.
#![cfg(feature = "sim")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]

use embassy_futures::block_on;
use embedded_hal_mock::eh1::delay::NoopDelay;
use proptest::prelude::*;
use spi_nor::sim::SimFlash;
use spi_nor::{FlashAddress, SpiNor, WaitPolicy, PAGE_SIZE, SECTOR_SIZE};

const CHIP: usize = 64 * 1024;

fn fresh() -> SpiNor<SimFlash, NoopDelay> {
    SpiNor::new(SimFlash::new(CHIP), NoopDelay)
}

fn at(a: u32) -> FlashAddress {
    FlashAddress::new(a).unwrap()
}

fn read_back(nor: &mut SpiNor<SimFlash, NoopDelay>, addr: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    block_on(nor.read_data(at(addr), &mut buf)).unwrap();
    buf
}

proptest! {
    /// Erase then program then read returns exactly what was written.
    #[test]
    fn erase_program_read_round_trip(
        sector in 0u32..(CHIP / SECTOR_SIZE) as u32,
        page in 0u32..16,
        data in proptest::collection::vec(any::<u8>(), 1..=PAGE_SIZE),
    ) {
        let mut nor = fresh();
        let policy = WaitPolicy::blocking();
        let base = sector * SECTOR_SIZE as u32;
        let addr = base + page * PAGE_SIZE as u32;

        block_on(nor.erase_sector_4k(at(base))).unwrap();
        block_on(nor.wait_ready(&policy)).unwrap();
        block_on(nor.program_page(at(addr), &data)).unwrap();
        block_on(nor.wait_ready(&policy)).unwrap();

        prop_assert_eq!(read_back(&mut nor, addr, data.len()), data);
    }

    /// Repeating erase-then-program of the same page leaves the same bytes.
    #[test]
    fn erase_then_program_is_idempotent(
        data in proptest::collection::vec(any::<u8>(), PAGE_SIZE),
        junk in any::<u8>(),
    ) {
        let mut nor = fresh();
        nor.device_mut().load(0, &vec![junk; SECTOR_SIZE]);
        let policy = WaitPolicy::blocking();
        for _ in 0..2 {
            block_on(nor.erase_sector_4k(at(0))).unwrap();
            block_on(nor.wait_ready(&policy)).unwrap();
            block_on(nor.program_page(at(0x300), &data)).unwrap();
            block_on(nor.wait_ready(&policy)).unwrap();
            prop_assert_eq!(read_back(&mut nor, 0x300, PAGE_SIZE), data.clone());
        }
        prop_assert_eq!(read_back(&mut nor, 0, 0x300), vec![0xFF; 0x300]);
    }

    /// Programming can only clear bits.
    #[test]
    fn program_never_sets_bits(a in any::<u8>(), b in any::<u8>()) {
        let mut nor = fresh();
        let policy = WaitPolicy::blocking();
        for v in [a, b] {
            block_on(nor.program_page(at(0), &[v])).unwrap();
            block_on(nor.wait_ready(&policy)).unwrap();
        }
        prop_assert_eq!(read_back(&mut nor, 0, 1), vec![a & b]);
    }

    /// Erase restores 0xFF across the whole sector and touches nothing else.
    #[test]
    fn erase_is_sector_local(sector in 1u32..((CHIP / SECTOR_SIZE) as u32 - 1)) {
        let mut nor = fresh();
        nor.device_mut().load(0, &vec![0u8; CHIP]);
        let base = sector * SECTOR_SIZE as u32;
        block_on(nor.erase_sector_4k(at(base))).unwrap();
        block_on(nor.wait_ready(&WaitPolicy::blocking())).unwrap();

        let mem = nor.device().contents();
        let s = base as usize;
        prop_assert!(mem[s..s + SECTOR_SIZE].iter().all(|&b| b == 0xFF));
        prop_assert_eq!(mem[s - 1], 0x00);
        prop_assert_eq!(mem[s + SECTOR_SIZE], 0x00);
    }

    /// Any range that leaves its page is rejected before touching the bus.
    #[test]
    fn page_crossing_rejected(offset in 1usize..PAGE_SIZE, extra in 1usize..PAGE_SIZE) {
        let mut nor = fresh();
        let len = PAGE_SIZE - offset + extra;
        let data = vec![0u8; len];
        let r = block_on(nor.program_page(at(offset as u32), &data));
        let is_page_cross = matches!(r, Err(spi_nor::Error::PageCross { .. }));
        prop_assert!(is_page_cross);
        prop_assert_eq!(nor.device().programs(), 0);
    }

    /// Only sector-aligned erase addresses are accepted.
    #[test]
    fn unaligned_erase_rejected(addr in 0u32..CHIP as u32) {
        prop_assume!(addr % SECTOR_SIZE as u32 != 0);
        let mut nor = fresh();
        let r = block_on(nor.erase_sector_4k(at(addr)));
        prop_assert_eq!(r, Err(spi_nor::Error::Unaligned { addr }));
    }
}

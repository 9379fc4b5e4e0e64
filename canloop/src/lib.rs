#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//! # canloop
//!
//! ## Overview
//! This crate provides a platform-agnostic, interrupt-driven driver for a CAN
//! controller together with a loopback self-test built on top of it.
//!
//! It provides the following features:
//!
//! - encoding and decoding of classic standard-identifier data frames in the
//!   four-word layout of the controller FIFOs
//! - bounded mode transitions and validated bit timing programming
//! - bit timing derived from a bitrate and the CAN clock via [`BitTiming`]
//! - typed interrupt and error status sets
//! - a dispatcher that demultiplexes the single controller interrupt line onto
//!   send, receive, error and event callbacks
//! - lock-free completion tracking shared between interrupt context and the
//!   main thread of control
//! - a fail-fast loopback self-test with a staged [`Report`]
//!
//! Register access and interrupt routing are platform specific. They are
//! abstracted by the [`Controller`] and [`InterruptBridge`] traits from
//! [`canloop_core`], which target HALs implement.
//!
//! ## Usage
//!
//! The interrupt handler registered during the test lives inside the
//! [`SelfTest`], so on a target everything is placed in `static` storage.
//!
//! ```ignore
//! use canloop::config::SelfTestConfig;
//! use canloop::embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use canloop::selftest::SelfTest;
//! use canloop::transfer::Coordinator;
//! use static_cell::StaticCell;
//!
//! static COORDINATOR: Coordinator<CriticalSectionRawMutex> = Coordinator::new();
//! static SELF_TEST: StaticCell<SelfTest<'static, hal::can::Can0, CriticalSectionRawMutex>> =
//!     StaticCell::new();
//!
//! let can: &'static hal::can::Can0 = hal::can::Can0::take().unwrap();
//! let mut gic = hal::interrupt::Gic::new();
//! let test = SELF_TEST.init(SelfTest::new(can, &COORDINATOR, SelfTestConfig::default()));
//! let report = test.run(&mut gic);
//! println!("{}", report);
//! exit(report.exit_code());
//! ```
//!
//! [`BitTiming`]: crate::config::BitTiming
//! [`Report`]: crate::selftest::Report
//! [`SelfTest`]: crate::selftest::SelfTest
//! [`Controller`]: canloop_core::Controller
//! [`InterruptBridge`]: canloop_core::InterruptBridge

mod fmt;

pub mod bus;
pub mod config;
pub mod interrupt;
pub mod message;
pub mod prelude;
pub mod selftest;
pub mod transfer;

pub use canloop_core as core;
pub use embassy_sync;
pub use embedded_can;

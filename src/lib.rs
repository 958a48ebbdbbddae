//! Crate used to bring an SD card online over an SDIO host controller and
//! move 512-byte sectors to and from it.
//!
//! The protocol engine lives in [`sdio`] and is written against the narrow
//! hardware interface in [`host`], so the same bring-up and data-path code
//! runs on real silicon or on a software fake in tests. Pin muxing and
//! clock-tree setup are the platform's job and must happen before
//! [`sdio::Sdio::init`] is called.

#![cfg_attr(not(test), no_std)]

pub mod errors;
pub mod host;
pub mod registers;
pub mod sdio;

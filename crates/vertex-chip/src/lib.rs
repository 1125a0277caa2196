// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware contract model for the vertex compute-graph engine.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of what the host and the coprocessor firmware agree on: the
//! fixed-size mailbox message, its payload structs, status codes, the
//! four-channel ring layout and the scheduling limits both sides size their
//! tables with.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`limits`] | Graph / task / bundle / buffer counts, priority ceiling |
//! | [`message`] | Message types, payload structs, the tagged payload union |
//! | [`mailbox`] | Message size, channel ids, default ring capacities |
//! | [`status`] | Payload status codes (0 = success, negative = failure) |
//! | [`regs`] | Diagnostic register names captured on a timeout dump |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod limits;
pub mod mailbox;
pub mod message;
pub mod regs;
pub mod status;

// SPDX-License-Identifier: GPL-3.0-only

//! Output management core: per-output double-buffered state with atomic
//! commits, buffer-age damage tracking, frame scheduling and the adapters
//! presenting frames to a framebuffer device, a remote peer or a window of
//! a host compositor.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod logger;
pub mod output;
pub mod session;
pub mod utils;

// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use smithay::utils::{Physical, Size};

use crate::{
    backend::{remote::EncodeError, render::RenderError},
    session::SessionError,
};

/// How a failed operation affects the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The output is unusable and gets destroyed.
    Fatal,
    /// The frame was dropped, retrying later may succeed.
    Transient,
    /// The request was invalid, nothing was changed.
    Contract,
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output has been destroyed")]
    Destroyed,
    #[error("a rendered frame is already attached")]
    RenderPending,
    #[error("no rendered frame is attached")]
    NoRenderAttached,
    #[error("output cannot be disabled")]
    CannotDisable,
    #[error("output does not support fixed modes")]
    FixedModeUnsupported,
    #[error("output does not support custom modes")]
    CustomModeUnsupported,
    #[error("invalid mode {0}x{1}")]
    InvalidMode(i32, i32),
    #[error("mode changes cannot be combined with a rendered buffer")]
    ModeWithBuffer,
    #[error("invalid scale {0}")]
    InvalidScale(f64),
    #[error("output is disabled")]
    Disabled,
    #[error("output does not accept client buffers")]
    ClientBuffersUnsupported,
    #[error("buffer size {0:?} does not match the output mode")]
    BufferSizeMismatch(Size<i32, Physical>),
    #[error("{0}")]
    Rejected(&'static str),

    #[error("session is inactive")]
    SessionInactive,
    #[error("failed to read pixels from the render target")]
    ReadPixels,
    #[error("too many outstanding images")]
    SlotsExhausted,
    #[error("failed to bind render target")]
    Render(#[source] RenderError),
    #[error("failed to blank the display")]
    Blank(#[source] io::Error),
    #[error("failed to encode frame")]
    Encode(#[source] EncodeError),
    #[error("failed to send frame to the peer")]
    Send(#[source] io::Error),
    #[error("host rejected the presented image")]
    Present(#[source] io::Error),

    #[error("mode change failed")]
    ModeFailed(#[source] Box<OutputError>),
    #[error("device access failed")]
    Device(#[source] io::Error),
    #[error("failed to open device")]
    Session(#[source] SessionError),
    #[error("failed to allocate render target")]
    RenderTarget(#[source] RenderError),
    #[error("failed to initialize encoder")]
    EncoderInit(#[source] EncodeError),
    #[error("unsupported pixel layout")]
    UnsupportedFormat,
    #[error("host stopped releasing images")]
    HostStalled,
}

impl OutputError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutputError::Destroyed
            | OutputError::RenderPending
            | OutputError::NoRenderAttached
            | OutputError::CannotDisable
            | OutputError::FixedModeUnsupported
            | OutputError::CustomModeUnsupported
            | OutputError::InvalidMode(..)
            | OutputError::ModeWithBuffer
            | OutputError::InvalidScale(_)
            | OutputError::Disabled
            | OutputError::ClientBuffersUnsupported
            | OutputError::BufferSizeMismatch(_)
            | OutputError::Rejected(_) => ErrorKind::Contract,

            OutputError::SessionInactive
            | OutputError::ReadPixels
            | OutputError::SlotsExhausted
            | OutputError::Render(_)
            | OutputError::Blank(_)
            | OutputError::Encode(_)
            | OutputError::Send(_)
            | OutputError::Present(_) => ErrorKind::Transient,

            OutputError::ModeFailed(_)
            | OutputError::Device(_)
            | OutputError::Session(_)
            | OutputError::RenderTarget(_)
            | OutputError::EncoderInit(_)
            | OutputError::UnsupportedFormat
            | OutputError::HostStalled => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
